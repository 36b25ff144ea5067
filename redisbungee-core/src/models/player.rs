use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::id::{NetworkId, PlayerId, ProxyId};

/// Connection metadata supplied by the proxy adapter on connect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerMetadata {
    /// Display name
    pub name: String,
    /// Remote address as reported by the proxy (IPv4/IPv6 literal)
    pub address: String,
    pub login_at: DateTime<Utc>,
    /// Backend server the player is currently connected to, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
}

impl PlayerMetadata {
    #[must_use]
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            login_at: Utc::now(),
            server: None,
        }
    }

    #[must_use]
    pub fn with_server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }
}

/// A player's claim as stored under `player:{uuid}`
///
/// Owned by the proxy in `proxy_id`; every other proxy only ever holds a
/// cached copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerRecord {
    pub player_id: PlayerId,
    pub proxy_id: ProxyId,
    pub metadata: PlayerMetadata,
    pub last_seen: DateTime<Utc>,
}

impl PlayerRecord {
    #[must_use]
    pub fn new(player_id: PlayerId, proxy_id: ProxyId, metadata: PlayerMetadata) -> Self {
        Self {
            player_id,
            proxy_id,
            metadata,
            last_seen: Utc::now(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

/// Snapshot of one proxy as seen in the shared store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRecord {
    pub proxy_id: ProxyId,
    pub network_id: NetworkId,
    /// `None` when the heartbeat key already expired but the player set is
    /// still present (crashed proxy awaiting reap)
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub players: BTreeSet<PlayerId>,
}

impl ProxyRecord {
    /// A proxy is dead once its heartbeat is older than `threshold_ms`, or
    /// missing altogether.
    #[must_use]
    pub fn is_stale(&self, threshold_ms: i64) -> bool {
        self.last_heartbeat.map_or(true, |hb| {
            Utc::now().signed_duration_since(hb).num_milliseconds() > threshold_ms
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_player_record_serialization() {
        let record = PlayerRecord::new(
            PlayerId::new(),
            ProxyId::from("proxy-a"),
            PlayerMetadata::new("Alice", "1.2.3.4"),
        );

        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("Alice"));
        assert!(json.contains("proxy-a"));
        // server omitted when unknown
        assert!(!json.contains("server"));

        let back: PlayerRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_proxy_record_staleness() {
        let mut record = ProxyRecord {
            proxy_id: ProxyId::from("proxy-a"),
            network_id: NetworkId::from("main"),
            last_heartbeat: Some(Utc::now()),
            players: BTreeSet::new(),
        };
        assert!(!record.is_stale(2_000));

        record.last_heartbeat = Some(Utc::now() - Duration::seconds(5));
        assert!(record.is_stale(2_000));

        record.last_heartbeat = None;
        assert!(record.is_stale(2_000));
    }
}
