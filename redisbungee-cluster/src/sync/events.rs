//! Typed payloads carried inside envelopes

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use redisbungee_core::models::{PlayerId, ProxyId};

use super::envelope::{get_bytes, get_str, put_bytes, put_str};
use crate::error::{Error, Result};

/// Payload of `EnvelopeKind::PresenceChange`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PresenceEvent {
    Joined {
        player_id: PlayerId,
        name: String,
        timestamp: DateTime<Utc>,
    },
    Left {
        player_id: PlayerId,
        timestamp: DateTime<Utc>,
    },
    /// Metadata refreshed, e.g. a server switch
    Updated {
        player_id: PlayerId,
        server: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

impl PresenceEvent {
    #[must_use]
    pub const fn player_id(&self) -> &PlayerId {
        match self {
            Self::Joined { player_id, .. }
            | Self::Left { player_id, .. }
            | Self::Updated { player_id, .. } => player_id,
        }
    }
}

/// Payload of `EnvelopeKind::ProxyReaped`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyReaped {
    pub proxy_id: ProxyId,
    pub players: Vec<PlayerId>,
}

/// Payload of `EnvelopeKind::ProxyLeaving`; the leaving proxy is the origin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyLeaving {
    pub players: Vec<PlayerId>,
}

/// Network-wide questions answered by every live proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "query", rename_all = "snake_case")]
pub enum Query {
    /// How many players are connected to you right now
    PlayerCount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum QueryReply {
    PlayerCount { count: u64 },
}

/// Payload of `EnvelopeKind::RunCommand`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCommand {
    /// `None` runs on every proxy
    pub target: Option<ProxyId>,
    pub command: String,
}

impl RunCommand {
    #[must_use]
    pub fn targets(&self, proxy_id: &ProxyId) -> bool {
        self.target.as_ref().map_or(true, |target| target == proxy_id)
    }
}

/// Payload of `EnvelopeKind::Kick`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KickRequest {
    pub player_id: PlayerId,
    pub reason: String,
}

/// Payload of `EnvelopeKind::PluginMessage`
///
/// Binary rather than JSON so arbitrary plugin data is carried as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginMessage {
    pub channel: String,
    pub data: Bytes,
}

impl PluginMessage {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(6 + self.channel.len() + self.data.len());
        put_str(&mut buf, &self.channel)?;
        put_bytes(&mut buf, &self.data)?;
        Ok(buf.freeze())
    }

    pub fn decode(mut data: &[u8]) -> Result<Self> {
        let channel = get_str(&mut data)?;
        let payload = get_bytes(&mut data)?;
        if !data.is_empty() {
            return Err(Error::Serialization(
                "Trailing bytes after plugin message".to_string(),
            ));
        }
        Ok(Self {
            channel,
            data: payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presence_event_tagging() {
        let player_id = PlayerId::new();
        let event = PresenceEvent::Left {
            player_id,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"left\""));

        let back: PresenceEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.player_id(), &player_id);
    }

    #[test]
    fn test_query_reply_format() {
        let json = serde_json::to_string(&QueryReply::PlayerCount { count: 7 }).unwrap();
        assert_eq!(json, r#"{"reply":"player_count","count":7}"#);
        assert_eq!(
            serde_json::to_string(&Query::PlayerCount).unwrap(),
            r#"{"query":"player_count"}"#
        );
    }

    #[test]
    fn test_run_command_targeting() {
        let everyone = RunCommand {
            target: None,
            command: "alert hi".into(),
        };
        let one = RunCommand {
            target: Some(ProxyId::from("proxy-b")),
            command: "end".into(),
        };
        assert!(everyone.targets(&ProxyId::from("proxy-a")));
        assert!(one.targets(&ProxyId::from("proxy-b")));
        assert!(!one.targets(&ProxyId::from("proxy-a")));
    }

    #[test]
    fn test_plugin_message_binary_data() {
        let message = PluginMessage {
            channel: "legacy:party".into(),
            data: Bytes::from_static(&[0, 159, 146, 150, 255]),
        };
        let decoded = PluginMessage::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(decoded, message);
        assert!(PluginMessage::decode(&[0, 5, b'a']).is_err());
    }
}
