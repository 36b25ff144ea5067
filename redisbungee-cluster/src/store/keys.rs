//! Store key and channel namespace
//!
//! Every key and channel is scoped by a configurable prefix and the network
//! id, so several networks can share one store.

use redisbungee_core::models::{NetworkId, PlayerId, ProxyId};

/// Builds every key and channel name used by the presence layer
#[derive(Debug, Clone)]
pub struct KeySpace {
    base: String,
}

impl KeySpace {
    #[must_use]
    pub fn new(prefix: &str, network_id: &NetworkId) -> Self {
        Self {
            base: format!("{}:{}", prefix, network_id.as_str()),
        }
    }

    // ==================== Players ====================

    /// Player claim
    ///
    /// Type: String, no TTL
    /// Value: JSON `PlayerRecord`
    #[must_use]
    pub fn player(&self, player_id: &PlayerId) -> String {
        format!("{}:player:{}", self.base, player_id)
    }

    /// Last time the player left the network
    ///
    /// Type: String
    /// Value: unix millis
    #[must_use]
    pub fn last_seen(&self, player_id: &PlayerId) -> String {
        format!("{}:seen:{}", self.base, player_id)
    }

    // ==================== Proxies ====================

    /// Liveness key
    ///
    /// Type: String + TTL (interval * multiplier)
    /// Value: JSON `HeartbeatRecord`
    #[must_use]
    pub fn proxy_heartbeat(&self, proxy_id: &ProxyId) -> String {
        format!("{}:proxy:{}:heartbeat", self.base, proxy_id.as_str())
    }

    /// Players claimed by a proxy
    ///
    /// Type: Set, no TTL (removed by reap or clean shutdown)
    /// Members: player uuids
    #[must_use]
    pub fn proxy_players(&self, proxy_id: &ProxyId) -> String {
        format!("{}:proxy:{}:players", self.base, proxy_id.as_str())
    }

    /// Reap lock for a dead proxy
    ///
    /// Type: String + TTL, set-if-absent
    /// Value: reaping proxy id
    #[must_use]
    pub fn proxy_reaping(&self, proxy_id: &ProxyId) -> String {
        format!("{}:proxy:{}:reaping", self.base, proxy_id.as_str())
    }

    #[must_use]
    pub fn proxy_heartbeat_pattern(&self) -> String {
        format!("{}:proxy:*:heartbeat", self.base)
    }

    #[must_use]
    pub fn proxy_players_pattern(&self) -> String {
        format!("{}:proxy:*:players", self.base)
    }

    /// Extract the proxy id from a heartbeat key returned by a scan
    #[must_use]
    pub fn proxy_from_heartbeat_key(&self, key: &str) -> Option<ProxyId> {
        self.proxy_from_key(key, ":heartbeat")
    }

    /// Extract the proxy id from a player-set key returned by a scan
    #[must_use]
    pub fn proxy_from_players_key(&self, key: &str) -> Option<ProxyId> {
        self.proxy_from_key(key, ":players")
    }

    fn proxy_from_key(&self, key: &str, suffix: &str) -> Option<ProxyId> {
        key.strip_prefix(self.base.as_str())
            .and_then(|rest| rest.strip_prefix(":proxy:"))
            .and_then(|rest| rest.strip_suffix(suffix))
            .filter(|id| !id.is_empty())
            .map(ProxyId::from)
    }

    // ==================== Channels ====================

    /// Network-wide control channel (leave, reap, commands, kicks)
    #[must_use]
    pub fn channel_all(&self) -> String {
        format!("{}:all", self.base)
    }

    /// Presence change notices
    #[must_use]
    pub fn channel_presence(&self) -> String {
        format!("{}:presence", self.base)
    }

    /// Request / response traffic
    #[must_use]
    pub fn channel_rpc(&self) -> String {
        format!("{}:rpc", self.base)
    }

    /// Plugin channel messages
    #[must_use]
    pub fn channel_messages(&self) -> String {
        format!("{}:messages", self.base)
    }

    /// The fixed set of channels every proxy subscribes to at startup
    #[must_use]
    pub fn channels(&self) -> Vec<String> {
        vec![
            self.channel_all(),
            self.channel_presence(),
            self.channel_rpc(),
            self.channel_messages(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> KeySpace {
        KeySpace::new("redisbungee", &NetworkId::from("main"))
    }

    #[test]
    fn test_key_layout() {
        let keys = keys();
        let proxy = ProxyId::from("proxy-a");
        assert_eq!(
            keys.proxy_heartbeat(&proxy),
            "redisbungee:main:proxy:proxy-a:heartbeat"
        );
        assert_eq!(keys.proxy_players(&proxy), "redisbungee:main:proxy:proxy-a:players");

        let player = PlayerId::new();
        assert_eq!(keys.player(&player), format!("redisbungee:main:player:{player}"));
    }

    #[test]
    fn test_proxy_id_extraction() {
        let keys = keys();
        let proxy = ProxyId::from("lobby:eu-1");
        assert_eq!(
            keys.proxy_from_players_key(&keys.proxy_players(&proxy)),
            Some(proxy.clone())
        );
        assert_eq!(
            keys.proxy_from_heartbeat_key(&keys.proxy_heartbeat(&proxy)),
            Some(proxy)
        );
        assert_eq!(keys.proxy_from_players_key("other:main:proxy:x:players"), None);
        assert_eq!(keys.proxy_from_players_key("redisbungee:main:proxy::players"), None);
    }

    #[test]
    fn test_channels_are_network_scoped() {
        let main = keys().channels();
        let other = KeySpace::new("redisbungee", &NetworkId::from("other")).channels();
        assert_eq!(main.len(), 4);
        assert!(main.iter().all(|c| !other.contains(c)));
    }
}
