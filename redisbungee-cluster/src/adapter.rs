//! Boundary to the host proxy
//!
//! `PlayerLifecycle` is what the host calls into; `ProxyAdapter` is what this
//! layer calls back out to. Neither depends on any particular proxy runtime.

use async_trait::async_trait;
use tracing::info;

use redisbungee_core::models::{PlayerId, PlayerMetadata, ProxyId};

use crate::error::Result;
use crate::presence::ClaimAck;
use crate::sync::PluginMessage;

/// Calls the host proxy makes into the presence layer
#[async_trait]
pub trait PlayerLifecycle: Send + Sync {
    /// A client finished logging in. `ClaimConflict` means another live
    /// proxy already holds this player (duplicate login).
    async fn on_player_connect(&self, player_id: PlayerId, metadata: PlayerMetadata) -> Result<ClaimAck>;

    async fn on_player_disconnect(&self, player_id: PlayerId) -> Result<()>;

    async fn on_shutdown(&self) -> Result<()>;
}

/// Callbacks into the host proxy. Every method defaults to doing nothing.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProxyAdapter: Send + Sync {
    async fn on_plugin_message(&self, origin: &ProxyId, message: &PluginMessage) {
        let _ = (origin, message);
    }

    async fn on_run_command(&self, origin: &ProxyId, command: &str) {
        let _ = (origin, command);
    }

    /// Disconnect a player if connected here. Returns whether they were.
    async fn on_kick(&self, player_id: &PlayerId, reason: &str) -> bool {
        let _ = (player_id, reason);
        false
    }

    async fn on_network_join(&self, player_id: &PlayerId, name: &str) {
        let _ = (player_id, name);
    }

    async fn on_network_leave(&self, player_id: &PlayerId) {
        let _ = player_id;
    }
}

/// Adapter that only logs, for headless runs
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingAdapter;

#[async_trait]
impl ProxyAdapter for LoggingAdapter {
    async fn on_plugin_message(&self, origin: &ProxyId, message: &PluginMessage) {
        info!(
            origin = %origin,
            channel = %message.channel,
            bytes = message.data.len(),
            "Plugin message"
        );
    }

    async fn on_run_command(&self, origin: &ProxyId, command: &str) {
        info!(origin = %origin, command = %command, "Proxy command received");
    }

    async fn on_network_join(&self, player_id: &PlayerId, name: &str) {
        info!(player_id = %player_id, name = %name, "Player joined the network");
    }

    async fn on_network_leave(&self, player_id: &PlayerId) {
        info!(player_id = %player_id, "Player left the network");
    }
}
