//! Presence node
//!
//! Wires registry, cache, bus and heartbeat together for one proxy process
//! and exposes the query API used by plugin and command layers. Everything
//! is constructed here once and passed explicitly; there is no global state.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use redisbungee_core::models::{PlayerId, PlayerMetadata, PlayerRecord, ProxyId};
use redisbungee_core::{Config, ProxyIdentity};

use crate::adapter::{PlayerLifecycle, ProxyAdapter};
use crate::cache::{Cached, LocalCache};
use crate::error::{Error, Result};
use crate::health::{HealthStatus, HealthTracker};
use crate::presence::{ClaimAck, HeartbeatLoop, PresenceRegistry};
use crate::store::StoreClient;
use crate::sync::{
    Envelope, EnvelopeHandler, EnvelopeKind, KickRequest, MessageBus, PluginMessage,
    PresenceEvent, ProxyLeaving, ProxyReaped, Query, QueryReply, QueryResponder, RunCommand,
};

const STATE_CREATED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// Applies bus notifications to local state and forwards them to the host
struct NodeEvents {
    identity: ProxyIdentity,
    registry: Arc<PresenceRegistry>,
    cache: Arc<LocalCache>,
    adapter: Arc<dyn ProxyAdapter>,
}

impl NodeEvents {
    fn decode<T: DeserializeOwned>(envelope: &Envelope) -> Option<T> {
        match envelope.decode_json() {
            Ok(body) => Some(body),
            Err(e) => {
                warn!(
                    kind = ?envelope.kind,
                    origin = %envelope.origin_proxy_id,
                    error = %e,
                    "Dropping envelope with malformed payload"
                );
                None
            }
        }
    }

    async fn leave_all(&self, proxy_id: &ProxyId, players: &[PlayerId]) {
        self.cache.invalidate_proxy(proxy_id, players).await;
        for player_id in players {
            self.adapter.on_network_leave(player_id).await;
        }
    }
}

#[async_trait]
impl EnvelopeHandler for NodeEvents {
    async fn handle(&self, envelope: &Envelope) {
        let origin = &envelope.origin_proxy_id;
        match envelope.kind {
            EnvelopeKind::PresenceChange => {
                let Some(event) = Self::decode::<PresenceEvent>(envelope) else {
                    return;
                };
                // A join may have taken the player over from another proxy's set
                self.cache.invalidate_player(event.player_id(), None).await;
                match &event {
                    PresenceEvent::Joined { player_id, name, .. } => {
                        self.adapter.on_network_join(player_id, name).await;
                    }
                    PresenceEvent::Left { player_id, .. } => {
                        self.adapter.on_network_leave(player_id).await;
                    }
                    PresenceEvent::Updated { .. } => {}
                }
            }
            EnvelopeKind::ProxyReaped => {
                if let Some(body) = Self::decode::<ProxyReaped>(envelope) {
                    self.leave_all(&body.proxy_id, &body.players).await;
                }
            }
            EnvelopeKind::ProxyLeaving => {
                if let Some(body) = Self::decode::<ProxyLeaving>(envelope) {
                    self.leave_all(origin, &body.players).await;
                }
            }
            EnvelopeKind::PluginMessage => match PluginMessage::decode(&envelope.payload) {
                Ok(message) => self.adapter.on_plugin_message(origin, &message).await,
                Err(e) => warn!(origin = %origin, error = %e, "Dropping malformed plugin message"),
            },
            EnvelopeKind::RunCommand => {
                if let Some(body) = Self::decode::<RunCommand>(envelope) {
                    if body.targets(self.identity.proxy_id()) {
                        self.adapter.on_run_command(origin, &body.command).await;
                    }
                }
            }
            EnvelopeKind::Kick => {
                if let Some(body) = Self::decode::<KickRequest>(envelope) {
                    if self.registry.is_local(&body.player_id) {
                        self.adapter.on_kick(&body.player_id, &body.reason).await;
                    }
                }
            }
            EnvelopeKind::Request | EnvelopeKind::Response => {}
        }
    }

    async fn on_resubscribed(&self) {
        debug!("Invalidating presence cache after resubscribe");
        self.cache.invalidate_all();
    }
}

#[async_trait]
impl QueryResponder for NodeEvents {
    async fn answer(&self, query: Query) -> Result<QueryReply> {
        match query {
            Query::PlayerCount => Ok(QueryReply::PlayerCount {
                count: self.registry.local_player_count() as u64,
            }),
        }
    }
}

/// One proxy's view of the network
pub struct PresenceNode {
    identity: ProxyIdentity,
    registry: Arc<PresenceRegistry>,
    cache: Arc<LocalCache>,
    bus: Arc<MessageBus>,
    heartbeat: Arc<HeartbeatLoop>,
    health: Arc<HealthTracker>,
    adapter: Arc<dyn ProxyAdapter>,
    request_deadline: Duration,
    state: AtomicU8,
}

impl PresenceNode {
    /// Build the node. Nothing touches the store until `start`.
    ///
    /// Fails with `Error::Configuration` when `config` does not validate.
    pub fn new(
        config: &Config,
        identity: ProxyIdentity,
        store: Arc<dyn StoreClient>,
        adapter: Arc<dyn ProxyAdapter>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|errors| Error::Configuration(errors.join("; ")))?;

        let health = Arc::new(HealthTracker::new());
        let prefix = config.redis.key_prefix.as_str();

        let registry = Arc::new(PresenceRegistry::new(
            Arc::clone(&store),
            identity.clone(),
            prefix,
            &config.heartbeat,
            Arc::clone(&health),
        ));
        let cache = Arc::new(LocalCache::new(Arc::clone(&registry), &config.cache));
        let bus = Arc::new(
            MessageBus::new(store, identity.clone(), prefix, Arc::clone(&health))
                .with_reconnect_backoff(config.bus.reconnect_initial(), config.bus.reconnect_max()),
        );
        let heartbeat = Arc::new(HeartbeatLoop::new(
            Arc::clone(&registry),
            Arc::clone(&bus),
            &config.heartbeat,
        ));

        let events = Arc::new(NodeEvents {
            identity: identity.clone(),
            registry: Arc::clone(&registry),
            cache: Arc::clone(&cache),
            adapter: Arc::clone(&adapter),
        });
        for kind in EnvelopeKind::ALL {
            if !matches!(kind, EnvelopeKind::Request | EnvelopeKind::Response) {
                bus.register(kind, events.clone());
            }
        }
        bus.set_responder(events);

        Ok(Self {
            identity,
            registry,
            cache,
            bus,
            heartbeat,
            health,
            adapter,
            request_deadline: config.bus.request_deadline(),
            state: AtomicU8::new(STATE_CREATED),
        })
    }

    /// Announce this proxy, subscribe to the bus and start heartbeating.
    ///
    /// The heartbeat is written before anything else so peers never see our
    /// claims without a live owner. Claims left under this proxy id by an
    /// earlier run are stripped before the first tick.
    pub async fn start(&self) -> Result<()> {
        match self.state.compare_exchange(
            STATE_CREATED,
            STATE_RUNNING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {}
            Err(STATE_RUNNING) => return Ok(()),
            Err(_) => return Err(Error::Closed),
        }

        if let Err(e) = self.start_inner().await {
            self.state.store(STATE_CREATED, Ordering::SeqCst);
            return Err(e);
        }

        info!(
            proxy_id = %self.identity.proxy_id(),
            network_id = %self.identity.network_id(),
            instance_id = %self.identity.instance_id(),
            "Presence node started"
        );
        Ok(())
    }

    async fn start_inner(&self) -> Result<()> {
        self.registry.refresh_heartbeat().await?;
        self.bus.start().await?;
        self.heartbeat.reconcile_now().await?;
        self.heartbeat.start();
        Ok(())
    }

    /// Leave the network cleanly. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        if self.state.swap(STATE_STOPPED, Ordering::SeqCst) != STATE_RUNNING {
            return Ok(());
        }

        let result = self.heartbeat.shutdown().await;
        self.bus.shutdown().await;
        self.cache.invalidate_all();

        match result {
            Ok(players) => {
                info!(released = players.len(), "Presence node stopped");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Presence node stopped without clean release, keys will expire");
                Err(e)
            }
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_RUNNING
    }

    #[must_use]
    pub const fn identity(&self) -> &ProxyIdentity {
        &self.identity
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<PresenceRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn health(&self) -> HealthStatus {
        self.health.status()
    }

    /// Publish and log instead of failing: the store write already
    /// succeeded and peers converge within one cache TTL regardless
    async fn announce(&self, envelope: Envelope) {
        if let Err(e) = self.bus.broadcast(&envelope).await {
            warn!(kind = ?envelope.kind, error = %e, "Failed to publish notification");
        }
    }

    async fn announce_presence(&self, event: &PresenceEvent) {
        match Envelope::json(EnvelopeKind::PresenceChange, &self.identity, event) {
            Ok(envelope) => self.announce(envelope).await,
            Err(e) => warn!(error = %e, "Failed to encode presence change"),
        }
    }

    // ==================== Queries ====================

    pub async fn player(&self, player_id: &PlayerId) -> Result<Cached<Option<PlayerRecord>>> {
        self.cache.player(player_id).await
    }

    pub async fn is_online(&self, player_id: &PlayerId) -> Result<bool> {
        Ok(self.cache.player(player_id).await?.value.is_some())
    }

    pub async fn proxy_of(&self, player_id: &PlayerId) -> Result<Option<ProxyId>> {
        let cached = self.cache.player(player_id).await?;
        Ok(cached.value.map(|record| record.proxy_id))
    }

    /// Cached sum of live proxies' player sets
    pub async fn total_count(&self) -> Result<usize> {
        Ok(self.cache.total_count().await?.value)
    }

    /// Ask every live proxy for its connected player count.
    ///
    /// Peers that miss the deadline are left out. With no live peers the
    /// answer is this proxy's own count, zero if it has none.
    pub async fn network_player_count(&self) -> Result<u64> {
        let peers = match self.registry.live_peers().await {
            Ok(peers) => peers,
            Err(e) if e.is_transient() => {
                warn!(error = %e, "Store unavailable, answering player count from cache");
                return Ok(self.cache.total_count().await?.value as u64);
            }
            Err(e) => return Err(e),
        };

        let mut total = self.registry.local_player_count() as u64;
        let replies = self
            .bus
            .request(Query::PlayerCount, &peers, self.request_deadline)
            .await?;
        for (_, reply) in replies {
            match reply {
                QueryReply::PlayerCount { count } => total += count,
            }
        }
        Ok(total)
    }

    pub async fn players_on(&self, proxy_id: &ProxyId) -> Result<BTreeSet<PlayerId>> {
        Ok(self.cache.players_on(proxy_id).await?.value)
    }

    /// Ids of every live proxy, this one included
    pub async fn proxies(&self) -> Result<Vec<ProxyId>> {
        Ok(self.cache.live_proxies().await?.value)
    }

    pub async fn network_players(&self) -> Result<BTreeSet<PlayerId>> {
        Ok(self.cache.network_players().await?.value)
    }

    /// Players whose current backend server is `server`
    pub async fn players_on_server(&self, server: &str) -> Result<BTreeSet<PlayerId>> {
        let records = self.cache.online_records().await?.value;
        Ok(records
            .iter()
            .filter(|record| record.metadata.server.as_deref() == Some(server))
            .map(|record| record.player_id)
            .collect())
    }

    /// Online players grouped by backend server. Players not yet on a
    /// server are left out.
    pub async fn server_to_players(&self) -> Result<BTreeMap<String, BTreeSet<PlayerId>>> {
        let records = self.cache.online_records().await?.value;
        let mut servers: BTreeMap<String, BTreeSet<PlayerId>> = BTreeMap::new();
        for record in records.iter() {
            if let Some(server) = &record.metadata.server {
                servers
                    .entry(server.clone())
                    .or_default()
                    .insert(record.player_id);
            }
        }
        Ok(servers)
    }

    /// Online player with this display name, compared case-insensitively
    pub async fn player_by_name(&self, name: &str) -> Result<Option<PlayerRecord>> {
        let records = self.cache.online_records().await?.value;
        Ok(records
            .iter()
            .find(|record| record.name().eq_ignore_ascii_case(name))
            .cloned())
    }

    /// When the player last left the network; `None` if never recorded
    pub async fn last_online(&self, player_id: &PlayerId) -> Result<Option<DateTime<Utc>>> {
        self.registry.last_seen(player_id).await
    }

    // ==================== Messaging ====================

    /// Publish a prebuilt envelope as-is
    pub async fn send_envelope(&self, envelope: &Envelope) -> Result<usize> {
        self.bus.publish(envelope).await
    }

    /// Send a plugin channel message to every proxy, this one included
    pub async fn send_message(&self, channel: impl Into<String>, data: impl Into<Bytes>) -> Result<()> {
        let message = PluginMessage {
            channel: channel.into(),
            data: data.into(),
        };
        let envelope = Envelope::new(EnvelopeKind::PluginMessage, &self.identity, message.encode()?);
        self.bus.broadcast(&envelope).await?;
        Ok(())
    }

    /// Run a command on one proxy, or on all of them when `target` is `None`
    pub async fn send_proxy_command(&self, target: Option<ProxyId>, command: impl Into<String>) -> Result<()> {
        let body = RunCommand {
            target,
            command: command.into(),
        };
        let envelope = Envelope::json(EnvelopeKind::RunCommand, &self.identity, &body)?;
        self.bus.broadcast(&envelope).await?;
        Ok(())
    }

    /// Disconnect a player wherever they are connected.
    ///
    /// Returns false when the player is not online anywhere.
    pub async fn kick_player(&self, player_id: &PlayerId, reason: impl Into<String>) -> Result<bool> {
        let reason = reason.into();
        if self.registry.is_local(player_id) {
            return Ok(self.adapter.on_kick(player_id, &reason).await);
        }

        if self.registry.lookup(player_id).await?.is_none() {
            return Ok(false);
        }
        let body = KickRequest {
            player_id: *player_id,
            reason,
        };
        let envelope = Envelope::json(EnvelopeKind::Kick, &self.identity, &body)?;
        self.bus.publish(&envelope).await?;
        Ok(true)
    }

    /// Refresh the metadata of a player connected here, e.g. after a
    /// server switch
    pub async fn update_player(&self, player_id: &PlayerId, metadata: PlayerMetadata) -> Result<bool> {
        let server = metadata.server.clone();
        if !self.registry.update_metadata(player_id, metadata).await? {
            return Ok(false);
        }
        self.announce_presence(&PresenceEvent::Updated {
            player_id: *player_id,
            server,
            timestamp: Utc::now(),
        })
        .await;
        Ok(true)
    }
}

#[async_trait]
impl PlayerLifecycle for PresenceNode {
    async fn on_player_connect(&self, player_id: PlayerId, metadata: PlayerMetadata) -> Result<ClaimAck> {
        if !self.is_running() {
            return Err(Error::Closed);
        }
        let ack = self.registry.claim(player_id, metadata).await?;
        self.announce_presence(&PresenceEvent::Joined {
            player_id,
            name: ack.record.name().to_string(),
            timestamp: Utc::now(),
        })
        .await;
        Ok(ack)
    }

    async fn on_player_disconnect(&self, player_id: PlayerId) -> Result<()> {
        if self.registry.release(&player_id).await?.is_some() {
            self.announce_presence(&PresenceEvent::Left {
                player_id,
                timestamp: Utc::now(),
            })
            .await;
        }
        Ok(())
    }

    async fn on_shutdown(&self) -> Result<()> {
        self.shutdown().await
    }
}
