//! Heartbeat loop
//!
//! Refreshes this proxy's liveness key every interval and reaps peers whose
//! heartbeat went stale. Crash recovery is passive: a dead process simply
//! stops refreshing and its key expires in the store.

use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use redisbungee_core::config::HeartbeatConfig;
use redisbungee_core::models::{PlayerId, ProxyId};

use super::registry::{PresenceRegistry, ReconcileReport};
use crate::error::Result;
use crate::sync::{Envelope, EnvelopeKind, MessageBus, PresenceEvent, ProxyLeaving, ProxyReaped};

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Dead proxies this tick cleaned up, with the players released
    pub reaped: Vec<(ProxyId, Vec<PlayerId>)>,
    pub reconciled: bool,
}

pub struct HeartbeatLoop {
    registry: Arc<PresenceRegistry>,
    bus: Arc<MessageBus>,
    interval: Duration,
    reconcile_every_ticks: u32,
    cancel_token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatLoop {
    #[must_use]
    pub fn new(
        registry: Arc<PresenceRegistry>,
        bus: Arc<MessageBus>,
        config: &HeartbeatConfig,
    ) -> Self {
        Self {
            registry,
            bus,
            interval: config.interval(),
            reconcile_every_ticks: config.reconcile_every_ticks,
            cancel_token: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the loop. The first tick runs immediately.
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let cancel_token = self.cancel_token.clone();
        let mut timer = interval(self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let handle = tokio::spawn(async move {
            let mut tick: u64 = 0;
            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => {
                        info!("Heartbeat loop shutting down");
                        return;
                    }
                    _ = timer.tick() => {
                        // A failed tick never stops the loop
                        if let Err(e) = this.tick(tick).await {
                            error!(error = %e, tick, "Heartbeat tick failed");
                        }
                        tick = tick.wrapping_add(1);
                    }
                }
            }
        });

        *self.handle.lock() = Some(handle);
    }

    /// Run one heartbeat tick: refresh, reap, and periodically reconcile
    pub async fn tick(&self, tick: u64) -> Result<TickReport> {
        self.registry.refresh_heartbeat().await?;

        let mut report = TickReport::default();
        let threshold = self.registry.staleness_threshold_ms();
        let own_id = self.registry.identity().proxy_id();

        for proxy in self.registry.list_proxies().await? {
            if proxy.proxy_id == *own_id || !proxy.is_stale(threshold) {
                continue;
            }
            debug!(
                dead_proxy = %proxy.proxy_id,
                last_heartbeat = ?proxy.last_heartbeat,
                "Found stale proxy"
            );

            let Some(players) = self.registry.reap(&proxy.proxy_id).await? else {
                continue;
            };
            self.announce_reap(&proxy.proxy_id, &players).await;
            report.reaped.push((proxy.proxy_id, players));
        }

        if self.reconcile_every_ticks > 0 && tick % u64::from(self.reconcile_every_ticks) == 0 {
            self.reconcile_now().await?;
            report.reconciled = true;
        }

        Ok(report)
    }

    /// Reconcile this proxy's stored player set and announce every repair
    pub async fn reconcile_now(&self) -> Result<ReconcileReport> {
        let report = self.registry.reconcile().await?;
        self.announce_reconcile(&report).await;
        Ok(report)
    }

    async fn announce_reconcile(&self, report: &ReconcileReport) {
        let timestamp = Utc::now();
        let joined = report.restored.iter().map(|player_id| PresenceEvent::Joined {
            player_id: *player_id,
            name: self
                .registry
                .local_metadata(player_id)
                .map(|metadata| metadata.name)
                .unwrap_or_default(),
            timestamp,
        });
        // Dropped players were claimed elsewhere and the owner announced them
        let left = report.stripped.iter().map(|player_id| PresenceEvent::Left {
            player_id: *player_id,
            timestamp,
        });

        for event in joined.chain(left) {
            let envelope =
                match Envelope::json(EnvelopeKind::PresenceChange, self.registry.identity(), &event) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode reconcile notice");
                        continue;
                    }
                };
            if let Err(e) = self.bus.broadcast(&envelope).await {
                warn!(player_id = %event.player_id(), error = %e, "Failed to publish reconcile notice");
            }
        }
    }

    async fn announce_reap(&self, dead: &ProxyId, players: &[PlayerId]) {
        let body = ProxyReaped {
            proxy_id: dead.clone(),
            players: players.to_vec(),
        };
        let envelope =
            match Envelope::json(EnvelopeKind::ProxyReaped, self.registry.identity(), &body) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(error = %e, "Failed to encode reap notice");
                    return;
                }
            };
        // Peers that miss this still read the players as absent: their
        // claims point at a proxy without a live heartbeat
        if let Err(e) = self.bus.broadcast(&envelope).await {
            warn!(dead_proxy = %dead, error = %e, "Failed to publish reap notice");
        }
    }

    /// Stop ticking and leave the network cleanly: release every player,
    /// delete this proxy's keys and announce the departure.
    pub async fn shutdown(&self) -> Result<Vec<PlayerId>> {
        self.cancel_token.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Heartbeat task ended abnormally");
            }
        }

        let players = self.registry.release_own().await?;
        let body = ProxyLeaving {
            players: players.clone(),
        };
        let envelope = Envelope::json(EnvelopeKind::ProxyLeaving, self.registry.identity(), &body)?;
        self.bus.broadcast(&envelope).await?;

        info!(
            proxy_id = %self.registry.identity().proxy_id(),
            released = players.len(),
            "Left the network"
        );
        Ok(players)
    }
}
