//! Presence registry
//!
//! Canonical player → proxy and proxy → players mapping, held in the shared
//! store. Claims go through the store's compare-and-set so concurrent proxies
//! can never both own a player; liveness of a claim's owner is judged from
//! its heartbeat record on every read.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use redisbungee_core::config::HeartbeatConfig;
use redisbungee_core::models::{
    NetworkId, PlayerId, PlayerMetadata, PlayerRecord, ProxyId, ProxyRecord,
};
use redisbungee_core::ProxyIdentity;

use crate::error::{Error, Result};
use crate::health::HealthTracker;
use crate::store::{KeySpace, StoreClient};

/// Compare-and-set attempts before a contended claim gives up
const MAX_CLAIM_ATTEMPTS: usize = 5;

/// Players released between reap lock extensions
const REAP_LOCK_EXTEND_EVERY: usize = 100;

/// Liveness record written by every proxy on each heartbeat tick
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub proxy_id: ProxyId,
    pub network_id: NetworkId,
    /// Random per-process id, see `ProxyIdentity::instance_id`
    pub instance_id: String,
    pub last_heartbeat: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
}

impl HeartbeatRecord {
    #[must_use]
    pub fn age_ms(&self) -> i64 {
        Utc::now()
            .signed_duration_since(self.last_heartbeat)
            .num_milliseconds()
    }
}

/// Successful claim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimAck {
    pub record: PlayerRecord,
    /// Dead proxy the claim was taken over from, if any
    pub taken_from: Option<ProxyId>,
}

/// Outcome of one integrity pass over this proxy's player set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Locally connected players missing from the store and written back
    pub restored: Vec<PlayerId>,
    /// Locally connected players now owned by another live proxy
    pub dropped: Vec<PlayerId>,
    /// Stored players this process is not actually serving
    pub stripped: Vec<PlayerId>,
}

impl ReconcileReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.restored.is_empty() && self.dropped.is_empty() && self.stripped.is_empty()
    }
}

pub struct PresenceRegistry {
    store: Arc<dyn StoreClient>,
    identity: ProxyIdentity,
    keys: KeySpace,
    key_ttl: Duration,
    staleness_threshold_ms: i64,
    started_at: DateTime<Utc>,
    health: Arc<HealthTracker>,
    /// Players this process has claimed and not released, with the metadata
    /// needed to re-claim them during reconciliation
    local_players: DashMap<PlayerId, PlayerMetadata>,
}

impl PresenceRegistry {
    pub fn new(
        store: Arc<dyn StoreClient>,
        identity: ProxyIdentity,
        key_prefix: &str,
        heartbeat: &HeartbeatConfig,
        health: Arc<HealthTracker>,
    ) -> Self {
        let keys = KeySpace::new(key_prefix, identity.network_id());
        let staleness_threshold_ms =
            i64::try_from(heartbeat.staleness_threshold().as_millis()).unwrap_or(i64::MAX);

        Self {
            store,
            identity,
            keys,
            key_ttl: heartbeat.key_ttl(),
            staleness_threshold_ms,
            started_at: Utc::now(),
            health,
            local_players: DashMap::new(),
        }
    }

    #[must_use]
    pub const fn identity(&self) -> &ProxyIdentity {
        &self.identity
    }

    #[must_use]
    pub const fn keys(&self) -> &KeySpace {
        &self.keys
    }

    #[must_use]
    pub const fn staleness_threshold_ms(&self) -> i64 {
        self.staleness_threshold_ms
    }

    fn proxy_id(&self) -> &ProxyId {
        self.identity.proxy_id()
    }

    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        self.health.observe(&result);
        result
    }

    // ==================== Liveness ====================

    /// Read a proxy's heartbeat record. Malformed records read as absent.
    pub async fn heartbeat_of(&self, proxy_id: &ProxyId) -> Result<Option<HeartbeatRecord>> {
        let raw = self.store.get(&self.keys.proxy_heartbeat(proxy_id)).await?;
        Ok(raw.and_then(|raw| match serde_json::from_str(&raw) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(proxy_id = %proxy_id, error = %e, "Ignoring malformed heartbeat record");
                None
            }
        }))
    }

    /// Whether a proxy's heartbeat is younger than the staleness threshold.
    /// This process always considers itself live.
    pub async fn is_proxy_live(&self, proxy_id: &ProxyId) -> Result<bool> {
        if proxy_id == self.proxy_id() {
            return Ok(true);
        }
        Ok(self
            .heartbeat_of(proxy_id)
            .await?
            .is_some_and(|hb| hb.age_ms() <= self.staleness_threshold_ms))
    }

    /// Write this proxy's heartbeat with a TTL of `interval × multiplier`.
    ///
    /// Warns when a live record from another process with the same proxy id
    /// is found.
    pub async fn refresh_heartbeat(&self) -> Result<()> {
        let result = self.refresh_heartbeat_inner().await;
        self.observe(result)
    }

    async fn refresh_heartbeat_inner(&self) -> Result<()> {
        if let Some(existing) = self.heartbeat_of(self.proxy_id()).await? {
            if existing.instance_id != self.identity.instance_id()
                && existing.age_ms() <= self.staleness_threshold_ms
            {
                warn!(
                    proxy_id = %self.proxy_id(),
                    other_instance = %existing.instance_id,
                    other_started_at = %existing.started_at,
                    "Another live process is using this proxy id"
                );
            }
        }

        let record = HeartbeatRecord {
            proxy_id: self.proxy_id().clone(),
            network_id: self.identity.network_id().clone(),
            instance_id: self.identity.instance_id().to_string(),
            last_heartbeat: Utc::now(),
            started_at: self.started_at,
        };
        let value = serde_json::to_string(&record)?;
        self.store
            .set(
                &self.keys.proxy_heartbeat(self.proxy_id()),
                &value,
                Some(self.key_ttl),
            )
            .await
    }

    // ==================== Claims ====================

    /// Claim a player for this proxy.
    ///
    /// Succeeds when the player is unclaimed, already ours, or held by a
    /// dead proxy. Fails with `ClaimConflict` when a live proxy holds it.
    pub async fn claim(&self, player_id: PlayerId, metadata: PlayerMetadata) -> Result<ClaimAck> {
        let result = self.claim_inner(player_id, metadata).await;
        self.observe(result)
    }

    async fn claim_inner(&self, player_id: PlayerId, metadata: PlayerMetadata) -> Result<ClaimAck> {
        let key = self.keys.player(&player_id);
        let record = PlayerRecord::new(player_id, self.proxy_id().clone(), metadata);
        let value = serde_json::to_string(&record)?;
        let mut contended_by = None;

        for attempt in 1..=MAX_CLAIM_ATTEMPTS {
            let current = self.store.get(&key).await?;

            let taken_from = match current.as_deref().map(serde_json::from_str::<PlayerRecord>) {
                None => None,
                Some(Ok(existing)) if existing.proxy_id == *self.proxy_id() => None,
                Some(Ok(existing)) => {
                    if self.is_proxy_live(&existing.proxy_id).await? {
                        return Err(Error::ClaimConflict {
                            player: player_id,
                            owner: existing.proxy_id,
                        });
                    }
                    Some(existing.proxy_id)
                }
                Some(Err(e)) => {
                    warn!(player_id = %player_id, error = %e, "Overwriting malformed player record");
                    None
                }
            };

            if self
                .store
                .compare_and_set(&key, current.as_deref(), &value, None)
                .await?
            {
                let member = [player_id.to_string()];
                self.store
                    .set_add(&self.keys.proxy_players(self.proxy_id()), &member)
                    .await?;
                if let Some(dead) = &taken_from {
                    self.store
                        .set_remove(&self.keys.proxy_players(dead), &member)
                        .await?;
                    info!(player_id = %player_id, dead_proxy = %dead, "Took over claim from dead proxy");
                }

                self.local_players
                    .insert(player_id, record.metadata.clone());
                debug!(player_id = %player_id, "Player claimed");
                return Ok(ClaimAck { record, taken_from });
            }

            debug!(player_id = %player_id, attempt, "Claim raced with another writer, retrying");
            contended_by = taken_from;
        }

        // Still losing the race after every attempt: report whoever holds it now
        match self.lookup_raw(&player_id).await? {
            Some(existing) if existing.proxy_id != *self.proxy_id() => Err(Error::ClaimConflict {
                player: player_id,
                owner: existing.proxy_id,
            }),
            _ => Err(Error::StoreUnavailable(format!(
                "claim for {player_id} kept racing (last seen owner: {contended_by:?})"
            ))),
        }
    }

    /// Release a player claimed by this proxy. Idempotent.
    ///
    /// Returns the record that was removed, or `None` when there was no claim
    /// of ours to remove.
    pub async fn release(&self, player_id: &PlayerId) -> Result<Option<PlayerRecord>> {
        self.local_players.remove(player_id);
        let owner = self.proxy_id().clone();
        let result = self.release_for(&owner, player_id).await;
        self.observe(result)
    }

    /// Release a player on behalf of `owner`; the claim is deleted only while
    /// it still names `owner`.
    async fn release_for(&self, owner: &ProxyId, player_id: &PlayerId) -> Result<Option<PlayerRecord>> {
        let key = self.keys.player(player_id);
        let mut released = None;

        if let Some(raw) = self.store.get(&key).await? {
            match serde_json::from_str::<PlayerRecord>(&raw) {
                Ok(record) if record.proxy_id == *owner => {
                    if self.store.compare_and_delete(&key, &raw).await? {
                        released = Some(record);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(player_id = %player_id, error = %e, "Removing malformed player record");
                    self.store.compare_and_delete(&key, &raw).await?;
                }
            }
        }

        self.store
            .set_remove(&self.keys.proxy_players(owner), &[player_id.to_string()])
            .await?;

        if released.is_some() {
            self.store
                .set(
                    &self.keys.last_seen(player_id),
                    &Utc::now().timestamp_millis().to_string(),
                    None,
                )
                .await?;
        }

        Ok(released)
    }

    /// Rewrite the metadata of a player this proxy owns.
    ///
    /// Returns false when the claim is no longer ours.
    pub async fn update_metadata(&self, player_id: &PlayerId, metadata: PlayerMetadata) -> Result<bool> {
        let result = self.update_metadata_inner(player_id, metadata).await;
        self.observe(result)
    }

    async fn update_metadata_inner(&self, player_id: &PlayerId, metadata: PlayerMetadata) -> Result<bool> {
        let key = self.keys.player(player_id);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(false);
        };
        let mut record: PlayerRecord = serde_json::from_str(&raw)?;
        if record.proxy_id != *self.proxy_id() {
            return Ok(false);
        }

        record.metadata = metadata.clone();
        record.last_seen = Utc::now();
        let value = serde_json::to_string(&record)?;
        let updated = self
            .store
            .compare_and_set(&key, Some(&raw), &value, None)
            .await?;
        if updated {
            self.local_players.insert(*player_id, metadata);
        }
        Ok(updated)
    }

    // ==================== Queries ====================

    async fn lookup_raw(&self, player_id: &PlayerId) -> Result<Option<PlayerRecord>> {
        match self.store.get(&self.keys.player(player_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Direct store read. Claims held by a dead proxy read as absent even
    /// before they are reaped.
    pub async fn lookup(&self, player_id: &PlayerId) -> Result<Option<PlayerRecord>> {
        let result = self.lookup_inner(player_id).await;
        self.observe(result)
    }

    async fn lookup_inner(&self, player_id: &PlayerId) -> Result<Option<PlayerRecord>> {
        let Some(record) = self.lookup_raw(player_id).await? else {
            return Ok(None);
        };
        if self.is_proxy_live(&record.proxy_id).await? {
            Ok(Some(record))
        } else {
            Ok(None)
        }
    }

    /// Players in a proxy's set, live or not
    pub async fn players_of(&self, proxy_id: &ProxyId) -> Result<BTreeSet<PlayerId>> {
        let result = self.players_of_inner(proxy_id).await;
        self.observe(result)
    }

    async fn players_of_inner(&self, proxy_id: &ProxyId) -> Result<BTreeSet<PlayerId>> {
        let members = self
            .store
            .set_members(&self.keys.proxy_players(proxy_id))
            .await?;
        Ok(members
            .iter()
            .filter_map(|member| match member.parse::<PlayerId>() {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(proxy_id = %proxy_id, member = %member, error = %e, "Skipping malformed player set member");
                    None
                }
            })
            .collect())
    }

    /// Every proxy known to the store: those with a heartbeat key and those
    /// whose heartbeat expired but whose player set is still awaiting reap.
    pub async fn list_proxies(&self) -> Result<Vec<ProxyRecord>> {
        let result = self.list_proxies_inner().await;
        self.observe(result)
    }

    async fn list_proxies_inner(&self) -> Result<Vec<ProxyRecord>> {
        let mut proxy_ids = BTreeSet::new();
        for key in self.store.scan(&self.keys.proxy_heartbeat_pattern()).await? {
            proxy_ids.extend(self.keys.proxy_from_heartbeat_key(&key));
        }
        for key in self.store.scan(&self.keys.proxy_players_pattern()).await? {
            proxy_ids.extend(self.keys.proxy_from_players_key(&key));
        }

        let mut proxies = Vec::with_capacity(proxy_ids.len());
        for proxy_id in proxy_ids {
            let heartbeat = self.heartbeat_of(&proxy_id).await?;
            let players = self.players_of_inner(&proxy_id).await?;
            proxies.push(ProxyRecord {
                network_id: self.identity.network_id().clone(),
                last_heartbeat: heartbeat.map(|hb| hb.last_heartbeat),
                proxy_id,
                players,
            });
        }
        Ok(proxies)
    }

    /// Proxies whose heartbeat is within the staleness threshold
    pub async fn live_proxies(&self) -> Result<Vec<ProxyRecord>> {
        let threshold = self.staleness_threshold_ms;
        let proxies = self.list_proxies().await?;
        Ok(proxies
            .into_iter()
            .filter(|proxy| proxy.proxy_id == *self.proxy_id() || !proxy.is_stale(threshold))
            .collect())
    }

    /// Live proxy ids mapped to their heartbeat records
    async fn live_heartbeats(&self) -> Result<BTreeMap<ProxyId, HeartbeatRecord>> {
        let mut live = BTreeMap::new();
        for key in self.store.scan(&self.keys.proxy_heartbeat_pattern()).await? {
            let Some(proxy_id) = self.keys.proxy_from_heartbeat_key(&key) else {
                continue;
            };
            if let Some(hb) = self.heartbeat_of(&proxy_id).await? {
                if hb.age_ms() <= self.staleness_threshold_ms {
                    live.insert(proxy_id, hb);
                }
            }
        }
        Ok(live)
    }

    /// Ids of peers currently live, excluding this proxy
    pub async fn live_peers(&self) -> Result<Vec<ProxyId>> {
        let result = self.live_heartbeats().await;
        let live = self.observe(result)?;
        Ok(live
            .into_keys()
            .filter(|proxy_id| proxy_id != self.proxy_id())
            .collect())
    }

    /// Sum of live proxies' player-set sizes. Proxies with an expired
    /// heartbeat are excluded even before they are reaped.
    pub async fn total_count(&self) -> Result<usize> {
        let result = self.total_count_inner().await;
        self.observe(result)
    }

    async fn total_count_inner(&self) -> Result<usize> {
        let mut total = 0;
        for proxy_id in self.live_heartbeats().await?.keys() {
            total += self.store.set_len(&self.keys.proxy_players(proxy_id)).await?;
        }
        Ok(total)
    }

    /// Union of every live proxy's players
    pub async fn network_players(&self) -> Result<BTreeSet<PlayerId>> {
        let result = self.network_players_inner().await;
        self.observe(result)
    }

    async fn network_players_inner(&self) -> Result<BTreeSet<PlayerId>> {
        let mut players = BTreeSet::new();
        for proxy_id in self.live_heartbeats().await?.keys() {
            players.extend(self.players_of_inner(proxy_id).await?);
        }
        Ok(players)
    }

    /// Full records of every player held by a live proxy.
    ///
    /// Set members whose record is missing, malformed or owned by another
    /// proxy are skipped; the next reconcile or reap cleans them up.
    pub async fn online_records(&self) -> Result<Vec<PlayerRecord>> {
        let result = self.online_records_inner().await;
        self.observe(result)
    }

    async fn online_records_inner(&self) -> Result<Vec<PlayerRecord>> {
        let mut records = Vec::new();
        for proxy_id in self.live_heartbeats().await?.keys() {
            for player_id in self.players_of_inner(proxy_id).await? {
                match self.lookup_raw(&player_id).await {
                    Ok(Some(record)) if record.proxy_id == *proxy_id => records.push(record),
                    Ok(_) => {}
                    Err(Error::Serialization(e)) => {
                        warn!(player_id = %player_id, error = %e, "Skipping malformed player record");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(records)
    }

    /// When the player last left the network, if ever recorded
    pub async fn last_seen(&self, player_id: &PlayerId) -> Result<Option<DateTime<Utc>>> {
        let result = self.store.get(&self.keys.last_seen(player_id)).await;
        let raw = self.observe(result)?;
        Ok(raw
            .and_then(|raw| raw.parse::<i64>().ok())
            .and_then(DateTime::from_timestamp_millis))
    }

    // ==================== Local state ====================

    #[must_use]
    pub fn local_player_count(&self) -> usize {
        self.local_players.len()
    }

    #[must_use]
    pub fn is_local(&self, player_id: &PlayerId) -> bool {
        self.local_players.contains_key(player_id)
    }

    /// Metadata of a player claimed by this process
    #[must_use]
    pub fn local_metadata(&self, player_id: &PlayerId) -> Option<PlayerMetadata> {
        self.local_players
            .get(player_id)
            .map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn local_players(&self) -> BTreeSet<PlayerId> {
        self.local_players.iter().map(|entry| *entry.key()).collect()
    }

    // ==================== Cleanup ====================

    /// Reap a dead proxy: release every player it held and delete its keys.
    ///
    /// Returns the released players, or `None` when another proxy holds the
    /// reap lock or the target turned out to be live.
    pub async fn reap(&self, dead: &ProxyId) -> Result<Option<Vec<PlayerId>>> {
        let result = self.reap_inner(dead).await;
        self.observe(result)
    }

    async fn reap_inner(&self, dead: &ProxyId) -> Result<Option<Vec<PlayerId>>> {
        if dead == self.proxy_id() {
            return Ok(None);
        }

        let locked = self
            .store
            .compare_and_set(
                &self.keys.proxy_reaping(dead),
                None,
                self.proxy_id().as_str(),
                Some(self.key_ttl),
            )
            .await?;
        if !locked {
            debug!(dead_proxy = %dead, "Reap already in progress elsewhere");
            return Ok(None);
        }

        // The proxy may have come back between the scan and the lock
        if self.is_proxy_live(dead).await? {
            return Ok(None);
        }

        let lock = self.keys.proxy_reaping(dead);
        let players = self.release_all_of(dead, Some(&lock)).await?;
        info!(dead_proxy = %dead, released = players.len(), "Reaped dead proxy");
        Ok(Some(players))
    }

    /// Release everything this proxy holds and delete its keys (clean stop)
    pub async fn release_own(&self) -> Result<Vec<PlayerId>> {
        self.local_players.clear();
        let own = self.proxy_id().clone();
        let result = self.release_all_of(&own, None).await;
        self.observe(result)
    }

    /// Release every player in `owner`'s set and delete its keys. A held
    /// reap lock is kept alive while large sets are worked through.
    async fn release_all_of(&self, owner: &ProxyId, reap_lock: Option<&str>) -> Result<Vec<PlayerId>> {
        let players: Vec<PlayerId> = self.players_of_inner(owner).await?.into_iter().collect();
        for (done, player_id) in players.iter().enumerate() {
            if let Some(lock) = reap_lock {
                if done > 0 && done % REAP_LOCK_EXTEND_EVERY == 0
                    && !self.store.expire(lock, self.key_ttl).await?
                {
                    warn!(dead_proxy = %owner, released = done, "Reap lock expired mid-reap");
                }
            }
            self.release_for(owner, player_id).await?;
        }

        self.store
            .delete(&[
                self.keys.proxy_players(owner),
                self.keys.proxy_heartbeat(owner),
            ])
            .await?;
        Ok(players)
    }

    /// Compare locally claimed players with this proxy's stored set and
    /// repair any divergence.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let stored = self.players_of(self.proxy_id()).await?;
        let local: Vec<(PlayerId, PlayerMetadata)> = self
            .local_players
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        let mut report = ReconcileReport::default();

        for (player_id, metadata) in &local {
            if stored.contains(player_id) {
                continue;
            }
            match self.claim(*player_id, metadata.clone()).await {
                Ok(_) => report.restored.push(*player_id),
                Err(Error::ClaimConflict { owner, .. }) => {
                    warn!(player_id = %player_id, owner = %owner, "Local player now owned by another proxy, dropping");
                    self.local_players.remove(player_id);
                    report.dropped.push(*player_id);
                }
                Err(e) => return Err(e),
            }
        }

        for player_id in stored {
            if self.local_players.contains_key(&player_id) {
                continue;
            }
            let own = self.proxy_id().clone();
            let result = self.release_for(&own, &player_id).await;
            self.observe(result)?;
            report.stripped.push(player_id);
        }

        if !report.is_clean() {
            info!(
                restored = report.restored.len(),
                dropped = report.dropped.len(),
                stripped = report.stripped.len(),
                "Reconciled player set"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn heartbeat_config() -> HeartbeatConfig {
        HeartbeatConfig {
            interval_ms: 50,
            ttl_multiplier: 3,
            reconcile_every_ticks: 0,
        }
    }

    fn registry(store: &MemoryStore, proxy: &str) -> PresenceRegistry {
        PresenceRegistry::new(
            Arc::new(store.connect()),
            ProxyIdentity::new(proxy, "main").unwrap(),
            "test",
            &heartbeat_config(),
            Arc::new(HealthTracker::new()),
        )
    }

    fn alice() -> PlayerMetadata {
        PlayerMetadata::new("Alice", "1.2.3.4")
    }

    #[tokio::test]
    async fn test_claim_and_lookup() {
        let store = MemoryStore::new();
        let a = registry(&store, "proxy-a");
        let b = registry(&store, "proxy-b");
        a.refresh_heartbeat().await.unwrap();

        let player = PlayerId::new();
        let ack = a.claim(player, alice()).await.unwrap();
        assert_eq!(ack.taken_from, None);
        assert!(a.is_local(&player));

        let record = b.lookup(&player).await.unwrap().unwrap();
        assert_eq!(record.proxy_id, ProxyId::from("proxy-a"));
        assert_eq!(record.name(), "Alice");
        assert_eq!(
            b.players_of(&ProxyId::from("proxy-a")).await.unwrap(),
            BTreeSet::from([player])
        );
    }

    #[tokio::test]
    async fn test_claim_conflict_with_live_owner() {
        let store = MemoryStore::new();
        let a = registry(&store, "proxy-a");
        let b = registry(&store, "proxy-b");
        a.refresh_heartbeat().await.unwrap();
        b.refresh_heartbeat().await.unwrap();

        let player = PlayerId::new();
        a.claim(player, alice()).await.unwrap();

        match b.claim(player, alice()).await {
            Err(Error::ClaimConflict { player: p, owner }) => {
                assert_eq!(p, player);
                assert_eq!(owner, ProxyId::from("proxy-a"));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        assert!(!b.is_local(&player));
    }

    #[tokio::test]
    async fn test_reclaim_by_same_proxy_is_allowed() {
        let store = MemoryStore::new();
        let a = registry(&store, "proxy-a");
        let player = PlayerId::new();

        a.claim(player, alice()).await.unwrap();
        let ack = a
            .claim(player, alice().with_server("lobby"))
            .await
            .unwrap();
        assert_eq!(ack.record.metadata.server.as_deref(), Some("lobby"));
    }

    #[tokio::test]
    async fn test_claim_over_dead_owner() {
        let store = MemoryStore::new();
        let a = registry(&store, "proxy-a");
        let b = registry(&store, "proxy-b");
        // proxy-a never writes a heartbeat, so it is dead to everyone else
        let player = PlayerId::new();
        a.claim(player, alice()).await.unwrap();

        assert_eq!(b.lookup(&player).await.unwrap(), None);
        let ack = b.claim(player, alice()).await.unwrap();
        assert_eq!(ack.taken_from, Some(ProxyId::from("proxy-a")));
        assert!(a.players_of(&ProxyId::from("proxy-a")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let store = MemoryStore::new();
        let a = registry(&store, "proxy-a");
        let player = PlayerId::new();
        a.claim(player, alice()).await.unwrap();

        let first = a.release(&player).await.unwrap();
        assert_eq!(first.map(|r| r.player_id), Some(player));
        let second = a.release(&player).await.unwrap();
        assert_eq!(second, None);

        assert_eq!(a.lookup(&player).await.unwrap(), None);
        assert!(a.players_of(&ProxyId::from("proxy-a")).await.unwrap().is_empty());
        assert!(a.last_seen(&player).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_release_does_not_touch_foreign_claim() {
        let store = MemoryStore::new();
        let a = registry(&store, "proxy-a");
        let b = registry(&store, "proxy-b");
        a.refresh_heartbeat().await.unwrap();

        let player = PlayerId::new();
        a.claim(player, alice()).await.unwrap();
        assert_eq!(b.release(&player).await.unwrap(), None);
        assert!(b.lookup(&player).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_total_count_excludes_dead_proxies() {
        let store = MemoryStore::new();
        let a = registry(&store, "proxy-a");
        let b = registry(&store, "proxy-b");
        a.refresh_heartbeat().await.unwrap();

        a.claim(PlayerId::new(), alice()).await.unwrap();
        a.claim(PlayerId::new(), alice()).await.unwrap();
        // proxy-b has no heartbeat
        b.claim(PlayerId::new(), alice()).await.unwrap();

        assert_eq!(a.total_count().await.unwrap(), 2);
        assert_eq!(a.network_players().await.unwrap().len(), 2);

        let proxies = a.list_proxies().await.unwrap();
        assert_eq!(proxies.len(), 2);
        let dead = proxies
            .iter()
            .find(|p| p.proxy_id == ProxyId::from("proxy-b"))
            .unwrap();
        assert!(dead.last_heartbeat.is_none());
    }

    #[tokio::test]
    async fn test_online_records_skip_dead_and_orphaned_members() {
        let store = MemoryStore::new();
        let a = registry(&store, "proxy-a");
        let b = registry(&store, "proxy-b");
        a.refresh_heartbeat().await.unwrap();

        let player = PlayerId::new();
        a.claim(player, alice().with_server("lobby")).await.unwrap();
        // proxy-b has no heartbeat
        b.claim(PlayerId::new(), alice()).await.unwrap();
        // Set member whose record is gone
        store
            .set_add(
                &a.keys().proxy_players(&ProxyId::from("proxy-a")),
                &[PlayerId::new().to_string()],
            )
            .await
            .unwrap();

        let records = a.online_records().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].player_id, player);
        assert_eq!(records[0].metadata.server.as_deref(), Some("lobby"));
    }

    #[tokio::test]
    async fn test_reap_runs_once() {
        let store = MemoryStore::new();
        let dead = registry(&store, "proxy-dead");
        let b = registry(&store, "proxy-b");
        let c = registry(&store, "proxy-c");

        let player = PlayerId::new();
        dead.claim(player, alice()).await.unwrap();

        let dead_id = ProxyId::from("proxy-dead");
        let (first, second) = tokio::join!(b.reap(&dead_id), c.reap(&dead_id));
        let outcomes = [first.unwrap(), second.unwrap()];
        let effective: Vec<_> = outcomes.iter().flatten().collect();
        assert_eq!(effective.len(), 1);
        assert_eq!(effective[0], &vec![player]);

        assert!(b.list_proxies().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reap_of_large_set_keeps_lock() {
        let store = MemoryStore::new();
        let dead = registry(&store, "proxy-dead");
        let b = registry(&store, "proxy-b");
        for _ in 0..(REAP_LOCK_EXTEND_EVERY * 2 + 1) {
            dead.claim(PlayerId::new(), alice()).await.unwrap();
        }

        let dead_id = ProxyId::from("proxy-dead");
        let released = b.reap(&dead_id).await.unwrap().unwrap();
        assert_eq!(released.len(), REAP_LOCK_EXTEND_EVERY * 2 + 1);

        // Still held by the reaper, so a late peer does not redo the work
        let lock = store.get(&b.keys().proxy_reaping(&dead_id)).await.unwrap();
        assert_eq!(lock.as_deref(), Some("proxy-b"));
        assert_eq!(registry(&store, "proxy-c").reap(&dead_id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reap_skips_live_proxy() {
        let store = MemoryStore::new();
        let a = registry(&store, "proxy-a");
        let b = registry(&store, "proxy-b");
        a.refresh_heartbeat().await.unwrap();
        a.claim(PlayerId::new(), alice()).await.unwrap();

        assert_eq!(b.reap(&ProxyId::from("proxy-a")).await.unwrap(), None);
        assert_eq!(b.total_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_update_metadata_only_while_owned() {
        let store = MemoryStore::new();
        let a = registry(&store, "proxy-a");
        let b = registry(&store, "proxy-b");
        a.refresh_heartbeat().await.unwrap();

        let player = PlayerId::new();
        a.claim(player, alice()).await.unwrap();

        assert!(a
            .update_metadata(&player, alice().with_server("survival"))
            .await
            .unwrap());
        assert!(!b.update_metadata(&player, alice()).await.unwrap());

        let record = b.lookup(&player).await.unwrap().unwrap();
        assert_eq!(record.metadata.server.as_deref(), Some("survival"));
    }

    #[tokio::test]
    async fn test_reconcile_restores_and_strips() {
        let store = MemoryStore::new();
        let raw = store.connect();
        let a = registry(&store, "proxy-a");
        a.refresh_heartbeat().await.unwrap();

        let kept = PlayerId::new();
        a.claim(kept, alice()).await.unwrap();

        // Lose the stored membership of a local player
        let set_key = a.keys().proxy_players(&ProxyId::from("proxy-a"));
        raw.set_remove(&set_key, &[kept.to_string()]).await.unwrap();
        // Leave behind a member this process is not serving
        let ghost = PlayerId::new();
        raw.set_add(&set_key, &[ghost.to_string()]).await.unwrap();

        let report = a.reconcile().await.unwrap();
        assert_eq!(report.restored, vec![kept]);
        assert_eq!(report.stripped, vec![ghost]);
        assert!(report.dropped.is_empty());

        assert_eq!(
            a.players_of(&ProxyId::from("proxy-a")).await.unwrap(),
            BTreeSet::from([kept])
        );
        assert!(a.reconcile().await.unwrap().is_clean());
    }

    #[tokio::test]
    async fn test_store_outage_degrades_health() {
        let store = MemoryStore::new();
        let handle = store.connect();
        let health = Arc::new(HealthTracker::new());
        let a = PresenceRegistry::new(
            Arc::new(handle.clone()),
            ProxyIdentity::new("proxy-a", "main").unwrap(),
            "test",
            &heartbeat_config(),
            health.clone(),
        );

        handle.set_available(false);
        let result = a.claim(PlayerId::new(), alice()).await;
        assert!(matches!(result, Err(Error::StoreUnavailable(_))));
        assert!(health.is_degraded());

        handle.set_available(true);
        a.refresh_heartbeat().await.unwrap();
        assert!(!health.is_degraded());
    }
}
