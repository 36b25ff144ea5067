//! Read-through presence cache
//!
//! Sits in front of `PresenceRegistry`. A hit is served only while younger
//! than its TTL; bus notifications evict entries early. Entries are retained
//! past their TTL (up to `stale_retention`) so that while the store is
//! unreachable the last-known-good value can still be served, flagged stale.

use moka::future::Cache;
use std::collections::BTreeSet;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use redisbungee_core::config::CacheConfig;
use redisbungee_core::models::{PlayerId, PlayerRecord, ProxyId};

use crate::error::Result;
use crate::presence::PresenceRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Younger than the TTL, or just fetched
    Fresh,
    /// Past its TTL, served because the store is unreachable
    Stale,
}

/// A value answered by the cache together with how much it can be trusted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cached<T> {
    pub value: T,
    pub freshness: Freshness,
}

impl<T> Cached<T> {
    const fn fresh(value: T) -> Self {
        Self {
            value,
            freshness: Freshness::Fresh,
        }
    }

    const fn stale(value: T) -> Self {
        Self {
            value,
            freshness: Freshness::Stale,
        }
    }

    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.freshness == Freshness::Stale
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Cached<U> {
        Cached {
            value: f(self.value),
            freshness: self.freshness,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub value: T,
    pub fetched_at: Instant,
}

impl<T> CacheEntry<T> {
    fn new(value: T) -> Self {
        Self {
            value,
            fetched_at: Instant::now(),
        }
    }

    fn is_fresh(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() < ttl
    }
}

/// One moka cache with freshness tracking and stale fallback
struct TtlCache<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    name: &'static str,
    inner: Cache<K, CacheEntry<V>>,
    ttl: Duration,
}

impl<K, V> TtlCache<K, V>
where
    K: Hash + Eq + Send + Sync + Clone + std::fmt::Debug + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn new(name: &'static str, max_capacity: u64, ttl: Duration, retention: Duration) -> Self {
        let inner = Cache::builder()
            .name(name)
            .max_capacity(max_capacity)
            .time_to_live(retention.max(ttl))
            .build();
        Self { name, inner, ttl }
    }

    async fn get_or_fetch<F, Fut>(&self, key: K, fetch: F) -> Result<Cached<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        if let Some(entry) = self.inner.get(&key).await {
            if entry.is_fresh(self.ttl) {
                return Ok(Cached::fresh(entry.value));
            }
        }

        match fetch().await {
            Ok(value) => {
                self.inner
                    .insert(key, CacheEntry::new(value.clone()))
                    .await;
                Ok(Cached::fresh(value))
            }
            Err(e) if e.is_transient() => match self.inner.get(&key).await {
                Some(entry) => {
                    debug!(
                        cache = self.name,
                        key = ?key,
                        age_ms = entry.fetched_at.elapsed().as_millis() as u64,
                        "Store unavailable, serving stale entry"
                    );
                    Ok(Cached::stale(entry.value))
                }
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    async fn invalidate(&self, key: &K) {
        self.inner.invalidate(key).await;
    }

    fn invalidate_all(&self) {
        self.inner.invalidate_all();
    }
}

pub struct LocalCache {
    registry: Arc<PresenceRegistry>,
    players: TtlCache<PlayerId, Option<PlayerRecord>>,
    proxy_players: TtlCache<ProxyId, BTreeSet<PlayerId>>,
    total_count: TtlCache<(), usize>,
    network_players: TtlCache<(), BTreeSet<PlayerId>>,
    live_proxies: TtlCache<(), Vec<ProxyId>>,
    online_records: TtlCache<(), Arc<Vec<PlayerRecord>>>,
}

impl LocalCache {
    #[must_use]
    pub fn new(registry: Arc<PresenceRegistry>, config: &CacheConfig) -> Self {
        let retention = config.stale_retention();
        let player_ttl = config.player_ttl();
        let aggregate_ttl = config.aggregate_ttl();
        let max_capacity = config.max_capacity;

        Self {
            registry,
            players: TtlCache::new("players", max_capacity, player_ttl, retention),
            proxy_players: TtlCache::new("proxy_players", 1_024, aggregate_ttl, retention),
            total_count: TtlCache::new("total_count", 1, aggregate_ttl, retention),
            network_players: TtlCache::new("network_players", 1, aggregate_ttl, retention),
            live_proxies: TtlCache::new("live_proxies", 1, aggregate_ttl, retention),
            online_records: TtlCache::new("online_records", 1, aggregate_ttl, retention),
        }
    }

    /// Player record, fetched through `PresenceRegistry::lookup` on a miss.
    /// Absence is cached as well.
    pub async fn player(&self, player_id: &PlayerId) -> Result<Cached<Option<PlayerRecord>>> {
        let registry = &self.registry;
        self.players
            .get_or_fetch(*player_id, || registry.lookup(player_id))
            .await
    }

    pub async fn players_on(&self, proxy_id: &ProxyId) -> Result<Cached<BTreeSet<PlayerId>>> {
        let registry = &self.registry;
        self.proxy_players
            .get_or_fetch(proxy_id.clone(), || registry.players_of(proxy_id))
            .await
    }

    pub async fn total_count(&self) -> Result<Cached<usize>> {
        let registry = &self.registry;
        self.total_count
            .get_or_fetch((), || registry.total_count())
            .await
    }

    pub async fn network_players(&self) -> Result<Cached<BTreeSet<PlayerId>>> {
        let registry = &self.registry;
        self.network_players
            .get_or_fetch((), || registry.network_players())
            .await
    }

    pub async fn live_proxies(&self) -> Result<Cached<Vec<ProxyId>>> {
        let registry = &self.registry;
        self.live_proxies
            .get_or_fetch((), || async move {
                let proxies = registry.live_proxies().await?;
                Ok(proxies.into_iter().map(|proxy| proxy.proxy_id).collect())
            })
            .await
    }

    /// Every online player's record, backing the server and name lookups
    pub async fn online_records(&self) -> Result<Cached<Arc<Vec<PlayerRecord>>>> {
        let registry = &self.registry;
        self.online_records
            .get_or_fetch((), || async move { Ok(Arc::new(registry.online_records().await?)) })
            .await
    }

    // ==================== Invalidation ====================

    async fn invalidate_aggregates(&self) {
        self.total_count.invalidate(&()).await;
        self.network_players.invalidate(&()).await;
        self.online_records.invalidate(&()).await;
    }

    /// Evict one player and every aggregate that may include them
    pub async fn invalidate_player(&self, player_id: &PlayerId, proxy_id: Option<&ProxyId>) {
        self.players.invalidate(player_id).await;
        match proxy_id {
            Some(proxy_id) => self.proxy_players.invalidate(proxy_id).await,
            None => self.proxy_players.invalidate_all(),
        }
        self.invalidate_aggregates().await;
    }

    /// Evict a batch of players that all belonged to one proxy
    pub async fn invalidate_proxy(&self, proxy_id: &ProxyId, players: &[PlayerId]) {
        for player_id in players {
            self.players.invalidate(player_id).await;
        }
        self.proxy_players.invalidate(proxy_id).await;
        self.live_proxies.invalidate(&()).await;
        self.invalidate_aggregates().await;
    }

    pub fn invalidate_all(&self) {
        self.players.invalidate_all();
        self.proxy_players.invalidate_all();
        self.total_count.invalidate_all();
        self.network_players.invalidate_all();
        self.live_proxies.invalidate_all();
        self.online_records.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthTracker;
    use crate::store::MemoryStore;
    use redisbungee_core::config::HeartbeatConfig;
    use redisbungee_core::models::PlayerMetadata;
    use redisbungee_core::ProxyIdentity;

    struct Fixture {
        handle: MemoryStore,
        owner: Arc<PresenceRegistry>,
        cache: LocalCache,
    }

    fn fixture(player_ttl_ms: u64) -> Fixture {
        let store = MemoryStore::new();
        let heartbeat = HeartbeatConfig {
            interval_ms: 1_000,
            ttl_multiplier: 3,
            reconcile_every_ticks: 0,
        };
        let owner = Arc::new(PresenceRegistry::new(
            Arc::new(store.connect()),
            ProxyIdentity::new("proxy-a", "main").unwrap(),
            "test",
            &heartbeat,
            Arc::new(HealthTracker::new()),
        ));
        let handle = store.connect();
        let reader = Arc::new(PresenceRegistry::new(
            Arc::new(handle.clone()),
            ProxyIdentity::new("proxy-b", "main").unwrap(),
            "test",
            &heartbeat,
            Arc::new(HealthTracker::new()),
        ));
        let config = CacheConfig {
            player_ttl_ms,
            aggregate_ttl_ms: player_ttl_ms,
            max_capacity: 100,
            stale_retention_ms: 60_000,
        };
        Fixture {
            handle,
            owner,
            cache: LocalCache::new(reader, &config),
        }
    }

    #[tokio::test]
    async fn test_hit_within_ttl_then_refetch() {
        let f = fixture(100);
        f.owner.refresh_heartbeat().await.unwrap();
        let player = PlayerId::new();

        let first = f.cache.player(&player).await.unwrap();
        assert_eq!(first, Cached::fresh(None));

        // Claimed behind the cache's back: still the cached absence
        f.owner
            .claim(player, PlayerMetadata::new("Alice", "1.2.3.4"))
            .await
            .unwrap();
        assert_eq!(f.cache.player(&player).await.unwrap().value, None);

        tokio::time::sleep(Duration::from_millis(150)).await;
        let refreshed = f.cache.player(&player).await.unwrap();
        assert_eq!(refreshed.value.unwrap().name(), "Alice");
        assert_eq!(refreshed.freshness, Freshness::Fresh);
    }

    #[tokio::test]
    async fn test_invalidation_evicts_before_ttl() {
        let f = fixture(60_000);
        f.owner.refresh_heartbeat().await.unwrap();
        let player = PlayerId::new();

        assert_eq!(f.cache.total_count().await.unwrap().value, 0);
        assert_eq!(f.cache.player(&player).await.unwrap().value, None);

        f.owner
            .claim(player, PlayerMetadata::new("Alice", "1.2.3.4"))
            .await
            .unwrap();
        f.cache
            .invalidate_player(&player, Some(&ProxyId::from("proxy-a")))
            .await;

        assert!(f.cache.player(&player).await.unwrap().value.is_some());
        assert_eq!(f.cache.total_count().await.unwrap().value, 1);
    }

    #[tokio::test]
    async fn test_serves_stale_while_store_unreachable() {
        let f = fixture(50);
        f.owner.refresh_heartbeat().await.unwrap();
        let player = PlayerId::new();
        f.owner
            .claim(player, PlayerMetadata::new("Alice", "1.2.3.4"))
            .await
            .unwrap();
        assert!(f.cache.player(&player).await.unwrap().value.is_some());

        f.handle.set_available(false);
        tokio::time::sleep(Duration::from_millis(80)).await;

        let stale = f.cache.player(&player).await.unwrap();
        assert!(stale.is_stale());
        assert!(stale.value.is_some());

        // Nothing cached for this one: the outage surfaces
        let unknown = f.cache.player(&PlayerId::new()).await;
        assert!(unknown.is_err());

        // Self-heals on the first read after connectivity returns
        f.handle.set_available(true);
        f.owner.release(&player).await.unwrap();
        let healed = f.cache.player(&player).await.unwrap();
        assert_eq!(healed, Cached::fresh(None));
    }

    #[tokio::test]
    async fn test_online_records_evicted_with_aggregates() {
        let f = fixture(60_000);
        f.owner.refresh_heartbeat().await.unwrap();
        assert!(f.cache.online_records().await.unwrap().value.is_empty());

        let player = PlayerId::new();
        f.owner
            .claim(player, PlayerMetadata::new("Alice", "1.2.3.4").with_server("lobby"))
            .await
            .unwrap();
        // Cached emptiness until a notification evicts it
        assert!(f.cache.online_records().await.unwrap().value.is_empty());

        f.cache.invalidate_player(&player, None).await;
        let records = f.cache.online_records().await.unwrap().value;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].player_id, player);
        assert_eq!(records[0].metadata.server.as_deref(), Some("lobby"));
    }
}
