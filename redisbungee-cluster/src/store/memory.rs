//! In-process store with Redis-compatible semantics
//!
//! Several handles can share one backend via [`MemoryStore::connect`]; each
//! handle has its own availability switch so a single proxy can be cut off
//! from the store while the others keep working.

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{StoreClient, StoreMessage, Subscription};
use crate::error::{Error, Result};

const BUS_CAPACITY: usize = 4096;

#[derive(Default)]
struct State {
    values: HashMap<String, String>,
    sets: HashMap<String, HashSet<String>>,
    expiry: HashMap<String, Instant>,
}

impl State {
    fn purge_if_expired(&mut self, key: &str, now: Instant) {
        if self.expiry.get(key).is_some_and(|deadline| *deadline <= now) {
            self.remove(key);
        }
    }

    fn purge_all_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .expiry
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.remove(&key);
        }
    }

    fn remove(&mut self, key: &str) -> bool {
        self.expiry.remove(key);
        let had_value = self.values.remove(key).is_some();
        let had_set = self.sets.remove(key).is_some();
        had_value || had_set
    }

    fn write(&mut self, key: &str, value: &str, ttl: Option<Duration>, now: Instant) {
        self.sets.remove(key);
        self.values.insert(key.to_string(), value.to_string());
        match ttl {
            Some(ttl) => {
                self.expiry.insert(key.to_string(), now + ttl);
            }
            None => {
                self.expiry.remove(key);
            }
        }
    }
}

struct Backend {
    state: Mutex<State>,
    bus: broadcast::Sender<StoreMessage>,
}

#[derive(Clone)]
pub struct MemoryStore {
    backend: Arc<Backend>,
    available: Arc<AtomicBool>,
    partition: Arc<Mutex<CancellationToken>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create a fresh, empty backend and a handle to it
    #[must_use]
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            backend: Arc::new(Backend {
                state: Mutex::new(State::default()),
                bus,
            }),
            available: Arc::new(AtomicBool::new(true)),
            partition: Arc::new(Mutex::new(CancellationToken::new())),
        }
    }

    /// Another handle to the same backend with its own availability switch
    #[must_use]
    pub fn connect(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            available: Arc::new(AtomicBool::new(true)),
            partition: Arc::new(Mutex::new(CancellationToken::new())),
        }
    }

    /// Cut this handle off from the backend or reconnect it.
    ///
    /// While unavailable every operation fails with `StoreUnavailable` and
    /// open subscriptions end, as they would on a dropped connection.
    pub fn set_available(&self, available: bool) {
        let was = self.available.swap(available, Ordering::SeqCst);
        if was && !available {
            let mut token = self.partition.lock();
            token.cancel();
            *token = CancellationToken::new();
        }
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(Error::StoreUnavailable("connection refused".to_string()))
        }
    }
}

/// Glob match supporting `*` only, which is all the key namespace uses
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern = pattern.as_bytes();
    let text = text.as_bytes();
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && pattern[p] == b'*' {
            star = Some((p, t));
            p += 1;
        } else if p < pattern.len() && pattern[p] == text[t] {
            p += 1;
            t += 1;
        } else if let Some((star_p, star_t)) = star {
            p = star_p + 1;
            t = star_t + 1;
            star = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|b| *b == b'*')
}

#[async_trait]
impl StoreClient for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        let mut state = self.backend.state.lock();
        state.purge_if_expired(key, Instant::now());
        Ok(state.values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.check()?;
        self.backend.state.lock().write(key, value, ttl, Instant::now());
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        self.check()?;
        let now = Instant::now();
        let mut state = self.backend.state.lock();
        state.purge_if_expired(key, now);

        if state.values.get(key).map(String::as_str) != expected {
            return Ok(false);
        }
        if expected.is_none() && state.sets.contains_key(key) {
            return Ok(false);
        }
        state.write(key, value, ttl, now);
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        self.check()?;
        let mut state = self.backend.state.lock();
        state.purge_if_expired(key, Instant::now());

        if state.values.get(key).map(String::as_str) == Some(expected) {
            state.remove(key);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn delete(&self, keys: &[String]) -> Result<usize> {
        self.check()?;
        let now = Instant::now();
        let mut state = self.backend.state.lock();
        let mut removed = 0;
        for key in keys {
            state.purge_if_expired(key, now);
            if state.remove(key) {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.check()?;
        let now = Instant::now();
        let mut state = self.backend.state.lock();
        state.purge_if_expired(key, now);

        if state.values.contains_key(key) || state.sets.contains_key(key) {
            state.expiry.insert(key.to_string(), now + ttl);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        self.check()?;
        let mut state = self.backend.state.lock();
        state.purge_all_expired(Instant::now());

        let mut keys: Vec<String> = state
            .values
            .keys()
            .chain(state.sets.keys())
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn set_add(&self, key: &str, members: &[String]) -> Result<usize> {
        self.check()?;
        let mut state = self.backend.state.lock();
        state.purge_if_expired(key, Instant::now());
        if state.values.contains_key(key) {
            return Err(Error::StoreUnavailable(format!(
                "WRONGTYPE key {key} holds a string value"
            )));
        }

        let set = state.sets.entry(key.to_string()).or_default();
        Ok(members.iter().filter(|m| set.insert((*m).clone())).count())
    }

    async fn set_remove(&self, key: &str, members: &[String]) -> Result<usize> {
        self.check()?;
        let mut state = self.backend.state.lock();
        state.purge_if_expired(key, Instant::now());

        let Some(set) = state.sets.get_mut(key) else {
            return Ok(0);
        };
        let removed = members.iter().filter(|m| set.remove(m.as_str())).count();
        if set.is_empty() {
            state.remove(key);
        }
        Ok(removed)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        self.check()?;
        let mut state = self.backend.state.lock();
        state.purge_if_expired(key, Instant::now());
        Ok(state
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_len(&self, key: &str) -> Result<usize> {
        self.check()?;
        let mut state = self.backend.state.lock();
        state.purge_if_expired(key, Instant::now());
        Ok(state.sets.get(key).map_or(0, HashSet::len))
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<usize> {
        self.check()?;
        let msg = StoreMessage {
            channel: channel.to_string(),
            payload: payload.to_vec(),
        };
        // No receivers is not an error
        Ok(self.backend.bus.send(msg).unwrap_or(0))
    }

    async fn subscribe(&self, channels: &[String]) -> Result<Subscription> {
        self.check()?;
        let rx = self.backend.bus.subscribe();
        let token = self.partition.lock().clone();
        let channels: HashSet<String> = channels.iter().cloned().collect();

        let stream = futures::stream::unfold(
            (rx, token, channels),
            |(mut rx, token, channels)| async move {
                loop {
                    tokio::select! {
                        () = token.cancelled() => return None,
                        received = rx.recv() => match received {
                            Ok(msg) if channels.contains(&msg.channel) => {
                                return Some((msg, (rx, token, channels)));
                            }
                            Ok(_) => {}
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(skipped, "In-memory subscriber lagged, messages dropped");
                            }
                            Err(broadcast::error::RecvError::Closed) => return None,
                        },
                    }
                }
            },
        );
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("a:*:players", "a:proxy-1:players"));
        assert!(glob_match("a:*:players", "a:x:y:players"));
        assert!(!glob_match("a:*:players", "a:proxy-1:heartbeat"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("exact", "exactly"));
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = MemoryStore::new();
        store
            .set("k", "v", Some(Duration::from_millis(30)))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.scan("*").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expire_extends_existing_keys_only() {
        let store = MemoryStore::new();
        store
            .set("lock", "proxy-a", Some(Duration::from_millis(40)))
            .await
            .unwrap();
        assert!(store
            .expire("lock", Duration::from_millis(200))
            .await
            .unwrap());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(store.get("lock").await.unwrap().as_deref(), Some("proxy-a"));

        assert!(!store.expire("missing", Duration::from_secs(1)).await.unwrap());
        assert!(store.scan("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_compare_and_set_semantics() {
        let store = MemoryStore::new();
        assert!(store.compare_and_set("k", None, "a", None).await.unwrap());
        assert!(!store.compare_and_set("k", None, "b", None).await.unwrap());
        assert!(!store.compare_and_set("k", Some("b"), "c", None).await.unwrap());
        assert!(store.compare_and_set("k", Some("a"), "c", None).await.unwrap());

        assert!(!store.compare_and_delete("k", "a").await.unwrap());
        assert!(store.compare_and_delete("k", "c").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_operations() {
        let store = MemoryStore::new();
        let members = vec!["a".to_string(), "b".to_string(), "a".to_string()];
        assert_eq!(store.set_add("s", &members).await.unwrap(), 2);
        assert_eq!(store.set_len("s").await.unwrap(), 2);
        assert!(store.set_add("s", &["a".to_string()]).await.is_ok());

        assert_eq!(store.set_remove("s", &members).await.unwrap(), 2);
        assert_eq!(store.set_len("s").await.unwrap(), 0);
        assert!(store.scan("s").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_partitioned_handle() {
        let shared = MemoryStore::new();
        let cut_off = shared.connect();

        cut_off.set_available(false);
        assert!(matches!(
            cut_off.get("k").await,
            Err(Error::StoreUnavailable(_))
        ));
        // Other handles are unaffected
        shared.set("k", "v", None).await.unwrap();

        cut_off.set_available(true);
        assert_eq!(cut_off.get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_subscription_filters_and_ends_on_partition() {
        let shared = MemoryStore::new();
        let subscriber = shared.connect();
        let mut sub = subscriber.subscribe(&["wanted".to_string()]).await.unwrap();

        shared.publish("ignored", b"x").await.unwrap();
        shared.publish("wanted", b"y").await.unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.payload, b"y");

        subscriber.set_available(false);
        let end = tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .unwrap();
        assert!(end.is_none());
    }
}
