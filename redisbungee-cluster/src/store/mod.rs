//! Shared key-value / pub-sub store contract
//!
//! Everything the presence layer needs from the coordination store, and
//! nothing more. `RedisStore` is the production implementation;
//! `MemoryStore` implements identical semantics in-process for tests and
//! single-node deployments.

pub mod keys;
pub mod memory;
pub mod redis;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;

use crate::error::Result;

pub use self::keys::KeySpace;
pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// A message delivered by a store subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMessage {
    pub channel: String,
    pub payload: Vec<u8>,
}

/// Live subscription. The stream ends when the underlying connection drops;
/// the subscriber is expected to resubscribe.
pub type Subscription = BoxStream<'static, StoreMessage>;

/// Operations consumed from the shared store
///
/// Every call is bounded by the store's operation timeout. Timeouts and
/// connection failures surface as `Error::StoreUnavailable`.
#[async_trait]
pub trait StoreClient: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Unconditional write; `ttl = None` keeps the key until deleted
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Atomic conditional write.
    ///
    /// Writes `value` only if the current value equals `expected`
    /// (`None` = key must be absent or expired). Returns whether the write
    /// happened.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool>;

    /// Atomically delete `key` only while it still holds `expected`
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool>;

    /// Delete keys of any type, returning how many existed
    async fn delete(&self, keys: &[String]) -> Result<usize>;

    /// Set a TTL on an existing key. Returns false if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// All keys matching a glob pattern (`*` wildcards)
    async fn scan(&self, pattern: &str) -> Result<Vec<String>>;

    async fn set_add(&self, key: &str, members: &[String]) -> Result<usize>;

    async fn set_remove(&self, key: &str, members: &[String]) -> Result<usize>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    async fn set_len(&self, key: &str) -> Result<usize>;

    /// Publish to a channel, returning the number of receivers
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<usize>;

    async fn subscribe(&self, channels: &[String]) -> Result<Subscription>;
}
