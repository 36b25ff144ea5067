pub mod adapter;
pub mod cache;
pub mod error;
pub mod health;
pub mod node;
pub mod presence;
pub mod store;
pub mod sync;

pub use adapter::{LoggingAdapter, PlayerLifecycle, ProxyAdapter};
pub use cache::{Cached, Freshness, LocalCache};
pub use error::{Error, Result};
pub use health::{HealthStatus, HealthTracker};
pub use node::PresenceNode;
pub use presence::{ClaimAck, HeartbeatLoop, PresenceRegistry};
pub use store::{KeySpace, MemoryStore, RedisStore, StoreClient};
pub use sync::{Envelope, EnvelopeKind, MessageBus, PluginMessage, PresenceEvent};
