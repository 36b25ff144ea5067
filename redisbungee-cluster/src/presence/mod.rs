// Module: presence

pub mod heartbeat;
pub mod registry;

pub use heartbeat::{HeartbeatLoop, TickReport};
pub use registry::{ClaimAck, HeartbeatRecord, PresenceRegistry, ReconcileReport};
