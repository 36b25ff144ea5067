// Module: sync

pub mod bus;
pub mod envelope;
pub mod events;

pub use bus::{EnvelopeHandler, MessageBus, QueryResponder};
pub use envelope::{Envelope, EnvelopeKind};
pub use events::{
    KickRequest, PluginMessage, PresenceEvent, ProxyLeaving, ProxyReaped, Query, QueryReply,
    RunCommand,
};
