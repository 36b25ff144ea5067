pub mod id;
pub mod player;

pub use id::{generate_id, NetworkId, PlayerId, ProxyId};
pub use player::{PlayerMetadata, PlayerRecord, ProxyRecord};
