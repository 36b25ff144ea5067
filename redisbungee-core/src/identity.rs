//! Static identity of this proxy process

use crate::config::ProxyConfig;
use crate::error::{ConfigError, Result};
use crate::models::{generate_id, NetworkId, ProxyId};

/// Who this process is: tags every store write and every published envelope.
///
/// Immutable after construction; share it by cloning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyIdentity {
    proxy_id: ProxyId,
    network_id: NetworkId,
    /// Random per-process id, distinguishes two processes misconfigured with
    /// the same proxy id
    instance_id: String,
}

impl ProxyIdentity {
    /// Build an identity, failing fast when either id is blank.
    pub fn new(proxy_id: impl Into<String>, network_id: impl Into<String>) -> Result<Self> {
        let proxy_id = proxy_id.into();
        let network_id = network_id.into();

        if proxy_id.trim().is_empty() {
            return Err(ConfigError::Missing("proxy.proxy_id"));
        }
        if network_id.trim().is_empty() {
            return Err(ConfigError::Missing("proxy.network_id"));
        }

        Ok(Self {
            proxy_id: ProxyId::from_string(proxy_id),
            network_id: NetworkId::from_string(network_id),
            instance_id: generate_id(),
        })
    }

    pub fn from_config(config: &ProxyConfig) -> Result<Self> {
        Self::new(config.proxy_id.clone(), config.network_id.clone())
    }

    #[must_use]
    pub const fn proxy_id(&self) -> &ProxyId {
        &self.proxy_id
    }

    #[must_use]
    pub const fn network_id(&self) -> &NetworkId {
        &self.network_id
    }

    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }
}
