use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub redis: RedisConfig,
    pub proxy: ProxyConfig,
    pub heartbeat: HeartbeatConfig,
    pub cache: CacheConfig,
    pub bus: BusConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    /// Namespace for every key and channel this layer touches
    pub key_prefix: String,
    /// Upper bound for a single store round-trip
    pub operation_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "redisbungee".to_string(),
            operation_timeout_ms: 2_000,
        }
    }
}

impl RedisConfig {
    #[must_use]
    pub const fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

/// Identity of this proxy. No defaults: both ids must come from the host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub proxy_id: String,
    pub network_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
    /// Heartbeat key TTL is `interval * ttl_multiplier`
    pub ttl_multiplier: u32,
    /// Reconcile the stored player set with local state every N ticks (0 = never)
    pub reconcile_every_ticks: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            ttl_multiplier: 3,
            reconcile_every_ticks: 60,
        }
    }
}

impl HeartbeatConfig {
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    #[must_use]
    pub fn key_ttl(&self) -> Duration {
        self.interval() * self.ttl_multiplier
    }

    /// Age after which any observer considers a proxy dead: two intervals.
    #[must_use]
    pub fn staleness_threshold(&self) -> Duration {
        self.interval() * 2
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub player_ttl_ms: u64,
    pub aggregate_ttl_ms: u64,
    pub max_capacity: u64,
    /// How long an expired entry is kept around as last-known-good data
    /// for degraded mode
    pub stale_retention_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            player_ttl_ms: 30_000,
            aggregate_ttl_ms: 2_000,
            max_capacity: 100_000,
            stale_retention_ms: 600_000,
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub const fn player_ttl(&self) -> Duration {
        Duration::from_millis(self.player_ttl_ms)
    }

    #[must_use]
    pub const fn aggregate_ttl(&self) -> Duration {
        Duration::from_millis(self.aggregate_ttl_ms)
    }

    #[must_use]
    pub const fn stale_retention(&self) -> Duration {
        Duration::from_millis(self.stale_retention_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Reply deadline for network-wide requests
    pub request_deadline_ms: u64,
    /// First resubscribe delay after the subscription drops; doubles per
    /// failed attempt up to `reconnect_max_ms`
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            request_deadline_ms: 500,
            reconnect_initial_ms: 1_000,
            reconnect_max_ms: 30_000,
        }
    }
}

impl BusConfig {
    #[must_use]
    pub const fn request_deadline(&self) -> Duration {
        Duration::from_millis(self.request_deadline_ms)
    }

    #[must_use]
    pub const fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    #[must_use]
    pub const fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from file and environment variables
    ///
    /// Priority order:
    /// 1. Environment variables (highest priority)
    /// 2. Config file
    /// 3. Default values (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // REDISBUNGEE_PROXY__PROXY_ID, REDISBUNGEE_HEARTBEAT__INTERVAL_MS, ...
        builder = builder.add_source(
            Environment::with_prefix("REDISBUNGEE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Check every section, collecting all problems instead of stopping at
    /// the first one.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.redis.url.trim().is_empty() {
            errors.push("redis.url must not be empty".to_string());
        }
        if self.redis.key_prefix.contains(':') || self.redis.key_prefix.trim().is_empty() {
            errors.push("redis.key_prefix must be non-empty and must not contain ':'".to_string());
        }
        if self.redis.operation_timeout_ms == 0 {
            errors.push("redis.operation_timeout_ms must be greater than 0".to_string());
        }
        if self.proxy.proxy_id.trim().is_empty() {
            errors.push("proxy.proxy_id is required".to_string());
        }
        if self.proxy.network_id.trim().is_empty() {
            errors.push("proxy.network_id is required".to_string());
        }
        if self.heartbeat.interval_ms == 0 {
            errors.push("heartbeat.interval_ms must be greater than 0".to_string());
        }
        if self.heartbeat.ttl_multiplier < 2 {
            errors.push(format!(
                "heartbeat.ttl_multiplier must be at least 2 (got {})",
                self.heartbeat.ttl_multiplier
            ));
        }
        if self.cache.player_ttl_ms == 0 || self.cache.aggregate_ttl_ms == 0 {
            errors.push("cache TTLs must be greater than 0".to_string());
        }
        if self.cache.aggregate_ttl_ms > self.cache.player_ttl_ms {
            errors.push("cache.aggregate_ttl_ms must not exceed cache.player_ttl_ms".to_string());
        }
        if self.cache.max_capacity == 0 {
            errors.push("cache.max_capacity must be greater than 0".to_string());
        }
        if self.bus.request_deadline_ms == 0 {
            errors.push("bus.request_deadline_ms must be greater than 0".to_string());
        }
        if self.bus.reconnect_initial_ms == 0
            || self.bus.reconnect_max_ms < self.bus.reconnect_initial_ms
        {
            errors.push(
                "bus.reconnect_initial_ms must be > 0 and not exceed bus.reconnect_max_ms"
                    .to_string(),
            );
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be 'json' or 'pretty' (got '{}')",
                self.logging.format
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Get Redis URL
    #[must_use]
    pub fn redis_url(&self) -> &str {
        &self.redis.url
    }
}
