//! Configuration loading

use std::path::Path;

use crate::error::{ConfigError, Result};
use crate::Config;

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "REDISBUNGEE_CONFIG_PATH";

/// Default config file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "redisbungee.yaml";

/// Load configuration from a config file and environment variables
///
/// Config file search order:
/// 1. `explicit` (command-line flag)
/// 2. `REDISBUNGEE_CONFIG_PATH` environment variable
/// 3. ./redisbungee.yaml (current working directory)
/// 4. Fall back to environment variables only
///
/// An explicitly requested file that does not exist is an error; the
/// implicit locations are skipped silently.
pub fn load_config(explicit: Option<&str>) -> Result<Config> {
    if let Some(path) = explicit {
        if !Path::new(path).exists() {
            return Err(ConfigError::Invalid(vec![format!(
                "config file '{path}' does not exist"
            )]));
        }
        return Ok(Config::from_file(path)?);
    }

    let config_path = std::env::var(CONFIG_PATH_ENV)
        .ok()
        .filter(|p| Path::new(p).exists())
        .or_else(|| {
            Path::new(DEFAULT_CONFIG_FILE)
                .exists()
                .then(|| DEFAULT_CONFIG_FILE.to_string())
        });

    let config = match config_path {
        Some(path) => {
            tracing::debug!(path = %path, "Loading config file");
            Config::from_file(&path)?
        }
        None => Config::from_env()?,
    };

    Ok(config)
}

/// Validate a loaded configuration, turning the collected problems into a
/// single fatal error.
pub fn ensure_valid(config: &Config) -> Result<()> {
    config.validate().map_err(|errors| {
        for error in &errors {
            tracing::error!("Config validation error: {}", error);
        }
        ConfigError::Invalid(errors)
    })
}
