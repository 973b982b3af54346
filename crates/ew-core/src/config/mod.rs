//! Configuration for event-wallet
//!
//! One TOML file (`config.toml` under the platform config dir) holds a
//! [`WalletConfig`]. Startup goes through [`resolve_wallet_config`]: file or
//! defaults, then `EVENT_WALLET_*` overrides, then validation.

mod serde_utils;
mod wallet;

pub use serde_utils::{duration_millis, duration_secs};
pub use wallet::{AllowanceConfig, ChannelDefaults, ReconnectConfig, WalletConfig};

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// `<platform config dir>/event-wallet`
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("event-wallet")
}

pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.toml")
}

/// Parse a TOML config file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConfigError::NotFound(path.to_path_buf()))
        }
        Err(e) => return Err(ConfigError::Invalid(format!("Failed to read {:?}: {}", path, e))),
    };

    Ok(toml::from_str(&content)?)
}

/// Write a config file, creating its directory
pub fn save_config<T: serde::Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::Invalid(format!("Failed to create {:?}: {}", parent, e)))?;
    }

    std::fs::write(path, content)
        .map_err(|e| ConfigError::Invalid(format!("Failed to write {:?}: {}", path, e)))
}

/// Load `path` (or defaults when it does not exist), apply environment
/// overrides and validate
pub fn resolve_wallet_config(path: &Path) -> Result<WalletConfig, ConfigError> {
    let mut config = match load_config::<WalletConfig>(path) {
        Ok(config) => config,
        Err(ConfigError::NotFound(_)) => {
            tracing::debug!("No config at {:?}, using defaults", path);
            WalletConfig::default()
        }
        Err(e) => return Err(e),
    };

    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}
