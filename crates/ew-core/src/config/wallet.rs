//! Wallet client configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::{duration_millis, duration_secs};
use crate::error::ConfigError;
use crate::types::Address;

/// Environment override for the node endpoint
pub const ENV_NODE_URL: &str = "EVENT_WALLET_NODE_URL";
/// Environment override for the reconnect base delay (milliseconds)
pub const ENV_RECONNECT_BASE_MS: &str = "EVENT_WALLET_RECONNECT_BASE_MS";
/// Environment override for the reconnect attempt cap
pub const ENV_RECONNECT_MAX_ATTEMPTS: &str = "EVENT_WALLET_RECONNECT_MAX_ATTEMPTS";
/// Environment override for the per-request timeout (seconds)
pub const ENV_REQUEST_TIMEOUT_SECS: &str = "EVENT_WALLET_REQUEST_TIMEOUT_SECS";

/// Configuration for the node connection and channel defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    /// WebSocket endpoint of the coordination node
    pub node_url: String,

    /// Application name sent in `auth_request`
    pub app_name: String,

    /// Application identity address bound into the auth policy
    pub application: Address,

    /// Scope requested for the session key
    pub scope: String,

    /// EIP-712 domain name for the auth policy
    pub domain_name: String,

    /// How long an authorization (and its cached token) stays valid
    #[serde(with = "duration_secs")]
    pub auth_ttl: Duration,

    /// Deadline for each handshake round-trip
    #[serde(with = "duration_secs")]
    pub auth_timeout: Duration,

    /// Default deadline for RPC requests
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,

    /// Allowances requested for the session key
    pub allowances: Vec<AllowanceConfig>,

    /// Reconnection policy
    pub reconnect: ReconnectConfig,

    /// Parameters for new channels
    pub channel: ChannelDefaults,

    /// Wallet (primary identity) key file
    pub wallet_key_path: PathBuf,

    /// Session (protocol signing) key file
    pub session_key_path: PathBuf,

    /// Key-value store file for channel records and tokens
    pub store_path: PathBuf,
}

impl Default for WalletConfig {
    fn default() -> Self {
        let config_dir = super::default_config_dir();

        Self {
            node_url: "wss://clearnet.yellow.com/ws".to_string(),
            app_name: "event-wallet".to_string(),
            application: Address::ZERO,
            scope: "app.event-wallet".to_string(),
            domain_name: "event-wallet".to_string(),
            auth_ttl: Duration::from_secs(24 * 60 * 60),
            auth_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            allowances: vec![],
            reconnect: ReconnectConfig::default(),
            channel: ChannelDefaults::default(),
            wallet_key_path: config_dir.join("wallet.key"),
            session_key_path: config_dir.join("session.key"),
            store_path: config_dir.join("store.json"),
        }
    }
}

impl WalletConfig {
    /// Apply `EVENT_WALLET_*` environment overrides
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|var| std::env::var(var).ok())
    }

    /// Apply overrides from an arbitrary lookup (the environment in production)
    pub fn apply_overrides_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(url) = lookup(ENV_NODE_URL) {
            self.node_url = url;
        }
        if let Some(ms) = lookup(ENV_RECONNECT_BASE_MS) {
            self.reconnect.base_delay = Duration::from_millis(parse_env(ENV_RECONNECT_BASE_MS, &ms)?);
        }
        if let Some(attempts) = lookup(ENV_RECONNECT_MAX_ATTEMPTS) {
            self.reconnect.max_attempts = parse_env(ENV_RECONNECT_MAX_ATTEMPTS, &attempts)?;
        }
        if let Some(secs) = lookup(ENV_REQUEST_TIMEOUT_SECS) {
            self.request_timeout = Duration::from_secs(parse_env(ENV_REQUEST_TIMEOUT_SECS, &secs)?);
        }
        Ok(())
    }

    /// Reject configurations the client cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_url.trim().is_empty() {
            return Err(ConfigError::Invalid("node_url is empty".into()));
        }
        if !(self.node_url.starts_with("ws://") || self.node_url.starts_with("wss://")) {
            return Err(ConfigError::Invalid(format!(
                "node_url must use ws:// or wss://, got {}",
                self.node_url
            )));
        }
        if self.request_timeout.is_zero() || self.auth_timeout.is_zero() {
            return Err(ConfigError::Invalid("timeouts must be non-zero".into()));
        }
        if self.auth_ttl.is_zero() {
            return Err(ConfigError::Invalid("auth_ttl must be non-zero".into()));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(var: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var: var.to_string(),
        value: value.to_string(),
    })
}

/// Allowance requested during auth
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowanceConfig {
    pub asset: String,
    pub amount: String,
}

/// Linear reconnect policy: attempt `n` waits `base_delay * n`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Whether unexpected drops trigger reconnects at all
    pub enabled: bool,

    /// Delay unit
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,

    /// Attempts before giving up and staying disconnected
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_delay: Duration::from_millis(1000),
            max_attempts: 5,
        }
    }
}

/// Parameters for `create_channel`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelDefaults {
    pub chain_id: u64,
    /// Token contract the channel is denominated in
    pub token: String,
    /// Ledger asset symbol used for sessions and balances
    pub asset: String,
}

impl Default for ChannelDefaults {
    fn default() -> Self {
        Self {
            chain_id: 137,
            token: Address::ZERO.to_hex(),
            asset: "usdc".to_string(),
        }
    }
}
