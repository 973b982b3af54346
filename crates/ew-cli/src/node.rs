//! Configuration loading and node connection setup shared by the commands

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

use ew_client::{AuthParams, ChannelManager, ClientConfig, ProtocolClient, WsTransport};
use ew_core::config::{self, WalletConfig};
use ew_core::store::FileStore;
use ew_core::{Address, KeyManager};

/// Resolve the config file path, falling back to the default location
pub fn config_file(config_path: Option<&PathBuf>) -> PathBuf {
    config_path.cloned().unwrap_or_else(config::default_config_path)
}

/// Load the effective wallet configuration
pub fn load_wallet_config(config_path: Option<&PathBuf>) -> Result<WalletConfig> {
    let path = config_file(config_path);
    config::resolve_wallet_config(&path)
        .with_context(|| format!("Invalid configuration ({:?})", path))
}

/// Load a key file, generating one if `generate` is set and it is missing
pub fn load_key(path: &Path, generate: bool) -> Result<KeyManager> {
    let key = if generate {
        KeyManager::load_or_generate(path)
    } else {
        KeyManager::load(path)
    };
    key.with_context(|| format!("Failed to load key from {:?}", path))
}

/// An authenticated connection plus the channel manager on top of it
pub struct NodeConnection {
    pub config: WalletConfig,
    pub wallet: KeyManager,
    /// Address of the key signing every request
    pub session: Address,
    pub client: ProtocolClient,
    pub channels: ChannelManager,
}

impl NodeConnection {
    /// Load keys and the record store, connect and authenticate
    pub async fn open(wallet_config: WalletConfig) -> Result<Self> {
        let wallet = load_key(&wallet_config.wallet_key_path, false)
            .context("Run 'event-wallet keygen' first")?;
        let session = load_key(&wallet_config.session_key_path, true)?;

        let store = Arc::new(
            FileStore::open(&wallet_config.store_path)
                .await
                .with_context(|| format!("Failed to open store {:?}", wallet_config.store_path))?,
        );

        let client = ProtocolClient::new(
            ClientConfig::from_wallet_config(&wallet_config),
            Arc::new(WsTransport::new()),
            session.signer(),
            store.clone(),
        );

        tracing::info!(
            wallet = %wallet.address(),
            session = %session.address(),
            "Connecting to {}",
            wallet_config.node_url
        );
        client
            .connect(AuthParams::from_config(&wallet_config, wallet.signer()))
            .await
            .with_context(|| format!("Failed to connect to {}", wallet_config.node_url))?;

        let channels = ChannelManager::new(client.clone(), wallet_config.channel.clone(), store);

        Ok(Self {
            config: wallet_config,
            wallet,
            session: session.address(),
            client,
            channels,
        })
    }

    /// Close the connection
    pub async fn close(self) {
        self.client.close().await;
    }
}
