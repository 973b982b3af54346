//! Status command implementation

use anyhow::{Context, Result};

use crate::node::NodeConnection;
use crate::output::{format_status, print_error, StatusReport};
use ew_core::config::WalletConfig;

/// Connect, authenticate and summarize the connection
pub async fn status_command(config: WalletConfig) -> Result<()> {
    let node = match NodeConnection::open(config).await {
        Ok(node) => node,
        Err(e) => {
            print_error(&format!("Status unavailable: {:#}", e));
            return Err(e);
        }
    };

    let channels = node.channels.list_remote_channels(node.wallet.address()).await;
    let report = StatusReport {
        node_url: node.config.node_url.clone(),
        state: node.client.state(),
        wallet: node.wallet.address(),
        session: node.session,
        channel_count: channels.as_ref().map(Vec::len).unwrap_or(0),
    };
    println!("{}", format_status(&report));

    node.close().await;
    channels.context("Failed to list channels")?;
    Ok(())
}
