//! Channel listing and opening

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::node::NodeConnection;
use crate::output::{format_channel, format_channels, print_success};
use ew_client::SessionCoordinator;
use ew_core::config::WalletConfig;
use ew_core::{Address, EventWalletId};

/// List the channels the node knows for `owner` (default: this wallet)
pub async fn channels_command(config: WalletConfig, owner: Option<Address>, json: bool) -> Result<()> {
    let node = NodeConnection::open(config).await?;
    let owner = owner.unwrap_or_else(|| node.wallet.address());

    let listed = node
        .channels
        .list_remote_channels(owner)
        .await
        .with_context(|| format!("Failed to list channels for {}", owner));
    node.close().await;
    let channels = listed?;

    if json {
        println!("{}", serde_json::to_string_pretty(&channels)?);
    } else {
        println!("{}", format_channels(&channels));
    }
    Ok(())
}

/// Open (or confirm) the channel for one event wallet
pub async fn open_command(config: WalletConfig, id: EventWalletId, owner: Option<Address>) -> Result<()> {
    let node = NodeConnection::open(config).await?;
    let owner = owner.unwrap_or_else(|| node.wallet.address());

    let coordinator = SessionCoordinator::new(node.channels.clone());
    let cancel = CancellationToken::new();
    let follower = tokio::spawn(coordinator.clone().run(cancel.clone()));

    let opened = coordinator
        .on_attendee_joined(&id, owner)
        .await
        .with_context(|| format!("Failed to open channel for {}", id));

    cancel.cancel();
    let _ = follower.await;
    node.close().await;

    let channel = opened?;
    print_success(&format_channel(&channel));
    Ok(())
}
