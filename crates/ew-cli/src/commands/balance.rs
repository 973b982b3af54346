//! Balance query

use anyhow::{Context, Result};

use crate::node::NodeConnection;
use crate::output::{format_balances, print_error, print_info};
use ew_client::ChannelError;
use ew_core::config::WalletConfig;
use ew_core::{AssetBalance, EventWalletId};

/// Show the ledger balances behind an event wallet's recorded channel
pub async fn balance_command(config: WalletConfig, id: EventWalletId, json: bool) -> Result<()> {
    let node = NodeConnection::open(config).await?;

    let result: Result<Option<Vec<AssetBalance>>, ChannelError> = async {
        if node.channels.recover(&id).await?.is_none() {
            return Ok(None);
        }
        node.channels.get_balance(&id).await.map(Some)
    }
    .await;
    node.close().await;

    let balances = result.with_context(|| format!("Failed to read balance for {}", id))?;
    let Some(balances) = balances else {
        print_error(&format!("No channel recorded for {}", id));
        print_info(&format!("Open one with: event-wallet open {}", id));
        anyhow::bail!("unknown event wallet {}", id);
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&balances)?);
    } else {
        println!("{}", format_balances(&balances));
    }
    Ok(())
}
