//! Output formatting utilities for the CLI
//!
//! Tables for channels and balances, the status summary, and colored
//! one-line messages.

use tabled::{settings::Style, Table, Tabled};

use ew_client::Channel;
use ew_core::{Address, AssetBalance, ConnectionState};
use ew_protocol::message::ChannelInfo;

/// Format the node's channel list as an ASCII table
pub fn format_channels(channels: &[ChannelInfo]) -> String {
    if channels.is_empty() {
        return "No channels".to_string();
    }

    #[derive(Tabled)]
    struct ChannelRow {
        #[tabled(rename = "CHANNEL ID")]
        id: String,
        #[tabled(rename = "STATUS")]
        status: String,
        #[tabled(rename = "CHAIN")]
        chain: String,
        #[tabled(rename = "TOKEN")]
        token: String,
        #[tabled(rename = "AMOUNT")]
        amount: String,
    }

    let rows: Vec<ChannelRow> = channels
        .iter()
        .map(|c| ChannelRow {
            id: truncate(&c.channel_id, 18),
            status: c.status.clone(),
            chain: c
                .chain_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".to_string()),
            token: c
                .token
                .as_deref()
                .map(|t| truncate(t, 14))
                .unwrap_or_else(|| "-".to_string()),
            amount: c.amount.clone().unwrap_or_else(|| "-".to_string()),
        })
        .collect();

    Table::new(rows).with(Style::rounded()).to_string()
}

/// Format ledger balances exactly as reported
pub fn format_balances(balances: &[AssetBalance]) -> String {
    if balances.is_empty() {
        return "No balances".to_string();
    }

    #[derive(Tabled)]
    struct BalanceRow {
        #[tabled(rename = "ASSET")]
        asset: String,
        #[tabled(rename = "AMOUNT")]
        amount: String,
    }

    let rows: Vec<BalanceRow> = balances
        .iter()
        .map(|b| BalanceRow {
            asset: b.asset.clone(),
            amount: b.amount.clone(),
        })
        .collect();

    Table::new(rows).with(Style::rounded()).to_string()
}

/// One-line summary of a local channel
pub fn format_channel(channel: &Channel) -> String {
    format!(
        "{} [{}] channel {} owner {}",
        channel.event_wallet_id,
        channel.status,
        channel.channel_id.as_deref().unwrap_or("-"),
        channel.owner
    )
}

/// Connection summary shown by `status`
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub node_url: String,
    pub state: ConnectionState,
    pub wallet: Address,
    pub session: Address,
    pub channel_count: usize,
}

pub fn format_status(report: &StatusReport) -> String {
    let mut output = String::new();

    output.push_str(&format!("Node: {}\n", report.node_url));
    output.push_str(&format!("Connection: {}\n", report.state));
    output.push_str(&format!("Wallet: {}\n", report.wallet));
    output.push_str(&format!("Session Key: {}\n", report.session));
    output.push_str(&format!("Channels: {}\n", report.channel_count));

    output
}

/// Truncate a string with ellipsis if too long
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

fn print_colored(to_stderr: bool, color: crossterm::style::Color, prefix: &str, msg: &str) {
    use crossterm::style::{Print, ResetColor, SetForegroundColor};

    if to_stderr {
        let _ = crossterm::execute!(
            std::io::stderr(),
            SetForegroundColor(color),
            Print(prefix),
            ResetColor,
            Print(msg),
            Print("\n")
        );
    } else {
        let _ = crossterm::execute!(
            std::io::stdout(),
            SetForegroundColor(color),
            Print(prefix),
            ResetColor,
            Print(msg),
            Print("\n")
        );
    }
}

/// Print a success message in green
pub fn print_success(msg: &str) {
    print_colored(false, crossterm::style::Color::Green, "✓ ", msg);
}

/// Print an error message in red to stderr
pub fn print_error(msg: &str) {
    print_colored(true, crossterm::style::Color::Red, "✗ ", msg);
}

/// Print a warning in yellow to stderr
pub fn print_warning(msg: &str) {
    print_colored(true, crossterm::style::Color::Yellow, "⚠ ", msg);
}

/// Print an informational message in cyan
pub fn print_info(msg: &str) {
    print_colored(false, crossterm::style::Color::Cyan, "ℹ ", msg);
}
