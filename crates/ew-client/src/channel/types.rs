//! Channel and session records

use serde::{Deserialize, Serialize};

use ew_core::{Address, AssetBalance, ChannelStatus, EventWalletId, SessionStatus};

/// Store key prefix of durable channel records
pub const CHANNEL_RECORD_PREFIX: &str = "channel:";

/// Key-value store key for one wallet's channel record
pub fn channel_record_key(id: &EventWalletId) -> String {
    format!("{CHANNEL_RECORD_PREFIX}{id}")
}

/// A payment channel for one event wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub event_wallet_id: EventWalletId,
    /// Assigned by the node once the channel exists
    pub channel_id: Option<String>,
    pub owner: Address,
    pub status: ChannelStatus,
    /// Unix milliseconds
    pub created_at: u64,
    /// Application session opened on this channel, if any
    pub session_id: Option<String>,
}

/// An application session between the owner and a counterparty
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub event_wallet_id: EventWalletId,
    pub participant: Address,
    pub counterparty: Option<Address>,
    pub status: SessionStatus,
    /// Last balance reported by the node; `None` until one arrives
    pub balance: Option<String>,
    /// Unix milliseconds
    pub created_at: u64,
    pub updated_at: u64,
}

/// What survives a restart: enough to re-derive a channel's identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub event_wallet_id: EventWalletId,
    pub owner: Address,
    pub channel_id: Option<String>,
}

impl From<&Channel> for ChannelRecord {
    fn from(channel: &Channel) -> Self {
        Self {
            event_wallet_id: channel.event_wallet_id.clone(),
            owner: channel.owner,
            channel_id: channel.channel_id.clone(),
        }
    }
}

/// Pick the amount of `asset` out of a node balance report
pub fn balance_of(balances: &[AssetBalance], asset: &str) -> Option<String> {
    balances
        .iter()
        .find(|b| b.asset.eq_ignore_ascii_case(asset))
        .map(|b| b.amount.clone())
}
