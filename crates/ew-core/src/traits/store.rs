//! Persistence ports

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StoreError;
use crate::types::{Address, AssetBalance, ChannelStatus, EventWalletId};

/// Durable string key-value storage.
///
/// Holds channel identity records and the cached auth token so they survive
/// process restarts.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a value
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a value, replacing any previous one
    async fn put(&self, key: &str, value: String) -> Result<(), StoreError>;

    /// Remove a value; removing a missing key is not an error
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Read and decode a JSON value
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Encode and write a JSON value
pub async fn put_json<T: Serialize + Sync>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    store.put(key, serde_json::to_string(value)?).await
}

/// Record-level façade over the application database.
///
/// The channel manager reports channel lifecycle and balances here so the
/// rest of the application (dashboards, retry affordances) can see them.
/// Failures are logged by callers and never abort a channel operation.
#[async_trait]
pub trait ChannelStore: Send + Sync {
    /// Last recorded status, if any
    async fn get_channel_status(
        &self,
        id: &EventWalletId,
    ) -> Result<Option<ChannelStatus>, StoreError>;

    /// Record that a channel is being created
    async fn initialize_channel(&self, id: &EventWalletId, owner: &Address)
        -> Result<(), StoreError>;

    /// Record the node-assigned channel id of an open channel
    async fn confirm_channel(&self, id: &EventWalletId, channel_id: &str)
        -> Result<(), StoreError>;

    /// Record a status change
    async fn update_channel_status(
        &self,
        id: &EventWalletId,
        status: ChannelStatus,
    ) -> Result<(), StoreError>;

    /// Record balances exactly as the node reported them
    async fn update_offchain_balance(
        &self,
        id: &EventWalletId,
        balances: &[AssetBalance],
    ) -> Result<(), StoreError>;
}
