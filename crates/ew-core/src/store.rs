//! Store implementations
//!
//! - [`MemoryStore`]: process-local key-value store
//! - [`FileStore`]: key-value store persisted as one JSON object on disk
//! - [`MemoryChannelStore`]: in-memory channel record façade

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::traits::{ChannelStore, KeyValueStore};
use crate::types::{Address, AssetBalance, ChannelStatus, EventWalletId};

/// Key-value store backed by a concurrent map
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn put(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }
}

/// Key-value store persisted to a JSON file.
///
/// The whole map is rewritten on every change; it only ever holds a handful
/// of channel records and one token.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    /// Open a store, reading existing entries if the file exists
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(contents) if contents.trim().is_empty() => BTreeMap::new(),
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self, entries: &BTreeMap<String, String>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_string_pretty(entries)?;
        tokio::fs::write(&self.path, json).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))
                .await?;
        }

        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: String) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), value);
        self.flush(&entries).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        if entries.remove(key).is_some() {
            self.flush(&entries).await?;
        }
        Ok(())
    }
}

/// One row of [`MemoryChannelStore`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRow {
    pub owner: Option<Address>,
    pub channel_id: Option<String>,
    pub status: ChannelStatus,
    pub balances: Vec<AssetBalance>,
}

/// In-memory [`ChannelStore`]
#[derive(Debug, Default)]
pub struct MemoryChannelStore {
    rows: DashMap<EventWalletId, ChannelRow>,
}

impl MemoryChannelStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one row
    pub fn row(&self, id: &EventWalletId) -> Option<ChannelRow> {
        self.rows.get(id).map(|r| r.value().clone())
    }

    fn upsert(&self, id: &EventWalletId, update: impl FnOnce(&mut ChannelRow)) {
        let mut row = self.rows.entry(id.clone()).or_insert_with(|| ChannelRow {
            owner: None,
            channel_id: None,
            status: ChannelStatus::Pending,
            balances: Vec::new(),
        });
        update(row.value_mut());
    }
}

#[async_trait]
impl ChannelStore for MemoryChannelStore {
    async fn get_channel_status(
        &self,
        id: &EventWalletId,
    ) -> Result<Option<ChannelStatus>, StoreError> {
        Ok(self.rows.get(id).map(|r| r.status))
    }

    async fn initialize_channel(
        &self,
        id: &EventWalletId,
        owner: &Address,
    ) -> Result<(), StoreError> {
        self.upsert(id, |row| {
            row.owner = Some(*owner);
            row.status = ChannelStatus::Connecting;
        });
        Ok(())
    }

    async fn confirm_channel(&self, id: &EventWalletId, channel_id: &str) -> Result<(), StoreError> {
        self.upsert(id, |row| {
            row.channel_id = Some(channel_id.to_string());
            row.status = ChannelStatus::Open;
        });
        Ok(())
    }

    async fn update_channel_status(
        &self,
        id: &EventWalletId,
        status: ChannelStatus,
    ) -> Result<(), StoreError> {
        self.upsert(id, |row| row.status = status);
        Ok(())
    }

    async fn update_offchain_balance(
        &self,
        id: &EventWalletId,
        balances: &[AssetBalance],
    ) -> Result<(), StoreError> {
        self.upsert(id, |row| row.balances = balances.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{get_json, put_json};

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        assert!(store.get("k").await.unwrap().is_none());

        store.put("k", "v".to_string()).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        store.delete("k").await.unwrap();
        store.delete("k").await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("store.json");

        {
            let store = FileStore::open(&path).await.unwrap();
            put_json(&store, "channel:a", &vec!["x", "y"]).await.unwrap();
        }

        let reopened = FileStore::open(&path).await.unwrap();
        let value: Option<Vec<String>> = get_json(&reopened, "channel:a").await.unwrap();
        assert_eq!(value, Some(vec!["x".to_string(), "y".to_string()]));
    }

    #[tokio::test]
    async fn test_file_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, "{not json").unwrap();

        assert!(matches!(
            FileStore::open(&path).await,
            Err(StoreError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_channel_store_lifecycle() {
        let store = MemoryChannelStore::new();
        let id = EventWalletId::new("fest-2026:alice");
        let owner = Address::from_bytes([1; 20]);

        store.initialize_channel(&id, &owner).await.unwrap();
        assert_eq!(
            store.get_channel_status(&id).await.unwrap(),
            Some(ChannelStatus::Connecting)
        );

        store.confirm_channel(&id, "0xchan").await.unwrap();
        let row = store.row(&id).unwrap();
        assert_eq!(row.status, ChannelStatus::Open);
        assert_eq!(row.channel_id.as_deref(), Some("0xchan"));
        assert_eq!(row.owner, Some(owner));
    }
}
