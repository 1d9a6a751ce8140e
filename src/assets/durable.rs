//! Durable tier of the asset cache.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::DatabaseError;

/// One stored asset: the url it was fetched from, its bytes, and the unix
/// millisecond timestamp of insertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRecord {
    pub id: String,
    pub blob: Vec<u8>,
    pub timestamp: i64,
}

/// Reload-surviving key-value store for asset records.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<AssetRecord>, DatabaseError>;

    /// Insert or replace the record with the same id.
    async fn put(&self, record: &AssetRecord) -> Result<(), DatabaseError>;

    async fn delete(&self, id: &str) -> Result<(), DatabaseError>;

    async fn clear(&self) -> Result<(), DatabaseError>;

    async fn count(&self) -> Result<usize, DatabaseError>;
}

/// Process-local `DurableStore`.
#[derive(Default)]
pub struct MemoryDurableStore {
    records: RwLock<HashMap<String, AssetRecord>>,
}

impl MemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DurableStore for MemoryDurableStore {
    async fn get(&self, id: &str) -> Result<Option<AssetRecord>, DatabaseError> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn put(&self, record: &AssetRecord) -> Result<(), DatabaseError> {
        self.records.write().await.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), DatabaseError> {
        self.records.write().await.remove(id);
        Ok(())
    }

    async fn clear(&self) -> Result<(), DatabaseError> {
        self.records.write().await.clear();
        Ok(())
    }

    async fn count(&self) -> Result<usize, DatabaseError> {
        Ok(self.records.read().await.len())
    }
}
