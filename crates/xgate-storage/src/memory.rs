use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::sync::RwLock;

use crate::{StoreError, TokenStore, VersionedRecord};

/// In-memory backend, used by tests and as a fallback when no data
/// directory is writable.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<String, VersionedRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<VersionedRecord>, StoreError> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn put(
        &self,
        id: &str,
        record: JsonValue,
        expect_version: Option<u64>,
    ) -> Result<u64, StoreError> {
        let mut records = self.records.write().await;
        let current = records.get(id).map(|row| row.version);
        let next = match (expect_version, current) {
            (None, current) => current.unwrap_or(0) + 1,
            (Some(expected), Some(found)) if expected == found => found + 1,
            (Some(expected), found) => {
                return Err(StoreError::Conflict {
                    id: id.to_string(),
                    expected: Some(expected),
                    found: found.unwrap_or(0),
                });
            }
        };
        records.insert(
            id.to_string(),
            VersionedRecord {
                version: next,
                record,
            },
        );
        Ok(next)
    }

    async fn list(&self) -> Result<Vec<(String, VersionedRecord)>, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .map(|(id, row)| (id.clone(), row.clone()))
            .collect())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.records.write().await.remove(id);
        Ok(())
    }
}
