use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tracing::warn;

use crate::{StoreError, TokenStore, VersionedRecord};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Catalog {
    records: BTreeMap<String, VersionedRecord>,
}

/// Single-file JSON backend.
///
/// The whole catalog is read and rewritten under one lock per operation;
/// writes go through a temp file + rename so a crash mid-write never leaves
/// a truncated catalog behind.
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn read_catalog(&self) -> Result<Catalog, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Catalog::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn write_catalog(&self, catalog: &Catalog) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(catalog)?;
        let tmp = tmp_path(&self.path);
        tokio::fs::write(&tmp, &bytes).await?;
        if let Err(err) = tokio::fs::rename(&tmp, &self.path).await {
            warn!(event = "store_rename_failed", error = %err, path = %self.path.display());
            return Err(err.into());
        }
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(ToOwned::to_owned).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[async_trait]
impl TokenStore for JsonFileStore {
    async fn get(&self, id: &str) -> Result<Option<VersionedRecord>, StoreError> {
        let _guard = self.lock.lock().await;
        Ok(self.read_catalog().await?.records.remove(id))
    }

    async fn put(
        &self,
        id: &str,
        record: JsonValue,
        expect_version: Option<u64>,
    ) -> Result<u64, StoreError> {
        let _guard = self.lock.lock().await;
        let mut catalog = self.read_catalog().await?;
        let current = catalog.records.get(id).map(|row| row.version);
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
        catalog.records.insert(
            id.to_string(),
            VersionedRecord {
                version: next,
                record,
            },
        );
        self.write_catalog(&catalog).await?;
        Ok(next)
    }

    async fn list(&self) -> Result<Vec<(String, VersionedRecord)>, StoreError> {
        let _guard = self.lock.lock().await;
        Ok(self.read_catalog().await?.records.into_iter().collect())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut catalog = self.read_catalog().await?;
        if catalog.records.remove(id).is_some() {
            self.write_catalog(&catalog).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_store(name: &str) -> JsonFileStore {
        let dir = std::env::temp_dir().join("xgate-storage-tests");
        JsonFileStore::new(dir.join(format!("{name}-{}.json", std::process::id())))
    }

    #[tokio::test]
    async fn round_trips_records_with_unknown_fields() {
        let store = temp_store("roundtrip");
        let record = json!({
            "class": "Basic",
            "consecutive_failures": 2,
            "some_future_field": {"nested": [1, 2, 3]},
        });
        let version = store.put("tok-a", record.clone(), None).await.unwrap();
        assert_eq!(version, 1);

        let loaded = store.get("tok-a").await.unwrap().unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.record, record);
        store.delete("tok-a").await.unwrap();
    }

    #[tokio::test]
    async fn put_with_stale_version_conflicts() {
        let store = temp_store("conflict");
        store.put("tok-b", json!({"v": 1}), None).await.unwrap();
        store.put("tok-b", json!({"v": 2}), Some(1)).await.unwrap();

        let err = store.put("tok-b", json!({"v": 3}), Some(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { found: 2, .. }));
        store.delete("tok-b").await.unwrap();
    }

    #[tokio::test]
    async fn delete_then_get_is_none() {
        let store = temp_store("delete");
        store.put("tok-c", json!({}), None).await.unwrap();
        store.delete("tok-c").await.unwrap();
        assert!(store.get("tok-c").await.unwrap().is_none());
    }
}
