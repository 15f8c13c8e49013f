//! Persistence contract for token records.
//!
//! The pool is the only writer; everything else reads through snapshots.
//! Records are opaque JSON at this layer so schema evolution (and unknown
//! third-party fields) survive a save/load cycle. Every record carries a
//! monotonic version used for optimistic concurrency across workers.

mod file;
mod memory;

pub use file::JsonFileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("version conflict on record {id}: expected {expected:?}, found {found}")]
    Conflict {
        id: String,
        expected: Option<u64>,
        found: u64,
    },
    #[error("storage io: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage codec: {0}")]
    Codec(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedRecord {
    pub version: u64,
    pub record: JsonValue,
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<VersionedRecord>, StoreError>;

    /// Write a record. `expect_version` of `None` means "create or replace
    /// whatever is there"; `Some(v)` fails with [`StoreError::Conflict`]
    /// unless the stored version is exactly `v`. Returns the new version.
    async fn put(
        &self,
        id: &str,
        record: JsonValue,
        expect_version: Option<u64>,
    ) -> Result<u64, StoreError>;

    async fn list(&self) -> Result<Vec<(String, VersionedRecord)>, StoreError>;

    async fn delete(&self, id: &str) -> Result<(), StoreError>;
}
