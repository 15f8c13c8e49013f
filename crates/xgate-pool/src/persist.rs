use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use xgate_common::mask_token;
use xgate_storage::{StoreError, TokenStore};

use crate::pool::TokenPool;
use crate::record::{TokenId, TokenRecord};

/// Bridges the in-memory pool and the storage contract.
///
/// Writes are coalesced: mutations mark records dirty and ping a signal;
/// the flusher waits out the debounce window and writes everything dirty
/// in one pass. Reads go the other way on an interval, applying records
/// whose persisted version moved under us (another worker wrote them).
pub struct Persister {
    pool: Arc<TokenPool>,
    store: Arc<dyn TokenStore>,
    versions: Mutex<HashMap<TokenId, u64>>,
}

impl Persister {
    /// Load the catalog into the pool and remember per-record versions.
    pub async fn bootstrap(
        pool: Arc<TokenPool>,
        store: Arc<dyn TokenStore>,
    ) -> Result<Arc<Self>, StoreError> {
        let rows = store.list().await?;
        let mut versions = HashMap::with_capacity(rows.len());
        let mut loaded = 0usize;
        for (id, row) in rows {
            match serde_json::from_value::<TokenRecord>(row.record) {
                Ok(record) => {
                    pool.apply_external(&id, record).await;
                    versions.insert(id, row.version);
                    loaded += 1;
                }
                Err(err) => {
                    error!(
                        event = "record_decode_failed",
                        token = %mask_token(&id),
                        error = %err,
                    );
                }
            }
        }
        info!(event = "pool_loaded", records = loaded);
        Ok(Arc::new(Self {
            pool,
            store,
            versions: Mutex::new(versions),
        }))
    }

    /// Write every dirty record (or delete ids with no record left).
    pub async fn flush_dirty(&self) {
        let dirty = self.pool.take_dirty().await;
        if dirty.is_empty() {
            return;
        }
        debug!(event = "pool_flush", records = dirty.len());
        for id in dirty {
            match self.pool.get(&id).await {
                Some(record) => self.put_record(&id, &record).await,
                None => {
                    if let Err(err) = self.store.delete(&id).await {
                        warn!(
                            event = "record_delete_failed",
                            token = %mask_token(&id),
                            error = %err,
                        );
                    }
                    self.versions.lock().await.remove(&id);
                }
            }
        }
    }

    async fn put_record(&self, id: &TokenId, record: &TokenRecord) {
        let value = match serde_json::to_value(record) {
            Ok(value) => value,
            Err(err) => {
                error!(event = "record_encode_failed", token = %mask_token(id), error = %err);
                return;
            }
        };
        let expect = self.versions.lock().await.get(id).copied();
        match self.store.put(id, value.clone(), expect).await {
            Ok(version) => {
                self.versions.lock().await.insert(id.clone(), version);
            }
            Err(StoreError::Conflict { found, .. }) => {
                warn!(
                    event = "record_write_conflict",
                    token = %mask_token(id),
                    expected = expect.unwrap_or(0),
                    found,
                );
                match self.store.put(id, value, Some(found)).await {
                    Ok(version) => {
                        self.versions.lock().await.insert(id.clone(), version);
                    }
                    Err(err) => {
                        error!(
                            event = "record_write_failed",
                            token = %mask_token(id),
                            error = %err,
                        );
                        self.pool.requeue_dirty([id.clone()]).await;
                    }
                }
            }
            Err(err) => {
                warn!(event = "record_write_failed", token = %mask_token(id), error = %err);
                self.pool.requeue_dirty([id.clone()]).await;
            }
        }
    }

    /// Pull records other workers changed since our cached versions.
    pub async fn reload_changed(&self) -> Result<usize, StoreError> {
        let rows = self.store.list().await?;
        let mut seen: HashSet<TokenId> = HashSet::with_capacity(rows.len());
        let mut applied = 0usize;
        for (id, row) in rows {
            seen.insert(id.clone());
            let known = self.versions.lock().await.get(&id).copied();
            if known == Some(row.version) {
                continue;
            }
            if self.pool.is_dirty(&id).await {
                // Our unflushed mutation wins; the flusher resolves the
                // version conflict on its next pass.
                continue;
            }
            match serde_json::from_value::<TokenRecord>(row.record) {
                Ok(record) => {
                    self.pool.apply_external(&id, record).await;
                    self.versions.lock().await.insert(id.clone(), row.version);
                    applied += 1;
                }
                Err(err) => {
                    warn!(
                        event = "record_decode_failed",
                        token = %mask_token(&id),
                        error = %err,
                    );
                }
            }
        }

        let known_ids: Vec<TokenId> = self.versions.lock().await.keys().cloned().collect();
        for id in known_ids {
            if !seen.contains(&id) {
                self.pool.remove_external(&id).await;
                self.versions.lock().await.remove(&id);
                applied += 1;
            }
        }
        Ok(applied)
    }
}

/// Spawn the debounced flusher and the periodic reload loop.
pub fn spawn_persistence(
    persister: Arc<Persister>,
    save_delay: Duration,
    reload_interval: Duration,
) -> Vec<JoinHandle<()>> {
    let flusher = {
        let persister = persister.clone();
        let signal = persister.pool.dirty_signal();
        tokio::spawn(async move {
            loop {
                signal.notified().await;
                tokio::time::sleep(save_delay).await;
                persister.flush_dirty().await;
            }
        })
    };
    let reloader = tokio::spawn(async move {
        loop {
            tokio::time::sleep(reload_interval).await;
            if let Err(err) = persister.reload_changed().await {
                warn!(event = "pool_reload_failed", error = %err);
            }
        }
    });
    vec![flusher, reloader]
}
