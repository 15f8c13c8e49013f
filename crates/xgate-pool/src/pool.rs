use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use time::OffsetDateTime;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, warn};

use xgate_common::mask_token;

use crate::events::{PoolEvent, PoolEventHub};
use crate::record::{ClassHint, QuotaBucket, TokenClass, TokenId, TokenRecord};

#[derive(Debug, Clone, thiserror::Error)]
pub enum AcquireError {
    #[error("no selectable token for class hint {hint:?}")]
    PoolEmpty { hint: ClassHint },
}

/// Snapshot handed to the pipeline for one upstream attempt.
///
/// A lease is not an exclusive lock: several requests may hold leases on
/// the same token concurrently.
#[derive(Debug, Clone)]
pub struct TokenLease {
    pub id: TokenId,
    pub class: TokenClass,
    pub bucket: QuotaBucket,
    pub fell_back: bool,
    pub record: TokenRecord,
}

#[derive(Debug, Clone)]
pub enum Outcome {
    Success {
        quota_hint: Option<(QuotaBucket, i64)>,
    },
    TransientFailure {
        status: Option<u16>,
        reason: String,
    },
    TerminalFailure {
        reason: String,
    },
    QuotaExhausted {
        reset_at: OffsetDateTime,
    },
}

/// Operator-applied partial update.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecordPatch {
    #[serde(default)]
    pub tags: Option<BTreeSet<String>>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub disabled: Option<bool>,
    #[serde(default)]
    pub class: Option<TokenClass>,
}

/// Selection order within a class: least-recently-used first, then the
/// largest advisory remaining budget, then the fewest consecutive
/// failures. Tokens that were never used (or never probed) sort ahead so
/// fresh imports get exercised immediately.
///
/// `use_seq` is a process-local acquisition counter breaking wall-clock
/// ties; without it, two acquisitions inside one clock granule would keep
/// re-selecting the same head.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SelectionKey {
    last_used_ms: i64,
    use_seq: u64,
    remaining_rank: i64,
    failures: u32,
    id: TokenId,
}

fn selection_key(
    id: &TokenId,
    record: &TokenRecord,
    bucket: QuotaBucket,
    use_seq: u64,
) -> SelectionKey {
    SelectionKey {
        last_used_ms: record
            .last_used_at
            .map(|at| (at.unix_timestamp_nanos() / 1_000_000) as i64)
            .unwrap_or(i64::MIN),
        use_seq,
        remaining_rank: -record.remaining(bucket).unwrap_or(i64::MAX),
        failures: record.consecutive_failures,
        id: id.clone(),
    }
}

fn class_buckets(class: TokenClass) -> &'static [QuotaBucket] {
    match class {
        TokenClass::Basic => &[QuotaBucket::Default],
        TokenClass::Super => &[QuotaBucket::Default, QuotaBucket::Heavy],
    }
}

#[derive(Default)]
struct Inner {
    records: HashMap<TokenId, TokenRecord>,
    index: HashMap<(TokenClass, QuotaBucket), BTreeSet<SelectionKey>>,
    cooling: HashMap<TokenId, OffsetDateTime>,
    dirty: HashSet<TokenId>,
    use_seq: u64,
    last_seq: HashMap<TokenId, u64>,
}

impl Inner {
    fn index_remove(&mut self, id: &TokenId) {
        let Some(record) = self.records.get(id) else {
            return;
        };
        let seq = self.last_seq.get(id).copied().unwrap_or(0);
        for bucket in class_buckets(record.class) {
            if let Some(set) = self.index.get_mut(&(record.class, *bucket)) {
                set.remove(&selection_key(id, record, *bucket, seq));
            }
        }
    }

    fn index_insert(&mut self, id: &TokenId) {
        let Some(record) = self.records.get(id) else {
            return;
        };
        if record.disabled {
            return;
        }
        let seq = self.last_seq.get(id).copied().unwrap_or(0);
        for bucket in class_buckets(record.class) {
            self.index
                .entry((record.class, *bucket))
                .or_default()
                .insert(selection_key(id, record, *bucket, seq));
        }
    }

    /// Reindex around a mutation; returns false when the id is unknown.
    fn mutate(&mut self, id: &TokenId, apply: impl FnOnce(&mut TokenRecord)) -> bool {
        if !self.records.contains_key(id) {
            return false;
        }
        self.index_remove(id);
        if let Some(record) = self.records.get_mut(id) {
            apply(record);
        }
        self.index_insert(id);
        self.dirty.insert(id.clone());
        true
    }
}

pub struct TokenPool {
    inner: RwLock<Inner>,
    events: PoolEventHub,
    dirty_signal: Arc<Notify>,
    fail_threshold: u32,
}

impl TokenPool {
    pub fn new(fail_threshold: u32, events: PoolEventHub) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            events,
            dirty_signal: Arc::new(Notify::new()),
            fail_threshold,
        }
    }

    pub fn events(&self) -> &PoolEventHub {
        &self.events
    }

    pub fn subscribe_changes(&self) -> tokio::sync::broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Signal observed by the persistence flusher.
    pub fn dirty_signal(&self) -> Arc<Notify> {
        self.dirty_signal.clone()
    }

    fn notify_dirty(&self) {
        self.dirty_signal.notify_one();
    }

    pub async fn acquire(&self, hint: ClassHint) -> Result<TokenLease, AcquireError> {
        self.acquire_excluding(hint, &[]).await
    }

    /// Acquire the best selectable token, skipping ids already tried by
    /// this request.
    pub async fn acquire_excluding(
        &self,
        hint: ClassHint,
        exclude: &[TokenId],
    ) -> Result<TokenLease, AcquireError> {
        let attempts: &[(TokenClass, bool)] = match hint {
            ClassHint::Basic => &[(TokenClass::Basic, false)],
            ClassHint::Super => &[(TokenClass::Super, false)],
            ClassHint::SuperPreferred => &[(TokenClass::Super, false), (TokenClass::Basic, true)],
        };
        let bucket = hint.bucket();
        let now = OffsetDateTime::now_utc();

        let mut inner = self.inner.write().await;
        for (class, fell_back) in attempts {
            let Some(id) = select_candidate(&mut inner, *class, bucket, exclude, now) else {
                continue;
            };
            inner.index_remove(&id);
            inner.use_seq += 1;
            let seq = inner.use_seq;
            inner.last_seq.insert(id.clone(), seq);
            if let Some(record) = inner.records.get_mut(&id) {
                record.last_used_at = Some(now);
            }
            inner.index_insert(&id);
            inner.dirty.insert(id.clone());
            let Some(record) = inner.records.get(&id).cloned() else {
                continue;
            };
            drop(inner);
            self.notify_dirty();
            if *fell_back {
                warn!(
                    event = "class_fallback",
                    token = %mask_token(&id),
                    "no Super token selectable, serving SuperPreferred request from Basic pool"
                );
            }
            return Ok(TokenLease {
                id,
                class: *class,
                bucket,
                fell_back: *fell_back,
                record,
            });
        }
        Err(AcquireError::PoolEmpty { hint })
    }

    pub async fn release(&self, lease: TokenLease, outcome: Outcome) {
        let now = OffsetDateTime::now_utc();
        let mut inner = self.inner.write().await;
        if !inner.records.contains_key(&lease.id) {
            return;
        }

        match outcome {
            Outcome::Success { quota_hint } => {
                inner.mutate(&lease.id, |record| {
                    record.reset_transient();
                    if let Some((bucket, remaining)) = quota_hint {
                        record.set_quota(bucket, remaining, None);
                    }
                });
                debug!(event = "token_success", token = %mask_token(&lease.id));
            }
            Outcome::TransientFailure { status, reason } => {
                let threshold = self.fail_threshold;
                let mut crossed = false;
                inner.mutate(&lease.id, |record| {
                    record.consecutive_failures += 1;
                    record.last_failure_at = Some(now);
                    record.last_failure_reason = Some(reason.clone());
                    if record.consecutive_failures >= threshold && !record.disabled {
                        record.disabled = true;
                        crossed = true;
                    }
                });
                let failures = inner
                    .records
                    .get(&lease.id)
                    .map(|record| record.consecutive_failures)
                    .unwrap_or(0);
                warn!(
                    event = "token_failure",
                    token = %mask_token(&lease.id),
                    status = status.unwrap_or(0),
                    failures,
                    threshold,
                    reason = %reason,
                );
                if crossed {
                    self.events.emit(PoolEvent::Disabled {
                        id: lease.id.clone(),
                        reason: format!("{threshold} consecutive failures"),
                    });
                }
            }
            Outcome::TerminalFailure { reason } => {
                inner.mutate(&lease.id, |record| {
                    record.disabled = true;
                    record.last_failure_at = Some(now);
                    record.last_failure_reason = Some(reason.clone());
                });
                warn!(
                    event = "token_disabled",
                    token = %mask_token(&lease.id),
                    reason = %reason,
                );
                self.events.emit(PoolEvent::Disabled {
                    id: lease.id.clone(),
                    reason,
                });
            }
            Outcome::QuotaExhausted { reset_at } => {
                inner.cooling.insert(lease.id.clone(), reset_at);
                inner.mutate(&lease.id, |record| {
                    record.set_quota(lease.bucket, 0, Some(reset_at));
                });
                self.events.emit(PoolEvent::CoolingStarted {
                    id: lease.id.clone(),
                    until: reset_at,
                });
            }
        }
        drop(inner);
        self.notify_dirty();
    }

    // ---- Operator operations ----

    pub async fn import(&self, entries: Vec<(TokenId, TokenRecord)>) -> usize {
        let mut inner = self.inner.write().await;
        let mut count = 0;
        let mut imported = Vec::new();
        for (id, record) in entries {
            if id.trim().is_empty() {
                continue;
            }
            inner.index_remove(&id);
            inner.records.insert(id.clone(), record);
            inner.index_insert(&id);
            inner.dirty.insert(id.clone());
            imported.push(id);
            count += 1;
        }
        drop(inner);
        for id in imported {
            self.events.emit(PoolEvent::Imported { id });
        }
        if count > 0 {
            self.notify_dirty();
        }
        count
    }

    pub async fn remove(&self, ids: &[TokenId]) -> usize {
        let mut inner = self.inner.write().await;
        let mut count = 0;
        let mut removed = Vec::new();
        for id in ids {
            inner.index_remove(id);
            if inner.records.remove(id).is_some() {
                inner.cooling.remove(id);
                inner.last_seq.remove(id);
                // Leave the id in the dirty set so the flusher deletes it.
                inner.dirty.insert(id.clone());
                removed.push(id.clone());
                count += 1;
            }
        }
        drop(inner);
        for id in removed {
            self.events.emit(PoolEvent::Removed { id });
        }
        if count > 0 {
            self.notify_dirty();
        }
        count
    }

    pub async fn replace_record(&self, id: &TokenId, patch: RecordPatch) -> bool {
        let now = OffsetDateTime::now_utc();
        let mut inner = self.inner.write().await;
        let reenabled = patch.disabled == Some(false);
        let applied = inner.mutate(id, |record| {
            if let Some(tags) = patch.tags {
                record.tags = tags;
            }
            if let Some(note) = patch.note {
                record.note = note;
            }
            if let Some(class) = patch.class {
                record.class = class;
            }
            if let Some(disabled) = patch.disabled {
                record.disabled = disabled;
                if !disabled {
                    record.reset_transient();
                    record.last_cleared_at = Some(now);
                }
            }
        });
        if applied && reenabled {
            inner.cooling.remove(id);
        }
        drop(inner);
        if applied {
            self.events.emit(PoolEvent::Updated { id: id.clone() });
            self.notify_dirty();
        }
        applied
    }

    /// Stamp a successful remote-asset purge.
    pub async fn mark_assets_cleared(&self, id: &TokenId) {
        let now = OffsetDateTime::now_utc();
        let mut inner = self.inner.write().await;
        let applied = inner.mutate(id, |record| {
            record.last_cleared_at = Some(now);
        });
        drop(inner);
        if applied {
            self.notify_dirty();
        }
    }

    pub async fn get(&self, id: &TokenId) -> Option<TokenRecord> {
        self.inner.read().await.records.get(id).cloned()
    }

    pub async fn list_all(&self) -> Vec<(TokenId, TokenRecord)> {
        let inner = self.inner.read().await;
        let mut rows: Vec<_> = inner
            .records
            .iter()
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }

    pub async fn ids_for_class(&self, class: Option<TokenClass>) -> Vec<TokenId> {
        let inner = self.inner.read().await;
        let mut ids: Vec<_> = inner
            .records
            .iter()
            .filter(|(_, record)| class.is_none_or(|wanted| record.class == wanted))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    // ---- Persistence support ----

    pub async fn take_dirty(&self) -> HashSet<TokenId> {
        std::mem::take(&mut self.inner.write().await.dirty)
    }

    pub async fn is_dirty(&self, id: &TokenId) -> bool {
        self.inner.read().await.dirty.contains(id)
    }

    pub async fn requeue_dirty(&self, ids: impl IntoIterator<Item = TokenId>) {
        let mut inner = self.inner.write().await;
        inner.dirty.extend(ids);
        drop(inner);
        self.notify_dirty();
    }

    /// Apply a record observed in storage (another worker's write) without
    /// marking it dirty again.
    pub async fn apply_external(&self, id: &TokenId, record: TokenRecord) {
        let mut inner = self.inner.write().await;
        inner.index_remove(id);
        inner.records.insert(id.clone(), record);
        inner.index_insert(id);
        drop(inner);
        self.events.emit(PoolEvent::Updated { id: id.clone() });
    }

    pub async fn remove_external(&self, id: &TokenId) {
        let mut inner = self.inner.write().await;
        if inner.dirty.contains(id) {
            // Locally mutated but not yet flushed; keep our copy.
            return;
        }
        inner.index_remove(id);
        if inner.records.remove(id).is_some() {
            inner.cooling.remove(id);
            drop(inner);
            self.events.emit(PoolEvent::Removed { id: id.clone() });
        }
    }

    /// One-shot startup pass: clear transient failure state on records
    /// that have been idle for longer than `idle`.
    pub async fn reconcile(&self, idle: Duration) -> usize {
        let cutoff = OffsetDateTime::now_utc() - idle;
        let mut inner = self.inner.write().await;
        let stale: Vec<TokenId> = inner
            .records
            .iter()
            .filter(|(_, record)| {
                record.last_used_at.is_some_and(|at| at < cutoff)
                    && (record.consecutive_failures > 0 || record.last_failure_reason.is_some())
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            inner.mutate(id, TokenRecord::reset_transient);
            inner.cooling.remove(id);
        }
        let count = stale.len();
        drop(inner);
        if count > 0 {
            debug!(event = "pool_reconcile", reset = count);
            self.notify_dirty();
        }
        count
    }

    // ---- Refresh support ----

    pub async fn stale_for_refresh(
        &self,
        basic_interval: Duration,
        super_interval: Duration,
    ) -> Vec<(TokenId, TokenClass)> {
        let now = OffsetDateTime::now_utc();
        let inner = self.inner.read().await;
        inner
            .records
            .iter()
            .filter(|(_, record)| {
                let interval = match record.class {
                    TokenClass::Basic => basic_interval,
                    TokenClass::Super => super_interval,
                };
                record
                    .last_refreshed_at
                    .is_none_or(|at| at < now - interval)
            })
            .map(|(id, record)| (id.clone(), record.class))
            .collect()
    }

    pub async fn apply_refresh(
        &self,
        id: &TokenId,
        bucket: QuotaBucket,
        remaining: i64,
        window_reset_at: Option<OffsetDateTime>,
    ) {
        let now = OffsetDateTime::now_utc();
        let mut inner = self.inner.write().await;
        let applied = inner.mutate(id, |record| {
            record.set_quota(bucket, remaining, window_reset_at);
            record.last_refreshed_at = Some(now);
            record.disabled = false;
            record.reset_transient();
        });
        if applied {
            inner.cooling.remove(id);
        }
        drop(inner);
        if applied {
            self.events.emit(PoolEvent::QuotaRefreshed { id: id.clone() });
            self.notify_dirty();
        }
    }

    /// Record a failed quota probe. Terminal failures (revoked auth)
    /// disable the token; transient ones only count toward the threshold.
    pub async fn apply_refresh_failure(&self, id: &TokenId, terminal: bool, reason: String) {
        let now = OffsetDateTime::now_utc();
        let threshold = self.fail_threshold;
        let mut inner = self.inner.write().await;
        let mut disabled_now = false;
        let applied = inner.mutate(id, |record| {
            record.last_failure_at = Some(now);
            record.last_failure_reason = Some(reason.clone());
            if terminal {
                if !record.disabled {
                    disabled_now = true;
                }
                record.disabled = true;
            } else {
                record.consecutive_failures += 1;
                if record.consecutive_failures >= threshold && !record.disabled {
                    record.disabled = true;
                    disabled_now = true;
                }
            }
        });
        drop(inner);
        if applied {
            if disabled_now {
                self.events.emit(PoolEvent::Disabled {
                    id: id.clone(),
                    reason,
                });
            }
            self.notify_dirty();
        }
    }

    pub async fn cooling_until(&self, id: &TokenId) -> Option<OffsetDateTime> {
        self.inner
            .read()
            .await
            .cooling
            .get(id)
            .copied()
            .filter(|until| *until > OffsetDateTime::now_utc())
    }
}

fn select_candidate(
    inner: &mut Inner,
    class: TokenClass,
    bucket: QuotaBucket,
    exclude: &[TokenId],
    now: OffsetDateTime,
) -> Option<TokenId> {
    let Inner {
        index, cooling, ..
    } = inner;
    let set = index.get(&(class, bucket))?;
    let mut expired = Vec::new();
    let mut chosen = None;
    for key in set.iter() {
        if exclude.contains(&key.id) {
            continue;
        }
        if let Some(until) = cooling.get(&key.id) {
            if *until > now {
                continue;
            }
            expired.push(key.id.clone());
        }
        chosen = Some(key.id.clone());
        break;
    }
    for id in expired {
        cooling.remove(&id);
    }
    chosen
}
