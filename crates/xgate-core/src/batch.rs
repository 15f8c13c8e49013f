use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tokio::sync::{mpsc, Mutex, RwLock, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use xgate_common::mask_token;
use xgate_pool::{refresh_one, RecordPatch, TokenId};

use crate::error::GatewayError;
use crate::pipeline::Pipeline;

const SUBSCRIBER_QUEUE: usize = 200;
const TASK_EXPIRY: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    RefreshUsage,
    EnableContentMode,
    ListRemoteAssets,
    PurgeRemoteAssets,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub status: String,
    pub total: usize,
    pub processed: usize,
    pub ok: usize,
    pub fail: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchEvent {
    Snapshot(TaskSnapshot),
    Progress {
        task_id: String,
        total: usize,
        processed: usize,
        ok: usize,
        fail: usize,
        item: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Done {
        task_id: String,
        total: usize,
        processed: usize,
        ok: usize,
        fail: usize,
        result: JsonValue,
    },
    Cancelled {
        task_id: String,
        total: usize,
        processed: usize,
        ok: usize,
        fail: usize,
        result: JsonValue,
    },
    Error {
        task_id: String,
        error: String,
    },
}

#[derive(Default)]
struct TaskState {
    processed: usize,
    ok: usize,
    fail: usize,
    status: TaskStatus,
    results: HashMap<String, JsonValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum TaskStatus {
    #[default]
    Running,
    Done,
    Cancelled,
}

struct Task {
    id: String,
    kind: TaskKind,
    total: usize,
    cancelled: AtomicBool,
    state: Mutex<TaskState>,
    subscribers: Mutex<Vec<mpsc::Sender<BatchEvent>>>,
    final_event: Mutex<Option<BatchEvent>>,
}

impl Task {
    async fn snapshot(&self) -> TaskSnapshot {
        let state = self.state.lock().await;
        TaskSnapshot {
            task_id: self.id.clone(),
            status: match state.status {
                TaskStatus::Running => "running",
                TaskStatus::Done => "done",
                TaskStatus::Cancelled => "cancelled",
            }
            .to_string(),
            total: self.total,
            processed: state.processed,
            ok: state.ok,
            fail: state.fail,
        }
    }

    async fn publish(&self, event: BatchEvent) {
        let subscribers = self.subscribers.lock().await;
        for subscriber in subscribers.iter() {
            // Slow consumers lose events rather than stalling the workers.
            let _ = subscriber.try_send(event.clone());
        }
    }

    async fn record(&self, token_id: &TokenId, result: JsonValue, ok: bool, error: Option<String>) {
        let masked = mask_token(token_id);
        let (processed, ok_count, fail_count) = {
            let mut state = self.state.lock().await;
            state.processed += 1;
            if ok {
                state.ok += 1;
            } else {
                state.fail += 1;
            }
            state.results.insert(masked.clone(), result);
            (state.processed, state.ok, state.fail)
        };
        self.publish(BatchEvent::Progress {
            task_id: self.id.clone(),
            total: self.total,
            processed,
            ok: ok_count,
            fail: fail_count,
            item: masked,
            error,
        })
        .await;
    }

    async fn finish(&self, cancelled: bool) -> BatchEvent {
        let event = {
            let mut state = self.state.lock().await;
            state.status = if cancelled {
                TaskStatus::Cancelled
            } else {
                TaskStatus::Done
            };
            let result = JsonValue::Object(
                state
                    .results
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect(),
            );
            if cancelled {
                BatchEvent::Cancelled {
                    task_id: self.id.clone(),
                    total: self.total,
                    processed: state.processed,
                    ok: state.ok,
                    fail: state.fail,
                    result,
                }
            } else {
                BatchEvent::Done {
                    task_id: self.id.clone(),
                    total: self.total,
                    processed: state.processed,
                    ok: state.ok,
                    fail: state.fail,
                    result,
                }
            }
        };
        *self.final_event.lock().await = Some(event.clone());
        self.publish(event.clone()).await;
        event
    }
}

/// Operator tasks that fan out over the token pool, streamed back over
/// SSE. Tasks are in-memory; a restart cancels them, and every item is
/// idempotent so clients just resubmit.
pub struct BatchEngine {
    pipeline: Arc<Pipeline>,
    tasks: RwLock<HashMap<String, Arc<Task>>>,
}

impl BatchEngine {
    pub fn new(pipeline: Arc<Pipeline>) -> Arc<Self> {
        Arc::new(Self {
            pipeline,
            tasks: RwLock::new(HashMap::new()),
        })
    }

    /// Launch a task over `target` (or the whole pool) and return its id.
    pub async fn submit(
        self: &Arc<Self>,
        kind: TaskKind,
        target: Option<Vec<TokenId>>,
    ) -> Result<String, GatewayError> {
        let tokens = match target {
            Some(tokens) if !tokens.is_empty() => tokens,
            _ => self.pipeline.pool().ids_for_class(None).await,
        };
        if tokens.is_empty() {
            return Err(GatewayError::InvalidRequest(
                "no tokens to operate on".to_string(),
            ));
        }

        let task = Arc::new(Task {
            id: Uuid::new_v4().simple().to_string(),
            kind,
            total: tokens.len(),
            cancelled: AtomicBool::new(false),
            state: Mutex::new(TaskState::default()),
            subscribers: Mutex::new(Vec::new()),
            final_event: Mutex::new(None),
        });
        let task_id = task.id.clone();
        self.tasks
            .write()
            .await
            .insert(task_id.clone(), task.clone());
        info!(event = "batch_submitted", task_id = %task_id, kind = ?kind, total = tokens.len());

        let engine = self.clone();
        tokio::spawn(async move {
            engine.run_task(task, tokens).await;
        });
        Ok(task_id)
    }

    /// Subscribe to a task: current snapshot first, then live events. If
    /// the task already finished, the terminal event is replayed.
    pub async fn attach(
        &self,
        task_id: &str,
    ) -> Option<(TaskSnapshot, mpsc::Receiver<BatchEvent>)> {
        let task = self.tasks.read().await.get(task_id).cloned()?;
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        if let Some(event) = task.final_event.lock().await.clone() {
            let _ = tx.try_send(event);
        } else {
            task.subscribers.lock().await.push(tx);
        }
        Some((task.snapshot().await, rx))
    }

    pub async fn cancel(&self, task_id: &str) -> bool {
        let Some(task) = self.tasks.read().await.get(task_id).cloned() else {
            return false;
        };
        task.cancelled.store(true, Ordering::SeqCst);
        info!(event = "batch_cancelled", task_id = %task_id);
        true
    }

    async fn run_task(self: &Arc<Self>, task: Arc<Task>, tokens: Vec<TokenId>) {
        let concurrent = self.concurrency_for(task.kind);
        let semaphore = Arc::new(Semaphore::new(concurrent.max(1)));
        let mut items = JoinSet::new();
        for token_id in tokens {
            let engine = self.clone();
            let task = task.clone();
            let semaphore = semaphore.clone();
            items.spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return;
                };
                if task.cancelled.load(Ordering::SeqCst) {
                    task.record(&token_id, json!({"cancelled": true}), false, None)
                        .await;
                    return;
                }
                match engine.run_item(task.kind, &token_id).await {
                    Ok(data) => {
                        task.record(&token_id, json!({"ok": true, "data": data}), true, None)
                            .await;
                    }
                    Err(err) => {
                        warn!(
                            event = "batch_item_failed",
                            task_id = %task.id,
                            token = %mask_token(&token_id),
                            error = %err,
                        );
                        task.record(
                            &token_id,
                            json!({"ok": false, "error": err.to_string()}),
                            false,
                            Some(err.to_string()),
                        )
                        .await;
                    }
                }
            });
        }
        while items.join_next().await.is_some() {}

        let cancelled = task.cancelled.load(Ordering::SeqCst);
        task.finish(cancelled).await;
        info!(event = "batch_finished", task_id = %task.id, cancelled);

        let engine = self.clone();
        let task_id = task.id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(TASK_EXPIRY).await;
            engine.tasks.write().await.remove(&task_id);
        });
    }

    fn concurrency_for(&self, kind: TaskKind) -> usize {
        let config = self.pipeline.config();
        match kind {
            TaskKind::RefreshUsage => config.pool.usage_concurrent,
            TaskKind::EnableContentMode => config.nsfw.concurrent,
            TaskKind::ListRemoteAssets => config.image.list_concurrent,
            TaskKind::PurgeRemoteAssets => config.image.delete_concurrent,
        }
    }

    /// Full result map for a task (admin detail view).
    pub async fn results(&self, task_id: &str) -> Option<JsonValue> {
        let task = self.tasks.read().await.get(task_id).cloned()?;
        let state = task.state.lock().await;
        Some(JsonValue::Object(
            state
                .results
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        ))
    }

    async fn run_item(&self, kind: TaskKind, token_id: &TokenId) -> Result<JsonValue, GatewayError> {
        let pool = self.pipeline.pool();
        let upstream = self.pipeline.upstream();
        match kind {
            TaskKind::RefreshUsage => {
                let record = pool
                    .get(token_id)
                    .await
                    .ok_or_else(|| GatewayError::InvalidRequest("unknown token".to_string()))?;
                let update = refresh_one(pool, self.pipeline.probe().as_ref(), token_id, record.class)
                    .await
                    .map_err(|err| GatewayError::Internal(err.to_string()))?;
                Ok(json!({
                    "bucket": update.bucket,
                    "remaining": update.remaining,
                }))
            }
            TaskKind::EnableContentMode => {
                // The feature flip is ignored on accounts without a birth
                // date, so set one first.
                upstream
                    .set_birth_date(token_id)
                    .await
                    .map_err(GatewayError::from)?;
                upstream
                    .enable_content_mode(token_id)
                    .await
                    .map_err(GatewayError::from)?;
                let mut tags = pool
                    .get(token_id)
                    .await
                    .map(|record| record.tags)
                    .unwrap_or_default();
                tags.insert("content-mode-enabled".to_string());
                pool.replace_record(
                    token_id,
                    RecordPatch {
                        tags: Some(tags),
                        ..Default::default()
                    },
                )
                .await;
                Ok(json!({"enabled": true}))
            }
            TaskKind::ListRemoteAssets => {
                let assets = upstream
                    .list_assets(token_id)
                    .await
                    .map_err(GatewayError::from)?;
                Ok(json!({"count": assets.len()}))
            }
            TaskKind::PurgeRemoteAssets => {
                let assets = upstream
                    .list_assets(token_id)
                    .await
                    .map_err(GatewayError::from)?;
                let ids: Vec<String> = assets.into_iter().map(|asset| asset.asset_id).collect();
                let deleted = upstream
                    .delete_assets(token_id, &ids)
                    .await
                    .map_err(GatewayError::from)?;
                pool.mark_assets_cleared(token_id).await;
                Ok(json!({"deleted": deleted}))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(total: usize) -> Arc<Task> {
        Arc::new(Task {
            id: "t1".to_string(),
            kind: TaskKind::RefreshUsage,
            total,
            cancelled: AtomicBool::new(false),
            state: Mutex::new(TaskState::default()),
            subscribers: Mutex::new(Vec::new()),
            final_event: Mutex::new(None),
        })
    }

    #[tokio::test]
    async fn record_updates_counters_and_publishes() {
        let task = task(3);
        let (tx, mut rx) = mpsc::channel(8);
        task.subscribers.lock().await.push(tx);

        task.record(&"tok-aaaa-bbbb".to_string(), json!({"ok": true}), true, None)
            .await;
        task.record(
            &"tok-cccc-dddd".to_string(),
            json!({"ok": false}),
            false,
            Some("boom".to_string()),
        )
        .await;

        let snapshot = task.snapshot().await;
        assert_eq!(snapshot.processed, 2);
        assert_eq!(snapshot.ok, 1);
        assert_eq!(snapshot.fail, 1);

        let BatchEvent::Progress { item, .. } = rx.recv().await.unwrap() else {
            panic!("expected progress");
        };
        // Token ids are masked before they leave the engine.
        assert_eq!(item, "tok-aaaa…");
    }

    #[tokio::test]
    async fn cancelled_finish_carries_result_map() {
        let task = task(2);
        task.record(&"one".to_string(), json!({"ok": true}), true, None)
            .await;
        task.record(&"two".to_string(), json!({"cancelled": true}), false, None)
            .await;
        task.cancelled.store(true, Ordering::SeqCst);

        let event = task.finish(true).await;
        let BatchEvent::Cancelled { result, processed, .. } = event else {
            panic!("expected cancelled event");
        };
        assert_eq!(processed, 2);
        assert_eq!(result["one"], json!({"ok": true}));
        assert_eq!(result["two"], json!({"cancelled": true}));
        assert!(task.final_event.lock().await.is_some());
    }

    #[tokio::test]
    async fn full_subscriber_queue_drops_instead_of_blocking() {
        let task = task(10);
        let (tx, mut rx) = mpsc::channel(1);
        task.subscribers.lock().await.push(tx);

        for n in 0..5 {
            task.record(&format!("tok-{n}"), json!({"ok": true}), true, None)
                .await;
        }
        // Only the first event fit; the rest were dropped silently.
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }
}
