use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use xgate_common::mask_token;

use crate::pool::TokenPool;
use crate::record::{QuotaBucket, TokenClass, TokenId};

#[derive(Debug, Clone)]
pub struct QuotaUpdate {
    pub bucket: QuotaBucket,
    pub remaining: i64,
    pub window_reset_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProbeError {
    #[error("credential revoked by upstream")]
    AuthRevoked,
    #[error("blocked by upstream, clearance required")]
    Blocked,
    #[error("upstream returned status {0}")]
    Http(u16),
    #[error("transport: {0}")]
    Transport(String),
}

/// Queries the upstream "remaining quota" endpoint with one token's
/// credential. Implemented by the upstream client crate.
#[async_trait]
pub trait UsageProbe: Send + Sync {
    async fn probe(&self, id: &TokenId, class: TokenClass) -> Result<QuotaUpdate, ProbeError>;
}

/// Probe one token and fold the result back into the pool. Shared between
/// the background scheduler and the operator batch task.
pub async fn refresh_one(
    pool: &TokenPool,
    probe: &dyn UsageProbe,
    id: &TokenId,
    class: TokenClass,
) -> Result<QuotaUpdate, ProbeError> {
    match probe.probe(id, class).await {
        Ok(update) => {
            pool.apply_refresh(id, update.bucket, update.remaining, update.window_reset_at)
                .await;
            debug!(
                event = "usage_refreshed",
                token = %mask_token(id),
                bucket = ?update.bucket,
                remaining = update.remaining,
            );
            Ok(update)
        }
        Err(err) => {
            let terminal = matches!(err, ProbeError::AuthRevoked);
            // A 403 means our egress is blocked, not that the token is bad.
            if !matches!(err, ProbeError::Blocked) {
                pool.apply_refresh_failure(id, terminal, err.to_string()).await;
            } else {
                warn!(event = "usage_probe_blocked", token = %mask_token(id));
            }
            Err(err)
        }
    }
}

/// Background refresh loop: every `tick`, probe records whose snapshot is
/// older than the per-class interval, at most `concurrent` in flight.
pub fn spawn_refresh(
    pool: Arc<TokenPool>,
    probe: Arc<dyn UsageProbe>,
    basic_interval: Duration,
    super_interval: Duration,
    concurrent: usize,
    tick: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let semaphore = Arc::new(Semaphore::new(concurrent.max(1)));
        loop {
            tokio::time::sleep(tick).await;
            let stale = pool.stale_for_refresh(basic_interval, super_interval).await;
            if stale.is_empty() {
                continue;
            }
            info!(event = "usage_refresh_round", stale = stale.len());
            let mut tasks = JoinSet::new();
            for (id, class) in stale {
                let pool = pool.clone();
                let probe = probe.clone();
                let semaphore = semaphore.clone();
                tasks.spawn(async move {
                    let Ok(_permit) = semaphore.acquire().await else {
                        return;
                    };
                    let _ = refresh_one(&pool, probe.as_ref(), &id, class).await;
                });
            }
            while tasks.join_next().await.is_some() {}
        }
    })
}
