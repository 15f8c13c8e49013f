use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tracing::info;

use xgate_common::{AppConfig, ConfigError};
use xgate_pool::{
    spawn_persistence, spawn_refresh, Persister, PoolEventHub, TokenPool,
};
use xgate_storage::{JsonFileStore, StoreError, TokenStore};
use xgate_upstream::{GrokUsageProbe, UpstreamClient};

use crate::batch::BatchEngine;
use crate::media::MediaCache;
use crate::pipeline::Pipeline;

const REFRESH_TICK: Duration = Duration::from_secs(600);

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("storage: {0}")]
    Storage(#[from] StoreError),
}

/// Everything the routers need, wired together.
///
/// The config lives behind an `ArcSwap`: readers take a frozen snapshot
/// per request and a reload swaps the whole value in one store.
pub struct AppHandle {
    pub config: Arc<ArcSwap<AppConfig>>,
    pub pool: Arc<TokenPool>,
    pub upstream: Arc<UpstreamClient>,
    pub media: Arc<MediaCache>,
    pub pipeline: Arc<Pipeline>,
    pub batch: Arc<BatchEngine>,
    pub persister: Arc<Persister>,
}

impl AppHandle {
    /// Swap in a rebuilt config. In-flight requests keep the snapshot
    /// they already loaded.
    pub fn apply_config(&self, config: AppConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.config.store(Arc::new(config));
        Ok(())
    }
}

/// Build process state from a frozen config: load the token catalog,
/// reconcile stale transient state, and start the persistence and
/// refresh loops.
pub async fn bootstrap(config: AppConfig) -> Result<AppHandle, BootstrapError> {
    config.validate()?;
    let config = Arc::new(ArcSwap::from_pointee(config));
    let boot = config.load_full();

    let events = PoolEventHub::new(256);
    let pool = Arc::new(TokenPool::new(boot.pool.fail_threshold, events));
    let store: Arc<dyn TokenStore> = Arc::new(JsonFileStore::new(
        Path::new(&boot.storage.data_dir).join(&boot.storage.token_file),
    ));
    let persister = Persister::bootstrap(pool.clone(), store).await?;
    pool.reconcile(Duration::from_secs(boot.pool.reconcile_idle_hours * 3600))
        .await;
    spawn_persistence(
        persister.clone(),
        Duration::from_millis(boot.pool.save_delay_ms),
        Duration::from_secs(boot.pool.reload_interval_sec),
    );

    let upstream = Arc::new(UpstreamClient::new(boot.upstream.clone()));
    let media = Arc::new(MediaCache::new(
        &boot.media.cache_dir,
        boot.media.max_bytes,
        boot.server.app_url.clone(),
    ));
    let pipeline = Pipeline::new(
        config.clone(),
        pool.clone(),
        upstream.clone(),
        media.clone(),
    );
    let batch = BatchEngine::new(pipeline.clone());

    spawn_refresh(
        pool.clone(),
        Arc::new(GrokUsageProbe::new(upstream.clone())),
        Duration::from_secs(boot.pool.refresh_interval_hours * 3600),
        Duration::from_secs(boot.pool.super_refresh_interval_hours * 3600),
        boot.pool.usage_concurrent,
        REFRESH_TICK,
    );

    info!(
        event = "bootstrap_complete",
        host = %boot.server.host,
        port = boot.server.port,
    );
    Ok(AppHandle {
        config,
        pool,
        upstream,
        media,
        pipeline,
        batch,
        persister,
    })
}
