use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use xgate_translate::MediaKind;
use xgate_upstream::UpstreamClient;

use crate::error::GatewayError;

/// Size-capped local cache for generated media.
///
/// Names are content-addressed (sha-256 of the bytes), so re-caching the
/// same image yields the same URL, and the upstream's expiring asset links
/// never leak to clients. Deletion is LRU by modification time and runs
/// under one lock; this is the only writer of the cache root.
pub struct MediaCache {
    root: PathBuf,
    max_bytes: u64,
    app_url: Option<String>,
    sweep_lock: Mutex<()>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    pub files: u64,
    pub bytes: u64,
}

impl MediaCache {
    pub fn new(root: impl Into<PathBuf>, max_bytes: u64, app_url: Option<String>) -> Self {
        Self {
            root: root.into(),
            max_bytes,
            app_url: app_url.map(|url| url.trim_end_matches('/').to_string()),
            sweep_lock: Mutex::new(()),
        }
    }

    fn kind_dir(&self, kind: MediaKind) -> PathBuf {
        self.root.join(kind.as_str())
    }

    /// Store bytes and return the gateway-relative (or absolute, when
    /// `app_url` is configured) URL clients should use.
    pub async fn put(
        &self,
        bytes: &[u8],
        kind: MediaKind,
        ext: &str,
    ) -> Result<String, GatewayError> {
        let name = format!("{}.{ext}", content_name(bytes));
        let dir = self.kind_dir(kind);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|err| GatewayError::Internal(format!("media dir: {err}")))?;
        let path = dir.join(&name);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!(event = "media_cache_hit", name = %name);
        } else {
            tokio::fs::write(&path, bytes)
                .await
                .map_err(|err| GatewayError::Internal(format!("media write: {err}")))?;
            self.sweep().await;
        }
        Ok(self.public_url(kind, &name))
    }

    /// Fetch an upstream asset and cache it locally. Returns the rewritten
    /// URL; without an `app_url` the caller falls back to the raw upstream
    /// link (the asset host would 403 later, but there is nowhere to point
    /// clients instead).
    pub async fn store_remote(
        &self,
        client: &UpstreamClient,
        token_id: &str,
        path: &str,
        kind: MediaKind,
    ) -> Result<String, GatewayError> {
        let bytes = client
            .download_asset(token_id, path)
            .await
            .map_err(GatewayError::from)?;
        let ext = extension_of(path, kind);
        self.put(&bytes, kind, ext).await
    }

    /// Fetch an upstream asset and return it base64-encoded.
    pub async fn fetch_base64(
        &self,
        client: &UpstreamClient,
        token_id: &str,
        path: &str,
    ) -> Result<String, GatewayError> {
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine as _;
        let bytes = client
            .download_asset(token_id, path)
            .await
            .map_err(GatewayError::from)?;
        Ok(BASE64.encode(&bytes))
    }

    pub fn public_url(&self, kind: MediaKind, name: &str) -> String {
        match &self.app_url {
            Some(base) => format!("{base}/v1/files/{}/{name}", kind.as_str()),
            None => format!("/v1/files/{}/{name}", kind.as_str()),
        }
    }

    /// Resolve a cached file for serving. Rejects anything that is not a
    /// bare file name so the media proxy can't be used to walk the disk.
    pub fn resolve(&self, kind: MediaKind, name: &str) -> Option<PathBuf> {
        if name.is_empty()
            || name.contains(['/', '\\'])
            || name.contains("..")
        {
            return None;
        }
        Some(self.kind_dir(kind).join(name))
    }

    pub async fn stat(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        for kind in [MediaKind::Image, MediaKind::Video] {
            if let Ok(mut dir) = tokio::fs::read_dir(self.kind_dir(kind)).await {
                while let Ok(Some(entry)) = dir.next_entry().await {
                    if let Ok(meta) = entry.metadata().await {
                        if meta.is_file() {
                            stats.files += 1;
                            stats.bytes += meta.len();
                        }
                    }
                }
            }
        }
        stats
    }

    /// Remove cached files, optionally for one kind only. Returns bytes
    /// freed.
    pub async fn clear(&self, kind: Option<MediaKind>) -> u64 {
        let _guard = self.sweep_lock.lock().await;
        let kinds: &[MediaKind] = match kind {
            Some(MediaKind::Image) => &[MediaKind::Image],
            Some(MediaKind::Video) => &[MediaKind::Video],
            None => &[MediaKind::Image, MediaKind::Video],
        };
        let mut freed = 0u64;
        for kind in kinds {
            let Ok(mut dir) = tokio::fs::read_dir(self.kind_dir(*kind)).await else {
                continue;
            };
            while let Ok(Some(entry)) = dir.next_entry().await {
                if let Ok(meta) = entry.metadata().await {
                    if meta.is_file() && tokio::fs::remove_file(entry.path()).await.is_ok() {
                        freed += meta.len();
                    }
                }
            }
        }
        info!(event = "media_cache_cleared", freed_bytes = freed);
        freed
    }

    /// Delete oldest files until the cache fits the size cap.
    async fn sweep(&self) {
        let _guard = self.sweep_lock.lock().await;
        let mut files: Vec<(PathBuf, u64, std::time::SystemTime)> = Vec::new();
        let mut total = 0u64;
        for kind in [MediaKind::Image, MediaKind::Video] {
            let Ok(mut dir) = tokio::fs::read_dir(self.kind_dir(kind)).await else {
                continue;
            };
            while let Ok(Some(entry)) = dir.next_entry().await {
                let Ok(meta) = entry.metadata().await else {
                    continue;
                };
                if !meta.is_file() {
                    continue;
                }
                let mtime = meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH);
                total += meta.len();
                files.push((entry.path(), meta.len(), mtime));
            }
        }
        if total <= self.max_bytes {
            return;
        }

        files.sort_by_key(|(_, _, mtime)| *mtime);
        for (path, size, _) in files {
            if total <= self.max_bytes {
                break;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => total = total.saturating_sub(size),
                Err(err) => warn!(event = "media_evict_failed", path = %path.display(), error = %err),
            }
        }
        debug!(event = "media_cache_swept", total_bytes = total);
    }
}

fn content_name(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut name = String::with_capacity(32);
    for byte in &digest[..16] {
        name.push_str(&format!("{byte:02x}"));
    }
    name
}

fn extension_of(path: &str, kind: MediaKind) -> &'static str {
    let ext = Path::new(path.split(['?', '#']).next().unwrap_or(path))
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    match ext.as_str() {
        "png" => "png",
        "jpg" | "jpeg" => "jpg",
        "gif" => "gif",
        "webp" => "webp",
        "mp4" => "mp4",
        "webm" => "webm",
        _ => match kind {
            MediaKind::Image => "jpg",
            MediaKind::Video => "mp4",
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(max_bytes: u64) -> MediaCache {
        let dir = std::env::temp_dir()
            .join("xgate-media-tests")
            .join(format!("{}-{max_bytes}", std::process::id()));
        MediaCache::new(dir, max_bytes, Some("http://gw.local".to_string()))
    }

    #[tokio::test]
    async fn identical_bytes_yield_identical_urls() {
        let cache = cache(1 << 20);
        let first = cache.put(b"png-bytes", MediaKind::Image, "png").await.unwrap();
        let second = cache.put(b"png-bytes", MediaKind::Image, "png").await.unwrap();
        assert_eq!(first, second);
        assert!(first.starts_with("http://gw.local/v1/files/image/"));
        cache.clear(None).await;
    }

    #[tokio::test]
    async fn resolve_rejects_path_traversal() {
        let cache = cache(1 << 20);
        assert!(cache.resolve(MediaKind::Image, "../secret").is_none());
        assert!(cache.resolve(MediaKind::Image, "a/b.png").is_none());
        assert!(cache.resolve(MediaKind::Image, "ok.png").is_some());
    }

    #[tokio::test]
    async fn sweep_evicts_down_to_cap() {
        let cache = cache(64);
        cache.put(&[1u8; 48], MediaKind::Image, "png").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        cache.put(&[2u8; 48], MediaKind::Image, "png").await.unwrap();
        let stats = cache.stat().await;
        assert!(stats.bytes <= 64, "cache over cap: {} bytes", stats.bytes);
        cache.clear(None).await;
    }

    #[test]
    fn extensions_normalize() {
        assert_eq!(extension_of("/a/b/c.JPEG", MediaKind::Image), "jpg");
        assert_eq!(extension_of("/a/b/c.png?sig=1", MediaKind::Image), "png");
        assert_eq!(extension_of("/a/b/noext", MediaKind::Video), "mp4");
    }
}
