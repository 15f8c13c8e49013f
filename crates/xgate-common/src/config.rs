use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config value for {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: String,
    },
}

/// Final, merged runtime configuration.
///
/// Built once at startup (defaults < config file < environment) and swapped
/// atomically on reload; handlers only ever see a frozen snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub retry: RetryConfig,
    pub pool: PoolConfig,
    pub chat: ChatConfig,
    pub image: ImageConfig,
    pub video: VideoConfig,
    pub media: MediaConfig,
    pub nsfw: NsfwConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// When set, `/v1/*` requires `Authorization: Bearer <api_key>`.
    pub api_key: Option<String>,
    /// When unset the admin surface is disabled entirely.
    pub admin_key: Option<String>,
    /// Public base URL used to rewrite cached media links.
    pub app_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            api_key: None,
            admin_key: None,
            app_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub proxy: Option<String>,
    /// Cloudflare clearance cookie appended to every upstream request.
    pub cf_clearance: Option<String>,
    /// Static anti-bot fingerprint header value.
    pub statsig_id: Option<String>,
    /// Derive the fingerprint per request instead of using the static value.
    pub dynamic_statsig: bool,
    pub user_agent: String,
    pub temporary_conversations: bool,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://grok.com".to_string(),
            proxy: None,
            cf_clearance: None,
            statsig_id: None,
            dynamic_statsig: false,
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/133.0.0.0 Safari/537.36"
                .to_string(),
            temporary_conversations: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retry: u32,
    pub status_codes: Vec<u16>,
    pub backoff_base_ms: u64,
    pub backoff_factor: f64,
    pub backoff_max_ms: u64,
    /// Total wall-clock budget across all attempts of one request.
    pub budget_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retry: 3,
            status_codes: vec![401, 403, 429],
            backoff_base_ms: 500,
            backoff_factor: 2.0,
            backoff_max_ms: 30_000,
            budget_ms: 90_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub fail_threshold: u32,
    pub save_delay_ms: u64,
    pub reload_interval_sec: u64,
    pub refresh_interval_hours: u64,
    pub super_refresh_interval_hours: u64,
    pub usage_concurrent: usize,
    /// Records idle longer than this get their transient state reset at boot.
    pub reconcile_idle_hours: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            fail_threshold: 5,
            save_delay_ms: 500,
            reload_interval_sec: 30,
            refresh_interval_hours: 8,
            super_refresh_interval_hours: 24,
            usage_concurrent: 10,
            reconcile_idle_hours: 24,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub stream_timeout_sec: u64,
    pub request_timeout_sec: u64,
    /// Container tags whose content is stripped from assistant text.
    pub filter_tags: Vec<String>,
    /// Default for requests that don't set `reasoning_effort`.
    pub thinking: bool,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            stream_timeout_sec: 45,
            request_timeout_sec: 120,
            filter_tags: vec![
                "xaiartifact".to_string(),
                "xai:tool_usage_card".to_string(),
                "grok:render".to_string(),
            ],
            thinking: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub request_timeout_sec: u64,
    pub stream_timeout_sec: u64,
    /// After a medium frame, how long to wait for a final before treating
    /// the generation as blocked.
    pub final_timeout_sec: u64,
    pub medium_min_bytes: usize,
    pub final_min_bytes: usize,
    /// Use the WebSocket image endpoint instead of the HTTP chat stream.
    pub ws_enabled: bool,
    pub list_concurrent: usize,
    pub delete_concurrent: usize,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            request_timeout_sec: 60,
            stream_timeout_sec: 45,
            final_timeout_sec: 30,
            medium_min_bytes: 20 * 1024,
            final_min_bytes: 100 * 1024,
            ws_enabled: true,
            list_concurrent: 20,
            delete_concurrent: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub stream_timeout_sec: u64,
    pub request_timeout_sec: u64,
    /// "html" wraps the result in a `<video>` tag, "url" emits the bare link.
    pub format: String,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            stream_timeout_sec: 90,
            request_timeout_sec: 180,
            format: "html".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub cache_dir: String,
    pub max_bytes: u64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            cache_dir: "data/cache".to_string(),
            max_bytes: 500 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NsfwConfig {
    pub concurrent: usize,
}

impl Default for NsfwConfig {
    fn default() -> Self {
        Self { concurrent: 10 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: String,
    pub token_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "data".to_string(),
            token_file: "token.json".to_string(),
        }
    }
}

/// Operational overrides layered on top of a parsed config file.
///
/// Merge order: defaults < file < patch (env/CLI). Only knobs that make
/// sense to flip per deployment are patchable; everything else lives in
/// the file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub api_key: Option<String>,
    pub admin_key: Option<String>,
    pub app_url: Option<String>,
    pub base_url: Option<String>,
    pub proxy: Option<String>,
    pub cf_clearance: Option<String>,
    pub statsig_id: Option<String>,
    pub data_dir: Option<String>,
}

impl AppConfigPatch {
    pub fn overlay(&mut self, other: AppConfigPatch) {
        macro_rules! take {
            ($field:ident) => {
                if other.$field.is_some() {
                    self.$field = other.$field;
                }
            };
        }
        take!(host);
        take!(port);
        take!(api_key);
        take!(admin_key);
        take!(app_url);
        take!(base_url);
        take!(proxy);
        take!(cf_clearance);
        take!(statsig_id);
        take!(data_dir);
    }

    pub fn apply_to(self, config: &mut AppConfig) {
        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if self.api_key.is_some() {
            config.server.api_key = self.api_key;
        }
        if self.admin_key.is_some() {
            config.server.admin_key = self.admin_key;
        }
        if self.app_url.is_some() {
            config.server.app_url = self.app_url;
        }
        if let Some(base_url) = self.base_url {
            config.upstream.base_url = base_url;
        }
        if self.proxy.is_some() {
            config.upstream.proxy = self.proxy;
        }
        if self.cf_clearance.is_some() {
            config.upstream.cf_clearance = self.cf_clearance;
        }
        if self.statsig_id.is_some() {
            config.upstream.statsig_id = self.statsig_id;
        }
        if let Some(data_dir) = self.data_dir {
            config.storage.data_dir = data_dir;
        }
    }

    /// Collect overrides from `XGATE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        let port = match var("XGATE_PORT") {
            Some(raw) => Some(raw.parse::<u16>().map_err(|err| ConfigError::InvalidValue {
                field: "XGATE_PORT",
                reason: err.to_string(),
            })?),
            None => None,
        };
        Ok(Self {
            host: var("XGATE_HOST"),
            port,
            api_key: var("XGATE_API_KEY"),
            admin_key: var("XGATE_ADMIN_KEY"),
            app_url: var("XGATE_APP_URL"),
            base_url: var("XGATE_UPSTREAM_BASE_URL"),
            proxy: var("XGATE_PROXY"),
            cf_clearance: var("XGATE_CF_CLEARANCE"),
            statsig_id: var("XGATE_STATSIG_ID"),
            data_dir: var("XGATE_DATA_DIR"),
        })
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_retry == 0 {
            return Err(ConfigError::InvalidValue {
                field: "retry.max_retry",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.pool.fail_threshold == 0 {
            return Err(ConfigError::InvalidValue {
                field: "pool.fail_threshold",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.image.medium_min_bytes >= self.image.final_min_bytes {
            return Err(ConfigError::InvalidValue {
                field: "image.medium_min_bytes",
                reason: "must be below image.final_min_bytes".to_string(),
            });
        }
        if !matches!(self.video.format.as_str(), "html" | "url") {
            return Err(ConfigError::InvalidValue {
                field: "video.format",
                reason: format!("unknown format {:?}", self.video.format),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_deserializes_over_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"server": {"port": 9000}, "retry": {"max_retry": 5}}"#)
                .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.retry.max_retry, 5);
        assert_eq!(config.retry.status_codes, vec![401, 403, 429]);
    }

    #[test]
    fn patch_overlay_last_wins() {
        let mut base = AppConfigPatch {
            host: Some("127.0.0.1".to_string()),
            port: Some(8000),
            ..Default::default()
        };
        base.overlay(AppConfigPatch {
            port: Some(9999),
            ..Default::default()
        });
        assert_eq!(base.host.as_deref(), Some("127.0.0.1"));
        assert_eq!(base.port, Some(9999));
    }

    #[test]
    fn patch_applies_onto_config() {
        let mut config = AppConfig::default();
        AppConfigPatch {
            proxy: Some("http://127.0.0.1:7890".to_string()),
            ..Default::default()
        }
        .apply_to(&mut config);
        assert_eq!(config.upstream.proxy.as_deref(), Some("http://127.0.0.1:7890"));
    }

    #[test]
    fn validate_rejects_inverted_image_thresholds() {
        let mut config = AppConfig::default();
        config.image.medium_min_bytes = config.image.final_min_bytes + 1;
        assert!(config.validate().is_err());
    }
}
