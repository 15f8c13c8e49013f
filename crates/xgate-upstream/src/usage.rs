use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use time::OffsetDateTime;
use wreq::Method;

use xgate_pool::{ProbeError, QuotaBucket, QuotaUpdate, TokenClass, TokenId, UsageProbe};
use xgate_protocol::upstream::RateLimitSnapshot;

use crate::client::{CallError, ResponseBody, TransportError, TransportKind, UpstreamClient};

const RATE_LIMITS_PATH: &str = "/rest/rate-limits";

impl UpstreamClient {
    pub async fn rate_limits(
        &self,
        token_id: &str,
        rate_limit_model: &str,
    ) -> Result<RateLimitSnapshot, CallError> {
        let headers = crate::headers::request_headers(self.config(), token_id, RATE_LIMITS_PATH)
            .ok_or(CallError::MissingFingerprint)?;
        let body = json!({
            "requestKind": "DEFAULT",
            "modelName": rate_limit_model,
        });
        let url = format!("{}{RATE_LIMITS_PATH}", self.base_url());
        let response = self
            .send(
                Method::POST,
                &url,
                headers,
                Some(Bytes::from(body.to_string())),
                Some(token_id),
                Duration::from_secs(30),
                false,
            )
            .await?;
        match response.body {
            ResponseBody::Bytes(bytes) => {
                serde_json::from_slice(&bytes).map_err(|err| {
                    CallError::Transport(TransportError {
                        kind: TransportKind::Other,
                        message: format!("decode rate limits: {err}"),
                    })
                })
            }
            ResponseBody::Stream(_) => Err(CallError::Transport(TransportError {
                kind: TransportKind::Other,
                message: "unexpected streaming body".to_string(),
            })),
        }
    }
}

/// Pool-facing quota probe backed by the rate-limits endpoint.
///
/// Basic tokens report the default window (`remainingTokens`); Super
/// tokens are probed against the heavy model and report the heavy window
/// (`remainingQueries`).
pub struct GrokUsageProbe {
    client: Arc<UpstreamClient>,
}

impl GrokUsageProbe {
    pub fn new(client: Arc<UpstreamClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl UsageProbe for GrokUsageProbe {
    async fn probe(&self, id: &TokenId, class: TokenClass) -> Result<QuotaUpdate, ProbeError> {
        let (model, bucket) = match class {
            TokenClass::Basic => ("grok-4", QuotaBucket::Default),
            TokenClass::Super => ("grok-4-heavy", QuotaBucket::Heavy),
        };
        let snapshot = self
            .client
            .rate_limits(id, model)
            .await
            .map_err(map_probe_error)?;

        let remaining = match bucket {
            QuotaBucket::Heavy => snapshot.remaining_queries,
            QuotaBucket::Default => snapshot.remaining_tokens.or(snapshot.remaining_queries),
        }
        .unwrap_or(-1);
        let window_reset_at = snapshot
            .wait_time_seconds
            .filter(|secs| *secs > 0)
            .map(|secs| OffsetDateTime::now_utc() + Duration::from_secs(secs as u64));

        Ok(QuotaUpdate {
            bucket,
            remaining,
            window_reset_at,
        })
    }
}

fn map_probe_error(err: CallError) -> ProbeError {
    match err {
        CallError::Http { status: 401, .. } => ProbeError::AuthRevoked,
        CallError::Http { status: 403, .. } => ProbeError::Blocked,
        CallError::Http { status, .. } => ProbeError::Http(status),
        CallError::Transport(fault) => ProbeError::Transport(fault.to_string()),
        CallError::MissingFingerprint => {
            ProbeError::Transport("anti-bot fingerprint unavailable".to_string())
        }
    }
}
