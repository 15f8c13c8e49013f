use http::StatusCode;
use time::OffsetDateTime;

use xgate_protocol::openai::error::ErrorBody;
use xgate_translate::TranslateError;
use xgate_upstream::{CallError, TransportKind};

/// Internal error taxonomy. Every failure a client can observe maps to
/// exactly one of these; the HTTP surface renders them through
/// [`GatewayError::status`] and [`GatewayError::body`].
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("no selectable token for this request")]
    PoolEmpty,
    #[error("upstream returned status {status}")]
    UpstreamHttp { status: u16 },
    #[error("upstream credential revoked")]
    AuthRevoked,
    #[error("upstream quota exhausted")]
    QuotaExhausted { reset_at: Option<OffsetDateTime> },
    #[error("upstream request budget exhausted")]
    UpstreamTimeout,
    #[error("malformed upstream stream: {message}")]
    TranslatorProtocol { message: String },
    #[error("generation blocked by upstream content policy")]
    Blocked,
    #[error("client cancelled the request")]
    ClientCancelled,
    #[error("persistence version conflict")]
    PersistenceConflict,
    #[error("{0}")]
    InvalidRequest(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::QuotaExhausted { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::ClientCancelled => StatusCode::BAD_REQUEST,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_GATEWAY,
        }
    }

    /// Stable OpenAI-style `error.type`.
    pub fn openai_type(&self) -> &'static str {
        match self {
            GatewayError::PoolEmpty | GatewayError::AuthRevoked | GatewayError::UpstreamHttp { .. } => {
                "upstream_unavailable"
            }
            GatewayError::QuotaExhausted { .. } => "rate_limit_exceeded",
            GatewayError::UpstreamTimeout => "timeout",
            GatewayError::TranslatorProtocol { .. } | GatewayError::Blocked => "bad_gateway",
            GatewayError::ClientCancelled => "client_cancelled",
            GatewayError::PersistenceConflict => "upstream_unavailable",
            GatewayError::InvalidRequest(_) => "invalid_request_error",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody::new(self.openai_type(), self.to_string())
    }
}

impl From<TranslateError> for GatewayError {
    fn from(err: TranslateError) -> Self {
        match err {
            TranslateError::IdleTimeout { .. } => GatewayError::UpstreamTimeout,
            TranslateError::Protocol { message } => GatewayError::TranslatorProtocol { message },
            TranslateError::Blocked => GatewayError::Blocked,
            TranslateError::Upstream { message } => {
                GatewayError::TranslatorProtocol { message }
            }
        }
    }
}

/// Terminal mapping for an upstream call error (after retries are spent).
impl From<CallError> for GatewayError {
    fn from(err: CallError) -> Self {
        match err {
            CallError::Http { status: 401, .. } => GatewayError::AuthRevoked,
            CallError::Http { status: 429, retry_after, .. } => GatewayError::QuotaExhausted {
                reset_at: retry_after
                    .map(|secs| OffsetDateTime::now_utc() + std::time::Duration::from_secs(secs)),
            },
            CallError::Http { status, .. } => GatewayError::UpstreamHttp { status },
            CallError::Transport(fault) => match fault.kind {
                TransportKind::Timeout | TransportKind::ReadTimeout => GatewayError::UpstreamTimeout,
                _ => GatewayError::UpstreamHttp { status: 502 },
            },
            CallError::MissingFingerprint => GatewayError::Internal(
                "anti-bot fingerprint unavailable: set upstream.statsig_id or enable dynamic_statsig"
                    .to_string(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_taxonomy() {
        assert_eq!(
            GatewayError::QuotaExhausted { reset_at: None }.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(GatewayError::UpstreamTimeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(GatewayError::PoolEmpty.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(GatewayError::Blocked.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn openai_types_are_stable() {
        assert_eq!(GatewayError::PoolEmpty.openai_type(), "upstream_unavailable");
        assert_eq!(GatewayError::AuthRevoked.openai_type(), "upstream_unavailable");
        assert_eq!(
            GatewayError::QuotaExhausted { reset_at: None }.openai_type(),
            "rate_limit_exceeded"
        );
        assert_eq!(
            GatewayError::TranslatorProtocol { message: String::new() }.openai_type(),
            "bad_gateway"
        );
    }
}
