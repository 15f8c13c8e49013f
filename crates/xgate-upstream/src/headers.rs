use time::OffsetDateTime;
use uuid::Uuid;

use xgate_common::UpstreamConfig;

use crate::fingerprint::statsig_id;

pub(crate) type HeaderList = Vec<(String, String)>;

const BASE_HEADERS: &[(&str, &str)] = &[
    ("accept", "*/*"),
    ("accept-language", "en-US,en;q=0.9"),
    ("accept-encoding", "gzip, deflate, br, zstd"),
    ("origin", "https://grok.com"),
    ("priority", "u=1, i"),
    (
        "sec-ch-ua",
        "\"Not(A:Brand\";v=\"99\", \"Google Chrome\";v=\"133\", \"Chromium\";v=\"133\"",
    ),
    ("sec-ch-ua-mobile", "?0"),
    ("sec-ch-ua-platform", "\"macOS\""),
    ("sec-fetch-dest", "empty"),
    ("sec-fetch-mode", "cors"),
    ("sec-fetch-site", "same-origin"),
    (
        "baggage",
        "sentry-environment=production,sentry-public_key=b311e0f2690c81f25e2c4cf6d4f7ce1c",
    ),
];

pub(crate) fn cookie_for(config: &UpstreamConfig, token_id: &str) -> String {
    let mut cookie = format!("sso-rw={token_id};sso={token_id}");
    if let Some(cf) = config.cf_clearance.as_deref().filter(|cf| !cf.is_empty()) {
        cookie.push_str(";cf_clearance=");
        cookie.push_str(cf);
    }
    cookie
}

/// Full browser-shaped header set for one upstream request.
///
/// `None` means no fingerprint is resolvable (static id unset and dynamic
/// derivation disabled); callers surface that as a configuration error
/// rather than sending a bare request that would be flagged.
pub(crate) fn request_headers(
    config: &UpstreamConfig,
    token_id: &str,
    pathname: &str,
) -> Option<HeaderList> {
    let statsig = statsig_id(config, token_id, OffsetDateTime::now_utc().unix_timestamp())?;

    let mut headers: HeaderList = BASE_HEADERS
        .iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect();
    headers.push(("user-agent".to_string(), config.user_agent.clone()));
    headers.push(("x-statsig-id".to_string(), statsig));
    headers.push(("x-xai-request-id".to_string(), Uuid::new_v4().to_string()));
    headers.push((
        "content-type".to_string(),
        if pathname.contains("upload-file") {
            "text/plain;charset=UTF-8".to_string()
        } else {
            "application/json".to_string()
        },
    ));
    headers.push(("cookie".to_string(), cookie_for(config, token_id)));
    Some(headers)
}

/// Header set for the imagine WebSocket upgrade.
pub(crate) fn ws_headers(config: &UpstreamConfig, token_id: &str) -> HeaderList {
    vec![
        ("origin".to_string(), "https://grok.com".to_string()),
        ("user-agent".to_string(), config.user_agent.clone()),
        ("cookie".to_string(), cookie_for(config, token_id)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_includes_clearance_when_set() {
        let mut config = UpstreamConfig::default();
        assert_eq!(cookie_for(&config, "abc"), "sso-rw=abc;sso=abc");
        config.cf_clearance = Some("cf123".to_string());
        assert_eq!(cookie_for(&config, "abc"), "sso-rw=abc;sso=abc;cf_clearance=cf123");
    }

    #[test]
    fn upload_paths_switch_content_type() {
        let config = UpstreamConfig {
            statsig_id: Some("id".to_string()),
            ..Default::default()
        };
        let headers = request_headers(&config, "tok", "/rest/app-chat/upload-file").unwrap();
        let content_type = headers
            .iter()
            .find(|(name, _)| name == "content-type")
            .map(|(_, value)| value.as_str());
        assert_eq!(content_type, Some("text/plain;charset=UTF-8"));
    }

    #[test]
    fn missing_fingerprint_is_none() {
        let config = UpstreamConfig::default();
        assert!(request_headers(&config, "tok", "/rest/rate-limits").is_none());
    }
}
