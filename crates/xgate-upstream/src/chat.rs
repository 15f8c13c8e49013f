use std::time::Duration;

use bytes::Bytes;
use wreq::Method;

use xgate_protocol::upstream::ConversationPayload;

use crate::client::{
    ByteStream, CallError, ResponseBody, TransportError, TransportKind, UpstreamClient,
};

const CHAT_PATH: &str = "/rest/app-chat/conversations/new";

impl UpstreamClient {
    /// Open a streaming conversation. The returned stream yields raw NDJSON
    /// body chunks; decoding and translation happen upstream of here.
    pub async fn start_conversation(
        &self,
        token_id: &str,
        payload: &ConversationPayload,
        referer: Option<String>,
        timeout: Duration,
    ) -> Result<ByteStream, CallError> {
        let mut headers = crate::headers::request_headers(self.config(), token_id, CHAT_PATH)
            .ok_or(CallError::MissingFingerprint)?;
        if let Some(referer) = referer {
            headers.push(("referer".to_string(), referer));
        }

        let body = serde_json::to_vec(payload).map_err(|err| {
            CallError::Transport(TransportError {
                kind: TransportKind::Other,
                message: format!("encode payload: {err}"),
            })
        })?;

        let url = format!("{}{CHAT_PATH}", self.base_url());
        let response = self
            .send(
                Method::POST,
                &url,
                headers,
                Some(Bytes::from(body)),
                Some(token_id),
                timeout,
                true,
            )
            .await?;
        match response.body {
            ResponseBody::Stream(stream) => Ok(stream),
            ResponseBody::Bytes(_) => Err(CallError::Transport(TransportError {
                kind: TransportKind::Other,
                message: "expected streaming body".to_string(),
            })),
        }
    }
}

/// Referer override for video generation requests; the upstream rejects
/// videoGen calls that don't look like they came from the imagine page.
pub fn imagine_referer(base_url: &str, post_id: &str) -> String {
    format!("{}/imagine/{post_id}", base_url.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use xgate_protocol::upstream::ConversationPayload;

    #[test]
    fn payload_serializes_camel_case() {
        let payload = ConversationPayload::new("grok-4", "MODEL_MODE_EXPERT", "hi".into(), true);
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["modelName"], "grok-4");
        assert_eq!(json["modelMode"], "MODEL_MODE_EXPERT");
        assert_eq!(json["disableTextFollowUps"], true);
        assert_eq!(
            json["responseMetadata"]["requestModelDetails"]["modelId"],
            "grok-4"
        );
    }
}
