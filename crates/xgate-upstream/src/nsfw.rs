use std::time::Duration;

use bytes::Bytes;
use wreq::Method;

use crate::client::{CallError, ResponseBody, TransportError, TransportKind, UpstreamClient};

const NSFW_PATH: &str = "/auth_mgmt.AuthManagement/UpdateUserFeatureControls";
const FEATURE_NAME: &[u8] = b"always_show_nsfw_content";

impl UpstreamClient {
    /// Flip the account's content-mode feature flag on via the gRPC-Web
    /// management endpoint.
    pub async fn enable_content_mode(&self, token_id: &str) -> Result<(), CallError> {
        let mut headers = crate::headers::request_headers(self.config(), token_id, NSFW_PATH)
            .ok_or(CallError::MissingFingerprint)?;
        headers.retain(|(name, _)| name != "content-type");
        headers.push((
            "content-type".to_string(),
            "application/grpc-web+proto".to_string(),
        ));
        headers.push(("x-grpc-web".to_string(), "1".to_string()));
        headers.push(("x-user-agent".to_string(), "connect-es/2.1.1".to_string()));
        headers.push(("cache-control".to_string(), "no-cache".to_string()));

        let url = format!("{}{NSFW_PATH}", self.base_url());
        let response = self
            .send(
                Method::POST,
                &url,
                headers,
                Some(Bytes::from(grpc_web_frame(&feature_message()))),
                Some(token_id),
                Duration::from_secs(30),
                false,
            )
            .await?;

        let ResponseBody::Bytes(body) = response.body else {
            return Err(CallError::Transport(TransportError {
                kind: TransportKind::Other,
                message: "unexpected streaming body".to_string(),
            }));
        };
        match grpc_status(&body) {
            None | Some(0) => Ok(()),
            Some(code) => Err(CallError::Transport(TransportError {
                kind: TransportKind::Other,
                message: format!("grpc status {code}"),
            })),
        }
    }
}

/// `UpdateUserFeatureControlsRequest { controls { enabled: true, names: ["…"] } }`
/// hand-encoded; the message is tiny and fixed.
fn feature_message() -> Vec<u8> {
    let mut inner = vec![0x0a, FEATURE_NAME.len() as u8];
    inner.extend_from_slice(FEATURE_NAME);
    let mut message = vec![0x0a, 0x02, 0x10, 0x01, 0x12, inner.len() as u8];
    message.extend_from_slice(&inner);
    message
}

/// gRPC-Web framing: flag byte + u32 big-endian length + payload.
fn grpc_web_frame(message: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(message.len() + 5);
    frame.push(0);
    frame.extend_from_slice(&(message.len() as u32).to_be_bytes());
    frame.extend_from_slice(message);
    frame
}

/// Pull `grpc-status` out of the trailer frame (flag bit 0x80), if any.
fn grpc_status(body: &[u8]) -> Option<i32> {
    let mut offset = 0usize;
    while offset + 5 <= body.len() {
        let flag = body[offset];
        let len = u32::from_be_bytes([
            body[offset + 1],
            body[offset + 2],
            body[offset + 3],
            body[offset + 4],
        ]) as usize;
        let start = offset + 5;
        let end = start.checked_add(len)?.min(body.len());
        if flag & 0x80 != 0 {
            let trailers = String::from_utf8_lossy(&body[start..end]);
            for line in trailers.lines() {
                if let Some(value) = line.strip_prefix("grpc-status:") {
                    return value.trim().parse().ok();
                }
            }
        }
        offset = end;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_layout() {
        let frame = grpc_web_frame(b"abc");
        assert_eq!(frame[0], 0);
        assert_eq!(&frame[1..5], &3u32.to_be_bytes());
        assert_eq!(&frame[5..], b"abc");
    }

    #[test]
    fn trailer_status_parses() {
        let mut body = grpc_web_frame(b"payload");
        let trailers = b"grpc-status: 0\r\ngrpc-message: ok\r\n";
        body.push(0x80);
        body.extend_from_slice(&(trailers.len() as u32).to_be_bytes());
        body.extend_from_slice(trailers);
        assert_eq!(grpc_status(&body), Some(0));
    }

    #[test]
    fn missing_trailers_is_none() {
        assert_eq!(grpc_status(&grpc_web_frame(b"payload")), None);
    }
}
