use std::time::Duration;

use bytes::Bytes;
use serde_json::{json, Value as JsonValue};
use wreq::Method;

use crate::client::{CallError, ResponseBody, TransportError, TransportKind, UpstreamClient};

const UPLOAD_PATH: &str = "/rest/app-chat/upload-file";
const POST_CREATE_PATH: &str = "/rest/media/post/create";

#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub file_id: String,
    pub file_uri: String,
}

impl UpstreamClient {
    /// Upload one attachment (base64 content) ahead of a conversation.
    pub async fn upload_file(
        &self,
        token_id: &str,
        file_name: &str,
        mime_type: &str,
        content_base64: &str,
    ) -> Result<UploadedFile, CallError> {
        let headers = crate::headers::request_headers(self.config(), token_id, UPLOAD_PATH)
            .ok_or(CallError::MissingFingerprint)?;
        let body = json!({
            "fileName": file_name,
            "fileMimeType": mime_type,
            "content": content_base64,
        });
        let url = format!("{}{UPLOAD_PATH}", self.base_url());
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
        let ResponseBody::Bytes(bytes) = response.body else {
            return Err(CallError::Transport(TransportError {
                kind: TransportKind::Other,
                message: "unexpected streaming body".to_string(),
            }));
        };
        let value: JsonValue = serde_json::from_slice(&bytes).map_err(|err| {
            CallError::Transport(TransportError {
                kind: TransportKind::Other,
                message: format!("decode upload response: {err}"),
            })
        })?;
        let file_id = value
            .get("fileMetadataId")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_string();
        if file_id.is_empty() {
            return Err(CallError::Transport(TransportError {
                kind: TransportKind::Other,
                message: "upload response missing fileMetadataId".to_string(),
            }));
        }
        let file_uri = value
            .get("fileUri")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(UploadedFile { file_id, file_uri })
    }

    /// Create a media post for an uploaded image; video generation
    /// requests reference the resulting post id.
    pub async fn create_media_post(
        &self,
        token_id: &str,
        file_uri: &str,
    ) -> Result<String, CallError> {
        let headers = crate::headers::request_headers(self.config(), token_id, POST_CREATE_PATH)
            .ok_or(CallError::MissingFingerprint)?;
        let body = json!({
            "media_url": format!("https://assets.grok.com/{}", file_uri.trim_start_matches('/')),
            "media_type": "MEDIA_POST_TYPE_IMAGE",
        });
        let url = format!("{}{POST_CREATE_PATH}", self.base_url());
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
        let ResponseBody::Bytes(bytes) = response.body else {
            return Err(CallError::Transport(TransportError {
                kind: TransportKind::Other,
                message: "unexpected streaming body".to_string(),
            }));
        };
        let value: JsonValue = serde_json::from_slice(&bytes).map_err(|err| {
            CallError::Transport(TransportError {
                kind: TransportKind::Other,
                message: format!("decode post create response: {err}"),
            })
        })?;
        Ok(value
            .get("post")
            .and_then(|post| post.get("id"))
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_string())
    }
}
