use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use wreq::Method;

use crate::client::{CallError, ResponseBody, TransportError, TransportKind, UpstreamClient};

const LIST_PATH: &str = "/rest/assets";
const DELETE_PATH: &str = "/rest/assets/delete";
const PAGE_SIZE: u32 = 100;
const CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize)]
pub struct RemoteAsset {
    pub asset_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

impl UpstreamClient {
    /// Enumerate every remote asset owned by one token, following
    /// pagination until the upstream stops returning a page token.
    pub async fn list_assets(&self, token_id: &str) -> Result<Vec<RemoteAsset>, CallError> {
        let mut assets = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut url = format!(
                "{}{LIST_PATH}?pageSize={PAGE_SIZE}&orderBy=SORT_BY_CREATE_TIME_DESC",
                self.base_url()
            );
            if let Some(token) = page_token.as_deref() {
                url.push_str("&pageToken=");
                url.push_str(token);
            }
            let headers = crate::headers::request_headers(self.config(), token_id, LIST_PATH)
                .ok_or(CallError::MissingFingerprint)?;
            let response = self
                .send(
                    Method::GET,
                    &url,
                    headers,
                    None,
                    Some(token_id),
                    CALL_TIMEOUT,
                    false,
                )
                .await?;
            let page = decode_json(response.body)?;

            if let Some(rows) = page.get("assets").and_then(JsonValue::as_array) {
                for row in rows {
                    let Some(asset_id) = row
                        .get("assetId")
                        .or_else(|| row.get("id"))
                        .and_then(JsonValue::as_str)
                    else {
                        continue;
                    };
                    assets.push(RemoteAsset {
                        asset_id: asset_id.to_string(),
                        name: row
                            .get("name")
                            .and_then(JsonValue::as_str)
                            .map(ToOwned::to_owned),
                        size_bytes: row
                            .get("sizeBytes")
                            .and_then(JsonValue::as_str)
                            .and_then(|raw| raw.parse().ok())
                            .or_else(|| row.get("sizeBytes").and_then(JsonValue::as_u64)),
                    });
                }
            }

            page_token = page
                .get("nextPageToken")
                .and_then(JsonValue::as_str)
                .filter(|token| !token.is_empty())
                .map(ToOwned::to_owned);
            if page_token.is_none() {
                break;
            }
        }
        Ok(assets)
    }

    /// Delete a batch of remote assets; returns how many were requested.
    pub async fn delete_assets(
        &self,
        token_id: &str,
        asset_ids: &[String],
    ) -> Result<usize, CallError> {
        if asset_ids.is_empty() {
            return Ok(0);
        }
        let headers = crate::headers::request_headers(self.config(), token_id, DELETE_PATH)
            .ok_or(CallError::MissingFingerprint)?;
        let body = json!({ "assetIds": asset_ids });
        let url = format!("{}{DELETE_PATH}", self.base_url());
        self.send(
            Method::POST,
            &url,
            headers,
            Some(Bytes::from(body.to_string())),
            Some(token_id),
            CALL_TIMEOUT,
            false,
        )
        .await?;
        Ok(asset_ids.len())
    }

    /// Fetch a generated asset body from the asset host. `path` is the
    /// path component the chat stream handed out (`/users/.../image.jpg`).
    pub async fn download_asset(&self, token_id: &str, path: &str) -> Result<Bytes, CallError> {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        let mut headers = crate::headers::request_headers(self.config(), token_id, &path)
            .ok_or(CallError::MissingFingerprint)?;
        headers.push((
            "referer".to_string(),
            format!("{}/", self.base_url()),
        ));
        let url = format!("{}{path}", self.asset_base());
        let response = self
            .send(
                Method::GET,
                &url,
                headers,
                None,
                Some(token_id),
                CALL_TIMEOUT,
                false,
            )
            .await?;
        match response.body {
            ResponseBody::Bytes(bytes) => Ok(bytes),
            ResponseBody::Stream(_) => Err(CallError::Transport(TransportError {
                kind: TransportKind::Other,
                message: "unexpected streaming body".to_string(),
            })),
        }
    }

    /// Generated media lives on a sibling host of the main site.
    fn asset_base(&self) -> String {
        let base = self.base_url();
        match base.strip_prefix("https://") {
            Some(host) => format!("https://assets.{host}"),
            None => base.to_string(),
        }
    }
}

fn decode_json(body: ResponseBody) -> Result<JsonValue, CallError> {
    match body {
        ResponseBody::Bytes(bytes) => serde_json::from_slice(&bytes).map_err(|err| {
            CallError::Transport(TransportError {
                kind: TransportKind::Other,
                message: format!("decode asset listing: {err}"),
            })
        }),
        ResponseBody::Stream(_) => Err(CallError::Transport(TransportError {
            kind: TransportKind::Other,
            message: "unexpected streaming body".to_string(),
        })),
    }
}
