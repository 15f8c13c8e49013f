use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tracing::{debug, warn};
use wreq::{Client, Method, Proxy};

use xgate_common::{mask_token, UpstreamConfig};

use crate::emulation::{default_emulation, emulation_for_token};
use crate::headers::HeaderList;

/// Streamed response body. Transport faults arrive in-band so the
/// consumer can distinguish "stream ended" from "stream broke".
pub type ByteStream = tokio::sync::mpsc::Receiver<Result<Bytes, TransportError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Timeout,
    ReadTimeout,
    Connect,
    Dns,
    Tls,
    Other,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct TransportError {
    pub kind: TransportKind,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("anti-bot fingerprint unavailable: set upstream.statsig_id or enable dynamic_statsig")]
    MissingFingerprint,
    #[error("upstream returned status {status}")]
    Http {
        status: u16,
        retry_after: Option<u64>,
        body: String,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub(crate) enum ResponseBody {
    Bytes(Bytes),
    Stream(ByteStream),
}

pub(crate) struct UpstreamResponse {
    pub status: u16,
    pub body: ResponseBody,
}

/// Shared wreq client pool, one client per (emulation profile, proxy).
pub struct UpstreamClient {
    config: UpstreamConfig,
    clients: Mutex<HashMap<(usize, Option<String>), Client>>,
}

impl UpstreamClient {
    pub fn new(config: UpstreamConfig) -> Self {
        Self {
            config,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    pub fn base_url(&self) -> &str {
        self.config.base_url.trim_end_matches('/')
    }

    fn client_for(&self, token_id: Option<&str>) -> Result<Client, TransportError> {
        let (index, emulation) = match token_id {
            Some(id) => emulation_for_token(id),
            None => default_emulation(),
        };
        let proxy = normalize_proxy(self.config.proxy.as_deref());
        let key = (index, proxy.clone());

        let mut guard = self
            .clients
            .lock()
            .map_err(|_| TransportError {
                kind: TransportKind::Other,
                message: "client cache poisoned".to_string(),
            })?;
        if let Some(client) = guard.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = Client::builder()
            .emulation(emulation)
            .connect_timeout(Duration::from_secs(10));
        if let Some(proxy_url) = proxy.as_deref() {
            builder = builder.proxy(Proxy::all(proxy_url).map_err(map_error)?);
        }
        let client = builder.build().map_err(map_error)?;
        guard.insert(key, client.clone());
        Ok(client)
    }

    /// One upstream HTTP exchange. Non-2xx statuses become
    /// [`CallError::Http`] with the body captured for diagnostics.
    pub(crate) async fn send(
        &self,
        method: Method,
        url: &str,
        headers: HeaderList,
        body: Option<Bytes>,
        token_id: Option<&str>,
        timeout: Duration,
        stream: bool,
    ) -> Result<UpstreamResponse, CallError> {
        let client = self.client_for(token_id)?;
        let mut builder = client.request(method.clone(), url).timeout(timeout);
        for (name, value) in &headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }

        debug!(
            event = "upstream_request",
            method = %method,
            url = %redact_url(url),
            token = token_id.map(mask_token).unwrap_or_default(),
            stream,
        );
        let response = builder.send().await.map_err(map_error)?;
        let status = response.status().as_u16();

        if !(200..300).contains(&status) {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse::<u64>().ok());
            let body = response.bytes().await.map_err(map_error)?;
            let body = String::from_utf8_lossy(&body[..body.len().min(2048)]).into_owned();
            warn!(
                event = "upstream_response",
                status,
                token = token_id.map(mask_token).unwrap_or_default(),
            );
            return Err(CallError::Http {
                status,
                retry_after,
                body,
            });
        }

        if !stream {
            let bytes = response.bytes().await.map_err(map_error)?;
            return Ok(UpstreamResponse {
                status,
                body: ResponseBody::Bytes(bytes),
            });
        }

        let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, TransportError>>(16);
        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            while let Some(item) = body.next().await {
                let message = match item {
                    Ok(chunk) => Ok(chunk),
                    Err(err) => {
                        let fault = map_error(err);
                        let _ = tx.send(Err(fault)).await;
                        break;
                    }
                };
                if tx.send(message).await.is_err() {
                    // Receiver dropped: client cancelled, stop reading.
                    break;
                }
            }
        });
        Ok(UpstreamResponse {
            status,
            body: ResponseBody::Stream(rx),
        })
    }
}

impl UpstreamClient {
    /// Plain GET of a client-supplied absolute URL (inbound image
    /// attachments). No credential, no fingerprint.
    pub async fn fetch_public(&self, url: &str) -> Result<Bytes, CallError> {
        let client = self.client_for(None)?;
        let response = client
            .get(url)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(map_error)?;
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(CallError::Http {
                status,
                retry_after: None,
                body: String::new(),
            });
        }
        response.bytes().await.map_err(map_error).map_err(Into::into)
    }
}

fn normalize_proxy(value: Option<&str>) -> Option<String> {
    value
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
}

fn redact_url(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

fn map_error(err: wreq::Error) -> TransportError {
    let message = err.to_string();
    let lowered = message.to_ascii_lowercase();
    let kind = if err.is_timeout() {
        if lowered.contains("read") || lowered.contains("idle") {
            TransportKind::ReadTimeout
        } else {
            TransportKind::Timeout
        }
    } else if err.is_connect() {
        if lowered.contains("dns") || lowered.contains("resolve") {
            TransportKind::Dns
        } else if lowered.contains("tls") || lowered.contains("ssl") {
            TransportKind::Tls
        } else {
            TransportKind::Connect
        }
    } else if lowered.contains("tls") || lowered.contains("ssl") {
        TransportKind::Tls
    } else {
        TransportKind::Other
    };
    TransportError { kind, message }
}
