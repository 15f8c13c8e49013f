use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use time::OffsetDateTime;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, warn};
use uuid::Uuid;

use xgate_common::mask_token;
use xgate_protocol::upstream::{imagine_request, WsServerMessage};

use crate::client::{CallError, TransportError, TransportKind, UpstreamClient};

const IMAGINE_PATH: &str = "/ws/imagine/listen";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Frames from the imagine socket; faults arrive in-band like the HTTP
/// byte stream.
pub type WsStream = tokio::sync::mpsc::Receiver<Result<WsServerMessage, TransportError>>;

impl UpstreamClient {
    /// Open the imagine WebSocket and send one generation request. The
    /// returned stream yields parsed server frames until the socket closes
    /// or the receiver is dropped (client cancellation).
    pub async fn connect_imagine(
        &self,
        token_id: &str,
        prompt: &str,
        aspect_ratio: &str,
        enable_nsfw: bool,
    ) -> Result<WsStream, CallError> {
        let url = format!(
            "{}{IMAGINE_PATH}",
            self.base_url().replacen("https://", "wss://", 1)
        );
        let mut request = url.into_client_request().map_err(map_ws_error)?;
        for (name, value) in crate::headers::ws_headers(self.config(), token_id) {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|err| {
                CallError::Transport(TransportError {
                    kind: TransportKind::Other,
                    message: format!("ws header: {err}"),
                })
            })?;
            let value = HeaderValue::from_str(&value).map_err(|err| {
                CallError::Transport(TransportError {
                    kind: TransportKind::Other,
                    message: format!("ws header: {err}"),
                })
            })?;
            request.headers_mut().insert(name, value);
        }

        let connected = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request))
            .await
            .map_err(|_| {
                CallError::Transport(TransportError {
                    kind: TransportKind::Timeout,
                    message: "websocket connect timed out".to_string(),
                })
            })?
            .map_err(map_ws_error)?;
        let (socket, _response) = connected;
        let (mut sink, mut stream) = socket.split();

        let request_id = Uuid::new_v4().to_string();
        let timestamp_ms =
            (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64;
        let frame =
            imagine_request(&request_id, prompt, aspect_ratio, enable_nsfw, timestamp_ms)
                .to_string();
        sink.send(Message::text(frame)).await.map_err(map_ws_error)?;
        debug!(
            event = "imagine_ws_open",
            token = %mask_token(token_id),
            request_id = %request_id,
        );

        let (tx, rx) = tokio::sync::mpsc::channel::<Result<WsServerMessage, TransportError>>(32);
        tokio::spawn(async move {
            // Keep the write half alive until the read loop ends so the
            // socket isn't half-closed under the server.
            let _sink = sink;
            while let Some(item) = stream.next().await {
                match item {
                    Ok(Message::Text(text)) => {
                        let Some(message) = WsServerMessage::parse(text.as_str()) else {
                            continue;
                        };
                        if matches!(message, WsServerMessage::Other) {
                            continue;
                        }
                        if tx.send(Ok(message)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        warn!(event = "imagine_ws_error", error = %err);
                        let _ = tx
                            .send(Err(TransportError {
                                kind: TransportKind::Other,
                                message: err.to_string(),
                            }))
                            .await;
                        break;
                    }
                }
            }
        });
        Ok(rx)
    }
}

fn map_ws_error(err: WsError) -> CallError {
    match err {
        WsError::Http(response) => CallError::Http {
            status: response.status().as_u16(),
            retry_after: None,
            body: String::new(),
        },
        other => CallError::Transport(TransportError {
            kind: TransportKind::Connect,
            message: other.to_string(),
        }),
    }
}
