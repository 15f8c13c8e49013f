use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use xgate_core::bootstrap::AppHandle;
use xgate_core::pipeline::{ChatResponse, ImageResponse};
use xgate_core::{models, GatewayError};
use xgate_protocol::openai::chat::ChatCompletionRequest;
use xgate_protocol::openai::images::ImageGenerationRequest;
use xgate_protocol::openai::models::ModelList;
use xgate_translate::MediaKind;

use crate::error_response;

#[derive(Clone)]
pub struct ApiState {
    pub app: Arc<AppHandle>,
}

pub fn public_router(app: Arc<AppHandle>) -> Router {
    let state = ApiState { app };
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/images/generations", post(images_generations))
        .route("/v1/images/edits", post(images_edits))
        .route("/v1/models", get(models_list))
        .route("/v1/files/{kind}/{name}", get(media_file))
        .layer(middleware::from_fn_with_state(state.clone(), bearer_auth))
        .with_state(state)
}

/// Bearer auth on `/v1/*` when an api key is configured. Cached media is
/// exempt: those URLs are loaded by image tags, not API clients.
async fn bearer_auth(
    State(state): State<ApiState>,
    req: axum::http::Request<Body>,
    next: Next,
) -> Result<Response, Response> {
    let config = state.app.config.load_full();
    let Some(expected) = config.server.api_key.as_deref() else {
        return Ok(next.run(req).await);
    };
    if req.uri().path().starts_with("/v1/files/") {
        return Ok(next.run(req).await);
    }
    let authorized = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        == Some(expected);
    if !authorized {
        return Err(error_response(&GatewayError::InvalidRequest(
            "invalid or missing api key".to_string(),
        ))
        .into_response());
    }
    Ok(next.run(req).await)
}

async fn chat_completions(
    State(state): State<ApiState>,
    Json(request): Json<ChatCompletionRequest>,
) -> Response {
    match state.app.pipeline.run_chat(request).await {
        Ok(ChatResponse::Stream(rx)) => sse_response(rx),
        Ok(ChatResponse::Json(body)) => Json(body).into_response(),
        Err(error) => error_response(&error),
    }
}

async fn images_generations(
    State(state): State<ApiState>,
    Json(request): Json<ImageGenerationRequest>,
) -> Response {
    match state.app.pipeline.run_image(request, Vec::new()).await {
        Ok(ImageResponse::Stream(rx)) => sse_response(rx),
        Ok(ImageResponse::Json(body)) => Json(body).into_response(),
        Err(error) => error_response(&error),
    }
}

/// `multipart/form-data` image edits: the JSON fields arrive as parts,
/// plus one or more `image` files that become upstream attachments.
async fn images_edits(State(state): State<ApiState>, mut multipart: Multipart) -> Response {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;

    let mut prompt = None;
    let mut model = None;
    let mut n = None;
    let mut size = None;
    let mut response_format = None;
    let mut stream = false;
    let mut attachments = Vec::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                return error_response(&GatewayError::InvalidRequest(format!(
                    "malformed multipart body: {err}"
                )));
            }
        };
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "prompt" => prompt = field.text().await.ok(),
            "model" => model = field.text().await.ok(),
            "n" => n = field.text().await.ok().and_then(|raw| raw.parse().ok()),
            "size" => size = field.text().await.ok(),
            "response_format" => response_format = field.text().await.ok(),
            "stream" => {
                stream = field
                    .text()
                    .await
                    .map(|raw| raw == "true" || raw == "1")
                    .unwrap_or(false);
            }
            "image" | "image[]" => {
                let mime = field
                    .content_type()
                    .unwrap_or("image/png")
                    .to_string();
                match field.bytes().await {
                    Ok(bytes) => attachments
                        .push(format!("data:{mime};base64,{}", BASE64.encode(&bytes))),
                    Err(err) => {
                        return error_response(&GatewayError::InvalidRequest(format!(
                            "unreadable image part: {err}"
                        )));
                    }
                }
            }
            _ => {
                debug!(event = "multipart_field_ignored", field = %name);
            }
        }
    }

    let Some(prompt) = prompt.filter(|prompt| !prompt.is_empty()) else {
        return error_response(&GatewayError::InvalidRequest(
            "prompt is required".to_string(),
        ));
    };
    if attachments.is_empty() {
        return error_response(&GatewayError::InvalidRequest(
            "at least one image is required".to_string(),
        ));
    }

    let request = ImageGenerationRequest {
        model,
        prompt,
        n,
        size,
        response_format,
        stream,
    };
    match state.app.pipeline.run_image(request, attachments).await {
        Ok(ImageResponse::Stream(rx)) => sse_response(rx),
        Ok(ImageResponse::Json(body)) => Json(body).into_response(),
        Err(error) => error_response(&error),
    }
}

async fn models_list(State(_state): State<ApiState>) -> Response {
    let created = time::OffsetDateTime::now_utc().unix_timestamp();
    Json(ModelList::new(models::model_ids(), created)).into_response()
}

async fn media_file(
    State(state): State<ApiState>,
    Path((kind, name)): Path<(String, String)>,
) -> Response {
    let kind = match kind.as_str() {
        "image" => MediaKind::Image,
        "video" => MediaKind::Video,
        _ => return StatusCode::NOT_FOUND.into_response(),
    };
    let Some(path) = state.app.media.resolve(kind, &name) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            // Content type comes from the file magic, never the request.
            let content_type = sniff_content_type(&bytes);
            ([(header::CONTENT_TYPE, content_type)], bytes).into_response()
        }
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

fn sse_response(rx: tokio::sync::mpsc::Receiver<Bytes>) -> Response {
    let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn sniff_content_type(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        "image/png"
    } else if bytes.starts_with(b"\xff\xd8\xff") {
        "image/jpeg"
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        "image/gif"
    } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        "image/webp"
    } else if bytes.len() >= 12 && &bytes[4..8] == b"ftyp" {
        "video/mp4"
    } else if bytes.starts_with(b"\x1a\x45\xdf\xa3") {
        "video/webm"
    } else {
        "application/octet-stream"
    }
}

#[cfg(test)]
mod tests {
    use super::sniff_content_type;

    #[test]
    fn magic_bytes_decide_content_type() {
        assert_eq!(sniff_content_type(b"\x89PNG\r\n\x1a\nrest"), "image/png");
        assert_eq!(sniff_content_type(b"\xff\xd8\xff\xe0"), "image/jpeg");
        assert_eq!(
            sniff_content_type(b"\x00\x00\x00\x20ftypisom...."),
            "video/mp4"
        );
        assert_eq!(sniff_content_type(b"plain text"), "application/octet-stream");
    }
}
