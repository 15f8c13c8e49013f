use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;

use xgate_core::batch::{BatchEvent, TaskKind};
use xgate_core::bootstrap::AppHandle;
use xgate_core::GatewayError;
use xgate_pool::{RecordPatch, TokenClass, TokenRecord};
use xgate_protocol::sse;
use xgate_translate::MediaKind;

use crate::error_response;

#[derive(Clone)]
pub struct AdminState {
    pub app: Arc<AppHandle>,
}

/// Operator surface under `/api/v1/admin`. Requires `admin_key`; with no
/// key configured the whole surface answers 404.
pub fn admin_router(app: Arc<AppHandle>) -> Router {
    let state = AdminState { app };
    Router::new()
        .route(
            "/api/v1/admin/tokens",
            get(list_tokens).post(import_tokens).delete(remove_tokens),
        )
        .route("/api/v1/admin/tokens/patch", post(patch_token))
        .route("/api/v1/admin/batch", post(submit_batch))
        .route("/api/v1/admin/batch/{task_id}", get(stream_batch))
        .route("/api/v1/admin/batch/{task_id}/cancel", post(cancel_batch))
        .route("/api/v1/admin/cache", get(cache_stat))
        .route("/api/v1/admin/cache/clear", post(cache_clear))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth))
        .with_state(state)
}

async fn admin_auth(
    State(state): State<AdminState>,
    req: axum::http::Request<Body>,
    next: Next,
) -> Result<Response, Response> {
    let config = state.app.config.load_full();
    let Some(expected) = config.server.admin_key.as_deref() else {
        return Err(StatusCode::NOT_FOUND.into_response());
    };
    let presented = req
        .headers()
        .get("x-admin-key")
        .or_else(|| req.headers().get(header::AUTHORIZATION))
        .and_then(|value| value.to_str().ok())
        .map(|value| value.strip_prefix("Bearer ").unwrap_or(value).trim());
    if presented != Some(expected) {
        return Err(StatusCode::UNAUTHORIZED.into_response());
    }
    Ok(next.run(req).await)
}

async fn list_tokens(State(state): State<AdminState>) -> Response {
    let rows = state.app.pool.list_all().await;
    let rows: Vec<_> = rows
        .into_iter()
        .map(|(id, record)| {
            json!({
                "id": id,
                "record": record,
            })
        })
        .collect();
    Json(json!({ "tokens": rows })).into_response()
}

#[derive(Debug, Deserialize)]
struct ImportRequest {
    tokens: Vec<String>,
    #[serde(default = "default_class")]
    class: TokenClass,
}

fn default_class() -> TokenClass {
    TokenClass::Basic
}

async fn import_tokens(
    State(state): State<AdminState>,
    Json(request): Json<ImportRequest>,
) -> Response {
    let entries = request
        .tokens
        .into_iter()
        .map(|id| (id, TokenRecord::new(request.class)))
        .collect();
    let imported = state.app.pool.import(entries).await;
    Json(json!({ "imported": imported })).into_response()
}

#[derive(Debug, Deserialize)]
struct RemoveRequest {
    tokens: Vec<String>,
}

async fn remove_tokens(
    State(state): State<AdminState>,
    Json(request): Json<RemoveRequest>,
) -> Response {
    let removed = state.app.pool.remove(&request.tokens).await;
    Json(json!({ "removed": removed })).into_response()
}

#[derive(Debug, Deserialize)]
struct PatchRequest {
    id: String,
    #[serde(flatten)]
    patch: RecordPatch,
}

async fn patch_token(
    State(state): State<AdminState>,
    Json(request): Json<PatchRequest>,
) -> Response {
    if state.app.pool.replace_record(&request.id, request.patch).await {
        Json(json!({ "updated": true })).into_response()
    } else {
        error_response(&GatewayError::InvalidRequest("unknown token".to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct SubmitBatchRequest {
    kind: TaskKind,
    #[serde(default)]
    tokens: Option<Vec<String>>,
}

async fn submit_batch(
    State(state): State<AdminState>,
    Json(request): Json<SubmitBatchRequest>,
) -> Response {
    match state.app.batch.submit(request.kind, request.tokens).await {
        Ok(task_id) => Json(json!({ "task_id": task_id })).into_response(),
        Err(error) => error_response(&error),
    }
}

/// SSE stream of one task: a snapshot first, then progress until the
/// terminal event.
async fn stream_batch(
    State(state): State<AdminState>,
    Path(task_id): Path<String>,
) -> Response {
    let Some((snapshot, mut events)) = state.app.batch.attach(&task_id).await else {
        return error_response(&GatewayError::InvalidRequest("unknown task".to_string()));
    };

    let (tx, rx) = tokio::sync::mpsc::channel::<bytes::Bytes>(64);
    tokio::spawn(async move {
        if let Some(frame) = sse::data_frame(&BatchEvent::Snapshot(snapshot)) {
            if tx.send(frame).await.is_err() {
                return;
            }
        }
        while let Some(event) = events.recv().await {
            let terminal = matches!(
                event,
                BatchEvent::Done { .. } | BatchEvent::Cancelled { .. } | BatchEvent::Error { .. }
            );
            if let Some(frame) = sse::data_frame(&event) {
                if tx.send(frame).await.is_err() {
                    return;
                }
            }
            if terminal {
                break;
            }
        }
        let _ = tx.send(sse::done_frame()).await;
    });

    let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn cancel_batch(State(state): State<AdminState>, Path(task_id): Path<String>) -> Response {
    if state.app.batch.cancel(&task_id).await {
        Json(json!({ "cancelled": true })).into_response()
    } else {
        error_response(&GatewayError::InvalidRequest("unknown task".to_string()))
    }
}

async fn cache_stat(State(state): State<AdminState>) -> Response {
    Json(state.app.media.stat().await).into_response()
}

#[derive(Debug, Deserialize)]
struct CacheClearRequest {
    #[serde(default)]
    kind: Option<String>,
}

async fn cache_clear(
    State(state): State<AdminState>,
    Json(request): Json<CacheClearRequest>,
) -> Response {
    let kind = match request.kind.as_deref() {
        Some("image") => Some(MediaKind::Image),
        Some("video") => Some(MediaKind::Video),
        Some(other) => {
            return error_response(&GatewayError::InvalidRequest(format!(
                "unknown cache kind {other:?}"
            )));
        }
        None => None,
    };
    let freed = state.app.media.clear(kind).await;
    Json(json!({ "freed_bytes": freed })).into_response()
}
