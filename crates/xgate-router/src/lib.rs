//! HTTP surface: the OpenAI-compatible public API and the operator
//! admin API. All behavior lives in `xgate-core`; this crate is routing,
//! extraction, auth, and SSE plumbing only.

mod admin;
mod public;

pub use admin::admin_router;
pub use public::public_router;

use axum::response::{IntoResponse, Response};
use axum::Json;

use xgate_core::GatewayError;

pub(crate) fn error_response(error: &GatewayError) -> Response {
    (error.status(), Json(error.body())).into_response()
}
