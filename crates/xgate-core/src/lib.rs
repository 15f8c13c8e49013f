//! Request pipeline, batch engine, and process wiring.
//!
//! This crate owns the per-request orchestration (token acquisition,
//! upstream execution, translation, outcome reporting), the error
//! taxonomy the public surface maps to HTTP, the media cache, and the
//! operator batch tasks. The routers call into here and nothing here
//! knows about axum.

pub mod batch;
pub mod bootstrap;
pub mod error;
pub mod media;
pub mod models;
pub mod pipeline;

pub use batch::{BatchEngine, BatchEvent, TaskKind};
pub use bootstrap::{bootstrap, AppHandle};
pub use error::GatewayError;
pub use media::{CacheStats, MediaCache};
pub use pipeline::{ChatResponse, ImageResponse, Pipeline};
