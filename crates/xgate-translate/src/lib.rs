//! Translates the upstream's incremental event streams into
//! OpenAI-compatible output.
//!
//! Translators are synchronous push-based state machines: bytes (or
//! WebSocket frames) go in, protocol-shaped outputs come out. Anything
//! that needs to suspend (media caching, URL rewriting) is signalled as
//! an output variant and resolved by the request pipeline driving the
//! translator.

mod chat;
mod idle;
mod image;
mod tag_filter;
mod ws_image;

pub use chat::{ChatOutput, ChatTranslator, MediaKind};
pub use idle::recv_with_idle;
pub use image::{ImageHttpTranslator, ImageOutput};
pub use tag_filter::TagFilter;
pub use ws_image::{FinalImage, WsImageEvent, WsImageMachine, WsPhase};

/// Translator-level failures, mapped to the gateway error taxonomy by the
/// pipeline.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TranslateError {
    #[error("no data from upstream for {idle_secs}s")]
    IdleTimeout { idle_secs: u64 },
    #[error("malformed upstream event: {message}")]
    Protocol { message: String },
    #[error("generation blocked by upstream content policy")]
    Blocked,
    #[error("upstream stream error: {message}")]
    Upstream { message: String },
}
