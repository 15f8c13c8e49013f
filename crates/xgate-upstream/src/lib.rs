//! Typed client for the grok.com upstream.
//!
//! Everything that touches the network lives here: the wreq HTTP client
//! with browser emulation, the anti-bot header set, the conversation and
//! rate-limit calls, the reverse asset/content-mode interfaces, and the
//! imagine WebSocket. Higher layers speak in protocol types and never see
//! wreq.

mod assets;
mod birth;
mod chat;
mod client;
mod emulation;
mod fingerprint;
mod headers;
mod nsfw;
mod upload;
mod usage;
mod ws;

pub use assets::RemoteAsset;
pub use chat::imagine_referer;
pub use client::{ByteStream, CallError, TransportError, TransportKind, UpstreamClient};
pub use fingerprint::statsig_id;
pub use upload::UploadedFile;
pub use usage::GrokUsageProbe;
pub use ws::WsStream;
