//! Token pool manager.
//!
//! Owns every [`TokenRecord`], answers acquire/release for the request
//! pipeline, broadcasts change events, and drives the background
//! persistence and quota-refresh loops. All mutation goes through
//! [`TokenPool`]; other components only ever see snapshots.

mod events;
mod persist;
mod pool;
mod record;
mod refresh;

pub use events::{PoolEvent, PoolEventHub};
pub use persist::{spawn_persistence, Persister};
pub use pool::{AcquireError, Outcome, RecordPatch, TokenLease, TokenPool};
pub use record::{ClassHint, QuotaBucket, QuotaSnapshot, TokenClass, TokenId, TokenRecord};
pub use refresh::{spawn_refresh, ProbeError, QuotaUpdate, UsageProbe};
