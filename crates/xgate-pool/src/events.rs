use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::broadcast;

use crate::record::TokenId;

/// Change notifications for the admin UI and batch progress views.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PoolEvent {
    Imported {
        id: TokenId,
    },
    Removed {
        id: TokenId,
    },
    Updated {
        id: TokenId,
    },
    Disabled {
        id: TokenId,
        reason: String,
    },
    CoolingStarted {
        id: TokenId,
        #[serde(with = "time::serde::rfc3339")]
        until: OffsetDateTime,
    },
    QuotaRefreshed {
        id: TokenId,
    },
}

#[derive(Clone)]
pub struct PoolEventHub {
    tx: broadcast::Sender<PoolEvent>,
}

impl PoolEventHub {
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.tx.subscribe()
    }

    /// Lagging subscribers miss events rather than blocking the pool.
    pub fn emit(&self, event: PoolEvent) {
        let _ = self.tx.send(event);
    }
}
