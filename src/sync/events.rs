//! Typed notifications for UI subscribers

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::state::ConnectivityState;
use crate::queue::OperationId;

/// Per-pass drain counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainSummary {
    /// Confirmed by the server and removed from the log
    pub succeeded: usize,
    /// Retryable failures, rescheduled with backoff
    pub failed: usize,
    /// Refused by the server, kept for the user to fix or discard
    pub rejected: usize,
    /// Not attempted because their backoff has not elapsed
    pub deferred: usize,
}

impl DrainSummary {
    pub fn attempted(&self) -> usize {
        self.succeeded + self.failed + self.rejected
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    Queued {
        id: OperationId,
        collection_key: String,
    },
    Synced {
        id: OperationId,
        collection_key: Option<String>,
    },
    Rejected {
        id: OperationId,
        /// HTTP status, or 0 when the request could not be built locally
        status: u16,
        message: String,
    },
    Discarded {
        id: OperationId,
    },
    DrainCompleted(DrainSummary),
    ConnectivityChanged {
        state: ConnectivityState,
    },
    BackgroundSyncFailed {
        message: String,
    },
}

/// Fan-out of engine events to any number of subscribers.
///
/// Slow subscribers lag and lose old events; emitting never blocks.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: EngineEvent) {
        tracing::trace!("Engine event: {:?}", event);
        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
