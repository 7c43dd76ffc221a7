//! Message protocol between foreground clients and the background context
//!
//! Messages cross the boundary as JSON text, never as shared objects.

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::queue::{OperationId, PendingOperation};
use crate::sync::DrainSummary;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeMessage {
    /// Background → foreground: which operations do you still have pending?
    RequestPendingItems,
    /// Foreground → background reply
    PendingItems { items: Vec<PendingOperation> },
    SyncStarted,
    ItemSynced {
        id: OperationId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        collection_key: Option<String>,
    },
    ItemRejected {
        id: OperationId,
        status: u16,
        message: String,
    },
    SyncCompleted { results: DrainSummary },
    SyncError { error: String },
}

impl BridgeMessage {
    /// Request/response traffic is stale once its requester has moved on
    pub fn is_replayable(&self) -> bool {
        !matches!(
            self,
            BridgeMessage::RequestPendingItems | BridgeMessage::PendingItems { .. }
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
    pub message: BridgeMessage,
}

impl Envelope {
    pub fn new(message: BridgeMessage) -> Self {
        Self {
            correlation_id: uuid::Uuid::new_v4().to_string(),
            in_reply_to: None,
            message,
        }
    }

    pub fn reply(&self, message: BridgeMessage) -> Self {
        Self {
            correlation_id: uuid::Uuid::new_v4().to_string(),
            in_reply_to: Some(self.correlation_id.clone()),
            message,
        }
    }

    pub fn encode(&self) -> SyncResult<String> {
        serde_json::to_string(self).map_err(|e| SyncError::Protocol(e.to_string()))
    }

    pub fn decode(raw: &str) -> SyncResult<Self> {
        serde_json::from_str(raw)
            .map_err(|e| SyncError::Protocol(format!("malformed envelope: {}", e)))
    }
}
