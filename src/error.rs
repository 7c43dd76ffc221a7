use serde_json::Value;
use thiserror::Error;

use crate::transport::TransportError;

/// Broad failure class, used to decide between retrying, surfacing and ignoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The server could not be reached. Retryable.
    Connectivity,
    /// The server answered and refused the request. Terminal.
    Semantic,
    /// The durable store is unavailable.
    Storage,
    /// A malformed message crossed the background bridge.
    Protocol,
    /// The caller asked for something the engine cannot do.
    Usage,
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Connectivity failure: {0}")]
    Connectivity(TransportError),

    #[error("Rejected by server (HTTP {status}): {message}")]
    Rejected {
        status: u16,
        message: String,
        body: Value,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Pending operation '{0}' not found")]
    OperationNotFound(String),

    #[error("Pending operation '{0}' is being synced")]
    OperationInFlight(String),

    #[error("Offline queue is full: {0}")]
    QueueFull(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    /// Build a rejection from a server status and response body.
    pub fn rejected(status: u16, body: Value) -> Self {
        let message = rejection_message(&body)
            .unwrap_or_else(|| format!("request refused with status {}", status));
        SyncError::Rejected {
            status,
            message,
            body,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            SyncError::Connectivity(_) => FailureKind::Connectivity,
            SyncError::Rejected { .. } => FailureKind::Semantic,
            SyncError::Storage(_) | SyncError::Io(_) => FailureKind::Storage,
            SyncError::Protocol(_) | SyncError::Json(_) => FailureKind::Protocol,
            SyncError::OperationNotFound(_)
            | SyncError::OperationInFlight(_)
            | SyncError::QueueFull(_)
            | SyncError::InvalidRequest(_)
            | SyncError::Config(_) => FailureKind::Usage,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == FailureKind::Connectivity
    }
}

/// Pull a human readable message out of a server error body.
///
/// Accepts `{"error": "..."}`, `{"message": "..."}` or a bare JSON string.
pub fn rejection_message(body: &Value) -> Option<String> {
    match body {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(map) => ["error", "message", "detail"]
            .iter()
            .find_map(|k| map.get(*k).and_then(|v| v.as_str()))
            .map(|s| s.to_string()),
        _ => None,
    }
}

/// A request that could not even be built is the caller's problem, not the network's.
impl From<TransportError> for SyncError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::InvalidRequest(message) => SyncError::InvalidRequest(message),
            other => SyncError::Connectivity(other),
        }
    }
}

impl From<rocksdb::Error> for SyncError {
    fn from(err: rocksdb::Error) -> Self {
        SyncError::Storage(err.into())
    }
}

impl serde::Serialize for SyncError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}
