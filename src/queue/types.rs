use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

use crate::transport::Method;

/// Locally generated id of a pending operation, stable across retries
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(String);

impl OperationId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for OperationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for OperationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum OperationStatus {
    Queued,
    Syncing,
    Failed { retry_count: u32, retryable: bool },
    Synced,
}

impl OperationStatus {
    pub fn retry_count(&self) -> u32 {
        match self {
            OperationStatus::Failed { retry_count, .. } => *retry_count,
            _ => 0,
        }
    }

    /// Queued, or failed in a way that another attempt can fix
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OperationStatus::Queued | OperationStatus::Failed { retryable: true, .. }
        )
    }

    /// Failed and waiting for the user to edit or discard it
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::Failed { retryable: false, .. })
    }
}

/// A captured file upload. The bytes travel with the operation; paths would
/// not survive a restart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub field_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(with = "blob")]
    pub data: Vec<u8>,
}

impl Attachment {
    pub fn new(field_name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            field_name: field_name.into(),
            file_name: None,
            content_type: None,
            data,
        }
    }

    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = Some(name.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Base64 encoding for blob bytes inside the JSON log entries
mod blob {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingOperation {
    pub id: OperationId,
    /// Creation order; replay order key
    pub sequence: u64,
    pub resource_url: String,
    pub method: Method,
    pub collection_key: String,
    pub body: Option<JsonValue>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub status: OperationStatus,
    pub created_at: i64, // Unix timestamp (milliseconds)
    pub updated_at: i64, // Unix timestamp (milliseconds)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_status: Option<u16>,
}

impl PendingOperation {
    /// Approximate size counted against the queue byte limit
    pub fn payload_bytes(&self) -> usize {
        let body = self
            .body
            .as_ref()
            .map(|b| serde_json::to_string(b).map(|s| s.len()).unwrap_or(0))
            .unwrap_or(0);
        body + self.attachments.iter().map(|a| a.data.len()).sum::<usize>()
    }

    /// Due for submission at `now` (unix millis)
    pub fn is_due(&self, now: i64) -> bool {
        self.status.is_retryable() && self.next_attempt_at.map(|t| t <= now).unwrap_or(true)
    }
}

/// A mutation to capture in the log
#[derive(Debug, Clone)]
pub struct NewOperation {
    pub id: OperationId,
    pub resource_url: String,
    pub method: Method,
    pub collection_key: String,
    pub body: Option<JsonValue>,
    pub attachments: Vec<Attachment>,
}
