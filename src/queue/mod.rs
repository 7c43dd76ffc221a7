//! Offline mutation queue
//!
//! Pending operations, their durable log and the retry policy applied when a
//! replay fails.

pub mod backoff;
pub mod log;
pub mod types;

pub use backoff::RetryPolicy;
pub use log::{PendingOperationLog, QueueLimits, QueueStats};
pub use types::{Attachment, NewOperation, OperationId, OperationStatus, PendingOperation};

/// Current time as unix milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
