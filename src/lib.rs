pub mod bridge;
pub mod config;
pub mod engine;
pub mod error;
pub mod queue;
pub mod storage;
pub mod sync;
pub mod transport;

pub use config::EngineConfig;
pub use engine::{SyncEngine, SyncEngineBuilder};
pub use error::{FailureKind, SyncError, SyncResult};
pub use queue::{Attachment, OperationId, OperationStatus, PendingOperation, RetryPolicy};
pub use storage::{CacheStore, KvStore, MemoryStore, RocksStore};
pub use sync::{
    ConnectivityState, DrainOutcome, DrainSummary, EngineEvent, PerformOutcome, PerformRequest,
    QueuedAck, ReadSource,
};
pub use transport::{HttpTransport, Method, OutboundRequest, ServerResponse, Transport, TransportError};
