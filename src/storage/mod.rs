//! Durable storage for the sync engine
//!
//! Everything the engine persists goes through the `KvStore` capability:
//! - `cache:{collection}` holds last-known-good server snapshots
//! - `pending_ops:{sequence}` holds unconfirmed mutations
//!
//! Keys are namespaced by prefix so pending operations can be enumerated
//! without touching cache entries.

pub mod cache;
pub mod memory;
pub mod rocks;

use crate::error::SyncResult;

pub use cache::CacheStore;
pub use memory::MemoryStore;
pub use rocks::RocksStore;

/// One write inside an atomic batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put(String, Vec<u8>),
    Delete(String),
}

/// Durable key→value store surviving process restarts
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> SyncResult<Option<Vec<u8>>>;

    fn put(&self, key: &str, value: &[u8]) -> SyncResult<()>;

    fn delete(&self, key: &str) -> SyncResult<()>;

    /// All entries whose key starts with `prefix`, in key order
    fn scan_prefix(&self, prefix: &str) -> SyncResult<Vec<(String, Vec<u8>)>>;

    /// Apply several writes atomically
    fn write_batch(&self, ops: &[BatchOp]) -> SyncResult<()> {
        for op in ops {
            match op {
                BatchOp::Put(key, value) => self.put(key, value)?,
                BatchOp::Delete(key) => self.delete(key)?,
            }
        }
        Ok(())
    }
}
