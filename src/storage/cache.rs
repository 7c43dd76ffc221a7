//! Last-known-good server snapshots, one per collection
//!
//! Whole-collection replace only: `put` overwrites, nothing is patched in place.

use serde_json::Value;
use std::sync::Arc;

use super::KvStore;
use crate::error::SyncResult;

const CACHE_PREFIX: &str = "cache:";

#[derive(Clone)]
pub struct CacheStore {
    store: Arc<dyn KvStore>,
}

impl CacheStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    fn key(collection_key: &str) -> String {
        format!("{}{}", CACHE_PREFIX, collection_key)
    }

    pub fn get(&self, collection_key: &str) -> SyncResult<Option<Value>> {
        match self.store.get(&Self::key(collection_key))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put(&self, collection_key: &str, payload: &Value) -> SyncResult<()> {
        let bytes = serde_json::to_vec(payload)?;
        self.store.put(&Self::key(collection_key), &bytes)?;
        tracing::debug!("Cache for '{}' replaced", collection_key);
        Ok(())
    }

    pub fn remove(&self, collection_key: &str) -> SyncResult<()> {
        self.store.delete(&Self::key(collection_key))
    }

    /// Names of every cached collection
    pub fn collections(&self) -> SyncResult<Vec<String>> {
        Ok(self
            .store
            .scan_prefix(CACHE_PREFIX)?
            .into_iter()
            .map(|(k, _)| k[CACHE_PREFIX.len()..].to_string())
            .collect())
    }
}
