//! In-process store for tests and throwaway sessions

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{BatchOp, KvStore};
use crate::error::SyncResult;

/// Clones share the same map, so a clone behaves like reopening the same store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> SyncResult<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> SyncResult<()> {
        self.entries.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> SyncResult<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> SyncResult<Vec<(String, Vec<u8>)>> {
        Ok(self
            .entries
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn write_batch(&self, ops: &[BatchOp]) -> SyncResult<()> {
        let mut map = self.entries.write();
        for op in ops {
            match op {
                BatchOp::Put(key, value) => {
                    map.insert(key.clone(), value.clone());
                }
                BatchOp::Delete(key) => {
                    map.remove(key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_prefix_ordering() {
        let store = MemoryStore::new();
        store.put("pending_ops:2", b"b").unwrap();
        store.put("cache:x", b"c").unwrap();
        store.put("pending_ops:1", b"a").unwrap();

        let values: Vec<_> = store
            .scan_prefix("pending_ops:")
            .unwrap()
            .into_iter()
            .map(|(_, v)| v)
            .collect();
        assert_eq!(values, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn test_clones_share_state() {
        let store = MemoryStore::new();
        let reopened = store.clone();
        store.put("k", b"v").unwrap();
        assert_eq!(reopened.get("k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(reopened.len(), 1);
    }
}
