//! RocksDB-backed durable store

use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use std::path::Path;
use std::sync::Arc;

use super::{BatchOp, KvStore};
use crate::error::SyncResult;

#[derive(Clone)]
pub struct RocksStore {
    db: Arc<DB>,
}

impl RocksStore {
    /// Open (or create) the store under `data_dir/offline`
    pub fn open<P: AsRef<Path>>(data_dir: P) -> SyncResult<Self> {
        let path = data_dir.as_ref().join("offline");
        std::fs::create_dir_all(&path)?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_max_write_buffer_number(2);
        opts.set_write_buffer_size(8 * 1024 * 1024); // 8MB

        let db = DB::open(&opts, &path)?;
        tracing::debug!("Opened offline store at {}", path.display());
        Ok(Self { db: Arc::new(db) })
    }
}

impl KvStore for RocksStore {
    fn get(&self, key: &str) -> SyncResult<Option<Vec<u8>>> {
        Ok(self.db.get(key.as_bytes())?)
    }

    fn put(&self, key: &str, value: &[u8]) -> SyncResult<()> {
        self.db.put(key.as_bytes(), value)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> SyncResult<()> {
        self.db.delete(key.as_bytes())?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> SyncResult<Vec<(String, Vec<u8>)>> {
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward));

        let mut entries = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            entries.push((String::from_utf8_lossy(&key).into_owned(), value.to_vec()));
        }
        Ok(entries)
    }

    fn write_batch(&self, ops: &[BatchOp]) -> SyncResult<()> {
        let mut batch = WriteBatch::default();
        for op in ops {
            match op {
                BatchOp::Put(key, value) => batch.put(key.as_bytes(), value),
                BatchOp::Delete(key) => batch.delete(key.as_bytes()),
            }
        }
        self.db.write(batch)?;
        Ok(())
    }
}
