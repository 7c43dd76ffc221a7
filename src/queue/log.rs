//! Pending operation log
//!
//! Durable, ordered record of mutations the server has not confirmed yet.
//!
//! Key layout:
//! - `pending_ops:{sequence:020}` entry without attachment bytes, so a prefix
//!   scan returns entries in creation order and stays cheap
//! - `pending_ops:_sequence` the last assigned sequence
//! - `pending_blobs:{sequence:020}` attachments of an entry, when it has any
//! - `pending_ids:{id}` sequence and payload size of an entry
//! - `pending_meta:totals` count and payload bytes of the whole queue
//!
//! Lookups by id go through the index and touch a single entry.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::types::{Attachment, NewOperation, OperationId, OperationStatus, PendingOperation};
use super::now_millis;
use crate::error::{SyncError, SyncResult};
use crate::storage::{BatchOp, KvStore};

const LOG_PREFIX: &str = "pending_ops:";
const SEQ_KEY: &str = "pending_ops:_sequence";
const BLOB_PREFIX: &str = "pending_blobs:";
const INDEX_PREFIX: &str = "pending_ids:";
const TOTALS_KEY: &str = "pending_meta:totals";

/// Bounds for the offline queue.
///
/// When full, new operations are rejected; accepted ones are never dropped.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct QueueLimits {
    /// Maximum number of pending operations (default: 10,000)
    #[serde(default = "default_max_count")]
    pub max_count: usize,
    /// Maximum total size of bodies and attachments (default: 100MB)
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
}

fn default_max_count() -> usize {
    10_000
}

fn default_max_bytes() -> usize {
    100 * 1024 * 1024
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            max_count: default_max_count(),
            max_bytes: default_max_bytes(),
        }
    }
}

impl QueueLimits {
    pub fn new(max_count: usize, max_bytes: usize) -> Self {
        Self {
            max_count,
            max_bytes,
        }
    }
}

/// Queue statistics for status displays
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub count: usize,
    pub bytes: usize,
    pub syncing: usize,
    pub failed: usize,
    pub rejected: usize,
}

/// Running totals checked against `QueueLimits` on every append
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct Totals {
    count: usize,
    bytes: usize,
}

/// Where an entry lives and how much it weighs
#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    sequence: u64,
    bytes: usize,
}

impl IndexEntry {
    fn encode(&self) -> Vec<u8> {
        let mut out = self.sequence.to_be_bytes().to_vec();
        out.extend_from_slice(&(self.bytes as u64).to_be_bytes());
        out
    }

    fn decode(raw: &[u8]) -> Option<Self> {
        let sequence = u64::from_be_bytes(raw.get(..8)?.try_into().ok()?);
        let bytes = u64::from_be_bytes(raw.get(8..16)?.try_into().ok()?);
        Some(Self {
            sequence,
            bytes: usize::try_from(bytes).unwrap_or(usize::MAX),
        })
    }
}

#[derive(Clone)]
pub struct PendingOperationLog {
    store: Arc<dyn KvStore>,
    limits: QueueLimits,
    sequence: Arc<Mutex<u64>>,
    /// Serializes read-modify-write of entries through this handle
    write_lock: Arc<Mutex<()>>,
}

impl PendingOperationLog {
    pub fn open(store: Arc<dyn KvStore>, limits: QueueLimits) -> SyncResult<Self> {
        let sequence = match store.get(SEQ_KEY)? {
            Some(bytes) => {
                let arr: [u8; 8] = bytes.as_slice().try_into().unwrap_or([0u8; 8]);
                u64::from_be_bytes(arr)
            }
            None => 0,
        };

        Ok(Self {
            store,
            limits,
            sequence: Arc::new(Mutex::new(sequence)),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn entry_key(sequence: u64) -> String {
        format!("{}{:020}", LOG_PREFIX, sequence)
    }

    fn blob_key(sequence: u64) -> String {
        format!("{}{:020}", BLOB_PREFIX, sequence)
    }

    fn index_key(id: &OperationId) -> String {
        format!("{}{}", INDEX_PREFIX, id)
    }

    fn totals(&self) -> SyncResult<Totals> {
        match self.store.get(TOTALS_KEY)? {
            Some(raw) => Ok(serde_json::from_slice(&raw)?),
            None => Ok(Totals::default()),
        }
    }

    fn totals_op(totals: Totals) -> SyncResult<BatchOp> {
        Ok(BatchOp::Put(TOTALS_KEY.to_string(), serde_json::to_vec(&totals)?))
    }

    /// Serialized entry without its attachment bytes
    fn encode_entry(op: &PendingOperation) -> SyncResult<Vec<u8>> {
        let mut header = op.clone();
        header.attachments = Vec::new();
        Ok(serde_json::to_vec(&header)?)
    }

    fn index_of(&self, id: &OperationId) -> SyncResult<Option<IndexEntry>> {
        let raw = match self.store.get(&Self::index_key(id))? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        match IndexEntry::decode(&raw) {
            Some(entry) => Ok(Some(entry)),
            None => {
                tracing::error!("Corrupted index entry for pending operation {}", id);
                Ok(None)
            }
        }
    }

    /// Entry at `sequence` without attachment bytes
    fn read_entry(&self, sequence: u64) -> SyncResult<Option<PendingOperation>> {
        match self.store.get(&Self::entry_key(sequence))? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    fn load_attachments(&self, op: &mut PendingOperation) -> SyncResult<()> {
        if let Some(raw) = self.store.get(&Self::blob_key(op.sequence))? {
            op.attachments = serde_json::from_slice::<Vec<Attachment>>(&raw)?;
        }
        Ok(())
    }

    /// Capture a new operation with status `Queued`.
    pub fn append(&self, new: NewOperation) -> SyncResult<PendingOperation> {
        let _guard = self.write_lock.lock();

        let now = now_millis();
        let mut op = PendingOperation {
            id: new.id,
            sequence: 0,
            resource_url: new.resource_url,
            method: new.method,
            collection_key: new.collection_key,
            body: new.body,
            attachments: new.attachments,
            status: OperationStatus::Queued,
            created_at: now,
            updated_at: now,
            next_attempt_at: None,
            last_error: None,
            last_status: None,
        };

        let totals = self.totals()?;
        let bytes = op.payload_bytes();
        if totals.count >= self.limits.max_count {
            return Err(SyncError::QueueFull(format!(
                "{} operations pending (limit {})",
                totals.count, self.limits.max_count
            )));
        }
        if totals.bytes + bytes > self.limits.max_bytes {
            return Err(SyncError::QueueFull(format!(
                "{} bytes pending (limit {})",
                totals.bytes, self.limits.max_bytes
            )));
        }

        let mut seq = self.sequence.lock();
        let next = *seq + 1;
        op.sequence = next;

        let mut batch = vec![
            BatchOp::Put(Self::entry_key(next), Self::encode_entry(&op)?),
            BatchOp::Put(SEQ_KEY.to_string(), next.to_be_bytes().to_vec()),
            BatchOp::Put(
                Self::index_key(&op.id),
                IndexEntry {
                    sequence: next,
                    bytes,
                }
                .encode(),
            ),
            Self::totals_op(Totals {
                count: totals.count + 1,
                bytes: totals.bytes + bytes,
            })?,
        ];
        if !op.attachments.is_empty() {
            batch.push(BatchOp::Put(
                Self::blob_key(next),
                serde_json::to_vec(&op.attachments)?,
            ));
        }
        self.store.write_batch(&batch)?;
        *seq = next;

        tracing::debug!(
            "Queued {} {} as {} (sequence {})",
            op.method,
            op.resource_url,
            op.id,
            op.sequence
        );
        Ok(op)
    }

    /// Every pending operation with its attachments, in creation order
    pub fn list(&self) -> SyncResult<Vec<PendingOperation>> {
        let mut ops = self.headers()?;
        let blobs = self.store.scan_prefix(BLOB_PREFIX)?;
        let mut blobs = blobs.into_iter().peekable();

        for op in ops.iter_mut() {
            let key = Self::blob_key(op.sequence);
            while blobs.peek().map(|(k, _)| k.as_str() < key.as_str()).unwrap_or(false) {
                blobs.next();
            }
            if let Some((_, raw)) = blobs.next_if(|(k, _)| *k == key) {
                match serde_json::from_slice::<Vec<Attachment>>(&raw) {
                    Ok(attachments) => op.attachments = attachments,
                    Err(e) => tracing::error!("Corrupted attachments at {}: {}", key, e),
                }
            }
        }
        Ok(ops)
    }

    /// Every pending operation in creation order, without attachment bytes.
    ///
    /// Enough to decide what to replay; `begin_sync` returns the full entry.
    pub fn headers(&self) -> SyncResult<Vec<PendingOperation>> {
        let mut ops = Vec::new();
        for (key, value) in self.store.scan_prefix(LOG_PREFIX)? {
            if key == SEQ_KEY {
                continue;
            }
            match serde_json::from_slice::<PendingOperation>(&value) {
                Ok(op) => ops.push(op),
                Err(e) => tracing::error!("Corrupted pending operation at {}: {}", key, e),
            }
        }
        ops.sort_by_key(|op| op.sequence);
        Ok(ops)
    }

    /// Operations eligible for submission at `now`, without attachment bytes
    pub fn due(&self, now: i64) -> SyncResult<Vec<PendingOperation>> {
        Ok(self.headers()?.into_iter().filter(|op| op.is_due(now)).collect())
    }

    pub fn get(&self, id: &OperationId) -> SyncResult<Option<PendingOperation>> {
        let index = match self.index_of(id)? {
            Some(index) => index,
            None => return Ok(None),
        };
        match self.read_entry(index.sequence)? {
            Some(mut op) => {
                self.load_attachments(&mut op)?;
                Ok(Some(op))
            }
            None => Ok(None),
        }
    }

    pub fn len(&self) -> SyncResult<usize> {
        Ok(self.totals()?.count)
    }

    pub fn is_empty(&self) -> SyncResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Overwrite the stored state of `op`. Attachments are immutable and
    /// never rewritten.
    pub fn update(&self, op: &PendingOperation) -> SyncResult<()> {
        self.store
            .put(&Self::entry_key(op.sequence), &Self::encode_entry(op)?)
    }

    /// Batch dropping every key of an entry and adjusting the totals
    fn removal(&self, id: &OperationId, index: IndexEntry) -> SyncResult<Vec<BatchOp>> {
        let totals = self.totals()?;
        Ok(vec![
            BatchOp::Delete(Self::entry_key(index.sequence)),
            BatchOp::Delete(Self::blob_key(index.sequence)),
            BatchOp::Delete(Self::index_key(id)),
            Self::totals_op(Totals {
                count: totals.count.saturating_sub(1),
                bytes: totals.bytes.saturating_sub(index.bytes),
            })?,
        ])
    }

    /// Drop an entry after the server confirmed it
    pub fn remove(&self, id: &OperationId) -> SyncResult<bool> {
        let _guard = self.write_lock.lock();
        match self.index_of(id)? {
            Some(index) => {
                self.store.write_batch(&self.removal(id, index)?)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Claim an operation for submission, persisting it as `Syncing`.
    ///
    /// Returns the full entry as it was before the claim (so its retry count
    /// is still readable), or `None` when it is gone, already `Syncing`,
    /// terminal or not due yet.
    pub fn begin_sync(&self, id: &OperationId, now: i64) -> SyncResult<Option<PendingOperation>> {
        let _guard = self.write_lock.lock();
        let index = match self.index_of(id)? {
            Some(index) => index,
            None => return Ok(None),
        };
        let mut previous = match self.read_entry(index.sequence)? {
            Some(op) => op,
            None => return Ok(None),
        };
        if !previous.is_due(now) {
            return Ok(None);
        }
        let mut claimed = previous.clone();
        claimed.status = OperationStatus::Syncing;
        claimed.updated_at = now;
        self.update(&claimed)?;

        self.load_attachments(&mut previous)?;
        Ok(Some(previous))
    }

    /// Remove a non-syncing entry at the user's request
    pub fn discard(&self, id: &OperationId) -> SyncResult<PendingOperation> {
        let _guard = self.write_lock.lock();
        let index = self
            .index_of(id)?
            .ok_or_else(|| SyncError::OperationNotFound(id.to_string()))?;
        let mut op = self
            .read_entry(index.sequence)?
            .ok_or_else(|| SyncError::OperationNotFound(id.to_string()))?;
        if op.status == OperationStatus::Syncing {
            return Err(SyncError::OperationInFlight(id.to_string()));
        }
        self.load_attachments(&mut op)?;
        self.store.write_batch(&self.removal(id, index)?)?;
        tracing::info!("Discarded pending operation {}", id);
        Ok(op)
    }

    /// Replace the body of a non-syncing entry and queue it again
    pub fn resubmit(
        &self,
        id: &OperationId,
        body: Option<serde_json::Value>,
    ) -> SyncResult<PendingOperation> {
        let _guard = self.write_lock.lock();
        let index = self
            .index_of(id)?
            .ok_or_else(|| SyncError::OperationNotFound(id.to_string()))?;
        let mut op = self
            .read_entry(index.sequence)?
            .ok_or_else(|| SyncError::OperationNotFound(id.to_string()))?;
        if op.status == OperationStatus::Syncing {
            return Err(SyncError::OperationInFlight(id.to_string()));
        }
        self.load_attachments(&mut op)?;

        op.body = body;
        op.status = OperationStatus::Queued;
        op.next_attempt_at = None;
        op.last_error = None;
        op.last_status = None;
        op.updated_at = now_millis();

        let bytes = op.payload_bytes();
        let totals = self.totals()?;
        self.store.write_batch(&[
            BatchOp::Put(Self::entry_key(op.sequence), Self::encode_entry(&op)?),
            BatchOp::Put(
                Self::index_key(id),
                IndexEntry {
                    sequence: op.sequence,
                    bytes,
                }
                .encode(),
            ),
            Self::totals_op(Totals {
                count: totals.count,
                bytes: (totals.bytes + bytes).saturating_sub(index.bytes),
            })?,
        ])?;
        tracing::info!("Resubmitted pending operation {}", id);
        Ok(op)
    }

    /// Put entries left `Syncing` by a torn-down process back in the queue.
    pub fn recover_interrupted(&self) -> SyncResult<usize> {
        let _guard = self.write_lock.lock();
        let mut recovered = 0;
        for mut op in self.headers()? {
            if op.status == OperationStatus::Syncing {
                op.status = OperationStatus::Queued;
                op.updated_at = now_millis();
                self.update(&op)?;
                recovered += 1;
            }
        }
        if recovered > 0 {
            tracing::warn!("Recovered {} interrupted pending operations", recovered);
        }
        Ok(recovered)
    }

    /// Whether retryable work is already waiting for `collection_key`
    pub fn has_pending_for(&self, collection_key: &str) -> SyncResult<bool> {
        Ok(self.headers()?.iter().any(|op| {
            op.collection_key == collection_key
                && (op.status.is_retryable() || op.status == OperationStatus::Syncing)
        }))
    }

    pub fn stats(&self) -> SyncResult<QueueStats> {
        let totals = self.totals()?;
        let mut stats = QueueStats {
            bytes: totals.bytes,
            ..Default::default()
        };
        for op in self.headers()? {
            stats.count += 1;
            match op.status {
                OperationStatus::Syncing => stats.syncing += 1,
                OperationStatus::Failed { retryable: true, .. } => stats.failed += 1,
                OperationStatus::Failed { retryable: false, .. } => stats.rejected += 1,
                _ => {}
            }
        }
        Ok(stats)
    }

    pub fn limits(&self) -> &QueueLimits {
        &self.limits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Attachment;
    use crate::storage::MemoryStore;
    use crate::transport::Method;
    use serde_json::json;

    fn new_op(key: &str) -> NewOperation {
        NewOperation {
            id: OperationId::generate(),
            resource_url: format!("http://fleet.local/api/{}", key),
            method: Method::Post,
            collection_key: key.to_string(),
            body: Some(json!({"name": "test"})),
            attachments: vec![],
        }
    }

    fn create_test_log() -> (PendingOperationLog, MemoryStore) {
        let store = MemoryStore::new();
        let log = PendingOperationLog::open(Arc::new(store.clone()), QueueLimits::default())
            .unwrap();
        (log, store)
    }

    #[test]
    fn test_append_and_list_in_order() {
        let (log, _) = create_test_log();
        let a = log.append(new_op("vehicles")).unwrap();
        let b = log.append(new_op("drivers")).unwrap();
        let c = log.append(new_op("vehicles")).unwrap();

        let ids: Vec<_> = log.list().unwrap().into_iter().map(|op| op.id).collect();
        assert_eq!(ids, vec![a.id, b.id, c.id]);
        assert_eq!(c.sequence, 3);
        assert_eq!(c.status, OperationStatus::Queued);
    }

    #[test]
    fn test_sequence_survives_reopen() {
        let (log, store) = create_test_log();
        log.append(new_op("vehicles")).unwrap();
        log.append(new_op("vehicles")).unwrap();

        let reopened =
            PendingOperationLog::open(Arc::new(store), QueueLimits::default()).unwrap();
        let op = reopened.append(new_op("vehicles")).unwrap();
        assert_eq!(op.sequence, 3);
        assert_eq!(reopened.len().unwrap(), 3);
    }

    #[test]
    fn test_begin_sync_claims_once() {
        let (log, _) = create_test_log();
        let op = log.append(new_op("vehicles")).unwrap();

        let claimed = log.begin_sync(&op.id, now_millis()).unwrap().unwrap();
        assert_eq!(claimed.status, OperationStatus::Queued);
        assert_eq!(log.get(&op.id).unwrap().unwrap().status, OperationStatus::Syncing);
        assert!(log.begin_sync(&op.id, now_millis()).unwrap().is_none());
    }

    #[test]
    fn test_discard_refuses_syncing() {
        let (log, _) = create_test_log();
        let op = log.append(new_op("vehicles")).unwrap();
        log.begin_sync(&op.id, now_millis()).unwrap();

        let err = log.discard(&op.id).unwrap_err();
        assert!(matches!(err, SyncError::OperationInFlight(_)));

        log.recover_interrupted().unwrap();
        log.discard(&op.id).unwrap();
        assert!(log.is_empty().unwrap());

        let err = log.discard(&op.id).unwrap_err();
        assert!(matches!(err, SyncError::OperationNotFound(_)));
    }

    #[test]
    fn test_resubmit_resets_terminal_failure() {
        let (log, _) = create_test_log();
        let mut op = log.append(new_op("vehicles")).unwrap();
        op.status = OperationStatus::Failed {
            retry_count: 1,
            retryable: false,
        };
        op.last_status = Some(400);
        log.update(&op).unwrap();
        assert!(log.due(now_millis()).unwrap().is_empty());

        let op = log
            .resubmit(&op.id, Some(json!({"name": "fixed"})))
            .unwrap();
        assert_eq!(op.status, OperationStatus::Queued);
        assert_eq!(op.last_status, None);
        assert_eq!(log.due(now_millis()).unwrap().len(), 1);
    }

    #[test]
    fn test_bounded_queue_count_limit() {
        let store = MemoryStore::new();
        let log = PendingOperationLog::open(Arc::new(store), QueueLimits::new(2, 1024 * 1024))
            .unwrap();
        log.append(new_op("vehicles")).unwrap();
        log.append(new_op("vehicles")).unwrap();

        let err = log.append(new_op("vehicles")).unwrap_err();
        assert!(matches!(err, SyncError::QueueFull(_)));
        assert_eq!(log.len().unwrap(), 2);
    }

    #[test]
    fn test_bounded_queue_bytes_limit() {
        let store = MemoryStore::new();
        let log = PendingOperationLog::open(Arc::new(store), QueueLimits::new(100, 500))
            .unwrap();
        let mut big = new_op("vehicles");
        big.body = Some(json!({"content": "x".repeat(300)}));

        log.append(big.clone()).unwrap();
        big.id = OperationId::generate();
        let err = log.append(big).unwrap_err();
        assert!(matches!(err, SyncError::QueueFull(_)));
    }

    #[test]
    fn test_stats_and_pending_for() {
        let (log, _) = create_test_log();
        let a = log.append(new_op("vehicles")).unwrap();
        let mut b = log.append(new_op("drivers")).unwrap();
        b.status = OperationStatus::Failed {
            retry_count: 1,
            retryable: false,
        };
        log.update(&b).unwrap();
        log.begin_sync(&a.id, now_millis()).unwrap();

        let stats = log.stats().unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.syncing, 1);
        assert_eq!(stats.rejected, 1);

        assert!(log.has_pending_for("vehicles").unwrap());
        assert!(!log.has_pending_for("drivers").unwrap());
    }

    #[test]
    fn test_corrupted_entry_is_skipped() {
        let (log, store) = create_test_log();
        log.append(new_op("vehicles")).unwrap();
        store
            .put("pending_ops:00000000000000000099", b"not json")
            .unwrap();
        assert_eq!(log.list().unwrap().len(), 1);
    }

    #[test]
    fn test_attachments_kept_apart_from_entries() {
        let (log, store) = create_test_log();
        let mut new = new_op("registrations");
        new.attachments = vec![Attachment::new("photo", vec![7u8; 2048])];
        let op = log.append(new).unwrap();

        let raw = store.get(&PendingOperationLog::entry_key(op.sequence)).unwrap().unwrap();
        assert!(raw.len() < 512);
        assert!(log.headers().unwrap()[0].attachments.is_empty());

        assert_eq!(log.list().unwrap()[0].attachments[0].data.len(), 2048);
        assert_eq!(log.get(&op.id).unwrap().unwrap().attachments.len(), 1);
        let claimed = log.begin_sync(&op.id, now_millis()).unwrap().unwrap();
        assert_eq!(claimed.attachments[0].data, vec![7u8; 2048]);
    }

    #[test]
    fn test_totals_follow_removals() {
        let (log, store) = create_test_log();
        let a = log.append(new_op("vehicles")).unwrap();
        let mut with_photo = new_op("registrations");
        with_photo.attachments = vec![Attachment::new("photo", vec![1u8; 100])];
        let b = log.append(with_photo).unwrap();
        let bytes_before = log.stats().unwrap().bytes;
        assert_eq!(bytes_before, a.payload_bytes() + b.payload_bytes());

        assert!(log.remove(&b.id).unwrap());
        assert!(!log.remove(&b.id).unwrap());
        assert_eq!(log.len().unwrap(), 1);
        assert_eq!(log.stats().unwrap().bytes, a.payload_bytes());
        assert!(store.scan_prefix(BLOB_PREFIX).unwrap().is_empty());

        let op = log.resubmit(&a.id, Some(json!({"n": "a much longer body than before"}))).unwrap();
        assert_eq!(log.stats().unwrap().bytes, op.payload_bytes());

        log.discard(&a.id).unwrap();
        assert!(log.is_empty().unwrap());
        assert_eq!(log.stats().unwrap().bytes, 0);
        assert!(store.scan_prefix(INDEX_PREFIX).unwrap().is_empty());
    }
}
