//! Common test utilities for sync engine tests
//!
//! Provides:
//! - `ScriptedTransport`: a fake server answering from a script
//! - `FailingStore`: a store whose writes can be switched off
//! - engine builders over in-memory or on-disk stores

#![allow(dead_code)]

use async_trait::async_trait;
use fleetsync::storage::{BatchOp, KvStore};
use fleetsync::{
    EngineConfig, EngineEvent, MemoryStore, OutboundRequest, ServerResponse, SyncEngine,
    SyncError, SyncResult, Transport, TransportError,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub const BASE_URL: &str = "http://fleet.local/api";

#[derive(Debug, Clone)]
pub enum Reply {
    Status(u16, Value),
    Unreachable,
    Timeout,
    /// The request could not be built, as with a bad attachment content type
    Invalid,
}

impl Reply {
    pub fn ok(body: Value) -> Self {
        Reply::Status(200, body)
    }

    pub fn created(body: Value) -> Self {
        Reply::Status(201, body)
    }
}

/// Answers requests from a FIFO script, then with the default reply
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Reply>>,
    default: Mutex<Reply>,
    requests: Mutex<Vec<OutboundRequest>>,
    delay: Mutex<Option<Duration>>,
    reachable: AtomicBool,
}

impl ScriptedTransport {
    /// Every request fails as unreachable until scripted otherwise
    pub fn offline() -> Arc<Self> {
        Arc::new(Self::with_default(Reply::Unreachable))
    }

    /// Every request succeeds with `body`
    pub fn answering(body: Value) -> Arc<Self> {
        Arc::new(Self::with_default(Reply::ok(body)))
    }

    fn with_default(default: Reply) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default: Mutex::new(default),
            requests: Mutex::new(Vec::new()),
            delay: Mutex::new(None),
            reachable: AtomicBool::new(true),
        }
    }

    pub fn push(&self, reply: Reply) {
        self.script.lock().push_back(reply);
    }

    pub fn set_default(&self, reply: Reply) {
        *self.default.lock() = reply;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<OutboundRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn mutation_urls(&self) -> Vec<String> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.method.is_mutation())
            .map(|r| r.url.clone())
            .collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: OutboundRequest) -> Result<ServerResponse, TransportError> {
        self.requests.lock().push(request);

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let reply = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default.lock().clone());

        match reply {
            Reply::Status(status, body) => Ok(ServerResponse::new(status, body)),
            Reply::Unreachable => Err(TransportError::Unreachable("connection refused".into())),
            Reply::Timeout => Err(TransportError::Timeout("5s".into())),
            Reply::Invalid => Err(TransportError::InvalidRequest("Invalid mime: not a mime".into())),
        }
    }

    async fn probe(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}

/// Memory store whose writes fail while `fail_writes` is set
#[derive(Clone, Default)]
pub struct FailingStore {
    inner: MemoryStore,
    fail_writes: Arc<AtomicBool>,
    fail_reads: Arc<AtomicBool>,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    fn check(&self, flag: &AtomicBool) -> SyncResult<()> {
        if flag.load(Ordering::SeqCst) {
            Err(SyncError::Storage("disk unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

impl KvStore for FailingStore {
    fn get(&self, key: &str) -> SyncResult<Option<Vec<u8>>> {
        self.check(&self.fail_reads)?;
        self.inner.get(key)
    }

    fn put(&self, key: &str, value: &[u8]) -> SyncResult<()> {
        self.check(&self.fail_writes)?;
        self.inner.put(key, value)
    }

    fn delete(&self, key: &str) -> SyncResult<()> {
        self.check(&self.fail_writes)?;
        self.inner.delete(key)
    }

    fn scan_prefix(&self, prefix: &str) -> SyncResult<Vec<(String, Vec<u8>)>> {
        self.check(&self.fail_reads)?;
        self.inner.scan_prefix(prefix)
    }

    fn write_batch(&self, ops: &[BatchOp]) -> SyncResult<()> {
        self.check(&self.fail_writes)?;
        self.inner.write_batch(ops)
    }
}

pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::new(BASE_URL);
    config.bridge_timeout_ms = 200;
    config
}

pub fn create_engine(
    transport: Arc<ScriptedTransport>,
    store: Arc<dyn KvStore>,
    online: bool,
) -> SyncEngine {
    create_engine_with(test_config(), transport, store, online)
}

pub fn create_engine_with(
    config: EngineConfig,
    transport: Arc<ScriptedTransport>,
    store: Arc<dyn KvStore>,
    online: bool,
) -> SyncEngine {
    SyncEngine::builder(config)
        .store(store)
        .transport(transport)
        .online(online)
        .build()
        .expect("Failed to build engine")
}

pub fn memory_engine(transport: Arc<ScriptedTransport>, online: bool) -> (SyncEngine, MemoryStore) {
    let store = MemoryStore::new();
    let engine = create_engine(transport, Arc::new(store.clone()), online);
    (engine, store)
}

/// Wait for the first event matching `pred`, failing after a second
pub async fn wait_for_event<F>(rx: &mut broadcast::Receiver<EngineEvent>, pred: F) -> EngineEvent
where
    F: Fn(&EngineEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event bus closed: {}", e),
            }
        }
    })
    .await
    .expect("Timed out waiting for event")
}

/// Drain every event currently buffered
pub fn collect_events(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
