//! Synchronization core
//!
//! - `interceptor`: single entry point for reads and writes
//! - `drain`: one replay pass over the pending operation log
//! - `orchestrator`: connectivity handling, single-flight drains, periodic trigger
//! - `reconcile`: cache updates after the server accepts a mutation
//! - `state`/`events`: connectivity state machine and UI notifications

pub mod drain;
pub mod events;
pub mod interceptor;
pub mod orchestrator;
pub mod reconcile;
pub mod resource;
pub mod state;

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use url::Url;

pub use drain::DrainObserver;
pub use events::{DrainSummary, EngineEvent, EventBus};
pub use interceptor::{PerformOutcome, PerformRequest, QueuedAck, ReadSource, RequestInterceptor};
pub use orchestrator::{DrainOutcome, SyncCommand, SyncOrchestrator};
pub use state::{Connectivity, ConnectivityState};

use crate::config::EngineConfig;
use crate::error::SyncResult;
use crate::queue::PendingOperationLog;
use crate::storage::{CacheStore, KvStore};
use crate::transport::{Method, Transport};

/// Everything the interceptor, drains and the background context share.
#[derive(Clone)]
pub struct SyncContext {
    pub log: PendingOperationLog,
    pub cache: CacheStore,
    pub transport: Arc<dyn Transport>,
    pub events: EventBus,
    pub connectivity: Arc<Connectivity>,
    pub config: Arc<EngineConfig>,
    pub base_url: Url,
    /// Held by whichever drain (foreground or background) is running
    pub drain_slot: Arc<Mutex<()>>,
}

impl SyncContext {
    pub fn new(
        store: Arc<dyn KvStore>,
        transport: Arc<dyn Transport>,
        config: EngineConfig,
    ) -> SyncResult<Self> {
        config.validate()?;
        let base_url = resource::parse_base(&config.base_url)?;
        let log = PendingOperationLog::open(store.clone(), config.queue.clone())?;
        let cache = CacheStore::new(store);
        let events = EventBus::new(config.event_capacity);
        let connectivity = Arc::new(Connectivity::new(config.start_online, events.clone()));

        Ok(Self {
            log,
            cache,
            transport,
            events,
            connectivity,
            config: Arc::new(config),
            base_url,
            drain_slot: Arc::new(Mutex::new(())),
        })
    }

    /// Fold an accepted mutation into the cached collection.
    ///
    /// Cache write failures are logged only; the server already has the data.
    pub(crate) fn reconcile_cache(
        &self,
        url: &str,
        collection_key: &str,
        method: Method,
        request_body: Option<&Value>,
        response_body: &Value,
    ) {
        let record_id = resource::resolve(&self.base_url, url, false)
            .ok()
            .and_then(|r| r.record_id);

        let cached = match self.cache.get(collection_key) {
            Ok(cached) => cached,
            Err(e) => {
                tracing::warn!("Failed to read cache for '{}': {}", collection_key, e);
                None
            }
        };

        let next = reconcile::apply_mutation(
            cached.as_ref(),
            method,
            record_id.as_deref(),
            request_body,
            response_body,
            &self.config.id_field,
        );

        if let Err(e) = self.cache.put(collection_key, &next) {
            tracing::warn!("Failed to update cache for '{}': {}", collection_key, e);
        }
    }
}
