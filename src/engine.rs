//! The sync engine
//!
//! One explicitly constructed object owning the store, the log, the cache,
//! the connectivity state and the event bus. Create one per process (or per
//! test) and pass it around.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::bridge::{BackgroundContext, BackgroundHandle, ForegroundBridge};
use crate::config::EngineConfig;
use crate::error::{SyncError, SyncResult};
use crate::queue::{OperationId, PendingOperation, QueueStats};
use crate::storage::{KvStore, RocksStore};
use crate::sync::{
    ConnectivityState, DrainOutcome, EngineEvent, PerformOutcome, PerformRequest,
    RequestInterceptor, SyncContext, SyncOrchestrator,
};
use crate::transport::{HttpTransport, Transport};

pub struct SyncEngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn KvStore>>,
    transport: Option<Arc<dyn Transport>>,
}

impl SyncEngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            store: None,
            transport: None,
        }
    }

    /// Use this store instead of RocksDB under `data_dir`
    pub fn store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use this transport instead of HTTP to `base_url`
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn online(mut self, online: bool) -> Self {
        self.config.start_online = online;
        self
    }

    pub fn build(self) -> SyncResult<SyncEngine> {
        let store = match self.store {
            Some(store) => store,
            None => Arc::new(RocksStore::open(&self.config.data_dir)?),
        };

        let transport = match self.transport {
            Some(transport) => transport,
            None => {
                let mut http = HttpTransport::new(&self.config.base_url)
                    .map_err(|e| SyncError::Config(e.to_string()))?
                    .with_health_path(&self.config.health_path);
                if let Some(token) = &self.config.auth_token {
                    http = http.with_token(token);
                }
                Arc::new(http)
            }
        };

        let ctx = SyncContext::new(store, transport, self.config)?;
        ctx.log.recover_interrupted()?;

        Ok(SyncEngine {
            interceptor: RequestInterceptor::new(ctx.clone()),
            orchestrator: SyncOrchestrator::new(ctx.clone()),
            ctx,
        })
    }
}

#[derive(Clone)]
pub struct SyncEngine {
    ctx: SyncContext,
    interceptor: RequestInterceptor,
    orchestrator: SyncOrchestrator,
}

impl SyncEngine {
    pub fn builder(config: EngineConfig) -> SyncEngineBuilder {
        SyncEngineBuilder::new(config)
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    pub fn orchestrator(&self) -> &SyncOrchestrator {
        &self.orchestrator
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.ctx.events.subscribe()
    }

    pub fn state(&self) -> ConnectivityState {
        self.ctx.connectivity.current()
    }

    pub async fn perform(&self, request: PerformRequest) -> SyncResult<PerformOutcome> {
        self.interceptor.perform(request).await
    }

    pub async fn drain(&self) -> DrainOutcome {
        self.orchestrator.drain().await
    }

    pub async fn set_online(&self, online: bool) -> Option<DrainOutcome> {
        self.orchestrator.connectivity_changed(online).await
    }

    pub fn pending(&self) -> SyncResult<Vec<PendingOperation>> {
        self.orchestrator.pending()
    }

    pub fn stats(&self) -> SyncResult<QueueStats> {
        self.orchestrator.stats()
    }

    pub fn discard(&self, id: &OperationId) -> SyncResult<PendingOperation> {
        self.orchestrator.discard(id)
    }

    pub fn resubmit(&self, id: &OperationId, body: Option<Value>) -> SyncResult<PendingOperation> {
        self.orchestrator.resubmit(id, body)
    }

    /// Last known server snapshot of a collection
    pub fn cached(&self, collection_key: &str) -> SyncResult<Option<Value>> {
        self.ctx.cache.get(collection_key)
    }

    /// Start a background context sharing this engine's store and transport.
    pub fn spawn_background(&self) -> (BackgroundHandle, JoinHandle<()>) {
        BackgroundContext::spawn(self.ctx.clone())
    }

    /// A foreground client of `background`, reporting through this engine.
    pub fn foreground(&self, background: BackgroundHandle, client_id: impl Into<String>) -> ForegroundBridge {
        ForegroundBridge::new(self.ctx.clone(), background, client_id)
    }
}
