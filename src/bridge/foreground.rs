//! Foreground side of the background bridge
//!
//! Answers the background's questions from the local log and turns its
//! notifications into engine events and a local view of item state.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::background::BackgroundHandle;
use super::protocol::{BridgeMessage, Envelope};
use crate::error::SyncResult;
use crate::queue::{OperationId, OperationStatus};
use crate::sync::{EngineEvent, SyncContext, SyncOrchestrator};

/// What this client knows about an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalStatus {
    Pending,
    Synced,
    Rejected,
}

#[derive(Clone)]
struct Listener {
    client_id: String,
    ctx: SyncContext,
    background: BackgroundHandle,
    view: Arc<RwLock<HashMap<OperationId, LocalStatus>>>,
}

pub struct ForegroundBridge {
    listener: Listener,
    task: Option<JoinHandle<()>>,
}

impl ForegroundBridge {
    pub fn new(ctx: SyncContext, background: BackgroundHandle, client_id: impl Into<String>) -> Self {
        Self {
            listener: Listener {
                client_id: client_id.into(),
                ctx,
                background,
                view: Arc::new(RwLock::new(HashMap::new())),
            },
            task: None,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.listener.client_id
    }

    pub fn is_attached(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    /// Start receiving from the background; messages missed while detached arrive first.
    pub fn attach(&mut self) -> SyncResult<()> {
        if self.is_attached() {
            return Ok(());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.listener.background.attach(self.listener.client_id.clone(), tx)?;
        let listener = self.listener.clone();
        self.task = Some(tokio::spawn(listener.listen(rx)));
        Ok(())
    }

    /// Stop receiving; the background buffers for us until `attach`.
    pub fn detach(&mut self) -> SyncResult<()> {
        self.listener.background.detach(self.listener.client_id.clone())?;
        // The listener exits once the background drops our sender
        self.task = None;
        Ok(())
    }

    /// Status as this client sees it.
    ///
    /// Bridge notifications win; otherwise the local log decides.
    pub fn status_of(&self, id: &OperationId) -> Option<LocalStatus> {
        if let Some(status) = self.listener.view.read().get(id) {
            return Some(*status);
        }
        match self.listener.ctx.log.get(id) {
            Ok(Some(op)) if op.status.is_terminal() => Some(LocalStatus::Rejected),
            Ok(Some(_)) => Some(LocalStatus::Pending),
            Ok(None) => None,
            Err(e) => {
                warn!("Could not read pending operation {}: {}", id, e);
                None
            }
        }
    }
}

impl Listener {
    async fn listen(self, mut rx: mpsc::UnboundedReceiver<String>) {
        debug!("Foreground {} listening", self.client_id);
        while let Some(raw) = rx.recv().await {
            self.handle(&raw);
        }
        debug!("Foreground {} stopped listening", self.client_id);
    }

    fn handle(&self, raw: &str) {
        let envelope = match Envelope::decode(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Ignoring message from background: {}", e);
                return;
            }
        };

        let ctx = &self.ctx;
        match &envelope.message {
            BridgeMessage::RequestPendingItems => self.answer_pending(&envelope),
            BridgeMessage::SyncStarted => ctx.connectivity.enter_sync(),
            BridgeMessage::ItemSynced { id, collection_key } => {
                self.view.write().insert(id.clone(), LocalStatus::Synced);
                ctx.events.emit(EngineEvent::Synced {
                    id: id.clone(),
                    collection_key: collection_key.clone(),
                });
            }
            BridgeMessage::ItemRejected {
                id,
                status,
                message,
            } => {
                self.view.write().insert(id.clone(), LocalStatus::Rejected);
                ctx.events.emit(EngineEvent::Rejected {
                    id: id.clone(),
                    status: *status,
                    message: message.clone(),
                });
            }
            BridgeMessage::SyncCompleted { results } => {
                self.finish_background_sync();
                ctx.events.emit(EngineEvent::DrainCompleted(*results));
            }
            BridgeMessage::SyncError { error } => {
                self.finish_background_sync();
                ctx.events.emit(EngineEvent::BackgroundSyncFailed {
                    message: error.clone(),
                });
            }
            BridgeMessage::PendingItems { .. } => {
                debug!("Unexpected pending items message in foreground")
            }
        }
    }

    /// Leave the background's sync state, catching up with a foreground
    /// drain if connectivity came back while it ran.
    fn finish_background_sync(&self) {
        if self.ctx.connectivity.end_sync() {
            debug!("Reconnected during background sync, draining again");
            let orchestrator = SyncOrchestrator::new(self.ctx.clone());
            tokio::spawn(async move {
                orchestrator.drain().await;
            });
        }
    }

    fn answer_pending(&self, request: &Envelope) {
        let items = match self.ctx.log.headers() {
            Ok(ops) => ops
                .into_iter()
                .filter(|op| op.status.is_retryable() || op.status == OperationStatus::Syncing)
                .collect(),
            Err(e) => {
                // No answer: the background falls back to the log after its timeout
                error!("Cannot list pending operations for background: {}", e);
                return;
            }
        };

        let reply = request.reply(BridgeMessage::PendingItems { items });
        match reply.encode() {
            Ok(raw) => {
                if let Err(e) = self.background.post(self.client_id.clone(), raw) {
                    warn!("Could not answer background: {}", e);
                }
            }
            Err(e) => warn!("Could not encode pending items: {}", e),
        }
    }
}
