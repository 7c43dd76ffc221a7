//! Background execution context
//!
//! An actor reachable only through `BackgroundHandle`. It drains the pending
//! operation log when the platform fires a sync, whether or not any
//! foreground client is attached, and tells attached clients what happened.
//! Clients that are detached get their messages replayed when they come back.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::protocol::{BridgeMessage, Envelope};
use crate::error::{SyncError, SyncResult};
use crate::queue::PendingOperation;
use crate::sync::drain::{run_pass, DrainObserver};
use crate::sync::{DrainSummary, SyncContext};

type ItemsReply = oneshot::Sender<Option<Vec<PendingOperation>>>;

enum Input {
    Attach {
        client_id: String,
        outbound: mpsc::UnboundedSender<String>,
    },
    Detach {
        client_id: String,
    },
    Inbound {
        client_id: String,
        raw: String,
    },
    Sync {
        done: Option<oneshot::Sender<DrainSummary>>,
    },
    AskForItems {
        reply: ItemsReply,
    },
    Publish(BridgeMessage),
    Finished {
        summary: Option<DrainSummary>,
    },
    Shutdown,
}

/// Cloneable address of the background context
#[derive(Clone)]
pub struct BackgroundHandle {
    inbox: mpsc::UnboundedSender<Input>,
}

impl BackgroundHandle {
    fn send(&self, input: Input) -> SyncResult<()> {
        self.inbox
            .send(input)
            .map_err(|_| SyncError::Protocol("background context has stopped".to_string()))
    }

    /// Register a foreground client; buffered messages are replayed to it first.
    pub fn attach(
        &self,
        client_id: impl Into<String>,
        outbound: mpsc::UnboundedSender<String>,
    ) -> SyncResult<()> {
        self.send(Input::Attach {
            client_id: client_id.into(),
            outbound,
        })
    }

    pub fn detach(&self, client_id: impl Into<String>) -> SyncResult<()> {
        self.send(Input::Detach {
            client_id: client_id.into(),
        })
    }

    /// Hand a raw envelope from a foreground client to the background.
    pub fn post(&self, client_id: impl Into<String>, raw: String) -> SyncResult<()> {
        self.send(Input::Inbound {
            client_id: client_id.into(),
            raw,
        })
    }

    /// Platform sync event. Ignored while a background drain is running.
    pub fn trigger_sync(&self) -> SyncResult<()> {
        self.send(Input::Sync { done: None })
    }

    /// Run a background drain and wait for its summary.
    ///
    /// Joins the drain already in progress if there is one; `None` when the
    /// drain could not read any work or the context stopped.
    pub async fn sync(&self) -> Option<DrainSummary> {
        let (tx, rx) = oneshot::channel();
        self.send(Input::Sync { done: Some(tx) }).ok()?;
        rx.await.ok()
    }

    pub fn shutdown(&self) -> SyncResult<()> {
        self.send(Input::Shutdown)
    }
}

#[derive(Default)]
struct ClientSlot {
    outbound: Option<mpsc::UnboundedSender<String>>,
    backlog: VecDeque<String>,
}

pub struct BackgroundContext {
    ctx: SyncContext,
    inbox: mpsc::UnboundedSender<Input>,
    rx: mpsc::UnboundedReceiver<Input>,
    clients: BTreeMap<String, ClientSlot>,
    awaiting_items: HashMap<String, ItemsReply>,
    waiters: Vec<oneshot::Sender<DrainSummary>>,
    syncing: bool,
    backlog_limit: usize,
    request_timeout: Duration,
}

impl BackgroundContext {
    /// Start the actor on the current runtime.
    pub fn spawn(ctx: SyncContext) -> (BackgroundHandle, JoinHandle<()>) {
        let (inbox, rx) = mpsc::unbounded_channel();
        let actor = Self {
            backlog_limit: ctx.config.bridge_backlog,
            request_timeout: ctx.config.bridge_timeout(),
            ctx,
            inbox: inbox.clone(),
            rx,
            clients: BTreeMap::new(),
            awaiting_items: HashMap::new(),
            waiters: Vec::new(),
            syncing: false,
        };
        let task = tokio::spawn(actor.run());
        (BackgroundHandle { inbox }, task)
    }

    async fn run(mut self) {
        info!("Background sync context started");
        while let Some(input) = self.rx.recv().await {
            match input {
                Input::Attach {
                    client_id,
                    outbound,
                } => self.attach(client_id, outbound),
                Input::Detach { client_id } => {
                    if let Some(slot) = self.clients.get_mut(&client_id) {
                        slot.outbound = None;
                        debug!("Client {} detached", client_id);
                    }
                }
                Input::Inbound { client_id, raw } => self.handle_inbound(&client_id, &raw),
                Input::Sync { done } => self.start_sync(done),
                Input::AskForItems { reply } => self.ask_for_items(reply),
                Input::Publish(message) => self.publish(message),
                Input::Finished { summary } => {
                    self.syncing = false;
                    self.awaiting_items.clear();
                    for waiter in self.waiters.drain(..) {
                        if let Some(summary) = summary {
                            let _ = waiter.send(summary);
                        }
                    }
                }
                Input::Shutdown => break,
            }
        }
        info!("Background sync context stopped");
    }

    fn attach(&mut self, client_id: String, outbound: mpsc::UnboundedSender<String>) {
        let slot = self.clients.entry(client_id.clone()).or_default();
        let replayed = slot.backlog.len();
        while let Some(raw) = slot.backlog.pop_front() {
            if outbound.send(raw).is_err() {
                break;
            }
        }
        slot.outbound = Some(outbound);
        debug!("Client {} attached, replayed {} messages", client_id, replayed);
    }

    fn handle_inbound(&mut self, client_id: &str, raw: &str) {
        let envelope = match Envelope::decode(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Ignoring message from {}: {}", client_id, e);
                return;
            }
        };

        match envelope.message {
            BridgeMessage::PendingItems { items } => {
                let reply = envelope
                    .in_reply_to
                    .as_ref()
                    .and_then(|id| self.awaiting_items.remove(id));
                match reply {
                    Some(reply) => {
                        let _ = reply.send(Some(items));
                    }
                    None => debug!("Late or unsolicited pending items from {}", client_id),
                }
            }
            other => debug!("Ignoring {:?} from {}", other, client_id),
        }
    }

    fn start_sync(&mut self, done: Option<oneshot::Sender<DrainSummary>>) {
        if let Some(done) = done {
            self.waiters.push(done);
        }
        if self.syncing {
            debug!("Background drain already running");
            return;
        }
        self.syncing = true;

        let ctx = self.ctx.clone();
        let inbox = self.inbox.clone();
        let timeout = self.request_timeout;
        tokio::spawn(async move {
            let result = background_drain(&ctx, &inbox, timeout).await;
            let (message, summary) = match result {
                Ok(summary) => (BridgeMessage::SyncCompleted { results: summary }, Some(summary)),
                Err(e) => {
                    error!("Background sync failed: {}", e);
                    (BridgeMessage::SyncError { error: e.to_string() }, None)
                }
            };
            let _ = inbox.send(Input::Publish(message));
            let _ = inbox.send(Input::Finished { summary });
        });
    }

    fn ask_for_items(&mut self, reply: ItemsReply) {
        let envelope = Envelope::new(BridgeMessage::RequestPendingItems);
        let raw = match envelope.encode() {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Could not encode item request: {}", e);
                let _ = reply.send(None);
                return;
            }
        };

        let asked = self
            .clients
            .iter()
            .filter_map(|(id, slot)| slot.outbound.as_ref().map(|tx| (id, tx)))
            .find(|(_, tx)| !tx.is_closed())
            .and_then(|(id, tx)| tx.send(raw).ok().map(|_| id.clone()));

        match asked {
            Some(client_id) => {
                debug!("Asked {} for pending items", client_id);
                self.awaiting_items.insert(envelope.correlation_id, reply);
            }
            None => {
                let _ = reply.send(None);
            }
        }
    }

    /// Deliver to every known client, buffering for the detached ones.
    fn publish(&mut self, message: BridgeMessage) {
        let replayable = message.is_replayable();
        let raw = match Envelope::new(message).encode() {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Could not encode bridge message: {}", e);
                return;
            }
        };

        for (client_id, slot) in self.clients.iter_mut() {
            let delivered = match &slot.outbound {
                Some(tx) => tx.send(raw.clone()).is_ok(),
                None => false,
            };
            if delivered {
                continue;
            }
            slot.outbound = None;
            if !replayable {
                continue;
            }
            if slot.backlog.len() >= self.backlog_limit {
                warn!("Backlog for {} full, dropping oldest message", client_id);
                slot.backlog.pop_front();
            }
            slot.backlog.push_back(raw.clone());
        }
    }
}

/// Forwards per-item outcomes to the actor as bridge messages
struct BridgeObserver<'a> {
    inbox: &'a mpsc::UnboundedSender<Input>,
}

impl DrainObserver for BridgeObserver<'_> {
    fn synced(&mut self, op: &PendingOperation) {
        let _ = self.inbox.send(Input::Publish(BridgeMessage::ItemSynced {
            id: op.id.clone(),
            collection_key: Some(op.collection_key.clone()),
        }));
    }

    fn rejected(&mut self, op: &PendingOperation, status: u16, message: &str) {
        let _ = self.inbox.send(Input::Publish(BridgeMessage::ItemRejected {
            id: op.id.clone(),
            status,
            message: message.to_string(),
        }));
    }
}

async fn background_drain(
    ctx: &SyncContext,
    inbox: &mpsc::UnboundedSender<Input>,
    timeout: Duration,
) -> SyncResult<DrainSummary> {
    // A foreground drain in progress finishes first
    let _slot = ctx.drain_slot.lock().await;
    let _ = inbox.send(Input::Publish(BridgeMessage::SyncStarted));

    let (tx, rx) = oneshot::channel();
    let _ = inbox.send(Input::AskForItems { reply: tx });
    let items = match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(Some(items))) => {
            debug!("Foreground reported {} pending items", items.len());
            items
        }
        Ok(_) => {
            debug!("No foreground attached, reading the log directly");
            ctx.log.headers()?
        }
        Err(_) => {
            debug!("Foreground did not answer in {:?}, reading the log directly", timeout);
            ctx.log.headers()?
        }
    };

    let mut observer = BridgeObserver { inbox };
    Ok(run_pass(ctx, items, &mut observer).await)
}
