//! Sync orchestrator
//!
//! Owns the foreground drain:
//! - single-flight: a drain already running makes `drain()` a no-op
//! - drains when connectivity comes back and on a periodic timer
//! - user-facing queue management (discard, resubmit)

use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::drain::{run_pass, EventObserver};
use super::{ConnectivityState, DrainSummary, EngineEvent, SyncContext};
use crate::error::SyncResult;
use crate::queue::{OperationId, PendingOperation, QueueStats};

/// Commands accepted by the orchestrator loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncCommand {
    DrainNow,
    Connectivity(bool),
    Shutdown,
}

pub fn command_channel() -> (mpsc::Sender<SyncCommand>, mpsc::Receiver<SyncCommand>) {
    mpsc::channel(100)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    Completed(DrainSummary),
    /// Another drain (foreground or background) holds the slot
    AlreadyRunning,
    /// Offline; nothing was attempted
    Skipped,
}

#[derive(Clone)]
pub struct SyncOrchestrator {
    ctx: SyncContext,
}

impl SyncOrchestrator {
    pub fn new(ctx: SyncContext) -> Self {
        Self { ctx }
    }

    pub fn state(&self) -> ConnectivityState {
        self.ctx.connectivity.current()
    }

    /// Replay every due pending operation once.
    ///
    /// Runs another pass right away when connectivity came back while the
    /// first one was in flight; the outcome is that of the last pass.
    pub async fn drain(&self) -> DrainOutcome {
        let _slot = match self.ctx.drain_slot.try_lock() {
            Ok(slot) => slot,
            Err(_) => {
                debug!("Drain already in progress");
                return DrainOutcome::AlreadyRunning;
            }
        };

        loop {
            if !self.ctx.connectivity.begin_sync() {
                return match self.ctx.connectivity.current() {
                    ConnectivityState::SyncInFlight => {
                        debug!("Background sync in progress, skipping foreground drain");
                        DrainOutcome::AlreadyRunning
                    }
                    _ => {
                        debug!("Offline, skipping drain");
                        DrainOutcome::Skipped
                    }
                };
            }

            let summary = self.pass().await;
            let again = self.ctx.connectivity.end_sync();
            self.ctx.events.emit(EngineEvent::DrainCompleted(summary));
            if !again {
                return DrainOutcome::Completed(summary);
            }
            info!("Reconnected during drain, draining again");
        }
    }

    async fn pass(&self) -> DrainSummary {
        let candidates = match self.ctx.log.headers() {
            Ok(ops) => ops,
            Err(e) => {
                error!("Failed to read pending operations: {}", e);
                return DrainSummary::default();
            }
        };
        if candidates.is_empty() {
            return DrainSummary::default();
        }

        info!("Draining {} pending operations", candidates.len());
        let mut observer = EventObserver(&self.ctx.events);
        run_pass(&self.ctx, candidates, &mut observer).await
    }

    /// Apply a platform connectivity signal; drains when it brings us back online.
    pub async fn connectivity_changed(&self, online: bool) -> Option<DrainOutcome> {
        if self.ctx.connectivity.set_platform(online) {
            info!("Back online, draining pending operations");
            Some(self.drain().await)
        } else {
            None
        }
    }

    pub fn pending(&self) -> SyncResult<Vec<PendingOperation>> {
        self.ctx.log.list()
    }

    pub fn stats(&self) -> SyncResult<QueueStats> {
        self.ctx.log.stats()
    }

    /// Drop a pending operation the user gave up on. Fails while it is syncing.
    pub fn discard(&self, id: &OperationId) -> SyncResult<PendingOperation> {
        let op = self.ctx.log.discard(id)?;
        self.ctx
            .events
            .emit(EngineEvent::Discarded { id: op.id.clone() });
        Ok(op)
    }

    /// Replace the body of a pending operation and queue it again.
    pub fn resubmit(&self, id: &OperationId, body: Option<Value>) -> SyncResult<PendingOperation> {
        self.ctx.log.resubmit(id, body)
    }

    /// Run the orchestrator loop until `Shutdown` or the channel closes.
    ///
    /// Drains on start, every `sync_interval`, on `DrainNow` and when
    /// connectivity returns.
    pub async fn run(self, mut commands: mpsc::Receiver<SyncCommand>) {
        let mut sync_interval = tokio::time::interval(self.ctx.config.sync_interval());
        sync_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Sync orchestrator started (interval {:?})",
            self.ctx.config.sync_interval()
        );

        loop {
            tokio::select! {
                _ = sync_interval.tick() => {
                    if !self.ctx.connectivity.is_offline() {
                        self.drain().await;
                    }
                }

                command = commands.recv() => {
                    match command {
                        Some(SyncCommand::DrainNow) => {
                            self.drain().await;
                        }
                        Some(SyncCommand::Connectivity(online)) => {
                            self.connectivity_changed(online).await;
                        }
                        Some(SyncCommand::Shutdown) | None => {
                            info!("Sync orchestrator shutting down");
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Poll the server's health endpoint and feed the result to `commands`.
    pub fn spawn_probe(
        &self,
        commands: mpsc::Sender<SyncCommand>,
        every: Duration,
    ) -> JoinHandle<()> {
        let transport = self.ctx.transport.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let online = transport.probe().await;
                if commands.send(SyncCommand::Connectivity(online)).await.is_err() {
                    warn!("Orchestrator gone, stopping connectivity probe");
                    break;
                }
            }
        })
    }
}
