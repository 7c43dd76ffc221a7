//! One replay pass over the pending operation log
//!
//! Shared by the foreground orchestrator and the background context; the
//! caller decides what "notify" means through a `DrainObserver`.

use std::collections::HashSet;

use super::{DrainSummary, EngineEvent, EventBus, SyncContext};
use crate::error::rejection_message;
use crate::queue::{now_millis, OperationStatus, PendingOperation};
use crate::transport::{OutboundRequest, ServerResponse};

/// Per-item outcome callbacks for a drain pass
pub trait DrainObserver: Send {
    fn synced(&mut self, op: &PendingOperation);

    fn rejected(&mut self, op: &PendingOperation, status: u16, message: &str);
}

/// Publishes outcomes straight to the engine event bus
pub struct EventObserver<'a>(pub &'a EventBus);

impl DrainObserver for EventObserver<'_> {
    fn synced(&mut self, op: &PendingOperation) {
        self.0.emit(EngineEvent::Synced {
            id: op.id.clone(),
            collection_key: Some(op.collection_key.clone()),
        });
    }

    fn rejected(&mut self, op: &PendingOperation, status: u16, message: &str) {
        self.0.emit(EngineEvent::Rejected {
            id: op.id.clone(),
            status,
            message: message.to_string(),
        });
    }
}

/// Status reported for operations refused before reaching the server
pub const LOCAL_REJECTION: u16 = 0;

enum Attempt {
    Accepted(ServerResponse),
    Retry { error: String, status: Option<u16> },
    Refused { status: u16, message: String },
    /// The request could not be built; retrying cannot help
    Unsendable { message: String },
}

/// Replay `candidates` in sequence order, one request at a time.
///
/// Each item is re-checked and claimed in the log before submission, so a
/// stale candidate list never causes a double send. Once an item for a
/// collection fails or is held back, later items for that collection wait
/// for the next pass.
pub async fn run_pass(
    ctx: &SyncContext,
    mut candidates: Vec<PendingOperation>,
    observer: &mut dyn DrainObserver,
) -> DrainSummary {
    candidates.sort_by_key(|op| op.sequence);

    let mut summary = DrainSummary::default();
    let mut blocked: HashSet<String> = HashSet::new();
    let now = now_millis();

    for candidate in candidates {
        if candidate.status.is_terminal() || candidate.status == OperationStatus::Synced {
            continue;
        }
        if candidate.status == OperationStatus::Syncing {
            blocked.insert(candidate.collection_key.clone());
            continue;
        }
        if !candidate.is_due(now) || blocked.contains(&candidate.collection_key) {
            summary.deferred += 1;
            blocked.insert(candidate.collection_key.clone());
            continue;
        }

        let op = match ctx.log.begin_sync(&candidate.id, now) {
            Ok(Some(op)) => op,
            Ok(None) => {
                // Claimed elsewhere, finished or not due any more: later work
                // for the collection must not overtake it
                tracing::debug!("Pending operation {} no longer eligible", candidate.id);
                summary.deferred += 1;
                blocked.insert(candidate.collection_key.clone());
                continue;
            }
            Err(e) => {
                tracing::error!("Failed to claim pending operation {}: {}", candidate.id, e);
                summary.failed += 1;
                blocked.insert(candidate.collection_key.clone());
                continue;
            }
        };

        match submit(ctx, &op).await {
            Attempt::Accepted(response) => {
                if let Err(e) = ctx.log.remove(&op.id) {
                    tracing::error!(
                        "Operation {} was accepted but could not be removed: {}",
                        op.id,
                        e
                    );
                    summary.failed += 1;
                    blocked.insert(op.collection_key.clone());
                    continue;
                }
                ctx.reconcile_cache(
                    &op.resource_url,
                    &op.collection_key,
                    op.method,
                    op.body.as_ref(),
                    &response.body,
                );
                tracing::info!("Synced {} {} ({})", op.method, op.resource_url, op.id);
                summary.succeeded += 1;
                observer.synced(&op);
            }
            Attempt::Retry { error, status } => {
                tracing::warn!("Sync of {} failed, will retry: {}", op.id, error);
                summary.failed += 1;
                blocked.insert(op.collection_key.clone());
                record_failure(ctx, op, error, status, true);
            }
            Attempt::Refused { status, message } => {
                tracing::warn!("Server rejected {} (HTTP {}): {}", op.id, status, message);
                summary.rejected += 1;
                observer.rejected(&op, status, &message);
                record_failure(ctx, op, message, Some(status), false);
            }
            Attempt::Unsendable { message } => {
                tracing::error!("Operation {} cannot be sent: {}", op.id, message);
                summary.rejected += 1;
                observer.rejected(&op, LOCAL_REJECTION, &message);
                record_failure(ctx, op, message, None, false);
            }
        }
    }

    tracing::debug!(
        "Drain pass finished: {} succeeded, {} failed, {} rejected, {} deferred",
        summary.succeeded,
        summary.failed,
        summary.rejected,
        summary.deferred
    );
    summary
}

async fn submit(ctx: &SyncContext, op: &PendingOperation) -> Attempt {
    let request = OutboundRequest::new(op.method, op.resource_url.clone(), ctx.config.write_timeout())
        .with_body(op.body.clone())
        .with_attachments(op.attachments.clone())
        .with_operation_id(op.id.clone());

    match ctx.transport.send(request).await {
        Ok(response) if response.is_success() => Attempt::Accepted(response),
        Ok(response) if response.is_server_error() => Attempt::Retry {
            error: rejection_message(&response.body)
                .unwrap_or_else(|| format!("server error {}", response.status)),
            status: Some(response.status),
        },
        Ok(response) => Attempt::Refused {
            status: response.status,
            message: rejection_message(&response.body)
                .unwrap_or_else(|| format!("request refused with status {}", response.status)),
        },
        Err(e) if !e.is_retryable() => Attempt::Unsendable {
            message: e.to_string(),
        },
        Err(e) => Attempt::Retry {
            error: e.to_string(),
            status: None,
        },
    }
}

/// Persist a failed attempt. `op` is the entry as it was before the claim.
fn record_failure(
    ctx: &SyncContext,
    mut op: PendingOperation,
    error: String,
    status: Option<u16>,
    retryable: bool,
) {
    let now = now_millis();
    let retry_count = op.status.retry_count() + 1;
    let policy = &ctx.config.retry;
    let retryable = if retryable && !policy.allows_retry(retry_count) {
        tracing::warn!(
            "Operation {} reached the retry limit after {} attempts",
            op.id,
            retry_count
        );
        false
    } else {
        retryable
    };

    op.status = OperationStatus::Failed {
        retry_count,
        retryable,
    };
    op.next_attempt_at = retryable.then(|| policy.next_attempt_at(now, retry_count));
    op.last_error = Some(error);
    op.last_status = status;
    op.updated_at = now;

    if let Err(e) = ctx.log.update(&op) {
        tracing::error!("Failed to record failure of {}: {}", op.id, e);
    }
}
