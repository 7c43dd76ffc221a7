//! Request interception
//!
//! Every read and write from the UI goes through `perform`:
//! - reads try the network and fall back to the cache, never failing for
//!   connectivity reasons
//! - writes are attempted once when online and captured in the pending
//!   operation log when the server cannot be reached
//! - server refusals are returned to the caller, never queued

use serde::Serialize;
use serde_json::{json, Value};

use super::resource::{self, ResourceRef};
use super::{EngineEvent, SyncContext};
use crate::error::{SyncError, SyncResult};
use crate::queue::{Attachment, NewOperation, OperationId};
use crate::transport::{Method, OutboundRequest, ServerResponse};

/// A read or write as issued by the UI
#[derive(Debug, Clone)]
pub struct PerformRequest {
    pub url: String,
    pub method: Method,
    pub body: Option<Value>,
    pub attachments: Vec<Attachment>,
    /// Overrides the collection derived from the URL
    pub collection_key: Option<String>,
}

impl PerformRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method,
            body: None,
            attachments: Vec::new(),
            collection_key: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::new(Method::Put, url)
    }

    pub fn patch(url: impl Into<String>) -> Self {
        Self::new(Method::Patch, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::Delete, url)
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn collection(mut self, key: impl Into<String>) -> Self {
        self.collection_key = Some(key.into());
        self
    }
}

/// Where a read's payload came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadSource {
    Network,
    Cache,
    /// Nothing cached yet; the payload is an empty array
    Empty,
}

/// Acknowledgement that a mutation was captured for later replay
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueuedAck {
    pub id: OperationId,
    pub collection_key: String,
    pub queued_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PerformOutcome {
    Fetched { payload: Value, source: ReadSource },
    Applied(ServerResponse),
    Queued(QueuedAck),
}

impl PerformOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(self, PerformOutcome::Queued(_))
    }
}

#[derive(Clone)]
pub struct RequestInterceptor {
    ctx: SyncContext,
}

impl RequestInterceptor {
    pub fn new(ctx: SyncContext) -> Self {
        Self { ctx }
    }

    pub async fn perform(&self, request: PerformRequest) -> SyncResult<PerformOutcome> {
        if request.method.is_mutation() {
            self.mutate(request).await
        } else {
            self.read(request).await
        }
    }

    async fn read(&self, request: PerformRequest) -> SyncResult<PerformOutcome> {
        let target = resource::resolve(&self.ctx.base_url, &request.url, true)?;
        let key = request
            .collection_key
            .unwrap_or_else(|| target.collection_key.clone());

        // Tried even while offline: the platform signal can lag behind the
        // network, and the short read timeout bounds the cost
        let outbound = OutboundRequest::new(
            Method::Get,
            target.url.as_str(),
            self.ctx.config.read_timeout(),
        );
        match self.ctx.transport.send(outbound).await {
            Ok(response) if response.is_success() => {
                if let Err(e) = self.ctx.cache.put(&key, &response.body) {
                    tracing::warn!("Failed to cache '{}': {}", key, e);
                }
                return Ok(PerformOutcome::Fetched {
                    payload: response.body,
                    source: ReadSource::Network,
                });
            }
            Ok(response) => {
                tracing::debug!("GET {} returned {}, serving cache", target.url, response.status);
            }
            Err(e) => tracing::debug!("GET {} failed, serving cache: {}", target.url, e),
        }

        Ok(self.cached(&key))
    }

    fn cached(&self, key: &str) -> PerformOutcome {
        match self.ctx.cache.get(key) {
            Ok(Some(payload)) => PerformOutcome::Fetched {
                payload,
                source: ReadSource::Cache,
            },
            Ok(None) => PerformOutcome::Fetched {
                payload: json!([]),
                source: ReadSource::Empty,
            },
            Err(e) => {
                tracing::warn!("Cache read for '{}' failed: {}", key, e);
                PerformOutcome::Fetched {
                    payload: json!([]),
                    source: ReadSource::Empty,
                }
            }
        }
    }

    async fn mutate(&self, request: PerformRequest) -> SyncResult<PerformOutcome> {
        let target = resource::resolve(&self.ctx.base_url, &request.url, false)?;
        let key = request
            .collection_key
            .clone()
            .unwrap_or_else(|| target.collection_key.clone());
        let id = OperationId::generate();

        if self.ctx.connectivity.is_offline() {
            return self.enqueue(id, request, &target, key);
        }

        let behind_queue = match self.ctx.log.has_pending_for(&key) {
            Ok(pending) => pending,
            Err(e) => {
                tracing::warn!("Could not inspect pending operations: {}", e);
                false
            }
        };
        if behind_queue {
            tracing::debug!("'{}' has pending operations, queueing behind them", key);
            return self.enqueue(id, request, &target, key);
        }

        let outbound = OutboundRequest::new(
            request.method,
            target.url.as_str(),
            self.ctx.config.write_timeout(),
        )
        .with_body(request.body.clone())
        .with_attachments(request.attachments.clone())
        .with_operation_id(id.clone());

        match self.ctx.transport.send(outbound).await {
            Ok(response) if response.is_success() => {
                self.ctx.reconcile_cache(
                    target.url.as_str(),
                    &key,
                    request.method,
                    request.body.as_ref(),
                    &response.body,
                );
                Ok(PerformOutcome::Applied(response))
            }
            Ok(response) => Err(SyncError::rejected(response.status, response.body)),
            Err(e) if !e.is_retryable() => {
                tracing::warn!("{} {} could not be sent: {}", request.method, target.url, e);
                Err(e.into())
            }
            Err(e) => {
                tracing::info!("{} {} unreachable, queueing: {}", request.method, target.url, e);
                self.enqueue(id, request, &target, key)
            }
        }
    }

    fn enqueue(
        &self,
        id: OperationId,
        request: PerformRequest,
        target: &ResourceRef,
        collection_key: String,
    ) -> SyncResult<PerformOutcome> {
        let mut body = request.body;
        if request.method == Method::Post {
            if let Some(Value::Object(map)) = body.as_mut() {
                map.entry(self.ctx.config.temp_id_field.clone())
                    .or_insert_with(|| Value::String(id.to_string()));
            }
        }

        let new = NewOperation {
            id,
            resource_url: target.url.to_string(),
            method: request.method,
            collection_key,
            body,
            attachments: request.attachments,
        };

        let op = self.ctx.log.append(new).map_err(|e| match e {
            SyncError::QueueFull(_) => e,
            other => {
                tracing::error!("Offline durability degraded: {}", other);
                SyncError::Storage(format!("offline durability degraded: {}", other))
            }
        })?;

        self.ctx.events.emit(EngineEvent::Queued {
            id: op.id.clone(),
            collection_key: op.collection_key.clone(),
        });

        Ok(PerformOutcome::Queued(QueuedAck {
            id: op.id,
            collection_key: op.collection_key,
            queued_at: op.created_at,
        }))
    }
}
