//! Transport to the remote authority
//!
//! The engine only needs one thing from the network: send a request and tell
//! apart "the server answered" from "the server could not be reached".
//! Any HTTP status (including 4xx/5xx) is a `ServerResponse`; only failures
//! without a response are `TransportError`s.

pub mod http;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::queue::{Attachment, OperationId};

pub use http::HttpTransport;

/// HTTP method of an intercepted request
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Method::Get)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "PATCH" => Ok(Method::Patch),
            "DELETE" => Ok(Method::Delete),
            other => Err(format!("unsupported method '{}'", other)),
        }
    }
}

/// A fully resolved request handed to a transport
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub url: String,
    pub method: Method,
    pub body: Option<Value>,
    pub attachments: Vec<Attachment>,
    /// Sent as `Idempotency-Key` so the server can deduplicate replays
    pub operation_id: Option<OperationId>,
    pub timeout: Duration,
}

impl OutboundRequest {
    pub fn new(method: Method, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            method,
            body: None,
            attachments: Vec::new(),
            operation_id: None,
            timeout,
        }
    }

    pub fn with_body(mut self, body: Option<Value>) -> Self {
        self.body = body;
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_operation_id(mut self, id: OperationId) -> Self {
        self.operation_id = Some(id);
        self
    }
}

/// Whatever the server answered, successful or not
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerResponse {
    pub status: u16,
    pub body: Value,
}

impl ServerResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status)
    }

    pub fn is_server_error(&self) -> bool {
        self.status >= 500
    }
}

/// Failure to get any response from the server, or to build the request
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportError {
    #[error("request timed out after {0}")]
    Timeout(String),

    #[error("server unreachable: {0}")]
    Unreachable(String),

    #[error("request could not be built: {0}")]
    InvalidRequest(String),
}

impl TransportError {
    /// Whether another attempt later could succeed. A request that could not
    /// be built never will.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::InvalidRequest(_))
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request. `Ok` for any HTTP answer, `Err` only when no answer arrived.
    async fn send(&self, request: OutboundRequest) -> Result<ServerResponse, TransportError>;

    /// Cheap reachability check used by the connectivity probe.
    async fn probe(&self) -> bool {
        false
    }
}
