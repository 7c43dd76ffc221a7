use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{Method, OutboundRequest, ServerResponse, Transport, TransportError};

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// reqwest-backed transport to the fleet API
pub struct HttpTransport {
    /// Always ends in '/' so relative paths join under it
    base_url: Url,
    health_path: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(base_url: &str) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(4)
            .build()
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;

        let mut base_url = Url::parse(base_url)
            .map_err(|e| TransportError::InvalidRequest(format!("Invalid base URL '{}': {}", base_url, e)))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self {
            base_url,
            health_path: "health".to_string(),
            token: None,
            client,
        })
    }

    pub fn with_token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }

    /// Health endpoint, relative to the base URL.
    pub fn with_health_path(mut self, path: &str) -> Self {
        self.health_path = path.trim_start_matches('/').to_string();
        self
    }

    pub fn health_url(&self) -> Result<Url, TransportError> {
        self.base_url
            .join(&self.health_path)
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))
    }

    fn method(method: Method) -> reqwest::Method {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        }
    }

    fn map_error(err: reqwest::Error, timeout: Duration) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout(format!("{}ms", timeout.as_millis()))
        } else if err.is_builder() {
            TransportError::InvalidRequest(err.to_string())
        } else {
            TransportError::Unreachable(err.to_string())
        }
    }

    /// Multipart body: one `payload` JSON part followed by each attachment in order.
    fn multipart_form(request: &OutboundRequest) -> Result<reqwest::multipart::Form, TransportError> {
        let mut form = reqwest::multipart::Form::new();

        if let Some(body) = &request.body {
            let json_str = serde_json::to_string(body)
                .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
            let part = reqwest::multipart::Part::text(json_str)
                .mime_str("application/json")
                .map_err(|e| TransportError::InvalidRequest(format!("Invalid mime: {}", e)))?;
            form = form.part("payload", part);
        }

        for attachment in &request.attachments {
            let mut part = reqwest::multipart::Part::bytes(attachment.data.clone());
            if let Some(name) = &attachment.file_name {
                part = part.file_name(name.clone());
            }
            if let Some(mime) = &attachment.content_type {
                part = part
                    .mime_str(mime)
                    .map_err(|e| TransportError::InvalidRequest(format!("Invalid mime: {}", e)))?;
            }
            form = form.part(attachment.field_name.clone(), part);
        }

        Ok(form)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: OutboundRequest) -> Result<ServerResponse, TransportError> {
        let mut builder = self
            .client
            .request(Self::method(request.method), &request.url)
            .timeout(request.timeout);

        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        if let Some(id) = &request.operation_id {
            builder = builder.header(IDEMPOTENCY_HEADER, id.as_str());
        }

        builder = if request.attachments.is_empty() {
            match &request.body {
                Some(body) => builder.json(body),
                None => builder,
            }
        } else {
            builder.multipart(Self::multipart_form(&request)?)
        };

        let response = builder
            .send()
            .await
            .map_err(|e| Self::map_error(e, request.timeout))?;

        let status = response.status().as_u16();
        // A cut connection while reading the body is still a connectivity failure
        let text = response
            .text()
            .await
            .map_err(|e| Self::map_error(e, request.timeout))?;

        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        debug!("{} {} -> {}", request.method, request.url, status);
        Ok(ServerResponse { status, body })
    }

    async fn probe(&self) -> bool {
        let url = match self.health_url() {
            Ok(url) => url,
            Err(e) => {
                debug!("No usable health URL: {}", e);
                return false;
            }
        };
        match self
            .client
            .get(url.clone())
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(response) => {
                debug!("GET {} -> {}", url, response.status());
                response.status().is_success()
            }
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{Attachment, OperationId};
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    /// Serve one request with `status` and hand back the raw request text.
    async fn one_shot_server(status: u16) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                raw.extend_from_slice(&chunk[..n]);
                if request_complete(&raw) {
                    break;
                }
            }
            let reply = format!(
                "HTTP/1.1 {} X\r\ncontent-type: application/json\r\ncontent-length: 2\r\nconnection: close\r\n\r\n{{}}",
                status
            );
            socket.write_all(reply.as_bytes()).await.unwrap();
            let _ = tx.send(String::from_utf8_lossy(&raw).into_owned());
        });

        (format!("http://{}", addr), rx)
    }

    fn request_complete(raw: &[u8]) -> bool {
        let text = String::from_utf8_lossy(raw);
        let Some(end) = text.find("\r\n\r\n") else {
            return false;
        };
        let head = text[..end].to_ascii_lowercase();
        let body_len = raw.len() - (end + 4);
        if head.contains("transfer-encoding: chunked") {
            return text.ends_with("0\r\n\r\n");
        }
        let expected = head
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        body_len >= expected
    }

    #[test]
    fn test_base_url_keeps_its_path() {
        let transport = HttpTransport::new("http://localhost:8080/api").unwrap();
        assert_eq!(transport.base_url.as_str(), "http://localhost:8080/api/");
        assert_eq!(
            transport.health_url().unwrap().as_str(),
            "http://localhost:8080/api/health"
        );

        let transport = HttpTransport::new("http://localhost:8080/api/")
            .unwrap()
            .with_health_path("/status/ping");
        assert_eq!(
            transport.health_url().unwrap().as_str(),
            "http://localhost:8080/api/status/ping"
        );
    }

    #[test]
    fn test_rejects_unparseable_base() {
        let err = HttpTransport::new("not a url").err().unwrap();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_health_check_hits_path_under_base() {
        let (addr, request) = one_shot_server(200).await;
        let transport = HttpTransport::new(&format!("{}/api", addr)).unwrap();

        assert!(transport.probe().await);
        let raw = request.await.unwrap();
        assert!(raw.starts_with("GET /api/health HTTP/1.1\r\n"), "{}", raw);
    }

    #[tokio::test]
    async fn test_missing_health_endpoint_is_not_online() {
        let (addr, _request) = one_shot_server(404).await;
        let transport = HttpTransport::new(&format!("{}/api", addr)).unwrap();
        assert!(!transport.probe().await);
    }

    #[tokio::test]
    async fn test_attachments_go_out_as_multipart() {
        let (addr, request) = one_shot_server(201).await;
        let transport = HttpTransport::new(&addr).unwrap();
        let id = OperationId::from("op-1");

        let outbound = OutboundRequest::new(
            Method::Post,
            format!("{}/registrations", addr),
            Duration::from_secs(2),
        )
        .with_body(Some(json!({"liters": 40.5})))
        .with_attachments(vec![Attachment::new("photo", b"JPEGDATA".to_vec())
            .with_file_name("pump.jpg")
            .with_content_type("image/jpeg")])
        .with_operation_id(id);

        let response = transport.send(outbound).await.unwrap();
        assert_eq!(response.status, 201);

        let raw = request.await.unwrap();
        let lower = raw.to_ascii_lowercase();
        assert!(raw.starts_with("POST /registrations HTTP/1.1\r\n"));
        assert!(lower.contains("idempotency-key: op-1\r\n"));
        assert!(lower.contains("content-type: multipart/form-data; boundary="));
        assert!(raw.contains("name=\"payload\""));
        assert!(raw.contains("{\"liters\":40.5}"));
        assert!(raw.contains("name=\"photo\"; filename=\"pump.jpg\""));
        assert!(lower.contains("content-type: image/jpeg"));
        assert!(raw.contains("JPEGDATA"));
        // The JSON part comes before the files
        assert!(raw.find("name=\"payload\"").unwrap() < raw.find("name=\"photo\"").unwrap());
    }

    #[tokio::test]
    async fn test_bad_content_type_cannot_be_sent() {
        let transport = HttpTransport::new("http://127.0.0.1:9").unwrap();
        let outbound = OutboundRequest::new(
            Method::Post,
            "http://127.0.0.1:9/registrations",
            Duration::from_millis(500),
        )
        .with_attachments(vec![
            Attachment::new("photo", vec![1, 2, 3]).with_content_type("not a mime")
        ]);

        let err = transport.send(outbound).await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidRequest(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transport_error() {
        let transport = HttpTransport::new("http://127.0.0.1:9").unwrap();
        let request = OutboundRequest::new(
            Method::Get,
            "http://127.0.0.1:9/api/vehicles",
            Duration::from_millis(500),
        );
        let err = transport.send(request).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
