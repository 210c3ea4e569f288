//! HTTP transports for the Consul client.
//!
//! Requests and responses are fully buffered: Consul API payloads are small
//! and buffering lets decorators such as [`DebugTransport`] inspect both
//! sides without consuming them.

use crate::{ConsulError, ConsulResult};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode, Url};
use std::fmt::{self, Write};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// An outgoing request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Overrides the transport's default timeout
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            timeout: None,
        }
    }

    pub fn with_header(mut self, name: &'static str, value: &str) -> ConsulResult<Self> {
        let value = HeaderValue::from_str(value)
            .map_err(|e| ConsulError::invalid_request(format!("header {}: {}", name, e)))?;
        self.headers.insert(HeaderName::from_static(name), value);
        Ok(self)
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A buffered response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// Numeric header value, used for `X-Consul-Index`.
    pub fn header_u64(&self, name: &str) -> Option<u64> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse().ok())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Sends one request and returns the buffered response.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> ConsulResult<HttpResponse>;
}

/// Transport backed by a `reqwest` client
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> ConsulResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConsulError::transport(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> ConsulResult<HttpResponse> {
        let mut builder = self
            .client
            .request(request.method, request.url)
            .headers(request.headers)
            .body(request.body);

        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(ConsulError::from_reqwest)?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(ConsulError::from_reqwest)?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// Receives request and response dumps.
pub type DebugSink = Arc<dyn Fn(&str) + Send + Sync>;

/// A sink that forwards dumps to `tracing` at debug level.
pub fn tracing_sink() -> DebugSink {
    Arc::new(|dump: &str| debug!(target: "leaderkey_consul::http", "{}", dump))
}

/// Decorator dumping every request and response to a sink.
///
/// Without a sink it only delegates. Without an inner transport it uses a
/// default [`ReqwestTransport`].
pub struct DebugTransport {
    inner: Arc<dyn HttpTransport>,
    sink: Option<DebugSink>,
}

impl DebugTransport {
    pub fn new(sink: Option<DebugSink>, inner: Option<Arc<dyn HttpTransport>>) -> Self {
        Self {
            inner: inner.unwrap_or_else(|| Arc::new(ReqwestTransport::default())),
            sink,
        }
    }

    pub fn wrap(inner: Arc<dyn HttpTransport>) -> Self {
        Self::new(None, Some(inner))
    }

    pub fn with_sink<F>(mut self, sink: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.sink = Some(Arc::new(sink));
        self
    }

    fn emit(&self, dump: impl FnOnce() -> String) {
        if let Some(sink) = &self.sink {
            sink(&dump());
        }
    }
}

impl Default for DebugTransport {
    fn default() -> Self {
        Self::new(None, None)
    }
}

impl fmt::Debug for DebugTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebugTransport")
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

#[async_trait]
impl HttpTransport for DebugTransport {
    async fn send(&self, request: HttpRequest) -> ConsulResult<HttpResponse> {
        self.emit(|| dump_request(&request));

        let response = self.inner.send(request).await?;

        self.emit(|| dump_response(&response));
        Ok(response)
    }
}

/// Renders a request in HTTP/1.1 wire form.
pub fn dump_request(request: &HttpRequest) -> String {
    let mut target = request.url.path().to_string();
    if let Some(query) = request.url.query() {
        target.push('?');
        target.push_str(query);
    }

    let mut dump = format!("{} {} HTTP/1.1\r\n", request.method, target);
    if let Some(host) = request.url.host_str() {
        match request.url.port() {
            Some(port) => {
                let _ = write!(dump, "Host: {}:{}\r\n", host, port);
            }
            None => {
                let _ = write!(dump, "Host: {}\r\n", host);
            }
        }
    }
    write_headers(&mut dump, &request.headers);
    dump.push_str("\r\n");
    dump.push_str(&String::from_utf8_lossy(&request.body));
    dump
}

/// Renders a response in HTTP/1.1 wire form.
pub fn dump_response(response: &HttpResponse) -> String {
    let mut dump = format!(
        "HTTP/1.1 {} {}\r\n",
        response.status.as_u16(),
        response.status.canonical_reason().unwrap_or("")
    );
    write_headers(&mut dump, &response.headers);
    dump.push_str("\r\n");
    dump.push_str(&String::from_utf8_lossy(&response.body));
    dump
}

fn write_headers(dump: &mut String, headers: &HeaderMap) {
    for (name, value) in headers {
        let _ = write!(
            dump,
            "{}: {}\r\n",
            name,
            String::from_utf8_lossy(value.as_bytes())
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FixedTransport {
        status: StatusCode,
    }

    #[async_trait]
    impl HttpTransport for FixedTransport {
        async fn send(&self, _request: HttpRequest) -> ConsulResult<HttpResponse> {
            Ok(HttpResponse::new(self.status, "[]"))
        }
    }

    struct FailingTransport;

    #[async_trait]
    impl HttpTransport for FailingTransport {
        async fn send(&self, _request: HttpRequest) -> ConsulResult<HttpResponse> {
            Err(ConsulError::transport("connection refused"))
        }
    }

    fn capture() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) + Send + Sync + 'static) {
        let dumps = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let dumps = dumps.clone();
            move |dump: &str| dumps.lock().unwrap().push(dump.to_string())
        };
        (dumps, sink)
    }

    fn request() -> HttpRequest {
        let url = Url::parse("http://127.0.0.1:8500/v1/kv/service/leader?index=3").unwrap();
        HttpRequest::new(Method::GET, url)
            .with_header("x-consul-token", "secret")
            .unwrap()
    }

    #[test]
    fn test_dump_request_format() {
        let dump = dump_request(&request().with_body("payload"));

        assert!(dump.starts_with("GET /v1/kv/service/leader?index=3 HTTP/1.1\r\n"));
        assert!(dump.contains("Host: 127.0.0.1:8500\r\n"));
        assert!(dump.contains("x-consul-token: secret\r\n"));
        assert!(dump.ends_with("\r\n\r\npayload"));
    }

    #[test]
    fn test_dump_response_format() {
        let response = HttpResponse::new(StatusCode::INTERNAL_SERVER_ERROR, "boom");
        let dump = dump_response(&response);

        assert!(dump.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(dump.ends_with("boom"));
    }

    #[tokio::test]
    async fn test_debug_transport_dumps_both_sides() {
        let (dumps, sink) = capture();
        let transport = DebugTransport::wrap(Arc::new(FixedTransport {
            status: StatusCode::OK,
        }))
        .with_sink(sink);

        let response = transport.send(request()).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);

        let dumps = dumps.lock().unwrap();
        assert_eq!(dumps.len(), 2);
        assert!(dumps[0].starts_with("GET /v1/kv/service/leader"));
        assert!(dumps[1].starts_with("HTTP/1.1 200 OK"));
    }

    #[tokio::test]
    async fn test_debug_transport_without_sink() {
        let transport = DebugTransport::wrap(Arc::new(FixedTransport {
            status: StatusCode::NOT_FOUND,
        }));

        let response = transport.send(request()).await.unwrap();
        assert_eq!(response.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_debug_transport_propagates_errors() {
        let (dumps, sink) = capture();
        let transport = DebugTransport::wrap(Arc::new(FailingTransport)).with_sink(sink);

        let result = transport.send(request()).await;
        assert!(matches!(result, Err(ConsulError::Transport { .. })));

        // Only the request was dumped.
        assert_eq!(dumps.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_header_u64() {
        let mut response = HttpResponse::new(StatusCode::OK, "");
        response
            .headers
            .insert("x-consul-index", HeaderValue::from_static("42"));

        assert_eq!(response.header_u64("X-Consul-Index"), Some(42));
        assert_eq!(response.header_u64("x-missing"), None);
    }
}
