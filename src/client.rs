//! Pooled HTTP client for requests forwarded to the engine
//!
//! The engine only ever listens on loopback, so a single plain-HTTP client
//! with keep-alive pooling serves every router instance.

use crate::error::BoxError;
use crate::router::RouterBody;
use http_body_util::BodyExt;
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Error type for forwarding operations
#[derive(Debug)]
pub enum ClientError {
    /// Error from the HTTP client (connection refused, reset, ...)
    Client(hyper_util::client::legacy::Error),
    /// Error building the outbound request
    RequestBuild(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Client(e) => write!(f, "Client error: {}", e),
            ClientError::RequestBuild(s) => write!(f, "Request build error: {}", s),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<hyper_util::client::legacy::Error> for ClientError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        ClientError::Client(err)
    }
}

/// Counters for forwarded traffic
#[derive(Debug, Default)]
pub struct ForwardStats {
    /// Requests handed to the engine
    pub forwarded: AtomicU64,
    /// Requests that failed before a response arrived
    pub failed: AtomicU64,
}

impl ForwardStats {
    pub fn record_forward(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    pub fn get_failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Client used by routers to reach the engine
pub struct EngineClient {
    client: Client<HttpConnector, RouterBody>,
    stats: Arc<ForwardStats>,
    config: PoolConfig,
}

impl EngineClient {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Engine client initialized"
        );

        Self {
            client,
            stats: Arc::new(ForwardStats::default()),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<ForwardStats> {
        Arc::clone(&self.stats)
    }

    /// Send a request to `base_uri` + the request's path and query
    pub async fn send_request(
        &self,
        req: Request<RouterBody>,
        base_uri: &str,
    ) -> Result<Response<Incoming>, ClientError> {
        let uri = format!(
            "{}{}",
            base_uri,
            req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
        );

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(&uri);

        // Copy headers
        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }

        let engine_req = builder
            .body(body)
            .map_err(|e| ClientError::RequestBuild(e.to_string()))?;

        self.stats.record_forward();

        match self.client.request(engine_req).await {
            Ok(response) => Ok(response),
            Err(e) => {
                self.stats.record_failure();
                Err(e.into())
            }
        }
    }
}

impl Default for EngineClient {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

/// Box any byte body into a [`RouterBody`]
pub fn boxed<B>(body: B) -> RouterBody
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    body.map_err(Into::into).boxed_unsync()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Empty;

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_forward_stats() {
        let stats = ForwardStats::default();

        assert_eq!(stats.get_forwarded(), 0);
        assert_eq!(stats.get_failed(), 0);

        stats.record_forward();
        stats.record_forward();
        stats.record_failure();
        assert_eq!(stats.get_forwarded(), 2);
        assert_eq!(stats.get_failed(), 1);
    }

    #[tokio::test]
    async fn test_send_to_closed_port_fails() {
        // Grab a free port, then release it so nothing is listening
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = EngineClient::default();
        let req = Request::builder()
            .method("POST")
            .uri("/graphql")
            .body(boxed(Empty::<Bytes>::new()))
            .unwrap();

        let result = client
            .send_request(req, &format!("http://127.0.0.1:{}", port))
            .await;
        assert!(matches!(result, Err(ClientError::Client(_))));
        assert_eq!(client.stats().get_failed(), 1);
        assert_eq!(client.stats().get_forwarded(), 1);
    }
}
