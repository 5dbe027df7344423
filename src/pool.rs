//! Pooled HTTP client for forwarding requests to the origin
//!
//! Requests are re-targeted at the origin base URL; method, headers
//! (including `Host`) and body are passed through untouched.

use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::Bytes;
use hyper::{Request, Response, Uri, Version};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Body type used for both directions of the proxy
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Error type for connection pool operations
#[derive(Debug)]
pub enum PoolError {
    /// Error from the HTTP client
    Client(hyper_util::client::legacy::Error),
    /// Error building a request
    RequestBuild(String),
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::Client(e) => write!(f, "Client error: {}", e),
            PoolError::RequestBuild(s) => write!(f, "Request build error: {}", s),
        }
    }
}

impl std::error::Error for PoolError {}

impl From<hyper_util::client::legacy::Error> for PoolError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        PoolError::Client(err)
    }
}

/// Statistics for the connection pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Requests sent to the origin
    pub total_requests: AtomicU64,
    /// Requests that failed at the transport level
    pub failed_requests: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
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

/// A pooled client bound to one origin
pub struct OriginPool {
    client: Client<HttpConnector, ProxyBody>,
    /// Origin base, without trailing slash
    base: String,
    stats: Arc<PoolStats>,
}

impl OriginPool {
    /// `origin_url` must be an `http://` URL; a path prefix is allowed
    pub fn new(origin_url: &str, config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        let base = origin_url.trim_end_matches('/').to_string();

        debug!(
            origin = %base,
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Origin pool initialized"
        );

        Self {
            client,
            base,
            stats: Arc::new(PoolStats::default()),
        }
    }

    pub fn origin(&self) -> &str {
        &self.base
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Origin URI for an inbound request URI
    pub fn target_uri(&self, inbound: &Uri) -> Result<Uri, PoolError> {
        let path_and_query = inbound
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        format!("{}{}", self.base, path_and_query)
            .parse::<Uri>()
            .map_err(|e| PoolError::RequestBuild(e.to_string()))
    }

    /// Forward a request to the origin, streaming the response body back
    pub async fn send_request(&self, req: Request<ProxyBody>) -> Result<Response<ProxyBody>, PoolError> {
        let uri = self.target_uri(req.uri())?;

        // The origin connector speaks HTTP/1.1 only, whatever the inbound version
        let (mut parts, body) = req.into_parts();
        parts.uri = uri;
        parts.version = Version::HTTP_11;
        let origin_req = Request::from_parts(parts, body);

        self.stats.record_request();

        let response = match self.client.request(origin_req).await {
            Ok(response) => response,
            Err(e) => {
                self.stats.record_failure();
                return Err(e.into());
            }
        };

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_pool_stats() {
        let stats = PoolStats::default();

        assert_eq!(stats.get_total_requests(), 0);
        assert_eq!(stats.get_failed_requests(), 0);

        stats.record_request();
        stats.record_request();
        stats.record_failure();
        assert_eq!(stats.get_total_requests(), 2);
        assert_eq!(stats.get_failed_requests(), 1);
    }

    #[tokio::test]
    async fn test_target_uri_keeps_path_and_query() {
        let pool = OriginPool::new("http://127.0.0.1:3000/", PoolConfig::default());
        assert_eq!(pool.origin(), "http://127.0.0.1:3000");

        let inbound: Uri = "/api/items?page=2&now=1".parse().unwrap();
        assert_eq!(
            pool.target_uri(&inbound).unwrap().to_string(),
            "http://127.0.0.1:3000/api/items?page=2&now=1"
        );

        let absolute: Uri = "http://public.example/login".parse().unwrap();
        assert_eq!(
            pool.target_uri(&absolute).unwrap().to_string(),
            "http://127.0.0.1:3000/login"
        );
    }

    #[tokio::test]
    async fn test_target_uri_with_path_prefix() {
        let pool = OriginPool::new("http://10.0.0.5:8080/mesh", PoolConfig::default());
        let inbound: Uri = "/".parse().unwrap();
        assert_eq!(
            pool.target_uri(&inbound).unwrap().to_string(),
            "http://10.0.0.5:8080/mesh/"
        );
    }

    #[tokio::test]
    async fn test_unreachable_origin_records_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let pool = OriginPool::new(&format!("http://{}", addr), PoolConfig::default());
        let req = Request::builder()
            .uri("/")
            .body(
                http_body_util::Empty::<Bytes>::new()
                    .map_err(|never| match never {})
                    .boxed(),
            )
            .unwrap();

        assert!(pool.send_request(req).await.is_err());
        assert_eq!(pool.stats().get_total_requests(), 1);
        assert_eq!(pool.stats().get_failed_requests(), 1);
    }
}
