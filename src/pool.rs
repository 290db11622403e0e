//! Connection pool for backend HTTP connections
//!
//! Backends are reached over plain HTTP through a single pooled client so
//! keep-alive connections to a running container are reused across requests.

use crate::config::ServerConfig;
use crate::dispatch::{ForwardError, Forwarder};
use crate::resolver::Target;
use crate::ProxyBody;
use async_trait::async_trait;
use http_body_util::BodyExt;
use hyper::{Request, Response, Version};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Statistics for the connection pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Total number of requests made through the pool
    pub total_requests: AtomicU64,
    /// Requests that ended in a transport error or timeout
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
    /// Upper bound for one backend request, response headers included
    pub request_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&ServerConfig> for PoolConfig {
    fn from(server: &ServerConfig) -> Self {
        Self {
            max_idle_per_host: server.pool_max_idle_per_host,
            idle_timeout: server.pool_idle_timeout(),
            request_timeout: server.request_timeout(),
        }
    }
}

/// A connection pool for HTTP connections to backend containers
pub struct ConnectionPool {
    client: Client<HttpConnector, ProxyBody>,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl ConnectionPool {
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
            request_timeout_secs = config.request_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            client,
            stats: Arc::new(PoolStats::default()),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Send a request to `target`, keeping method, path, query, headers and body.
    ///
    /// Backends always speak HTTP/1.1, whatever version the client used.
    pub async fn send_request(
        &self,
        req: Request<ProxyBody>,
        target: &Target,
    ) -> Result<Response<ProxyBody>, ForwardError> {
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = target.uri(path);

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder()
            .method(parts.method)
            .version(Version::HTTP_11)
            .uri(&uri);

        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }

        let backend_req = builder
            .body(body)
            .map_err(|e| ForwardError::RequestBuild(e.to_string()))?;

        self.stats.record_request();

        let response = self
            .client
            .request(backend_req)
            .await
            .map_err(|e| ForwardError::from_transport(&e))?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

#[async_trait]
impl Forwarder for ConnectionPool {
    async fn forward(
        &self,
        req: Request<ProxyBody>,
        target: &Target,
    ) -> Result<Response<ProxyBody>, ForwardError> {
        let result = match tokio::time::timeout(
            self.config.request_timeout,
            self.send_request(req, target),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ForwardError::Timeout(self.config.request_timeout)),
        };

        if let Err(e) = &result {
            self.stats.record_failure();
            debug!(target = %target, error = %e, "Backend request failed");
        }
        result
    }
}
