//! Upstream HTTP client for the embedded proxy
//!
//! Port targets go through a pooled hyper client; unix-socket targets get a
//! fresh HTTP/1.1 connection per request.

use crate::descriptor::Target;
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::UnixStream;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    #[error("connection error: {0}")]
    Connect(#[from] std::io::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),
    #[error("request build error: {0}")]
    RequestBuild(String),
}

/// Request counters
#[derive(Debug, Default)]
pub struct PoolStats {
    pub tcp_requests: AtomicU64,
    pub unix_requests: AtomicU64,
}

impl PoolStats {
    pub fn total(&self) -> u64 {
        self.tcp_requests.load(Ordering::Relaxed) + self.unix_requests.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per worker port
    pub max_idle_per_host: usize,
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

pub struct UpstreamClient {
    client: Client<HttpConnector, Incoming>,
    stats: PoolStats,
    config: PoolConfig,
}

impl UpstreamClient {
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
            "Upstream client initialized"
        );

        Self {
            client,
            stats: PoolStats::default(),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// Forward `req` to `target`, keeping method, path and headers
    pub async fn send(
        &self,
        req: Request<Incoming>,
        target: &Target,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let (parts, body) = req.into_parts();

        let uri = match target {
            Target::Port(port) => format!("http://127.0.0.1:{}{}", port, path),
            Target::Sock(_) => path,
        };
        let mut builder = Request::builder()
            .method(parts.method)
            .uri(&uri)
            .version(hyper::Version::HTTP_11);
        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }
        let upstream_req = builder
            .body(body)
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        let response = match target {
            Target::Port(_) => {
                self.stats.tcp_requests.fetch_add(1, Ordering::Relaxed);
                self.client.request(upstream_req).await?
            }
            Target::Sock(path) => {
                self.stats.unix_requests.fetch_add(1, Ordering::Relaxed);
                let stream = UnixStream::connect(path).await?;
                let (mut sender, conn) =
                    hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        debug!(error = %e, "Unix upstream connection closed with error");
                    }
                });
                sender.send_request(upstream_req).await?
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
    fn test_client_creation() {
        let client = UpstreamClient::new(PoolConfig {
            max_idle_per_host: 5,
            idle_timeout: Duration::from_secs(30),
        });
        assert_eq!(client.config().max_idle_per_host, 5);
        assert_eq!(client.stats().total(), 0);
    }
}
