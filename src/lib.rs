//! Dockgate - session-routed proxy that starts Docker containers on demand
//!
//! Each request names a workload (through a signed session cookie or a
//! trusted header). The proxy:
//! - Looks up the container registered under that name
//! - Creates it from a template when it is missing and auto-creation is on
//! - Starts it when it is stopped and re-reads its published port
//! - Forwards the request through a pooled HTTP client
//! - Answers with a self-reloading page while the backend is still booting
//!
//! Requests without a workload, or for a workload that does not exist and
//! may not be created, are handed to a fallback handler.

pub mod config;
pub mod dispatch;
pub mod docker;
pub mod error;
pub mod lifecycle;
pub mod middleware;
pub mod pool;
pub mod resolver;
pub mod runtime;
pub mod server;
pub mod session;

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;

/// Body type used for every request and response the proxy handles
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// A complete in-memory body
pub fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}
