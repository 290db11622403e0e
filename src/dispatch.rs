//! Forwards a request to its target and classifies the result
//!
//! A backend container that is still booting typically accepts the TCP
//! connection (the runtime's port forwarder does) and then resets or closes
//! it. That failure is answered with a small self-reloading page instead of
//! an error, so the browser simply retries until the application is up.

use crate::resolver::Target;
use crate::{full, ProxyBody};
use async_trait::async_trait;
use hyper::header::{HeaderValue, CACHE_CONTROL, CONTENT_TYPE};
use hyper::{Request, Response, StatusCode};
use std::error::Error as StdError;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Body served while a backend is not accepting connections yet
pub const INITIALIZING_PAGE: &str = concat!(
    "Initializing...",
    "<script>",
    "   setTimeout(function(){",
    "       window.location.reload()",
    "   },1000)",
    "</script>"
);

/// Errors from forwarding a request to a backend
#[derive(Debug, Error)]
pub enum ForwardError {
    /// The backend accepted the connection and then reset or closed it
    #[error("connection reset by backend: {0}")]
    ConnectionReset(String),

    #[error("request timed out after {} seconds", .0.as_secs())]
    Timeout(Duration),

    #[error("request build error: {0}")]
    RequestBuild(String),

    #[error("{0}")]
    Client(String),
}

impl ForwardError {
    /// Classify a transport error by walking its source chain
    pub fn from_transport(err: &(dyn StdError + 'static)) -> Self {
        let description = error_chain(err);
        if is_connection_reset(err) {
            ForwardError::ConnectionReset(description)
        } else {
            ForwardError::Client(description)
        }
    }

    pub fn is_connection_reset(&self) -> bool {
        matches!(self, ForwardError::ConnectionReset(_))
    }
}

/// True when any error in the chain means "accepted, then dropped"
fn is_connection_reset(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            if matches!(
                io_err.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ) {
                return true;
            }
        }
        if let Some(hyper_err) = e.downcast_ref::<hyper::Error>() {
            // Closed before a response (or before the request could be written)
            if hyper_err.is_incomplete_message() || hyper_err.is_canceled() {
                return true;
            }
        }
        current = e.source();
    }
    false
}

/// Render an error and all of its sources, outermost first
fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut current = err.source();
    while let Some(e) = current {
        let part = e.to_string();
        if !message.contains(&part) {
            message.push_str(": ");
            message.push_str(&part);
        }
        current = e.source();
    }
    message
}

/// Low-level transport that sends one request to one backend
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(
        &self,
        req: Request<ProxyBody>,
        target: &Target,
    ) -> Result<Response<ProxyBody>, ForwardError>;
}

/// Result of one dispatch attempt
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Backend response, passed through untouched
    Proxied(Response<ProxyBody>),
    /// Backend not accepting connections yet; placeholder page
    Retrying(Response<ProxyBody>),
    /// Any other transport failure
    Failed(ForwardError),
}

/// Sends requests to resolved targets through a [`Forwarder`]
#[derive(Clone)]
pub struct Dispatcher {
    forwarder: Arc<dyn Forwarder>,
}

impl Dispatcher {
    pub fn new(forwarder: Arc<dyn Forwarder>) -> Self {
        Self { forwarder }
    }

    pub async fn dispatch(&self, req: Request<ProxyBody>, target: &Target) -> DispatchOutcome {
        match self.forwarder.forward(req, target).await {
            Ok(response) => DispatchOutcome::Proxied(response),
            Err(e) if e.is_connection_reset() => {
                debug!(target = %target, error = %e, "Backend not accepting connections yet, serving retry page");
                DispatchOutcome::Retrying(initializing_response())
            }
            Err(e) => DispatchOutcome::Failed(e),
        }
    }
}

/// The self-refreshing placeholder response
pub fn initializing_response() -> Response<ProxyBody> {
    let mut response = Response::new(full(INITIALIZING_PAGE));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}
