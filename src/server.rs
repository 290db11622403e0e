use crate::middleware::WorkloadService;
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderValue, HOST};
use hyper::service::{service_fn, Service};
use hyper::{Request, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Accept loop serving a [`WorkloadService`] over HTTP/1.1 and HTTP/2
pub struct ProxyServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    service: WorkloadService,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    /// Bind the listening socket. Port 0 picks a free port.
    pub async fn bind(
        addr: SocketAddr,
        service: WorkloadService,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", addr, e))?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            service,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(addr = %self.local_addr, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let service = self.service.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, service).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    // A dropped sender counts as shutdown
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    service: WorkloadService,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |mut req: Request<Incoming>| {
        let request_id = apply_proxy_headers(&mut req, addr);
        debug!(method = %req.method(), uri = %req.uri(), request_id, "Incoming request");
        service.call(req)
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

/// Set request ID and forwarding headers, returning the request ID.
///
/// X-Forwarded-* values from the client are overwritten, not appended: this
/// proxy is the first trusted hop.
fn apply_proxy_headers<B>(req: &mut Request<B>, client_addr: SocketAddr) -> String {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let host = original_host(req.headers(), req.uri());
    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    match host {
        Some(host) => {
            headers.insert(X_FORWARDED_HOST, host);
        }
        None => {
            headers.remove(X_FORWARDED_HOST);
        }
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    request_id
}

/// Host header, or the URI authority for HTTP/2 requests
fn original_host(headers: &HeaderMap, uri: &Uri) -> Option<HeaderValue> {
    headers.get(HOST).cloned().or_else(|| {
        uri.authority()
            .and_then(|authority| HeaderValue::from_str(authority.as_str()).ok())
    })
}
