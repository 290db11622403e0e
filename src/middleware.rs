//! Request entry point: session → lifecycle → dispatch
//!
//! [`WorkloadProxy`] reads the workload name from the request, makes sure
//! the container is running, and forwards the request to it. When the
//! request carries no workload, or the workload does not exist and may not
//! be created, the request is handed to the next handler untouched.

use crate::config::ProxyConfig;
use crate::dispatch::{DispatchOutcome, Dispatcher, Forwarder};
use crate::error::{json_error_response, workload_error_response, ProxyErrorCode, WorkloadError};
use crate::lifecycle::LifecycleOrchestrator;
use crate::resolver::InstanceDescriptor;
use crate::runtime::{RuntimeError, RuntimeGateway};
use crate::session::WorkloadExtractor;
use crate::ProxyBody;
use futures::future::BoxFuture;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::Service;
use hyper::{Request, Response};
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Header carrying the request ID, when the server set one
const X_REQUEST_ID: &str = "x-request-id";

/// Continuation invoked when the proxy declines a request
pub trait NextHandler: Send + Sync + 'static {
    fn call(&self, req: Request<ProxyBody>) -> BoxFuture<'static, Response<ProxyBody>>;
}

impl<F, Fut> NextHandler for F
where
    F: Fn(Request<ProxyBody>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response<ProxyBody>> + Send + 'static,
{
    fn call(&self, req: Request<ProxyBody>) -> BoxFuture<'static, Response<ProxyBody>> {
        Box::pin(self(req))
    }
}

/// Fallback used when nothing else handles a declined request
pub async fn not_found(_req: Request<ProxyBody>) -> Response<ProxyBody> {
    json_error_response(ProxyErrorCode::NoWorkload, "No workload for this request")
}

/// Values threaded through the stages of one request
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub workload: String,
    pub request_id: Option<String>,
}

struct Inner {
    orchestrator: LifecycleOrchestrator,
    dispatcher: Dispatcher,
    extractor: Arc<dyn WorkloadExtractor>,
}

/// Routes requests to per-workload containers
#[derive(Clone)]
pub struct WorkloadProxy {
    inner: Arc<Inner>,
}

impl WorkloadProxy {
    pub fn new(
        gateway: Arc<dyn RuntimeGateway>,
        forwarder: Arc<dyn Forwarder>,
        extractor: Arc<dyn WorkloadExtractor>,
        config: ProxyConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                orchestrator: LifecycleOrchestrator::new(gateway, Arc::new(config)),
                dispatcher: Dispatcher::new(forwarder),
                extractor,
            }),
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        self.inner.orchestrator.config()
    }

    /// Current snapshot of the container registered as `name`, if any
    pub async fn find_instance(&self, name: &str) -> Result<Option<InstanceDescriptor>, RuntimeError> {
        self.inner.orchestrator.resolver().resolve(name).await
    }

    /// Wrap this proxy as a hyper service with `next` as the fallback
    pub fn service(&self, next: Arc<dyn NextHandler>) -> WorkloadService {
        WorkloadService {
            proxy: self.clone(),
            next,
        }
    }

    /// Handle one request. Never fails: every error becomes a response.
    pub async fn handle(&self, req: Request<ProxyBody>, next: &dyn NextHandler) -> Response<ProxyBody> {
        let (parts, body) = req.into_parts();
        let workload = self.inner.extractor.workload_name(&parts);
        let req = Request::from_parts(parts, body);

        let Some(workload) = workload else {
            debug!(uri = %req.uri(), "No workload on request, passing through");
            return next.call(req).await;
        };

        let ctx = RequestContext {
            workload,
            request_id: req
                .headers()
                .get(X_REQUEST_ID)
                .and_then(|v| v.to_str().ok())
                .map(String::from),
        };

        let descriptor = match self.inner.orchestrator.ensure_running(&ctx.workload).await {
            Ok(descriptor) => descriptor,
            Err(WorkloadError::NotFound { name, reason }) => {
                debug!(workload = %name, %reason, request_id = ?ctx.request_id, "No container, passing through");
                return next.call(req).await;
            }
            Err(e) => return self.fail(&ctx, e),
        };

        self.forward(&ctx, req, descriptor).await
    }

    async fn forward(
        &self,
        ctx: &RequestContext,
        req: Request<ProxyBody>,
        descriptor: InstanceDescriptor,
    ) -> Response<ProxyBody> {
        let Some(target) = descriptor.target else {
            return self.fail(
                ctx,
                WorkloadError::MalformedInstance {
                    name: descriptor.name,
                    status: descriptor.status,
                },
            );
        };

        debug!(
            workload = %ctx.workload,
            target = %target,
            request_id = ?ctx.request_id,
            method = %req.method(),
            uri = %req.uri(),
            "Forwarding request"
        );

        match self.inner.dispatcher.dispatch(req, &target).await {
            DispatchOutcome::Proxied(response) | DispatchOutcome::Retrying(response) => response,
            DispatchOutcome::Failed(e) => self.fail(ctx, WorkloadError::Upstream(e)),
        }
    }

    fn fail(&self, ctx: &RequestContext, err: WorkloadError) -> Response<ProxyBody> {
        warn!(
            workload = %ctx.workload,
            request_id = ?ctx.request_id,
            code = err.code().as_header_value(),
            error = %err,
            "Request failed"
        );
        workload_error_response(&err)
    }
}

/// hyper service wrapping a [`WorkloadProxy`] and its fallback
#[derive(Clone)]
pub struct WorkloadService {
    proxy: WorkloadProxy,
    next: Arc<dyn NextHandler>,
}

impl Service<Request<Incoming>> for WorkloadService {
    type Response = Response<ProxyBody>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let proxy = self.proxy.clone();
        let next = Arc::clone(&self.next);
        Box::pin(async move {
            let req = req.map(|body| body.boxed());
            Ok(proxy.handle(req, next.as_ref()).await)
        })
    }
}
