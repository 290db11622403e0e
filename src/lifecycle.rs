//! Ensures a workload's container exists and is running
//!
//! Per request the orchestrator resolves the workload, creates it when
//! allowed, starts it when it is not up, and then resolves it again: the
//! runtime may publish a different host port after every start, so only a
//! post-start snapshot is ever used to build a target.
//!
//! Create and start transitions are serialized per workload name. Requests
//! for a workload that is already running never wait on that lock. A
//! transition runs on its own task, so a caller that goes away does not
//! abort a create or start halfway.

use crate::config::{ContainerTemplate, ProxyConfig};
use crate::error::{NotFoundReason, WorkloadError};
use crate::resolver::{InstanceDescriptor, InstanceResolver};
use crate::runtime::{RuntimeError, RuntimeGateway};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// User-supplied provisioning for a missing workload
#[async_trait]
pub trait CreateInstance: Send + Sync {
    /// Create (not start) the container that will be registered as `name`
    async fn create(&self, gateway: &dyn RuntimeGateway, name: &str) -> Result<(), RuntimeError>;
}

/// How a missing workload is provisioned
#[derive(Clone)]
pub enum CreateStrategy {
    /// Fixed template, merged with the workload name
    Template(ContainerTemplate),
    /// Arbitrary creation logic
    Custom(Arc<dyn CreateInstance>),
}

impl CreateStrategy {
    pub fn custom(create: impl CreateInstance + 'static) -> Self {
        CreateStrategy::Custom(Arc::new(create))
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            CreateStrategy::Template(_) => "template",
            CreateStrategy::Custom(_) => "custom",
        }
    }

    async fn create(&self, gateway: &dyn RuntimeGateway, name: &str) -> Result<(), RuntimeError> {
        match self {
            CreateStrategy::Template(template) => {
                gateway.create_instance(name, template).await.map(|_| ())
            }
            CreateStrategy::Custom(create) => create.create(gateway, name).await,
        }
    }
}

/// Drives a workload to the running state
#[derive(Clone)]
pub struct LifecycleOrchestrator {
    resolver: InstanceResolver,
    config: Arc<ProxyConfig>,
    /// One lock per workload currently going through create/start
    transitions: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl LifecycleOrchestrator {
    pub fn new(gateway: Arc<dyn RuntimeGateway>, config: Arc<ProxyConfig>) -> Self {
        Self {
            resolver: InstanceResolver::new(gateway, config.upstream_host.clone()),
            config,
            transitions: Arc::new(DashMap::new()),
        }
    }

    pub fn resolver(&self) -> &InstanceResolver {
        &self.resolver
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Make sure `name` is running and return a snapshot with a target.
    ///
    /// Fails with [`WorkloadError::NotFound`] when the workload does not
    /// exist and may not be created. Runtime failures propagate unchanged
    /// and are not retried.
    pub async fn ensure_running(&self, name: &str) -> Result<InstanceDescriptor, WorkloadError> {
        if let Some(descriptor) = self.resolver.resolve(name).await? {
            if descriptor.is_running() {
                debug!(workload = name, status = %descriptor.status, "Container already running");
                return with_target(descriptor);
            }
        }

        let orchestrator = self.clone();
        let owned = name.to_string();
        let transition = tokio::spawn(async move { orchestrator.transition(&owned).await });

        match transition.await {
            Ok(result) => result,
            Err(e) => Err(WorkloadError::Runtime(RuntimeError::Other(format!(
                "lifecycle task for '{}' failed: {}",
                name, e
            )))),
        }
    }

    async fn transition(&self, name: &str) -> Result<InstanceDescriptor, WorkloadError> {
        let lock = self.transition_lock(name);
        let result = {
            let _guard = lock.lock().await;
            self.ensure_running_locked(name).await
        };

        // The map and this task hold the only references when nobody else waits
        self.transitions
            .remove_if(name, |_, l| Arc::strong_count(l) <= 2);
        result
    }

    fn transition_lock(&self, name: &str) -> Arc<Mutex<()>> {
        self.transitions
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn ensure_running_locked(&self, name: &str) -> Result<InstanceDescriptor, WorkloadError> {
        // Another request may have finished the transition while we waited
        let descriptor = match self.resolver.resolve(name).await? {
            Some(descriptor) => descriptor,
            None => self.provision(name).await?,
        };

        if descriptor.is_running() {
            return with_target(descriptor);
        }

        info!(workload = name, status = %descriptor.status, "Container not running, starting");
        self.resolver.gateway().start_instance(name).await?;

        let started = self
            .resolver
            .resolve(name)
            .await?
            .ok_or_else(|| WorkloadError::Vanished {
                name: name.to_string(),
            })?;
        with_target(started)
    }

    async fn provision(&self, name: &str) -> Result<InstanceDescriptor, WorkloadError> {
        if !self.config.auto_create {
            return Err(WorkloadError::NotFound {
                name: name.to_string(),
                reason: NotFoundReason::AutoCreateDisabled,
            });
        }
        let Some(ref strategy) = self.config.create else {
            return Err(WorkloadError::NotFound {
                name: name.to_string(),
                reason: NotFoundReason::NoCreateStrategy,
            });
        };

        info!(workload = name, strategy = strategy.kind(), "Container not found, creating");
        strategy
            .create(self.resolver.gateway().as_ref(), name)
            .await?;

        Ok(InstanceDescriptor::not_started(name))
    }
}

fn with_target(descriptor: InstanceDescriptor) -> Result<InstanceDescriptor, WorkloadError> {
    if descriptor.target.is_none() {
        return Err(WorkloadError::MalformedInstance {
            name: descriptor.name,
            status: descriptor.status,
        });
    }
    Ok(descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::Target;
    use crate::runtime::fake::{FakeGateway, GatewayCall};
    use std::time::Duration;

    fn orchestrator(gateway: &FakeGateway, config: ProxyConfig) -> LifecycleOrchestrator {
        LifecycleOrchestrator::new(Arc::new(gateway.clone()), Arc::new(config))
    }

    fn auto_create_config() -> ProxyConfig {
        ProxyConfig {
            auto_create: true,
            create: Some(CreateStrategy::Template(ContainerTemplate::new("nginx", 80))),
            ..Default::default()
        }
    }

    struct CreateFromImage {
        image: String,
    }

    #[async_trait]
    impl CreateInstance for CreateFromImage {
        async fn create(&self, gateway: &dyn RuntimeGateway, name: &str) -> Result<(), RuntimeError> {
            let template = ContainerTemplate::new(&self.image, 3000);
            gateway.create_instance(name, &template).await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_running_instance_is_not_started() {
        let gateway = FakeGateway::new().with_instance("alice", "Up 10 minutes", Some(40001));
        let descriptor = orchestrator(&gateway, ProxyConfig::default())
            .ensure_running("alice")
            .await
            .unwrap();

        assert_eq!(descriptor.target, Some(Target::new("127.0.0.1", 40001)));
        assert!(gateway.lifecycle_calls().is_empty());
        assert_eq!(gateway.list_count(), 1);
    }

    #[tokio::test]
    async fn test_stopped_instance_uses_post_start_port() {
        // Stale port from before the restart must never be dispatched to
        let gateway = FakeGateway::new().with_instance("alice", "Exited (0) 1 hour ago", Some(40001));
        let descriptor = orchestrator(&gateway, ProxyConfig::default())
            .ensure_running("alice")
            .await
            .unwrap();

        assert_eq!(gateway.lifecycle_calls(), vec![GatewayCall::Start("alice".to_string())]);
        assert_eq!(descriptor.published_port, Some(49200));
        assert_eq!(descriptor.target, Some(Target::new("127.0.0.1", 49200)));
        assert!(descriptor.is_running());

        let calls = gateway.calls();
        let start = calls
            .iter()
            .position(|c| *c == GatewayCall::Start("alice".to_string()))
            .unwrap();
        assert_eq!(calls.get(start + 1), Some(&GatewayCall::List));
    }

    #[tokio::test]
    async fn test_absent_without_auto_create_is_not_found() {
        let gateway = FakeGateway::new();
        let err = orchestrator(&gateway, ProxyConfig::default())
            .ensure_running("carol")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            WorkloadError::NotFound { reason: NotFoundReason::AutoCreateDisabled, .. }
        ));
        assert!(gateway.lifecycle_calls().is_empty());
    }

    #[tokio::test]
    async fn test_auto_create_without_strategy_is_not_found() {
        let gateway = FakeGateway::new();
        let config = ProxyConfig {
            auto_create: true,
            ..Default::default()
        };
        let err = orchestrator(&gateway, config)
            .ensure_running("carol")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            WorkloadError::NotFound { reason: NotFoundReason::NoCreateStrategy, .. }
        ));
        assert!(gateway.lifecycle_calls().is_empty());
    }

    #[tokio::test]
    async fn test_template_is_ignored_when_auto_create_is_off() {
        let gateway = FakeGateway::new();
        let config = ProxyConfig {
            auto_create: false,
            ..auto_create_config()
        };
        let err = orchestrator(&gateway, config)
            .ensure_running("carol")
            .await
            .unwrap_err();
        assert!(matches!(err, WorkloadError::NotFound { .. }));
        assert!(gateway.lifecycle_calls().is_empty());
    }

    #[tokio::test]
    async fn test_absent_with_auto_create_creates_then_starts() {
        let gateway = FakeGateway::new();
        let descriptor = orchestrator(&gateway, auto_create_config())
            .ensure_running("carol")
            .await
            .unwrap();

        assert_eq!(
            gateway.lifecycle_calls(),
            vec![
                GatewayCall::Create("carol".to_string()),
                GatewayCall::Start("carol".to_string()),
            ]
        );
        assert_eq!(descriptor.name, "carol");
        assert_eq!(descriptor.target, Some(Target::new("127.0.0.1", 49200)));
    }

    #[tokio::test]
    async fn test_custom_create_strategy() {
        let gateway = FakeGateway::new();
        let config = ProxyConfig {
            auto_create: true,
            create: Some(CreateStrategy::custom(CreateFromImage {
                image: "ghcr.io/acme/app".to_string(),
            })),
            ..Default::default()
        };
        let descriptor = orchestrator(&gateway, config)
            .ensure_running("dave")
            .await
            .unwrap();

        assert_eq!(
            gateway.lifecycle_calls(),
            vec![
                GatewayCall::Create("dave".to_string()),
                GatewayCall::Start("dave".to_string()),
            ]
        );
        assert!(descriptor.is_running());
    }

    #[tokio::test]
    async fn test_create_failure_propagates_without_start() {
        let gateway = FakeGateway::new();
        let config = ProxyConfig {
            auto_create: true,
            create: Some(CreateStrategy::Template(ContainerTemplate::new("", 80))),
            ..Default::default()
        };
        let err = orchestrator(&gateway, config)
            .ensure_running("carol")
            .await
            .unwrap_err();

        assert!(matches!(err, WorkloadError::Runtime(RuntimeError::Template(_))));
        assert_eq!(gateway.lifecycle_calls(), vec![GatewayCall::Create("carol".to_string())]);
    }

    #[tokio::test]
    async fn test_start_failure_propagates() {
        let gateway = FakeGateway::new().with_instance("alice", "Exited (1) 2 minutes ago", None);
        gateway.fail_start("OCI runtime create failed");
        let err = orchestrator(&gateway, ProxyConfig::default())
            .ensure_running("alice")
            .await
            .unwrap_err();

        assert!(matches!(err, WorkloadError::Runtime(RuntimeError::Start { .. })));
        assert_eq!(gateway.lifecycle_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_running_without_port_is_malformed() {
        let gateway = FakeGateway::new().with_instance("alice", "Up 3 hours", None);
        let err = orchestrator(&gateway, ProxyConfig::default())
            .ensure_running("alice")
            .await
            .unwrap_err();

        assert!(matches!(err, WorkloadError::MalformedInstance { ref name, .. } if name == "alice"));
        assert!(gateway.lifecycle_calls().is_empty());
    }

    #[tokio::test]
    async fn test_started_without_port_is_malformed() {
        let gateway = FakeGateway::new().with_instance("alice", "Exited (0) 1 day ago", None);
        gateway.start_without_port();
        let err = orchestrator(&gateway, ProxyConfig::default())
            .ensure_running("alice")
            .await
            .unwrap_err();

        assert!(matches!(err, WorkloadError::MalformedInstance { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_requests_start_once() {
        let gateway = FakeGateway::new().with_instance("alice", "Exited (0) 1 hour ago", None);
        gateway.start_delay(Duration::from_millis(50));
        let orchestrator = orchestrator(&gateway, ProxyConfig::default());

        let (first, second) = tokio::join!(
            orchestrator.ensure_running("alice"),
            orchestrator.ensure_running("alice")
        );

        assert_eq!(first.unwrap().target, second.unwrap().target);
        assert_eq!(gateway.lifecycle_calls(), vec![GatewayCall::Start("alice".to_string())]);
        assert!(orchestrator.transitions.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_requests_create_once() {
        let gateway = FakeGateway::new();
        gateway.start_delay(Duration::from_millis(50));
        let orchestrator = orchestrator(&gateway, auto_create_config());

        let (first, second, third) = tokio::join!(
            orchestrator.ensure_running("carol"),
            orchestrator.ensure_running("carol"),
            orchestrator.ensure_running("carol")
        );

        assert!(first.is_ok() && second.is_ok() && third.is_ok());
        assert_eq!(
            gateway.lifecycle_calls(),
            vec![
                GatewayCall::Create("carol".to_string()),
                GatewayCall::Start("carol".to_string()),
            ]
        );
        assert!(orchestrator.transitions.is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_request_still_completes_start() {
        let gateway = FakeGateway::new().with_instance("alice", "Exited (0) 1 hour ago", None);
        gateway.start_delay(Duration::from_millis(200));
        let orchestrator = orchestrator(&gateway, ProxyConfig::default());

        let abandoned =
            tokio::time::timeout(Duration::from_millis(50), orchestrator.ensure_running("alice")).await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(400)).await;

        let descriptor = orchestrator.resolver().resolve("alice").await.unwrap().unwrap();
        assert!(descriptor.is_running());
        assert_eq!(gateway.lifecycle_calls(), vec![GatewayCall::Start("alice".to_string())]);
        assert!(orchestrator.transitions.is_empty());

        // Next request finds it running and does not start it again
        orchestrator.ensure_running("alice").await.unwrap();
        assert_eq!(gateway.lifecycle_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_different_workloads_do_not_share_a_lock() {
        let gateway = FakeGateway::new()
            .with_instance("alice", "Exited (0) 1 hour ago", None)
            .with_instance("bob", "Exited (0) 1 hour ago", None);
        let orchestrator = orchestrator(&gateway, ProxyConfig::default());

        let (alice, bob) = tokio::join!(
            orchestrator.ensure_running("alice"),
            orchestrator.ensure_running("bob")
        );

        assert_ne!(alice.unwrap().target, bob.unwrap().target);
        assert_eq!(gateway.lifecycle_calls().len(), 2);
    }
}
