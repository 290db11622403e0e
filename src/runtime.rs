//! Container runtime control-plane abstraction
//!
//! The proxy only ever needs three operations from the runtime: list every
//! container (stopped ones included), create one from a template, and start
//! one by name. [`DockerGateway`](crate::docker::DockerGateway) is the
//! production implementation.

use crate::config::ContainerTemplate;
use async_trait::async_trait;
use thiserror::Error;

/// A published port reported by the runtime for a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    /// Port the application listens on inside the container
    pub private_port: u16,
    /// Host port the runtime forwards to `private_port`
    pub public_port: u16,
    /// Host interface the port is bound to, if reported
    pub host_ip: Option<String>,
}

/// A single container as reported by a list call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceSummary {
    pub id: String,
    /// Registered names exactly as the runtime reports them.
    /// Docker prefixes each name with `/`.
    pub names: Vec<String>,
    /// Free-text status, e.g. `Up 3 minutes` or `Exited (0) 2 hours ago`
    pub status: String,
    /// Published ports only, in the order the runtime reported them
    pub ports: Vec<PortMapping>,
}

/// Errors from runtime control-plane calls
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to list containers: {0}")]
    List(String),

    #[error("failed to create container '{name}': {message}")]
    Create { name: String, message: String },

    #[error("failed to start container '{name}': {message}")]
    Start { name: String, message: String },

    #[error("invalid container template: {0}")]
    Template(String),

    /// Failure reported by a custom create function
    #[error("{0}")]
    Other(String),
}

/// Control-plane operations against a container runtime
#[async_trait]
pub trait RuntimeGateway: Send + Sync {
    /// List containers. With `all` set, stopped containers are included.
    async fn list_instances(&self, all: bool) -> Result<Vec<InstanceSummary>, RuntimeError>;

    /// Create (but do not start) a container named `name` from `template`.
    /// Returns the runtime's identifier for the new container.
    async fn create_instance(
        &self,
        name: &str,
        template: &ContainerTemplate,
    ) -> Result<String, RuntimeError>;

    /// Start an existing container by name
    async fn start_instance(&self, name: &str) -> Result<(), RuntimeError>;
}

#[cfg(test)]
pub(crate) mod fake {
    use super::{InstanceSummary, PortMapping, RuntimeError, RuntimeGateway};
    use crate::config::ContainerTemplate;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    /// Recorded gateway call
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum GatewayCall {
        List,
        Create(String),
        Start(String),
    }

    struct FakeState {
        instances: Vec<InstanceSummary>,
        calls: Vec<GatewayCall>,
        next_port: u16,
        start_delay: Duration,
        fail_list: Option<String>,
        fail_start: Option<String>,
        start_without_port: bool,
    }

    /// In-memory runtime that records every call.
    ///
    /// Starting an instance marks it `Up` and publishes a fresh host port,
    /// so a restart always moves the instance to a new port.
    #[derive(Clone)]
    pub struct FakeGateway {
        inner: Arc<Mutex<FakeState>>,
    }

    impl Default for FakeGateway {
        fn default() -> Self {
            Self {
                inner: Arc::new(Mutex::new(FakeState {
                    instances: Vec::new(),
                    calls: Vec::new(),
                    next_port: 49200,
                    start_delay: Duration::ZERO,
                    fail_list: None,
                    fail_start: None,
                    start_without_port: false,
                })),
            }
        }
    }

    impl FakeGateway {
        pub fn new() -> Self {
            Self::default()
        }

        /// Seed an instance with the given status and optional published port
        pub fn with_instance(self, name: &str, status: &str, port: Option<u16>) -> Self {
            self.inner.lock().instances.push(InstanceSummary {
                id: format!("id-{}", name),
                names: vec![format!("/{}", name)],
                status: status.to_string(),
                ports: port
                    .map(|p| {
                        vec![PortMapping {
                            private_port: 8080,
                            public_port: p,
                            host_ip: Some("127.0.0.1".to_string()),
                        }]
                    })
                    .unwrap_or_default(),
            });
            self
        }

        pub fn fail_list(&self, message: &str) {
            self.inner.lock().fail_list = Some(message.to_string());
        }

        pub fn fail_start(&self, message: &str) {
            self.inner.lock().fail_start = Some(message.to_string());
        }

        pub fn start_delay(&self, delay: Duration) {
            self.inner.lock().start_delay = delay;
        }

        /// Make started instances come up without publishing a port
        pub fn start_without_port(&self) {
            self.inner.lock().start_without_port = true;
        }

        pub fn calls(&self) -> Vec<GatewayCall> {
            self.inner.lock().calls.clone()
        }

        /// Create and start calls only, in order
        pub fn lifecycle_calls(&self) -> Vec<GatewayCall> {
            self.calls()
                .into_iter()
                .filter(|c| !matches!(c, GatewayCall::List))
                .collect()
        }

        pub fn list_count(&self) -> usize {
            self.calls()
                .iter()
                .filter(|c| matches!(c, GatewayCall::List))
                .count()
        }
    }

    #[async_trait]
    impl RuntimeGateway for FakeGateway {
        async fn list_instances(&self, all: bool) -> Result<Vec<InstanceSummary>, RuntimeError> {
            let mut state = self.inner.lock();
            state.calls.push(GatewayCall::List);
            if let Some(ref message) = state.fail_list {
                return Err(RuntimeError::List(message.clone()));
            }
            Ok(state
                .instances
                .iter()
                .filter(|i| all || i.status.starts_with("Up "))
                .cloned()
                .collect())
        }

        async fn create_instance(
            &self,
            name: &str,
            template: &ContainerTemplate,
        ) -> Result<String, RuntimeError> {
            let mut state = self.inner.lock();
            state.calls.push(GatewayCall::Create(name.to_string()));
            if template.image.is_empty() {
                return Err(RuntimeError::Template("missing image".to_string()));
            }
            let id = format!("id-{}", name);
            state.instances.push(InstanceSummary {
                id: id.clone(),
                names: vec![format!("/{}", name)],
                status: "Created".to_string(),
                ports: Vec::new(),
            });
            Ok(id)
        }

        async fn start_instance(&self, name: &str) -> Result<(), RuntimeError> {
            let delay = {
                let mut state = self.inner.lock();
                state.calls.push(GatewayCall::Start(name.to_string()));
                if let Some(ref message) = state.fail_start {
                    return Err(RuntimeError::Start {
                        name: name.to_string(),
                        message: message.clone(),
                    });
                }
                state.start_delay
            };

            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let mut state = self.inner.lock();
            let port = state.next_port;
            state.next_port += 1;
            let without_port = state.start_without_port;
            let wanted = format!("/{}", name);
            let instance = state
                .instances
                .iter_mut()
                .find(|i| i.names.first() == Some(&wanted))
                .ok_or_else(|| RuntimeError::Start {
                    name: name.to_string(),
                    message: "no such container".to_string(),
                })?;
            instance.status = "Up Less than a second".to_string();
            instance.ports = if without_port {
                Vec::new()
            } else {
                vec![PortMapping {
                    private_port: 8080,
                    public_port: port,
                    host_ip: Some("127.0.0.1".to_string()),
                }]
            };
            Ok(())
        }
    }
}
