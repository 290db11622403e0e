//! Maps a workload name to a fresh snapshot of its container

use crate::runtime::{InstanceSummary, RuntimeError, RuntimeGateway};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Status prefix the runtime reports for a running container
pub const RUNNING_STATUS_PREFIX: &str = "Up ";

/// Address a single request is forwarded to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    host: String,
    port: u16,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Absolute backend URI for a request path
    pub fn uri(&self, path_and_query: &str) -> String {
        format!("http://{}{}", self, path_and_query)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Snapshot of a container at query time. Never cached between requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceDescriptor {
    pub name: String,
    pub status: String,
    /// Host port from the first published mapping
    pub published_port: Option<u16>,
    pub target: Option<Target>,
}

impl InstanceDescriptor {
    /// Descriptor for a container that was just created and never started
    pub fn not_started(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: String::new(),
            published_port: None,
            target: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status.starts_with(RUNNING_STATUS_PREFIX)
    }
}

/// Strip the runtime's leading `/` from a registered name
pub fn canonical_name(raw: &str) -> &str {
    raw.strip_prefix('/').unwrap_or(raw)
}

/// Looks up workload instances through the runtime gateway
#[derive(Clone)]
pub struct InstanceResolver {
    gateway: Arc<dyn RuntimeGateway>,
    upstream_host: String,
}

impl InstanceResolver {
    pub fn new(gateway: Arc<dyn RuntimeGateway>, upstream_host: impl Into<String>) -> Self {
        Self {
            gateway,
            upstream_host: upstream_host.into(),
        }
    }

    pub fn gateway(&self) -> &Arc<dyn RuntimeGateway> {
        &self.gateway
    }

    /// Find the instance registered as `name`.
    ///
    /// Stopped containers are included. Returns `Ok(None)` when nothing
    /// matches; the first match in list order wins.
    pub async fn resolve(&self, name: &str) -> Result<Option<InstanceDescriptor>, RuntimeError> {
        let instances = self.gateway.list_instances(true).await?;

        let found = instances.into_iter().find(|instance| {
            instance
                .names
                .first()
                .is_some_and(|registered| canonical_name(registered) == name)
        });

        let descriptor = found.map(|instance| self.describe(name, instance));
        debug!(
            workload = name,
            found = descriptor.is_some(),
            port = ?descriptor.as_ref().and_then(|d| d.published_port),
            "Resolved workload"
        );
        Ok(descriptor)
    }

    fn describe(&self, name: &str, instance: InstanceSummary) -> InstanceDescriptor {
        let published_port = instance.ports.first().map(|p| p.public_port);
        InstanceDescriptor {
            name: name.to_string(),
            status: instance.status,
            published_port,
            target: published_port.map(|port| Target::new(self.upstream_host.clone(), port)),
        }
    }
}
