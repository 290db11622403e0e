//! Docker implementation of the runtime gateway

use crate::config::{ContainerTemplate, PullPolicy};
use crate::runtime::{InstanceSummary, PortMapping, RuntimeError, RuntimeGateway};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, StartContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerSummary, HostConfig, PortBinding};
use bollard::{Docker, API_DEFAULT_VERSION};
use futures::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

/// Label attached to every container created by the proxy
pub const WORKLOAD_LABEL: &str = "dockgate.workload";

/// Seconds bollard waits on a daemon call before giving up
const DAEMON_TIMEOUT_SECS: u64 = 120;

/// Talks to the Docker daemon on behalf of the proxy
pub struct DockerGateway {
    client: Docker,
}

impl DockerGateway {
    /// Connect to the daemon named by `docker_host`, then `DOCKER_HOST`, then
    /// the first local socket that exists, and ping it.
    pub async fn connect(docker_host: Option<&str>) -> anyhow::Result<Self> {
        let host = docker_host
            .map(str::to_string)
            .or_else(|| std::env::var("DOCKER_HOST").ok());

        let client = match host {
            Some(ref host) => connect_to_host(host)?,
            None => match local_socket() {
                Some(path) => {
                    debug!(path, "Using local Docker socket");
                    Docker::connect_with_socket(&path, DAEMON_TIMEOUT_SECS, API_DEFAULT_VERSION)?
                }
                None => Docker::connect_with_socket_defaults()?,
            },
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon at {} is not responding: {}",
                host.as_deref().unwrap_or("the local socket"),
                e
            )
        })?;

        debug!("Connected to Docker daemon");
        Ok(Self::from_client(client))
    }

    /// Wrap an already-configured bollard client
    pub fn from_client(client: Docker) -> Self {
        Self { client }
    }

    /// Make `image` available locally according to `policy`
    async fn ensure_image(&self, image: &str, policy: &PullPolicy) -> Result<(), String> {
        let present = match policy {
            PullPolicy::Always => false,
            _ => self.client.inspect_image(image).await.is_ok(),
        };
        if present {
            return Ok(());
        }
        if *policy == PullPolicy::Never {
            return Err(format!("image '{}' is not present and pull_policy is 'never'", image));
        }

        info!(image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut progress = self.client.create_image(Some(options), None, None);
        while let Some(update) = progress.next().await {
            let update = update.map_err(|e| format!("pull of '{}' failed: {}", image, e))?;
            if let Some(error) = update.error {
                return Err(format!("pull of '{}' failed: {}", image, error));
            }
            if let Some(status) = update.status {
                debug!(image, status, "Pull progress");
            }
        }

        info!(image, "Image pulled");
        Ok(())
    }
}

/// Client for an explicit `unix://` or `tcp://` daemon address
fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
    let client = if let Some(path) = host.strip_prefix("unix://") {
        Docker::connect_with_socket(path, DAEMON_TIMEOUT_SECS, API_DEFAULT_VERSION)
    } else if host.starts_with("tcp://") || host.starts_with("http://") {
        Docker::connect_with_http(host, DAEMON_TIMEOUT_SECS, API_DEFAULT_VERSION)
    } else {
        anyhow::bail!("unsupported docker_host '{}', expected unix:// or tcp://", host);
    };
    client.map_err(|e| anyhow::anyhow!("cannot connect to Docker at '{}': {}", host, e))
}

/// First existing socket among the system and rootless locations
fn local_socket() -> Option<String> {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR").ok();
    let home = std::env::var("HOME").ok();
    [
        Some("/var/run/docker.sock".to_string()),
        runtime_dir.map(|dir| format!("{}/docker.sock", dir)),
        home.map(|dir| format!("{}/.docker/run/docker.sock", dir)),
    ]
    .into_iter()
    .flatten()
    .find(|path| Path::new(path).exists())
}

#[async_trait]
impl RuntimeGateway for DockerGateway {
    async fn list_instances(&self, all: bool) -> Result<Vec<InstanceSummary>, RuntimeError> {
        let options = ListContainersOptions::<String> {
            all,
            ..Default::default()
        };

        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| RuntimeError::List(e.to_string()))?;

        Ok(containers.into_iter().map(summary_from_docker).collect())
    }

    async fn create_instance(
        &self,
        name: &str,
        template: &ContainerTemplate,
    ) -> Result<String, RuntimeError> {
        let container_config = container_config(name, template)?;

        self.ensure_image(&template.image, &template.pull_policy)
            .await
            .map_err(|message| RuntimeError::Create {
                name: name.to_string(),
                message,
            })?;

        let create_options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(create_options), container_config)
            .await
            .map_err(|e| RuntimeError::Create {
                name: name.to_string(),
                message: format!("from image '{}': {}", template.image, e),
            })?;

        info!(
            workload = name,
            container_id = %response.id,
            image = %template.image,
            "Created Docker container"
        );

        Ok(response.id)
    }

    async fn start_instance(&self, name: &str) -> Result<(), RuntimeError> {
        self.client
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| RuntimeError::Start {
                name: name.to_string(),
                message: e.to_string(),
            })?;

        info!(workload = name, "Started Docker container");
        Ok(())
    }
}

/// Convert a Docker list entry, keeping only ports published to the host
fn summary_from_docker(container: ContainerSummary) -> InstanceSummary {
    let ports = container
        .ports
        .unwrap_or_default()
        .into_iter()
        .filter_map(|p| {
            p.public_port.map(|public_port| PortMapping {
                private_port: p.private_port,
                public_port,
                host_ip: p.ip,
            })
        })
        .collect();

    InstanceSummary {
        id: container.id.unwrap_or_default(),
        names: container.names.unwrap_or_default(),
        status: container.status.unwrap_or_default(),
        ports,
    }
}

/// Build the Docker create config for `template` merged with the workload name
fn container_config(name: &str, template: &ContainerTemplate) -> Result<Config<String>, RuntimeError> {
    template.validate().map_err(RuntimeError::Template)?;

    let mut env: Vec<String> = template
        .env
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    env.push(format!("PORT={}", template.port));

    let mut labels = template.labels.clone();
    labels.insert(WORKLOAD_LABEL.to_string(), name.to_string());

    // Empty host port lets Docker pick a fresh one on every start
    let port_key = format!("{}/tcp", template.port);
    let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
    port_bindings.insert(
        port_key.clone(),
        Some(vec![PortBinding {
            host_ip: Some("127.0.0.1".to_string()),
            host_port: Some(String::new()),
        }]),
    );

    let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
    exposed_ports.insert(port_key, HashMap::new());

    let mut host_config = HostConfig {
        port_bindings: Some(port_bindings),
        network_mode: template.network.clone(),
        ..Default::default()
    };

    if let Some(ref memory) = template.memory {
        host_config.memory =
            Some(parse_memory_limit(memory).map_err(RuntimeError::Template)?);
    }
    if let Some(ref cpus) = template.cpus {
        let cpu_count: f64 = cpus
            .parse()
            .map_err(|_| RuntimeError::Template(format!("Invalid CPU limit: {}", cpus)))?;
        // NanoCPUs is CPUs * 1e9
        host_config.nano_cpus = Some((cpu_count * 1_000_000_000.0) as i64);
    }

    let cmd = if template.args.is_empty() {
        None
    } else {
        Some(template.args.clone())
    };

    Ok(Config {
        image: Some(template.image.clone()),
        cmd,
        env: Some(env),
        labels: Some(labels),
        exposed_ports: Some(exposed_ports),
        host_config: Some(host_config),
        ..Default::default()
    })
}

/// Bytes for a limit such as `512m`, `1g`, `64kb` or a plain byte count
pub(crate) fn parse_memory_limit(limit: &str) -> Result<i64, String> {
    let lower = limit.trim().to_ascii_lowercase();
    let unitless = lower.strip_suffix('b').unwrap_or(&lower);
    let (number, scale) = match unitless.chars().last() {
        Some('k') => (&unitless[..unitless.len() - 1], 1i64 << 10),
        Some('m') => (&unitless[..unitless.len() - 1], 1i64 << 20),
        Some('g') => (&unitless[..unitless.len() - 1], 1i64 << 30),
        _ => (unitless, 1),
    };
    number
        .parse::<f64>()
        .map(|n| (n * scale as f64) as i64)
        .map_err(|_| format!("Invalid memory limit: {}", limit))
}
