use crate::docker::parse_memory_limit;
use crate::lifecycle::CreateStrategy;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Container runtime connection settings
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Where the workload name is read from
    #[serde(default)]
    pub session: SessionConfig,

    /// Auto-creation settings
    #[serde(default)]
    pub workload: WorkloadConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// HTTP port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Maximum idle connections per backend host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Max time to wait for a backend response in seconds (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// Docker host URL (default: DOCKER_HOST, then common socket paths)
    pub docker_host: Option<String>,

    /// Host that published container ports are reachable on (default: 127.0.0.1)
    #[serde(default = "default_upstream_host")]
    pub upstream_host: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            docker_host: None,
            upstream_host: default_upstream_host(),
        }
    }
}

/// Where the workload name of a request comes from
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum SessionSource {
    /// Signed session cookie (HS256 JWT) carrying the name in a claim
    #[default]
    Cookie,
    /// Plain request header, for deployments behind a trusted auth proxy
    Header,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    #[serde(default)]
    pub source: SessionSource,

    /// Session cookie name (default: dockgate_session)
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,

    /// HMAC secret used to verify session tokens (required for cookie source)
    pub secret: Option<String>,

    /// Claim holding the workload name (default: container)
    #[serde(default = "default_claim")]
    pub claim: String,

    /// Header holding the workload name (default: x-dockgate-workload)
    #[serde(default = "default_session_header")]
    pub header: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            source: SessionSource::default(),
            cookie_name: default_cookie_name(),
            secret: None,
            claim: default_claim(),
            header: default_session_header(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct WorkloadConfig {
    /// Create missing containers on demand (default: false)
    #[serde(default)]
    pub auto_create: bool,

    /// Template used when creating a missing container
    pub template: Option<ContainerTemplate>,
}

/// Image pull policy applied before creating a container
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum PullPolicy {
    /// Pull if image doesn't exist locally (default)
    #[default]
    #[serde(alias = "if-not-present")]
    IfNotPresent,
    /// Always pull before creating
    Always,
    /// Never pull, fail if image doesn't exist
    Never,
}

/// Fixed container configuration. The workload name is merged in at
/// creation time and becomes the container name.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct ContainerTemplate {
    /// Docker image to run
    pub image: String,

    /// Port the application listens on inside the container.
    /// It is published on an ephemeral host port.
    pub port: u16,

    /// Command arguments
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment variables to set
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Extra container labels
    #[serde(default)]
    pub labels: HashMap<String, String>,

    /// Docker network to connect to (default: bridge)
    pub network: Option<String>,

    /// Memory limit (e.g., "512m", "1g")
    pub memory: Option<String>,

    /// CPU limit (e.g., "0.5", "2")
    pub cpus: Option<String>,

    /// Image pull policy: "always", "never", or "if-not-present" (default)
    #[serde(default)]
    pub pull_policy: PullPolicy,
}

impl ContainerTemplate {
    /// Create a template with defaults for everything but image and port
    pub fn new(image: &str, port: u16) -> Self {
        Self {
            image: image.to_string(),
            port,
            ..Default::default()
        }
    }

    /// Set environment variables (builder pattern)
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Set arguments (builder pattern)
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Validate the template
    pub fn validate(&self) -> Result<(), String> {
        if self.image.trim().is_empty() {
            return Err("workload template requires 'image' field".to_string());
        }
        if self.port == 0 {
            return Err("workload template: 'port' must be greater than 0".to_string());
        }
        if let Some(ref memory) = self.memory {
            parse_memory_limit(memory)
                .map_err(|_| format!("workload template: invalid memory limit '{}'", memory))?;
        }
        if let Some(ref cpus) = self.cpus {
            cpus.parse::<f64>()
                .map_err(|_| format!("workload template: invalid CPU limit '{}'", cpus))?;
        }
        Ok(())
    }
}

/// Immutable per-process proxy settings read by every request
#[derive(Clone)]
pub struct ProxyConfig {
    /// Whether a missing instance may be provisioned
    pub auto_create: bool,
    /// How to provision a missing instance
    pub create: Option<CreateStrategy>,
    /// Host used when building targets from published ports
    pub upstream_host: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            auto_create: false,
            create: None,
            upstream_host: default_upstream_host(),
        }
    }
}

impl std::fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("auto_create", &self.auto_create)
            .field("create", &self.create.as_ref().map(CreateStrategy::kind))
            .field("upstream_host", &self.upstream_host)
            .finish()
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10 // Keep up to 10 idle connections per backend
}

fn default_pool_idle_timeout() -> u64 {
    90 // Close idle connections after 90 seconds
}

fn default_request_timeout() -> u64 {
    30
}

fn default_upstream_host() -> String {
    "127.0.0.1".to_string()
}

fn default_cookie_name() -> String {
    "dockgate_session".to_string()
}

fn default_claim() -> String {
    "container".to_string()
}

fn default_session_header() -> String {
    "x-dockgate-workload".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.session.source == SessionSource::Cookie
            && self.session.secret.as_deref().map_or(true, str::is_empty)
        {
            errors.push("session: cookie source requires 'secret'".to_string());
        }
        if self.session.source == SessionSource::Header
            && hyper::header::HeaderName::from_bytes(self.session.header.as_bytes()).is_err()
        {
            errors.push(format!("session: invalid header name '{}'", self.session.header));
        }

        if let Some(ref template) = self.workload.template {
            if let Err(e) = template.validate() {
                errors.push(e);
            }
        }

        if self.runtime.upstream_host.trim().is_empty() {
            errors.push("runtime: 'upstream_host' must not be empty".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Build the immutable proxy settings from this configuration
    pub fn proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            auto_create: self.workload.auto_create,
            create: self.workload.template.clone().map(CreateStrategy::Template),
            upstream_host: self.runtime.upstream_host.clone(),
        }
    }
}
