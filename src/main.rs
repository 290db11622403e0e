use dockgate::config::Config;
use dockgate::docker::DockerGateway;
use dockgate::middleware::{not_found, WorkloadProxy};
use dockgate::pool::{ConnectionPool, PoolConfig};
use dockgate::server::ProxyServer;
use dockgate::session;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("dockgate=debug".parse()?),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    if config.workload.auto_create && config.workload.template.is_none() {
        warn!("auto_create is enabled but no [workload.template] is configured; missing containers will not be created");
    }

    let gateway = DockerGateway::connect(config.runtime.docker_host.as_deref()).await?;

    let pool_config = PoolConfig::from(&config.server);
    let pool = ConnectionPool::new(pool_config);

    let extractor = session::from_config(&config.session)
        .map_err(|e| anyhow::anyhow!("Invalid session configuration: {}", e))?;

    let proxy = WorkloadProxy::new(
        Arc::new(gateway),
        Arc::new(pool),
        extractor,
        config.proxy_config(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let server = ProxyServer::bind(addr, proxy.service(Arc::new(not_found)), shutdown_rx).await?;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    wait_for_signal().await?;

    let _ = shutdown_tx.send(true);

    // In-flight connections finish on their own tasks; only the accept loop is awaited
    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting proxy server");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        request_timeout_secs = config.server.request_timeout_secs,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        docker_host = config.runtime.docker_host.as_deref().unwrap_or("auto"),
        upstream_host = %config.runtime.upstream_host,
        "Runtime settings"
    );
    info!(
        source = ?config.session.source,
        cookie_name = %config.session.cookie_name,
        claim = %config.session.claim,
        "Session settings"
    );
    info!(
        auto_create = config.workload.auto_create,
        image = config.workload.template.as_ref().map(|t| t.image.as_str()),
        "Workload settings"
    );
}
