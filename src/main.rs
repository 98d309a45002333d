//! jobproxy - Entry Point
//!
//! Starts local forwarding proxies for the configured upstreams and stops them
//! on Ctrl+C or SIGTERM.

use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use jobproxy::config::{Config, LogConfig, RunMode};
use jobproxy::{ForwardingServer, PoolManager, Result};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config.log);

    info!("Starting jobproxy");

    let servers = match config.proxy.mode {
        RunMode::Single => vec![start_single(&config).await?],
        RunMode::Pool => start_pool(&config).await?,
    };

    shutdown_signal().await;
    info!("Shutdown signal received");

    for server in &servers {
        server.stop().await;
    }

    info!("jobproxy stopped");
    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("jobproxy={}", log.level).into());
    let registry = tracing_subscriber::registry().with(filter);

    if log.format == "pretty" {
        registry.with(fmt::layer().pretty()).init();
    } else {
        registry.with(fmt::layer().json()).init();
    }
}

/// One server on PROXY_LOCAL_PORT with fallback across every upstream
async fn start_single(config: &Config) -> Result<ForwardingServer> {
    let server = ForwardingServer::with_fallback(config.require_urls()?, config.proxy.local_port)?
        .with_config(config.forwarder_config());
    server.start().await?;

    info!(
        local_url = %server.local_url(),
        proxies = server.proxy_count(),
        "Forwarding server ready"
    );
    Ok(server)
}

/// One pool-issued server per job
async fn start_pool(config: &Config) -> Result<Vec<ForwardingServer>> {
    let pool = PoolManager::with_config(config.require_urls()?, config.pool_config())?;
    let jobs = match config.proxy.jobs {
        0 => pool.proxy_count(),
        n => n,
    };

    let mut servers = Vec::with_capacity(jobs);
    for i in 1..=jobs {
        let job_id = format!("job-{}", i);
        match pool.acquire_server_for_job(&job_id).await {
            Ok(server) => {
                info!(
                    job_id = %job_id,
                    local_url = %server.local_url(),
                    endpoint = %server.current_proxy(),
                    "Job server ready"
                );
                servers.push(server);
            }
            Err(e) => {
                error!(job_id = %job_id, "Failed to acquire job server: {}", e);
                for server in &servers {
                    server.stop().await;
                }
                return Err(e);
            }
        }
    }

    match serde_json::to_string(&pool.stats()) {
        Ok(stats) => info!(stats = %stats, "Pool stats"),
        Err(e) => warn!("Failed to serialize pool stats: {}", e),
    }

    Ok(servers)
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
