use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use wakegate::config::{GatewayConfig, RoutingState, SharedRouting};
use wakegate::discovery::DiscoveryManager;
use wakegate::docker::{ContainerRuntime, DockerClient};
use wakegate::manager::ContainerManager;
use wakegate::server::Server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("wakegate=info".parse().expect("valid log directive")),
        )
        .init();

    // Config path comes from CONFIG_PATH; any load/parse/validation error is
    // fatal at startup.
    let config = GatewayConfig::load().map_err(|e| {
        error!(error = %e, "failed to load configuration");
        e
    })?;
    info!(
        containers = config.containers.len(),
        groups = config.groups.len(),
        port = %config.gateway.port,
        "configuration loaded"
    );

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerClient::new().await.map_err(|e| {
        error!(error = %e, "failed to initialize Docker client");
        e
    })?);

    let manager = Arc::new(ContainerManager::new(Arc::clone(&runtime)));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let routing: SharedRouting = Arc::new(parking_lot::RwLock::new(Arc::new(
        RoutingState::build(config.clone()),
    )));

    // Discovery merges labelled containers into the static catalog and swaps
    // the routing snapshot on change. The listen port and admin-auth mode
    // stay as bound at startup.
    let discovery = Arc::new(DiscoveryManager::new(
        Arc::clone(&runtime),
        config.clone(),
        {
            let routing = Arc::clone(&routing);
            Box::new(move |cfg: GatewayConfig| {
                info!(containers = cfg.containers.len(), "routing configuration updated");
                *routing.write() = Arc::new(RoutingState::build(cfg));
            })
        },
    ));
    {
        let discovery = Arc::clone(&discovery);
        let interval = config.gateway.discovery_interval;
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            discovery.run(interval, shutdown_rx).await;
        });
    }

    let _sweeper = Arc::clone(&manager).spawn_idle_sweeper(Arc::clone(&routing), shutdown_rx.clone());

    let server = Arc::new(Server::new(
        Arc::clone(&manager),
        Arc::clone(&routing),
        shutdown_rx.clone(),
    ));
    let mut server_task = tokio::spawn(server.run());

    // Signal loop: SIGINT/SIGTERM shut down, SIGHUP re-reads the config and
    // forces a discovery pass.
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sighup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");

        loop {
            tokio::select! {
                result = &mut server_task => {
                    // The server exited on its own (e.g. listener bind failure).
                    let _ = shutdown_tx.send(true);
                    return result.map_err(|e| anyhow::anyhow!("server task failed: {e}"))?;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("received SIGINT, shutting down");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM, shutting down");
                    break;
                }
                _ = sighup.recv() => {
                    info!("received SIGHUP, reloading configuration");
                    match GatewayConfig::load() {
                        Ok(new_config) => discovery.update_static(new_config).await,
                        Err(e) => {
                            error!(error = %e, "failed to reload configuration, keeping previous");
                        }
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            result = &mut server_task => {
                let _ = shutdown_tx.send(true);
                return result.map_err(|e| anyhow::anyhow!("server task failed: {e}"))?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received Ctrl+C, shutting down");
            }
        }
    }

    let _ = shutdown_tx.send(true);
    match tokio::time::timeout(Duration::from_secs(16), &mut server_task).await {
        Ok(result) => result.map_err(|e| anyhow::anyhow!("server task failed: {e}"))??,
        Err(_) => error!("server did not stop within the grace period"),
    }

    info!("shutdown complete");
    Ok(())
}
