use anyhow::Context;
use lb_node::bootstrap::wait_for_registry;
use lb_node::config::Config;
use lb_node::error::SupervisorError;
use lb_node::install::Installer;
use lb_node::process::{ProcessSupervisor, ProxyBinary};
use lb_node::reconcile::Reconciler;
use lb_node::registry::{EtcdClient, Registry, Revision};
use lb_node::watch::WatchLoop;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinError;
use tracing::{error, info, warn, Instrument};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("lb_node=info".parse().context("invalid log directive")?),
        )
        .init();

    // Optional configuration file; defaults and environment otherwise
    let config_path = std::env::args().nth(1).map(PathBuf::from);

    let config = Config::resolve(config_path.as_deref()).map_err(|e| {
        error!(error = %e, "Failed to load configuration");
        e
    })?;

    // Everything from bootstrap on logs under the node's identity
    let span = config.node_span();
    run(config, config_path).instrument(span).await
}

async fn run(config: Config, config_path: Option<PathBuf>) -> anyhow::Result<()> {
    print_startup_banner(&config, config_path.as_deref());

    // Block until the registry answers
    let mut backoff = config.backoff.build();
    let client = wait_for_registry(
        || EtcdClient::connect(&config.registry.endpoint, config.registry.dial_timeout()),
        config.registry.probe_timeout(),
        &mut *backoff,
    )
    .await;
    let registry: Arc<dyn Registry> = Arc::new(client);

    // The proxy binary both checks candidates and runs the live config
    let proxy = Arc::new(ProxyBinary::new(&config.proxy.binary));
    let installer = Installer::new(
        &config.proxy.config_path,
        &config.proxy.staging_path,
        proxy.clone(),
    );
    let supervisor = Arc::new(ProcessSupervisor::new(proxy));
    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&registry),
        &config.registry.prefix,
        config.registry.fetch_timeout(),
        config.render.clone(),
        installer,
        supervisor,
    ));

    // Nothing to fall back to if the first read or spawn fails
    let (start, _) = reconciler.first_activation().await?;

    // Watch loop runs in the background from here on
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (resync_tx, resync_rx) = mpsc::channel(1);

    let watch_loop = WatchLoop::new(
        registry,
        reconciler,
        &config.registry.prefix,
        start,
        backoff,
        resync_rx,
        shutdown_rx,
    );
    let mut watch_task = tokio::spawn(watch_loop.run().in_current_span());

    // Wait for shutdown signal (Ctrl+C or SIGTERM), resync request (SIGHUP),
    // or the watch loop dying on a fatal error
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        let mut sighup =
            signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    match resync_tx.try_send(()) {
                        Ok(()) => info!("Received SIGHUP, full resync queued"),
                        Err(TrySendError::Full(())) => info!("Received SIGHUP, resync already pending"),
                        Err(TrySendError::Closed(())) => warn!("Received SIGHUP, but watch loop is gone"),
                    }
                }
                result = &mut watch_task => {
                    return watch_finished(result);
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl+C")?;
                info!("Received Ctrl+C, shutting down...");
            }
            result = &mut watch_task => {
                return watch_finished(result);
            }
        }
    }

    // Stop watching; the running proxy keeps serving
    let _ = shutdown_tx.send(true);
    drop(resync_tx);
    let result = watch_task.await;
    watch_finished(result)?;

    info!("Shutdown complete");
    Ok(())
}

fn watch_finished(result: Result<Result<Revision, SupervisorError>, JoinError>) -> anyhow::Result<()> {
    match result {
        Ok(Ok(cursor)) => {
            info!(cursor = %cursor, "Watch loop finished");
            Ok(())
        }
        Ok(Err(e)) => {
            error!(error = %e, "Proxy could not be started, exiting");
            Err(e.into())
        }
        Err(e) => {
            error!(error = %e, "Watch loop task failed");
            Err(e.into())
        }
    }
}

fn print_startup_banner(config: &Config, config_path: Option<&Path>) {
    info!(
        name = PKG_NAME,
        version = VERSION,
        node_id = %config.node_id,
        "Starting load balancer node"
    );
    let source = config_path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "<defaults>".to_string());
    info!(
        config = %source,
        endpoint = %config.registry.endpoint,
        prefix = %config.registry.prefix,
        "Registry settings"
    );
    info!(
        binary = %config.proxy.binary.display(),
        config = %config.proxy.config_path.display(),
        staging = %config.proxy.staging_path.display(),
        frontend_port = config.render.frontend_port,
        stats_port = config.render.stats_port,
        "Proxy settings"
    );
    info!(
        strategy = ?config.backoff.strategy,
        initial_ms = config.backoff.initial_ms,
        max_ms = config.backoff.max_ms,
        "Retry backoff"
    );
}
