mod admission;
mod cli;
mod error;
mod routes;
mod state;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use scanforge_core::config::ServiceConfig;
use scanforge_core::idempotency::IdempotencyCache;
use scanforge_core::kv::{KvStore, RedisKvStore};
use scanforge_core::model::ScannerConfig;
use scanforge_core::task_store::TaskStore;
use scanforge_engine::breaker::BreakerOptions;
use scanforge_engine::housekeeping::{Housekeeper, HousekeepingOptions};
use scanforge_engine::metrics::Metrics;
use scanforge_engine::queue::QueueManager;
use scanforge_engine::registry::Registry;
use scanforge_engine::validator;
use scanforge_engine::worker::{Worker, WorkerOptions};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cli::Cli;
use crate::state::AppState;

fn load_scanner_config(path: &std::path::Path) -> anyhow::Result<ScannerConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading scanner config at {}", path.display()))?;
    let config: ScannerConfig =
        serde_yaml::from_str(&contents).with_context(|| format!("parsing scanner config at {}", path.display()))?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = ServiceConfig::from_env();
    if let Some(path) = &cli.scanner_config {
        config.scanner_config_path = path.clone();
    }
    let config = Arc::new(config);

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(config.log_level.clone()))
        .init();

    info!(bind_addr = %cli.bind_addr, "starting scanforge-server");

    let kv: Arc<dyn KvStore> = Arc::new(
        RedisKvStore::connect(&config.kv_url)
            .await
            .with_context(|| format!("connecting to redis at {}", config.kv_url))?,
    );

    let task_store = TaskStore::new(config.data_dir.clone());
    let queue = QueueManager::new(kv.clone());
    let idempotency = Arc::new(IdempotencyCache::new(kv.clone(), config.idempotency_ttl));
    let metrics = Metrics::new().context("registering metrics")?;

    let scanner_config = load_scanner_config(&config.scanner_config_path)?;
    let registry = Registry::from_config(&scanner_config, BreakerOptions::default())
        .context("building scanner registry")?;

    let plugin_table_path = cli
        .plugin_table
        .clone()
        .unwrap_or_else(|| std::path::PathBuf::from("./plugin_ids.yaml"));
    let plugin_table = validator::load_plugin_table(&plugin_table_path);

    let worker_options = WorkerOptions {
        poll_interval: config.poll_interval,
        scan_ceiling: config.scan_ceiling,
        ..WorkerOptions::default()
    };
    let worker = Worker::new(
        task_store.clone(),
        queue.clone(),
        registry.clone(),
        worker_options,
        plugin_table,
        metrics.clone(),
    );
    let worker_cancel = worker.cancellation_token();

    let housekeeping_options = HousekeepingOptions {
        completed_ttl: config.completed_ttl,
        failed_ttl: config.failed_ttl,
        stale_running_threshold: config.stale_running_threshold,
        sweep_interval: config.housekeeping_interval,
    };
    let housekeeper = Housekeeper::new(task_store.clone(), registry.clone(), housekeeping_options, metrics.clone());

    let shutdown_token = CancellationToken::new();
    let shutdown_deadline = config.shutdown_deadline;

    let worker_handle = tokio::spawn({
        let worker = worker.clone();
        async move { worker.run(shutdown_deadline).await }
    });
    let housekeeper_handle = tokio::spawn({
        let housekeeper = housekeeper.clone();
        let token = shutdown_token.clone();
        async move { housekeeper.run(token).await }
    });

    tokio::spawn(signal_loop(registry.clone(), config.clone(), worker_cancel, shutdown_token.clone()));

    let app_state = AppState {
        task_store,
        queue,
        registry,
        idempotency,
        metrics,
        kv,
        config: config.clone(),
    };
    let app = routes::build_router(app_state);

    let listener = tokio::net::TcpListener::bind(&cli.bind_addr)
        .await
        .with_context(|| format!("binding {}", cli.bind_addr))?;

    let shutdown_signal = {
        let token = shutdown_token.clone();
        async move { token.cancelled().await }
    };
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("http server failed")?;

    if let Err(e) = worker_handle.await {
        error!(error = %e, "worker task panicked");
    }
    if let Err(e) = housekeeper_handle.await {
        error!(error = %e, "housekeeper task panicked");
    }

    Ok(())
}

/// Listens for SIGTERM/SIGINT (graceful shutdown) and SIGHUP (scanner config
/// hot-reload, spec §4.7, §9) for the lifetime of the process.
async fn signal_loop(
    registry: Arc<Registry>,
    config: Arc<ServiceConfig>,
    worker_cancel: CancellationToken,
    shutdown_token: CancellationToken,
) {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            return;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install SIGINT handler");
            return;
        }
    };
    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install SIGHUP handler");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
                worker_cancel.cancel();
                shutdown_token.cancel();
                break;
            }
            _ = sigint.recv() => {
                info!("received SIGINT, shutting down");
                worker_cancel.cancel();
                shutdown_token.cancel();
                break;
            }
            _ = sighup.recv() => {
                info!("received SIGHUP, reloading scanner config");
                match load_scanner_config(&config.scanner_config_path) {
                    Ok(scanner_config) => {
                        if let Err(e) = registry.reload(&scanner_config) {
                            warn!(error = %e, "scanner config reload failed");
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to read scanner config for reload"),
                }
            }
        }
    }
}
