use anyhow::{Context, Result};
use dataset_service::{
    start_api_server, AppState, Config, DatasetService, MergeCache, PgMetadataStore,
    S3ObjectStore, ServiceLimits,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How long in-flight requests get to finish after a shutdown signal
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting dataset service"
    );

    init_metrics(config.service.metrics_port)?;

    let metadata_store = Arc::new(
        PgMetadataStore::new(&config.database)
            .await
            .context("Failed to initialize metadata store")?,
    );

    if config.database.run_migrations {
        metadata_store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let object_store = Arc::new(
        S3ObjectStore::new(&config.s3)
            .await
            .context("Failed to initialize object store")?,
    );

    if config.s3.create_bucket {
        object_store
            .ensure_bucket()
            .await
            .context("Failed to prepare S3 bucket")?;
    }

    let cache = Arc::new(MergeCache::new(config.cache_ttl()));
    let shutdown = CancellationToken::new();
    let sweeper_handle = cache.spawn_sweeper(config.cache_sweep_interval(), shutdown.clone());

    let service = Arc::new(DatasetService::new(
        metadata_store,
        object_store,
        cache,
        ServiceLimits::from_config(&config),
    ));

    let api_state = AppState {
        service,
        default_page_size: config.api.default_page_size,
    };

    let api_config = config.api.clone();
    let api_shutdown = shutdown.clone();
    let mut api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config, api_shutdown).await {
            error!(error = %e, "API server error");
        }
    });

    info!(
        cache_ttl_secs = config.cache.ttl_secs,
        "Dataset service started successfully"
    );

    let api_running = tokio::select! {
        _ = shutdown_signal() => true,
        _ = &mut api_handle => {
            warn!("API server exited unexpectedly");
            false
        }
    };

    info!("Shutting down dataset service");
    shutdown.cancel();

    if api_running && tokio::time::timeout(SHUTDOWN_GRACE, &mut api_handle).await.is_err() {
        warn!("API server did not drain in time, aborting");
        api_handle.abort();
    }
    if let Err(e) = sweeper_handle.await {
        warn!(error = %e, "Merge cache sweeper ended abnormally");
    }

    info!("Dataset service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
