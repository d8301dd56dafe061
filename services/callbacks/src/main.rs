use anyhow::{Context, Result};
use marsha_callbacks::notifier::{self, KafkaUploadPublisher, LoggingSubscriber};
use marsha_callbacks::{
    start_api_server, AppState, Config, EventDispatcher, KeyParser, PgUploadStore,
    SignatureValidator, UploadStateUpdater,
};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Marsha callbacks service"
    );

    if config.signature.shared_secrets.is_empty() {
        warn!("No callback shared secret configured, every callback will be rejected");
    }

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let store = Arc::new(
        PgUploadStore::new(&config.database)
            .await
            .context("Failed to initialize upload store")?,
    );

    // Run migrations if enabled
    if config.database.run_migrations {
        store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let parser =
        KeyParser::new(&config.uploads.track_modes).context("Invalid timed text track modes")?;

    // Event bus
    let (events, receiver) = notifier::channel(config.events.channel_capacity);
    let mut dispatcher = EventDispatcher::new(receiver).subscribe(Arc::new(LoggingSubscriber));
    if config.kafka.bootstrap_servers.is_some() {
        let publisher = KafkaUploadPublisher::new(&config.kafka)
            .context("Failed to initialize Kafka upload publisher")?;
        dispatcher = dispatcher.subscribe(Arc::new(publisher));
    }

    // Create API state
    let api_state = AppState {
        updater: Arc::new(UploadStateUpdater::new(parser, store.clone(), events)),
        store,
        validator: Arc::new(SignatureValidator::new(
            config.signature.shared_secrets.iter().cloned(),
        )),
    };

    let api_shutdown = CancellationToken::new();
    let dispatcher_shutdown = CancellationToken::new();

    // Spawn event dispatcher task
    let dispatcher_handle = tokio::spawn(dispatcher.run(dispatcher_shutdown.clone()));

    // Spawn API server task
    let api_config = config.api.clone();
    let server_shutdown = api_shutdown.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config, server_shutdown).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Callbacks service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down callbacks service");

    notifier::shutdown_in_order(
        &api_shutdown,
        api_handle,
        &dispatcher_shutdown,
        dispatcher_handle,
        config.drain_timeout(),
    )
    .await;

    info!("Callbacks service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
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
