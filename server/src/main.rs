use std::sync::Arc;

use boop_submitter::{config, http::MetricsServer, submitter::Submitter};
use submitter_executors::metrics::{SubmitterMetrics, initialize_metrics};
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::get_config()?;

    let subscriber = tracing_subscriber::registry().with(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            // Default to debug for our crates if RUST_LOG is not set
            "boop_submitter=debug,submitter_executors=debug,submitter_core=debug".into()
        }),
    );

    match config.server.log_format {
        config::LogFormat::Json => subscriber
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        config::LogFormat::Pretty => subscriber.with(tracing_subscriber::fmt::layer()).init(),
    }

    let registry = Arc::new(prometheus::Registry::new());
    initialize_metrics(SubmitterMetrics::new(&registry)?);
    tracing::info!("Metrics initialized");

    let submitter = Submitter::start(&config).await?;

    let mut metrics_server = MetricsServer::new(registry);
    let address = format!("{}:{}", config.server.host, config.server.metrics_port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    metrics_server.start(listener)?;

    tracing::info!("Submitter running, waiting for shutdown signal");
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for Ctrl+C: {}", e);
    }
    tracing::info!("Shutdown signal received");

    if let Err(e) = metrics_server.shutdown().await {
        tracing::error!("Error shutting down metrics server: {}", e);
    }

    if let Err(e) = submitter.shutdown().await {
        tracing::error!("Error during submitter shutdown: {}", e);
    } else {
        tracing::info!("Submitter shut down successfully");
    }

    Ok(())
}
