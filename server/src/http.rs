use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::{sync::watch, task::JoinHandle};

/// Prometheus metrics endpoint
pub async fn get_metrics(State(registry): State<Arc<Registry>>) -> Result<Response, MetricsError> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;

    let metrics_output =
        String::from_utf8(buffer).map_err(|e| MetricsError::Utf8Error(e.to_string()))?;

    Ok((
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        metrics_output,
    )
        .into_response())
}

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Failed to encode metrics: {0}")]
    EncodingFailed(String),

    #[error("UTF-8 conversion error: {0}")]
    Utf8Error(String),
}

impl IntoResponse for MetricsError {
    fn into_response(self) -> Response {
        let error_message = self.to_string();
        tracing::error!("Metrics error: {}", error_message);

        (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain")],
            format!("Metrics export failed: {error_message}"),
        )
            .into_response()
    }
}

pub fn metrics_router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/metrics", get(get_metrics))
        .with_state(registry)
}

/// Serves `/metrics` until shut down.
pub struct MetricsServer {
    handle: Option<JoinHandle<Result<(), std::io::Error>>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    app: Router,
}

impl MetricsServer {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            handle: None,
            shutdown_tx: None,
            app: metrics_router(registry),
        }
    }

    pub fn start(&mut self, listener: tokio::net::TcpListener) -> Result<(), std::io::Error> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let app = self.app.clone();
        let local_addr = listener.local_addr()?;

        let handle = tokio::spawn(async move {
            tracing::info!("Metrics server starting on {}", local_addr);

            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let mut rx = shutdown_rx;
                    while !*rx.borrow() {
                        if rx.changed().await.is_err() {
                            break;
                        }
                    }
                    tracing::info!("Metrics server shutting down");
                })
                .await
        });

        self.handle = Some(handle);
        self.shutdown_tx = Some(shutdown_tx);

        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), std::io::Error> {
        if let Some(tx) = self.shutdown_tx.take() {
            if tx.send(true).is_err() {
                tracing::error!("Failed to send shutdown signal to metrics server");
            }
        }

        if let Some(handle) = self.handle.take() {
            match handle.await {
                Ok(result) => {
                    if let Err(e) = result {
                        tracing::error!("Metrics server error during shutdown: {}", e);
                        return Err(e);
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to join metrics server task: {}", e);
                    return Err(std::io::Error::other(format!("Task join error: {e}")));
                }
            }
        }

        Ok(())
    }
}
