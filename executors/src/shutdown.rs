use thiserror::Error;
use tokio::{sync::oneshot, task::JoinHandle};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ShutdownError {
    #[error("Worker {name} panicked: {message}")]
    Panicked { name: String, message: String },
}

/// Handle for a single background task that can be shut down gracefully
pub struct WorkerHandle {
    pub name: String,
    pub join_handle: JoinHandle<()>,
    pub shutdown_tx: oneshot::Sender<()>,
}

impl WorkerHandle {
    pub fn new(name: impl Into<String>, join_handle: JoinHandle<()>, shutdown_tx: oneshot::Sender<()>) -> Self {
        Self {
            name: name.into(),
            join_handle,
            shutdown_tx,
        }
    }

    /// Shutdown this worker gracefully
    pub async fn shutdown(self) -> Result<(), ShutdownError> {
        tracing::info!(worker = %self.name, "Initiating graceful shutdown of worker");

        // Signal shutdown to the worker
        if self.shutdown_tx.send(()).is_err() {
            tracing::warn!(worker = %self.name, "Worker was already shutting down");
        }

        // Wait for worker to finish
        match self.join_handle.await {
            Ok(()) => {
                tracing::info!(worker = %self.name, "Worker shut down gracefully");
                Ok(())
            }
            Err(e) => {
                tracing::error!(worker = %self.name, error = ?e, "Worker task panicked during shutdown");
                Err(ShutdownError::Panicked {
                    name: self.name,
                    message: e.to_string(),
                })
            }
        }
    }
}
