use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why the nonce queue refused or gave up on a request.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueError {
    #[error("Too many pending requests for this nonce track")]
    BufferExceeded,

    #[error("Submitter is over capacity")]
    OverCapacity,

    #[error("Request pruned due to capacity limit")]
    Pruned,

    #[error("Nonce {nonce} out of range, expected a value in [{next_nonce}, {next_nonce} + {window}]")]
    #[serde(rename_all = "camelCase")]
    NonceOutOfRange {
        nonce: u64,
        next_nonce: u64,
        window: u64,
    },

    #[error("Request replaced by a newer request with the same nonce")]
    Replaced,

    #[error("A request with nonce {nonce} is already executing")]
    NonceInFlight { nonce: u64 },

    #[error("Request did not start executing within {waited_ms}ms")]
    #[serde(rename_all = "camelCase")]
    PendingTimeout { waited_ms: u64 },

    #[error("Failed to fetch on-chain nonce: {message}")]
    NonceFetch { message: String },

    #[error("Request processor failed: {message}")]
    ProcessorFailed { message: String },

    #[error("Nonce queue is shutting down")]
    Shutdown,
}

impl QueueError {
    /// Low-cardinality label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            QueueError::BufferExceeded => "buffer_exceeded",
            QueueError::OverCapacity => "over_capacity",
            QueueError::Pruned => "pruned",
            QueueError::NonceOutOfRange { .. } => "nonce_out_of_range",
            QueueError::Replaced => "replaced",
            QueueError::NonceInFlight { .. } => "nonce_in_flight",
            QueueError::PendingTimeout { .. } => "pending_timeout",
            QueueError::NonceFetch { .. } => "nonce_fetch",
            QueueError::ProcessorFailed { .. } => "processor_failed",
            QueueError::Shutdown => "shutdown",
        }
    }
}
