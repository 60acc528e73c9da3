use alloy::transports::{RpcError as AlloyRpcError, TransportErrorKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chain::Chain;

#[derive(Debug, Error, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcErrorKind {
    /// Server returned an error response.
    #[error("server returned an error response: {0}")]
    ErrorResp(RpcErrorResponse),

    /// Server returned a null response when a non-null response was expected.
    #[error("server returned a null response when a non-null response was expected")]
    NullResp,

    /// Rpc server returned an unsupported feature.
    #[error("unsupported feature: {message}")]
    UnsupportedFeature { message: String },

    /// Returned when a local pre-processing step fails.
    #[error("local usage error: {message}")]
    InternalError { message: String },

    /// JSON serialization error.
    #[error("serialization error: {message}")]
    SerError { message: String },

    /// JSON deserialization error.
    #[error("deserialization error: {message}, text: {text}")]
    DeserError {
        message: String,
        /// For deser errors, the text that failed to deserialize.
        text: String,
    },

    #[error("HTTP error {status}")]
    TransportHttpError { status: u16, body: String },

    #[error("Other transport error: {message}")]
    OtherTransportError { message: String },
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RpcErrorResponse {
    /// The error code.
    pub code: i64,
    /// The error message (if any).
    pub message: String,
    /// The error data (if any).
    pub data: Option<String>,
}

impl RpcErrorResponse {
    pub fn as_display(&self) -> String {
        format!(
            "code {}: {}{}",
            self.code,
            self.message,
            self.data
                .as_ref()
                .map(|data| format!(", data: {data}"))
                .unwrap_or_default()
        )
    }
}

impl std::fmt::Display for RpcErrorResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_display())
    }
}

#[derive(Error, Debug, Serialize, Clone, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "type")]
pub enum SubmitterError {
    #[error("RPC error on chain {chain_id} at {rpc_url}: {message}")]
    RpcError {
        chain_id: u64,
        rpc_url: String,
        message: String,
        kind: RpcErrorKind,
    },

    #[error("Bad RPC configuration: {message}")]
    RpcConfigError { message: String },

    #[error("Validation error: {message}")]
    ValidationError { message: String },

    #[error("Signer error: {message}")]
    #[serde(rename_all = "camelCase")]
    SignerError { message: String },

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl From<url::ParseError> for SubmitterError {
    fn from(err: url::ParseError) -> Self {
        SubmitterError::RpcConfigError {
            message: err.to_string(),
        }
    }
}

pub fn to_rpc_error_kind(err: &AlloyRpcError<TransportErrorKind>) -> RpcErrorKind {
    match err {
        AlloyRpcError::ErrorResp(err) => RpcErrorKind::ErrorResp(RpcErrorResponse {
            code: err.code,
            message: err.message.to_string(),
            data: err.data.as_ref().map(|data| data.to_string()),
        }),
        AlloyRpcError::NullResp => RpcErrorKind::NullResp,
        AlloyRpcError::UnsupportedFeature(feature) => RpcErrorKind::UnsupportedFeature {
            message: feature.to_string(),
        },
        AlloyRpcError::LocalUsageError(err) => RpcErrorKind::InternalError {
            message: err.to_string(),
        },
        AlloyRpcError::SerError(err) => RpcErrorKind::SerError {
            message: err.to_string(),
        },
        AlloyRpcError::DeserError { err, text } => RpcErrorKind::DeserError {
            message: err.to_string(),
            text: text.to_string(),
        },
        AlloyRpcError::Transport(err) => match err {
            TransportErrorKind::HttpError(err) => RpcErrorKind::TransportHttpError {
                status: err.status,
                body: err.body.to_string(),
            },
            _ => RpcErrorKind::OtherTransportError {
                message: err.to_string(),
            },
        },
    }
}

pub trait AlloyRpcErrorToSubmitterError {
    fn to_submitter_error(&self, chain: &impl Chain) -> SubmitterError;
}

impl AlloyRpcErrorToSubmitterError for AlloyRpcError<TransportErrorKind> {
    fn to_submitter_error(&self, chain: &impl Chain) -> SubmitterError {
        SubmitterError::RpcError {
            chain_id: chain.chain_id(),
            rpc_url: chain.rpc_url().to_string(),
            message: self.to_string(),
            kind: to_rpc_error_kind(self),
        }
    }
}

/// Contract call failures. Transport problems keep their RPC detail, everything
/// else is reported as a validation failure of the call itself.
pub trait ContractErrorToSubmitterError {
    fn to_submitter_error(self, chain: &impl Chain) -> SubmitterError;
}

impl ContractErrorToSubmitterError for alloy::contract::Error {
    fn to_submitter_error(self, chain: &impl Chain) -> SubmitterError {
        match self {
            alloy::contract::Error::TransportError(err) => err.to_submitter_error(chain),
            alloy::contract::Error::ZeroData(function, _) => SubmitterError::ValidationError {
                message: format!("Zero data returned from contract call to {function}"),
            },
            other => SubmitterError::ValidationError {
                message: other.to_string(),
            },
        }
    }
}
