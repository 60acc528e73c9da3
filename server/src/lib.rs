pub mod config;
pub mod execution;
pub mod http;
pub mod submitter;

pub use config::{
    ChainSection, ExecutorsConfig, MonitoringConfig, QueueConfig, ReceiptsConfig, ServerConfig,
    SubmitterConfig,
};
pub use execution::{EncodedBoop, EntryPointExecutor, EntryPointNonceSource};
pub use http::MetricsServer;
pub use submitter::{Submitter, StartupError};
