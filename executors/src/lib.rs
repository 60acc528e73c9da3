pub mod block_watcher;
pub mod executor;
pub mod metrics;
pub mod nonce_queue;
pub mod receipt;
pub mod shutdown;
pub mod submit;

pub use block_watcher::{BlockSubscription, BlockWatcher, BlockWatcherConfig, ChainTransport};
pub use executor::{AssignmentError, ExecutorAssignment, ExecutorHeap};
pub use nonce_queue::{NonceQueue, NonceQueueConfig, QueueError, SubmitRequest};
pub use receipt::{ReceiptResolver, ReceiptResolverConfig, ReceiptResult, ReceiptSource};
pub use submit::{ExecutionOutcome, ExecutionPath, RequestHash, SubmitPipeline};
