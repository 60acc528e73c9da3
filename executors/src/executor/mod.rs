pub mod assignment;
pub mod heap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use assignment::ExecutorAssignment;
pub use heap::{ExecutorHeap, ExecutorSlot};

#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssignmentError {
    #[error("No executors available")]
    NoExecutors,
}
