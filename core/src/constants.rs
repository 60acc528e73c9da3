use std::time::Duration;

/// How long an executor stays pinned to an `(account, nonceTrack)` after its last request.
pub const DEFAULT_ASSIGNMENT_TTL: Duration = Duration::from_secs(30);

pub const DEFAULT_MAX_PENDING_PER_TRACK: usize = 50;
pub const DEFAULT_MAX_TOTAL_PENDING: usize = 10_000;
pub const DEFAULT_MAX_IN_FLIGHT: usize = 1_000;
pub const DEFAULT_MAX_PENDING_TIME: Duration = Duration::from_secs(30);

// Block monitoring
pub const DEFAULT_MAX_ATTEMPTS_PER_URL: u32 = 3;
pub const DEFAULT_CONNECT_RETRY_DELAY: Duration = Duration::from_secs(3);
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_WATCHDOG_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_RESTART_BACKOFF: Duration = Duration::from_secs(1);
pub const DEFAULT_INITIAL_BLOCK_WAIT: Duration = Duration::from_secs(5);

// Receipts
pub const DEFAULT_RECEIPT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RECEIPT_RETRIES: u32 = 3;
pub const DEFAULT_RECEIPT_RETRY_DELAY: Duration = Duration::from_millis(100);
pub const DEFAULT_RECEIPT_LAST_DITCH_TIMEOUT: Duration = Duration::from_millis(500);
