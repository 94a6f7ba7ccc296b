use std::sync::Arc;
use tokio::sync::Mutex;

use crate::common::TimestampMs;
use crate::queue::ProcessSummary;

/// In-memory state of one auto-retry registration.
#[derive(Debug, Clone, Default)]
pub struct RetryStatus {
    /// Number of pending operations seen by the last trigger.
    pub pending_ops: u64,
    /// Runs that reached the processor (triggers with an empty queue are
    /// not counted).
    pub runs_started: u64,
    /// Runs that returned, successfully or with a storage error.
    pub runs_completed: u64,
    /// Triggers dropped because a run was already in flight.
    pub ignored_triggers: u64,
    /// Start of the last run, in milliseconds since UNIX_EPOCH.
    pub last_run_ts_ms: TimestampMs,
    pub last_summary: Option<ProcessSummary>,
    /// Storage error that aborted the last run, if any.
    pub last_error: Option<String>,
}

pub type SharedRetryStatus = Arc<Mutex<RetryStatus>>;
