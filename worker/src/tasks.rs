// ==============================================================================
// tasks.rs - Task Execution Support
// ==============================================================================
// Description: Shared task failure types, transient retry, and cancellation
//              polling for worker tasks
// Author: Matt Barham
// Created: 2025-12-11
// Modified: 2026-01-21
// Version: 1.1.0
// ==============================================================================

use std::time::Duration;

use tracing::warn;
use uuid::Uuid;
use varda_core::store::{self, Store, StoreError};

/// Batch flushes retry this many times on deadlock or serialization
/// failure before the task fails.
pub const FLUSH_RETRIES: u32 = 3;

/// A task-terminating condition. Everything surfaces on the task row;
/// nothing is silently swallowed.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),
}

impl TaskError {
    pub fn failed(message: impl Into<String>) -> Self {
        TaskError::Failed(message.into())
    }
}

impl From<StoreError> for TaskError {
    fn from(error: StoreError) -> Self {
        TaskError::Failed(error.to_string())
    }
}

/// True when a store error is a transient database condition.
pub fn is_transient(error: &StoreError) -> bool {
    matches!(error, StoreError::Database(db) if store::is_transient(db))
}

/// Exponential backoff delay before retry `attempt` (1-based).
pub fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(1 << attempt.min(6))
}

/// Poll the cooperative cancel flag; returns a `Cancelled` error when an
/// operator has requested it.
pub async fn check_cancelled(store: &Store, task_id: Uuid) -> Result<(), TaskError> {
    if store.cancel_requested(task_id).await? {
        warn!("Task {} cancelled by request", task_id);
        return Err(TaskError::Cancelled);
    }
    Ok(())
}

/// Progress percentage from byte counts, held below 100 until the task
/// actually finishes.
pub fn progress_percent(bytes_consumed: u64, bytes_total: u64) -> i32 {
    if bytes_total == 0 {
        return 0;
    }
    (((bytes_consumed * 100) / bytes_total) as i32).min(99)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_percent() {
        assert_eq!(progress_percent(0, 100), 0);
        assert_eq!(progress_percent(40, 100), 40);
        assert_eq!(progress_percent(100, 100), 99);
        assert_eq!(progress_percent(5, 0), 0);
        assert_eq!(progress_percent(999, 1000), 99);
    }

    #[test]
    fn test_backoff_is_bounded() {
        assert_eq!(backoff(1), Duration::from_secs(2));
        assert_eq!(backoff(2), Duration::from_secs(4));
        assert_eq!(backoff(3), Duration::from_secs(8));
        assert_eq!(backoff(60), Duration::from_secs(64));
    }
}
