//! Error types for bus operations
//!
//! Only recoverable conditions are represented here. Invariant violations
//! (out-of-range ids, illegal state transitions, allocator exhaustion, full
//! mailboxes under the abort policy) panic instead.

use thiserror::Error;

use crate::timer::TimerId;

/// Error type for bus construction and task lifecycle operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// Invalid bus configuration.
    #[error(transparent)]
    Config(#[from] agw_common::Error),

    /// Runtime or thread creation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The task did not call `mark_ready` within the rendezvous timeout.
    #[error("task {task} did not become ready within {timeout_ms} ms")]
    ReadyTimeout {
        /// Task name
        task: String,
        /// Timeout that elapsed
        timeout_ms: u64,
    },

    /// The task thread exited before calling `mark_ready`.
    #[error("task {task} exited before becoming ready")]
    ExitedBeforeReady {
        /// Task name
        task: String,
    },

    /// Another caller is already waiting for the tasks to end.
    #[error("a shutdown coordinator is already waiting on this bus")]
    CoordinatorBusy,
}

/// Error type for timer operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimerError {
    /// No armed timer has this id (already fired, acknowledged or removed).
    #[error("timer {0} not found")]
    NotFound(TimerId),

    /// Timers need a non-zero interval.
    #[error("timer interval must be non-zero")]
    InvalidInterval,

    /// The expiry envelope would not fit in the largest pool item.
    #[error("timer argument needs {len} bytes, the largest message item holds {max}")]
    ArgTooLarge {
        /// Bytes needed by the expiry payload (id plus argument)
        len: usize,
        /// Largest payload the pool can serve
        max: usize,
    },
}
