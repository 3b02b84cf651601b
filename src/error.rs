//! Error types for pipeline lifecycle and contract violations.
//!
//! Transient conditions (full queue, empty queue, not running, closed while
//! waiting) are never errors; they are signalled through return values on the
//! boundary API. `PipelineError` covers the other two categories from the
//! error model: programming-contract violations detected at the call site,
//! and unexpected faults raised inside worker threads.

use thiserror::Error;

use crate::slot::StageSlot;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Error type for pipeline lifecycle and configuration operations.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A worker group was registered with no members. The analogue of a null
    /// worker: a misconfiguration, reported rather than silently ignored.
    #[error("{operation}: worker group for slot {slot:?} is empty")]
    EmptyWorkerGroup {
        /// The operation that detected the violation
        operation: &'static str,
        /// The slot the empty group targeted
        slot: StageSlot,
    },

    /// `exec` or `start` was called while a previous run is still active.
    /// The graph is rebuilt per run; the old one must be stopped first.
    #[error("{operation}: pipeline is already running")]
    AlreadyRunning {
        /// The operation that detected the violation
        operation: &'static str,
    },

    /// A worker thread panicked while processing. The panic message is
    /// captured and the pipeline transitions to Stopped.
    #[error("worker thread {thread_id} panicked: {message}")]
    WorkerPanicked {
        /// Index of the thread plan that panicked
        thread_id: usize,
        /// Extracted panic payload
        message: String,
    },
}
