//! Core types and error definitions for the Hive coordination framework.
//!
//! This crate provides the foundational types shared across all Hive crates:
//! the unified error enum and the task data model that flows between the
//! coordinator and its workers.
//!
//! # Main types
//!
//! - [`HiveError`]: Unified error enum for all Hive subsystems.
//! - [`HiveResult`]: Convenience alias for `Result<T, HiveError>`.
//! - [`Task`]: A unit of work submitted to the coordinator.
//! - [`TaskOutcome`]: Final value of a completed task (direct or consensus).
//! - [`TaskFailure`]: Diagnostic record of a failed task.

/// Task, result and consensus data model.
pub mod task;

pub use task::{
    Consensus, FailureKind, Task, TaskFailure, TaskId, TaskOptions, TaskOutcome, TaskPriority,
    TaskResult, TaskStatus, WorkerOutput,
};

// --- Error types ---

/// Top-level error type for the Hive framework.
///
/// Variants mirror the failure modes of the coordinator: lifecycle misuse,
/// routing failures, lookups, deadlines, and errors raised by workers.
#[derive(Debug, thiserror::Error)]
pub enum HiveError {
    /// The coordinator is not in the `running` state.
    #[error("Coordinator is not running")]
    NotRunning,

    /// No registered worker is healthy and willing to take the task.
    #[error("No suitable worker: {0}")]
    NoSuitableWorker(String),

    /// The queried task identifier is unknown to the coordinator.
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    /// A caller-side wait exceeded its deadline. The task itself keeps running.
    #[error("Task {task_id} timed out after {timeout_ms}ms")]
    TaskTimeout {
        /// The task that was being awaited.
        task_id: TaskId,
        /// The deadline that elapsed.
        timeout_ms: u64,
    },

    /// The task reached the `failed` state.
    #[error("Task failed: {0}")]
    TaskFailed(Box<TaskFailure>),

    /// A worker reported itself unhealthy. Informational; never fatal.
    #[error("Worker unhealthy: {0}")]
    WorkerUnhealthy(String),

    /// An error raised by a worker implementation while processing.
    #[error("Worker error: {0}")]
    Worker(String),

    /// Duplicate or unknown worker name in the registry.
    #[error("Registry error: {0}")]
    Registry(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`HiveError`].
pub type HiveResult<T> = Result<T, HiveError>;

impl HiveError {
    /// The stored failure record, if this error re-raises a failed task.
    pub fn failure(&self) -> Option<&TaskFailure> {
        match self {
            HiveError::TaskFailed(failure) => Some(failure),
            _ => None,
        }
    }
}

impl From<TaskFailure> for HiveError {
    fn from(failure: TaskFailure) -> Self {
        HiveError::TaskFailed(Box::new(failure))
    }
}
