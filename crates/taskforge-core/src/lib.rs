//! Core types and error definitions for the taskforge orchestrator.
//!
//! This crate provides the foundational types shared across all taskforge crates:
//! the engine-level error enum and the task-level error that is guaranteed to
//! survive the execution boundary between a worker and the orchestrator.
//!
//! # Main types
//!
//! - [`TaskforgeError`]: Unified error enum for configuration, backends and checkpoints.
//! - [`TaskforgeResult`]: Convenience alias for `Result<T, TaskforgeError>`.
//! - [`TaskError`]: Serializable description of why a single task did not produce a value.
//! - [`TaskFailure`]: A [`TaskError`] together with its diagnostic trace.

/// Task-level errors that cross the execution boundary.
pub mod task_error;

pub use task_error::{error_chain, short_type_name, TaskError, TaskFailure};

// --- Error types ---

/// Top-level error type for the taskforge engine.
///
/// These errors never describe the outcome of a task; they describe failures
/// of the machinery around it (bad configuration, a backend that refused a
/// job, a checkpoint that could not be written).
#[derive(Debug, thiserror::Error)]
pub enum TaskforgeError {
    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// An execution backend refused or lost a job.
    #[error("Backend error: {0}")]
    Backend(String),

    /// A checkpoint could not be written or read.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// A process was asked to make a state transition its current state forbids.
    #[error("Invalid transition: {0}")]
    Transition(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`TaskforgeError`].
pub type TaskforgeResult<T> = Result<T, TaskforgeError>;
