//! Supervised parallel execution of independent tasks.
//!
//! Callers hand an [`Orchestrator`] a set of tasks keyed by id. Each task is
//! submitted to an [`ExecutionBackend`], reports back through a
//! [`MessageChannel`], and is tracked by a [`Process`] state machine until it
//! ends `DONE` or `FAILED`. Transient failures are retried, stuck tasks are
//! failed after a timeout, and the state of the run is checkpointed to JSON.
//!
//! # Main types
//!
//! - [`Orchestrator`]: Runs the reconciliation loop and returns a [`RunReport`].
//! - [`Task`]: A callable, optionally reporting progress through a [`ProgressReporter`].
//! - [`Process`]: Per-task lifecycle: `NEW`, `PENDING`, `DONE`, `RETRY`, `FAILED`.
//! - [`LocalPool`] / [`ClusterBackend`]: The two shipped execution backends.
//! - [`CheckpointStore`]: Timestamped JSON snapshots of a run.

/// Execution backends and the job handles they return.
pub mod backend;
/// State and log queues from tasks to the orchestrator.
pub mod channel;
/// JSON checkpoints of a run.
pub mod checkpoint;
/// Completion classification of resolved jobs.
pub mod classify;
/// Orchestrator settings.
pub mod config;
/// The reconciliation loop.
pub mod engine;
mod finite;
/// Progress aggregation and status reports.
pub mod monitor;
/// Per-task state machine.
pub mod process;
/// Task callables and progress reporting.
pub mod task;
/// Worker-side wrapper around a task attempt.
pub mod trampoline;
/// Messages, statuses and reports.
pub mod types;

pub use backend::{
    ClusterBackend, ClusterConfig, ExecutionBackend, Job, JobOutcome, JobTicket, LocalPool,
    PendingJob,
};
pub use channel::{MessageChannel, MessageSender};
pub use checkpoint::{snapshot, CheckpointStore, Snapshot};
pub use classify::{CompletionClassifier, RetryPredicate};
pub use config::OrchestratorConfig;
pub use engine::Orchestrator;
pub use monitor::{overall_progress, truncate_fmt};
pub use process::{count_active, Process};
pub use task::{ProgressReporter, Task, TaskFn};
pub use types::{
    Message, MessageBody, MessageType, RunReport, Status, StatusUpdate, TaskReport, TaskResult,
};

pub use taskforge_core::{TaskError, TaskFailure, TaskforgeError, TaskforgeResult};
