//! Code that runs on the worker side of the execution boundary.
//!
//! [`job`] wraps a [`Task`] into a backend [`Job`]: it announces the start of
//! the attempt, runs the callable (handing it a reporter when it asks for one)
//! and makes sure whatever comes back can be transported.

use crate::backend::Job;
use crate::channel::MessageSender;
use crate::finite::ensure_finite;
use crate::monitor::truncate_fmt;
use crate::task::{ProgressReporter, Task, TaskFn};
use crate::types::StatusUpdate;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use taskforge_core::{error_chain, short_type_name, TaskError, TaskFailure};
use tracing::debug;

/// Build the backend job for one attempt of `task`.
pub fn job(task_id: impl Into<String>, task: Task, sender: MessageSender) -> Job {
    let task_id = task_id.into();
    Box::new(move || dispatch(&task_id, &task, &sender))
}

/// Run one attempt of a task. Executes inside the worker.
pub fn dispatch(task_id: &str, task: &Task, sender: &MessageSender) -> Result<Value, TaskFailure> {
    sender.post_status(
        task_id,
        StatusUpdate::Pending {
            started_at: Utc::now(),
        },
    );

    let result = match task.func() {
        TaskFn::Plain(f) => f(),
        TaskFn::Reporting(f) => {
            let reporter = ProgressReporter::new(task_id, sender.clone());
            f(&reporter)
        }
    }
    .map_err(|failure| failure.with_context(format!("raised by task {task_id}")));

    match &result {
        Ok(value) => debug!(task_id, value = %truncate_fmt(value, 100), "Task returned"),
        Err(failure) => debug!(task_id, error = %failure.error, "Task raised"),
    }
    result
}

/// Check a task's return value and error against the wire format.
///
/// A value that cannot be represented becomes `NonSerializableResult`; an
/// error that cannot be represented becomes `NonSerializableError`. Either
/// way the caller gets something it can always transport and report.
pub fn seal<T, E>(result: Result<T, E>) -> Result<Value, TaskFailure>
where
    T: Serialize,
    E: std::error::Error + Serialize,
{
    match result {
        Ok(value) => seal_value(&value),
        Err(err) => Err(seal_error(&err)),
    }
}

/// Convert a returned value, rejecting anything JSON cannot represent
/// without loss, non-finite floats included.
pub fn seal_value<T: Serialize>(value: &T) -> Result<Value, TaskFailure> {
    to_wire(value).map_err(|e| {
        TaskFailure::new(
            TaskError::NonSerializableResult {
                reason: e.to_string(),
            },
            format!(
                "value of type {} returned by task is not serializable",
                short_type_name::<T>()
            ),
        )
    })
}

/// Convert a raised error into a transportable [`TaskFailure`].
pub fn seal_error<E>(err: &E) -> TaskFailure
where
    E: std::error::Error + Serialize,
{
    let error_type = short_type_name::<E>().to_string();
    let trace = error_chain(err);
    let error = match to_wire(err) {
        Ok(payload) => TaskError::Application {
            error_type,
            message: err.to_string(),
            payload,
        },
        Err(e) => {
            debug!(error = %err, "Task raised an error that cannot be serialized");
            TaskError::NonSerializableError {
                error_type,
                message: err.to_string(),
                reason: e.to_string(),
            }
        }
    };
    TaskFailure::new(error, trace)
}

fn to_wire<T: ?Sized + Serialize>(value: &T) -> serde_json::Result<Value> {
    ensure_finite(value)?;
    serde_json::to_value(value)
}
