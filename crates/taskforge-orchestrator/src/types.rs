use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use taskforge_core::{TaskError, TaskFailure};

/// Lifecycle state of a tracked task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    /// Created or reset, not yet running.
    New,
    /// Running on a worker.
    Pending,
    /// Finished with a value. Terminal.
    Done,
    /// Failed transiently, waiting to be resubmitted.
    Retry,
    /// Failed for good. Terminal.
    Failed,
}

impl Status {
    /// All states, in lifecycle order.
    pub const ALL: [Status; 5] = [
        Status::New,
        Status::Pending,
        Status::Done,
        Status::Retry,
        Status::Failed,
    ];

    /// Upper-case name used in reports and checkpoints.
    pub fn name(self) -> &'static str {
        match self {
            Status::New => "NEW",
            Status::Pending => "PENDING",
            Status::Done => "DONE",
            Status::Retry => "RETRY",
            Status::Failed => "FAILED",
        }
    }

    /// `DONE` and `FAILED` never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Done | Status::Failed)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Kind of a [`Message`], mirroring which queue it travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    /// A status transition, carried on the state queue.
    Status,
    /// A progress fraction, carried on the log queue.
    Progress,
    /// A free-form log line, carried on the log queue.
    Log,
}

/// A requested status transition and the data it carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "args", rename_all = "UPPERCASE")]
pub enum StatusUpdate {
    /// Reset before (re)submission.
    New,
    /// The trampoline started executing the task.
    Pending {
        /// When the worker picked the task up.
        started_at: DateTime<Utc>,
    },
    /// The task returned a value.
    Done(serde_json::Value),
    /// The attempt failed in a way worth retrying.
    Retry(TaskFailure),
    /// The attempt failed for good.
    Failed(TaskFailure),
}

impl StatusUpdate {
    /// The state this update asks for.
    pub fn status(&self) -> Status {
        match self {
            StatusUpdate::New => Status::New,
            StatusUpdate::Pending { .. } => Status::Pending,
            StatusUpdate::Done(_) => Status::Done,
            StatusUpdate::Retry(_) => Status::Retry,
            StatusUpdate::Failed(_) => Status::Failed,
        }
    }
}

/// Payload of a [`Message`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageBody {
    /// Status transition.
    Status(StatusUpdate),
    /// Progress fraction in `[0, 1]`.
    Progress(f64),
    /// Log line emitted by the task.
    Log(String),
}

/// Unit of communication from a running task back to the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub task_id: String,
    pub body: MessageBody,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Stamp a new message with the current time.
    pub fn new(task_id: impl Into<String>, body: MessageBody) -> Self {
        Self {
            task_id: task_id.into(),
            body,
            timestamp: Utc::now(),
        }
    }

    pub fn status(task_id: impl Into<String>, update: StatusUpdate) -> Self {
        Self::new(task_id, MessageBody::Status(update))
    }

    pub fn progress(task_id: impl Into<String>, fraction: f64) -> Self {
        Self::new(task_id, MessageBody::Progress(fraction))
    }

    pub fn log(task_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(task_id, MessageBody::Log(text.into()))
    }

    pub fn kind(&self) -> MessageType {
        match self.body {
            MessageBody::Status(_) => MessageType::Status,
            MessageBody::Progress(_) => MessageType::Progress,
            MessageBody::Log(_) => MessageType::Log,
        }
    }
}

/// Final value of a task: what it returned, or why it failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskResult {
    Value(serde_json::Value),
    Failure(TaskFailure),
}

impl TaskResult {
    pub fn value(&self) -> Option<&serde_json::Value> {
        match self {
            TaskResult::Value(v) => Some(v),
            TaskResult::Failure(_) => None,
        }
    }

    pub fn error(&self) -> Option<&TaskError> {
        match self {
            TaskResult::Value(_) => None,
            TaskResult::Failure(f) => Some(&f.error),
        }
    }

    /// JSON representation written into checkpoints.
    pub fn repr(&self) -> serde_json::Value {
        match self {
            TaskResult::Value(v) => v.clone(),
            TaskResult::Failure(f) => serde_json::json!([f.error, f.trace]),
        }
    }
}

/// Outcome of one task at the end of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    /// Always `DONE` or `FAILED`.
    pub status: Status,
    pub result: TaskResult,
    /// Number of dispatch attempts made.
    pub attempts: u32,
    /// Wall time of the last attempt, if it ever started.
    pub elapsed: Option<Duration>,
}

/// Everything a run produced, keyed by task id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub tasks: BTreeMap<String, TaskReport>,
}

impl RunReport {
    pub fn get(&self, task_id: &str) -> Option<&TaskReport> {
        self.tasks.get(task_id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Number of tasks that ended in `status`.
    pub fn count(&self, status: Status) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }

    /// True when every task ended `DONE`.
    pub fn all_done(&self) -> bool {
        self.tasks.values().all(|t| t.status == Status::Done)
    }

    /// The `{task_id: (status_name, result)}` view of the run.
    pub fn outcomes(&self) -> BTreeMap<String, (&'static str, &TaskResult)> {
        self.tasks
            .iter()
            .map(|(id, t)| (id.clone(), (t.status.name(), &t.result)))
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_status_names_and_terminality() {
        assert_eq!(Status::Done.to_string(), "DONE");
        assert_eq!(Status::Retry.name(), "RETRY");
        assert!(Status::Done.is_terminal());
        assert!(Status::Failed.is_terminal());
        assert!(!Status::Retry.is_terminal());
        assert!(!Status::Pending.is_terminal());
    }

    #[test]
    fn test_status_serializes_upper_case() {
        let json = serde_json::to_string(&Status::Failed).unwrap();
        assert_eq!(json, "\"FAILED\"");
        let parsed: Status = serde_json::from_str("\"PENDING\"").unwrap();
        assert_eq!(parsed, Status::Pending);
    }

    #[test]
    fn test_message_kind() {
        assert_eq!(Message::progress("a", 0.5).kind(), MessageType::Progress);
        assert_eq!(Message::log("a", "hello").kind(), MessageType::Log);
        let msg = Message::status("a", StatusUpdate::Done(serde_json::json!(true)));
        assert_eq!(msg.kind(), MessageType::Status);
        assert_eq!(msg.task_id, "a");
    }

    #[test]
    fn test_message_is_transportable() {
        let failure = TaskFailure::new(TaskError::timeout("late"), "attempt 2");
        let msg = Message::status("t7", StatusUpdate::Retry(failure));
        let bytes = serde_json::to_vec(&msg).unwrap();
        let back: Message = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_failure_repr_is_error_and_trace() {
        let result = TaskResult::Failure(TaskFailure::new(TaskError::timeout("late"), "trace"));
        let repr = result.repr();
        assert_eq!(repr[0]["kind"], "timeout");
        assert_eq!(repr[1], "trace");
        assert!(result.value().is_none());
        assert_eq!(result.error().map(TaskError::error_type), Some("Timeout"));
    }

    #[test]
    fn test_run_report_counts() {
        let mut report = RunReport::default();
        report.tasks.insert(
            "a".into(),
            TaskReport {
                status: Status::Done,
                result: TaskResult::Value(serde_json::json!(1)),
                attempts: 1,
                elapsed: None,
            },
        );
        report.tasks.insert(
            "b".into(),
            TaskReport {
                status: Status::Failed,
                result: TaskResult::Failure(TaskFailure::new(TaskError::timeout("x"), "")),
                attempts: 2,
                elapsed: None,
            },
        );
        assert_eq!(report.count(Status::Done), 1);
        assert_eq!(report.count(Status::Failed), 1);
        assert!(!report.all_done());
        assert_eq!(report.outcomes()["b"].0, "FAILED");
    }
}
