use crate::backend::{panic_message, CompletionCallback, JobOutcome};
use crate::channel::MessageSender;
use crate::monitor::truncate_fmt;
use crate::types::StatusUpdate;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use taskforge_core::{TaskError, TaskFailure};
use tracing::{debug, error};

/// Decides whether an error raised by a task is worth another attempt.
pub type RetryPredicate = Arc<dyn Fn(&TaskError) -> bool + Send + Sync>;

/// Turns a resolved job into exactly one status message.
///
/// Runs on the orchestrator side, from the backend's completion callback:
///
/// - a returned value is `DONE`, even if it encodes an error of its own;
/// - a dead worker or a backend timeout is `RETRY`;
/// - a raised error is `RETRY` when the retry predicate accepts it, else `FAILED`;
///   a predicate that panics counts as a rejection.
///
/// Whether a `RETRY` actually happens is up to the process, which reroutes it
/// to `FAILED` once attempts are spent.
#[derive(Clone)]
pub struct CompletionClassifier {
    sender: MessageSender,
    retry_predicate: Option<RetryPredicate>,
}

impl CompletionClassifier {
    pub fn new(sender: MessageSender, retry_predicate: Option<RetryPredicate>) -> Self {
        Self {
            sender,
            retry_predicate,
        }
    }

    pub fn classify(&self, task_id: &str, outcome: JobOutcome) -> StatusUpdate {
        match outcome {
            JobOutcome::Returned(value) => {
                debug!(task_id, value = %truncate_fmt(&value, 100), "Task done");
                StatusUpdate::Done(value)
            }
            JobOutcome::Expired { reason } => {
                debug!(task_id, reason = %reason, "Worker expired");
                StatusUpdate::Retry(TaskFailure::new(
                    TaskError::abnormal_termination(reason.clone()),
                    format!("worker running task {task_id} expired: {reason}"),
                ))
            }
            JobOutcome::TimedOut { after } => {
                debug!(task_id, ?after, "Backend timeout");
                StatusUpdate::Retry(TaskFailure::new(
                    TaskError::timeout(format!("task exceeded the backend timeout of {after:?}")),
                    format!("task {task_id} abandoned by its backend after {after:?}"),
                ))
            }
            JobOutcome::Raised(failure) => {
                if self.is_retryable(&failure.error) {
                    debug!(task_id, error = %failure.error, "Task raised, retrying");
                    StatusUpdate::Retry(failure)
                } else {
                    debug!(task_id, error = %failure.error, trace = %failure.trace, "Task raised");
                    StatusUpdate::Failed(failure)
                }
            }
        }
    }

    /// Classify and post the resulting status message.
    pub fn complete(&self, task_id: &str, outcome: JobOutcome) {
        let update = self.classify(task_id, outcome);
        self.sender.post_status(task_id, update);
    }

    /// Completion callback for one attempt of `task_id`.
    pub fn callback(&self, task_id: impl Into<String>) -> CompletionCallback {
        let classifier = self.clone();
        let task_id = task_id.into();
        Box::new(move |outcome| classifier.complete(&task_id, outcome))
    }

    fn is_retryable(&self, err: &TaskError) -> bool {
        let Some(predicate) = &self.retry_predicate else {
            return false;
        };
        match panic::catch_unwind(AssertUnwindSafe(|| predicate(err))) {
            Ok(retry) => retry,
            Err(payload) => {
                error!(
                    error = %err,
                    panic = %panic_message(payload.as_ref()),
                    "Retry predicate panicked, not retrying"
                );
                false
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::channel::MessageChannel;
    use crate::types::{MessageBody, Status};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn raised(error_type: &str) -> JobOutcome {
        JobOutcome::Raised(TaskFailure::new(
            TaskError::application(error_type, "boom", serde_json::Value::Null),
            "trace",
        ))
    }

    fn retry_on(kind: &'static str) -> RetryPredicate {
        Arc::new(move |e: &TaskError| e.error_type() == kind)
    }

    #[test]
    fn test_returned_is_done() {
        let channel = MessageChannel::new();
        let classifier = CompletionClassifier::new(channel.sender(), None);
        let update = classifier.classify("t", JobOutcome::Returned(serde_json::json!(true)));
        assert_eq!(update, StatusUpdate::Done(serde_json::json!(true)));
    }

    #[test]
    fn test_returned_error_code_is_still_done() {
        let channel = MessageChannel::new();
        let classifier =
            CompletionClassifier::new(channel.sender(), Some(Arc::new(|_: &TaskError| true)));
        let update = classifier.classify("t", JobOutcome::Returned(serde_json::json!({"exit": 2})));
        assert_eq!(update.status(), Status::Done);
    }

    #[test]
    fn test_infrastructure_failures_retry() {
        let channel = MessageChannel::new();
        let classifier = CompletionClassifier::new(channel.sender(), None);

        match classifier.classify("t", JobOutcome::Expired { reason: "exit".into() }) {
            StatusUpdate::Retry(f) => assert!(matches!(f.error, TaskError::AbnormalTermination { .. })),
            other => panic!("unexpected {other:?}"),
        }
        let timed_out = JobOutcome::TimedOut {
            after: Duration::from_secs(2),
        };
        match classifier.classify("t", timed_out) {
            StatusUpdate::Retry(f) => assert!(matches!(f.error, TaskError::Timeout { .. })),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_raised_without_predicate_fails() {
        let channel = MessageChannel::new();
        let classifier = CompletionClassifier::new(channel.sender(), None);
        assert_eq!(classifier.classify("t", raised("NameError")).status(), Status::Failed);
    }

    #[test]
    fn test_predicate_decides_raised() {
        let channel = MessageChannel::new();
        let classifier = CompletionClassifier::new(channel.sender(), Some(retry_on("ValueError")));
        assert_eq!(classifier.classify("t", raised("ValueError")).status(), Status::Retry);
        assert_eq!(classifier.classify("t", raised("NameError")).status(), Status::Failed);
    }

    #[test]
    fn test_panicking_predicate_fails_task() {
        let mut channel = MessageChannel::new();
        let predicate: RetryPredicate =
            Arc::new(|_: &TaskError| -> bool { panic!("predicate bug") });
        let classifier = CompletionClassifier::new(channel.sender(), Some(predicate));

        classifier.callback("t3")(raised("ValueError"));

        let messages = channel.drain_state();
        assert_eq!(messages.len(), 1);
        match &messages[0].body {
            MessageBody::Status(StatusUpdate::Failed(failure)) => {
                assert_eq!(failure.error.error_type(), "ValueError");
            }
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn test_predicate_only_sees_raised_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let predicate: RetryPredicate = Arc::new(move |_: &TaskError| {
            counter.fetch_add(1, Ordering::SeqCst);
            false
        });
        let channel = MessageChannel::new();
        let classifier = CompletionClassifier::new(channel.sender(), Some(predicate));

        classifier.classify("t", JobOutcome::Returned(serde_json::Value::Null));
        classifier.classify("t", JobOutcome::Expired { reason: "x".into() });
        classifier.classify("t", raised("ValueError"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_posts_one_status_message() {
        let mut channel = MessageChannel::new();
        let classifier = CompletionClassifier::new(channel.sender(), None);
        let callback = classifier.callback("t9");
        callback(JobOutcome::Returned(serde_json::json!(5)));

        let messages = channel.drain_state();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].task_id, "t9");
        assert_eq!(
            messages[0].body,
            MessageBody::Status(StatusUpdate::Done(serde_json::json!(5)))
        );
        assert!(channel.drain_log().is_empty());
    }
}
