use crate::channel::MessageSender;
use crate::trampoline::seal;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use taskforge_core::TaskFailure;

type PlainFn = dyn Fn() -> Result<Value, TaskFailure> + Send + Sync;
type ReportingFn = dyn Fn(&ProgressReporter) -> Result<Value, TaskFailure> + Send + Sync;

/// The callable behind a [`Task`], tagged by whether it reports progress.
#[derive(Clone)]
pub enum TaskFn {
    /// Takes no arguments.
    Plain(Arc<PlainFn>),
    /// Receives a [`ProgressReporter`] bound to its task id.
    Reporting(Arc<ReportingFn>),
}

/// A caller-supplied unit of work.
///
/// The closure may run any number of times (once per attempt) on any worker,
/// so it must be `Fn + Send + Sync + 'static`. Its value and error are checked
/// for transportability inside the worker, before they leave it.
#[derive(Clone)]
pub struct Task {
    func: TaskFn,
}

impl Task {
    /// Wrap a zero-argument callable.
    pub fn new<F, T, E>(f: F) -> Self
    where
        F: Fn() -> Result<T, E> + Send + Sync + 'static,
        T: Serialize,
        E: std::error::Error + Serialize,
    {
        Self {
            func: TaskFn::Plain(Arc::new(move || seal(f()))),
        }
    }

    /// Wrap a callable that reports progress through the given reporter.
    pub fn with_progress<F, T, E>(f: F) -> Self
    where
        F: Fn(&ProgressReporter) -> Result<T, E> + Send + Sync + 'static,
        T: Serialize,
        E: std::error::Error + Serialize,
    {
        Self {
            func: TaskFn::Reporting(Arc::new(move |reporter: &ProgressReporter| {
                seal(f(reporter))
            })),
        }
    }

    pub fn func(&self) -> &TaskFn {
        &self.func
    }

    pub fn reports_progress(&self) -> bool {
        matches!(self.func, TaskFn::Reporting(_))
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("reports_progress", &self.reports_progress())
            .finish()
    }
}

/// Handle given to progress-reporting tasks.
///
/// Everything it posts travels on the log queue, so it never competes with
/// status transitions.
#[derive(Clone)]
pub struct ProgressReporter {
    task_id: String,
    sender: MessageSender,
}

impl ProgressReporter {
    pub(crate) fn new(task_id: impl Into<String>, sender: MessageSender) -> Self {
        Self {
            task_id: task_id.into(),
            sender,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Report completion as a fraction; clamped to `[0, 1]`, NaN counts as 0.
    pub fn progress(&self, fraction: f64) {
        let fraction = if fraction.is_nan() {
            0.0
        } else {
            fraction.clamp(0.0, 1.0)
        };
        self.sender.post_progress(&self.task_id, fraction);
    }

    /// Forward a log line to the orchestrator.
    pub fn log(&self, text: impl Into<String>) {
        self.sender.post_log(&self.task_id, text);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::channel::MessageChannel;
    use crate::types::MessageBody;
    use taskforge_core::TaskError;

    #[test]
    fn test_plain_task_is_not_reporting() {
        let task = Task::new(|| Ok::<_, TaskError>(42));
        assert!(!task.reports_progress());
        match task.func() {
            TaskFn::Plain(f) => assert_eq!(f().unwrap(), serde_json::json!(42)),
            TaskFn::Reporting(_) => panic!("expected plain task"),
        }
    }

    #[test]
    fn test_reporting_task_flag() {
        let task = Task::with_progress(|r: &ProgressReporter| {
            r.progress(1.0);
            Ok::<_, TaskError>(())
        });
        assert!(task.reports_progress());
        assert!(format!("{task:?}").contains("reports_progress: true"));
    }

    #[test]
    fn test_reporter_clamps_progress() {
        let mut channel = MessageChannel::new();
        let reporter = ProgressReporter::new("t1", channel.sender());
        reporter.progress(1.7);
        reporter.progress(-0.2);
        reporter.progress(f64::NAN);
        reporter.log("working");

        let bodies: Vec<MessageBody> = channel.drain_log().into_iter().map(|m| m.body).collect();
        assert_eq!(
            bodies,
            vec![
                MessageBody::Progress(1.0),
                MessageBody::Progress(0.0),
                MessageBody::Progress(0.0),
                MessageBody::Log("working".into()),
            ]
        );
    }
}
