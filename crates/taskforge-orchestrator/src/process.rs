use crate::backend::JobTicket;
use crate::task::Task;
use crate::types::{Status, StatusUpdate, TaskReport, TaskResult};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;
use taskforge_core::{TaskError, TaskFailure, TaskforgeError, TaskforgeResult};

/// Orchestrator-side bookkeeping for one task.
///
/// Only the reconciliation loop mutates a `Process`, and only through
/// [`Process::update_status`], which enforces the transition table:
///
/// | to        | allowed from            | effect                                  |
/// |-----------|-------------------------|-----------------------------------------|
/// | `NEW`     | anything but `DONE`     | reset progress and result               |
/// | `PENDING` | not `DONE`/`FAILED`     | record start time                       |
/// | `DONE`    | not `DONE`/`FAILED`     | elapsed time, store value, drop ticket  |
/// | `FAILED`  | not `DONE`/`FAILED`     | elapsed time, store failure, drop ticket|
/// | `RETRY`   | not `DONE`/`FAILED`/`RETRY` | becomes `FAILED` once attempts are spent |
pub struct Process {
    id: String,
    task: Task,
    status: Status,
    ticket: Option<JobTicket>,
    result: Option<TaskResult>,
    start_time: Option<DateTime<Utc>>,
    elapsed_time: Option<Duration>,
    attempts: u32,
    max_attempts: Option<u32>,
    progress: f64,
    progress_update: Option<DateTime<Utc>>,
}

impl Process {
    pub fn new(id: impl Into<String>, task: Task, max_attempts: Option<u32>) -> Self {
        Self {
            id: id.into(),
            task,
            status: Status::New,
            ticket: None,
            result: None,
            start_time: None,
            elapsed_time: None,
            attempts: 0,
            max_attempts,
            progress: 0.0,
            progress_update: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// Handle of the in-flight job, present only while an attempt is running.
    pub fn ticket(&self) -> Option<&JobTicket> {
        self.ticket.as_ref()
    }

    pub fn result(&self) -> Option<&TaskResult> {
        self.result.as_ref()
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    pub fn elapsed_time(&self) -> Option<Duration> {
        self.elapsed_time
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn progress(&self) -> f64 {
        self.progress
    }

    pub fn progress_update(&self) -> Option<DateTime<Utc>> {
        self.progress_update
    }

    /// Neither `DONE` nor `FAILED`.
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Whether another dispatch attempt is allowed.
    pub fn has_attempts_left(&self) -> bool {
        self.max_attempts.map_or(true, |max| self.attempts < max)
    }

    /// Reset to `NEW` ahead of a dispatch; fails once attempts are spent.
    pub fn prepare_attempt(&mut self) -> TaskforgeResult<()> {
        if !self.has_attempts_left() {
            return Err(TaskforgeError::Transition(format!(
                "[{}]: Max attempts reached",
                self.id
            )));
        }
        self.update_status(StatusUpdate::New)?;
        Ok(())
    }

    /// Record that an attempt was handed to the backend.
    pub fn attach(&mut self, ticket: JobTicket) {
        self.ticket = Some(ticket);
        self.attempts += 1;
    }

    /// Apply a transition. On a guard violation the process is left untouched.
    ///
    /// Returns the status actually reached, which differs from the requested
    /// one when a retry is rerouted to `FAILED`.
    pub fn update_status(&mut self, update: StatusUpdate) -> TaskforgeResult<Status> {
        match update {
            StatusUpdate::New => {
                if self.status == Status::Done {
                    return Err(self.invalid("Cannot start a process already done"));
                }
                self.status = Status::New;
                self.progress = 0.0;
                self.result = None;
            }
            StatusUpdate::Pending { started_at } => {
                if self.status.is_terminal() {
                    return Err(self.invalid("Cannot mark pending a process done or failed"));
                }
                self.status = Status::Pending;
                self.start_time = Some(started_at);
            }
            StatusUpdate::Done(value) => {
                match self.status {
                    Status::Failed => return Err(self.invalid("Cannot finish a failed process")),
                    Status::Done => {
                        return Err(self.invalid("Cannot finish a process already done"))
                    }
                    _ => {}
                }
                self.finish(Status::Done, TaskResult::Value(value));
            }
            StatusUpdate::Failed(failure) => {
                match self.status {
                    Status::Done => return Err(self.invalid("Cannot fail a process done")),
                    Status::Failed => {
                        return Err(self.invalid("Cannot fail a process already failed"))
                    }
                    _ => {}
                }
                self.finish(Status::Failed, TaskResult::Failure(failure));
            }
            StatusUpdate::Retry(failure) => {
                match self.status {
                    Status::Done | Status::Failed => {
                        return Err(self.invalid("Cannot retry a process done or failed"))
                    }
                    Status::Retry => {
                        return Err(self.invalid("Cannot retry a process already retried"))
                    }
                    _ => {}
                }
                if self.has_attempts_left() {
                    self.status = Status::Retry;
                } else {
                    self.finish(Status::Failed, TaskResult::Failure(failure));
                }
            }
        }
        Ok(self.status)
    }

    /// Record a progress report. Ignored unless the process is `PENDING`.
    pub fn update_progress(&mut self, fraction: f64) -> bool {
        if self.status != Status::Pending {
            return false;
        }
        self.progress = fraction.clamp(0.0, 1.0);
        self.progress_update = Some(Utc::now());
        true
    }

    /// Share of the overall run this process accounts for, in `[0, 1]`.
    pub fn progress_contribution(&self) -> f64 {
        match self.status {
            Status::Done | Status::Failed => 1.0,
            Status::Pending => self.progress.clamp(0.0, 1.0),
            Status::New | Status::Retry => 0.0,
        }
    }

    /// `PENDING` for longer than `limit` as of `now`.
    pub fn is_stuck(&self, now: DateTime<Utc>, limit: Duration) -> bool {
        if self.status != Status::Pending {
            return false;
        }
        match (self.start_time, chrono::Duration::from_std(limit)) {
            (Some(start), Ok(limit)) => now - start > limit,
            _ => false,
        }
    }

    /// Seed a process from a previous run's checkpoint so it is not redispatched.
    pub fn restore_done(&mut self, value: serde_json::Value) -> TaskforgeResult<()> {
        if self.status != Status::New {
            return Err(self.invalid("Only a new process can be restored"));
        }
        self.status = Status::Done;
        self.result = Some(TaskResult::Value(value));
        Ok(())
    }

    /// Final report entry for this process.
    pub fn report(&self) -> TaskReport {
        let result = self.result.clone().unwrap_or_else(|| {
            TaskResult::Failure(TaskFailure::new(
                TaskError::abnormal_termination("no outcome was recorded"),
                format!("process {} ended in {}", self.id, self.status),
            ))
        });
        TaskReport {
            status: self.status,
            result,
            attempts: self.attempts,
            elapsed: self.elapsed_time,
        }
    }

    fn finish(&mut self, status: Status, result: TaskResult) {
        self.status = status;
        self.elapsed_time = Some(
            self.start_time
                .and_then(|start| (Utc::now() - start).to_std().ok())
                .unwrap_or_default(),
        );
        self.ticket = None;
        self.result = Some(result);
    }

    fn invalid(&self, reason: &str) -> TaskforgeError {
        TaskforgeError::Transition(format!("[{}]: {reason} (status {})", self.id, self.status))
    }
}

/// Number of processes that are neither `DONE` nor `FAILED`.
pub fn count_active(processes: &BTreeMap<String, Process>) -> usize {
    processes.values().filter(|p| p.is_active()).count()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn process(max_attempts: Option<u32>) -> Process {
        Process::new("p1", Task::new(|| Ok::<_, TaskError>(true)), max_attempts)
    }

    fn failure() -> TaskFailure {
        TaskFailure::new(TaskError::application("ValueError", "boom", serde_json::Value::Null), "")
    }

    fn pending() -> StatusUpdate {
        StatusUpdate::Pending {
            started_at: Utc::now(),
        }
    }

    fn ticket() -> JobTicket {
        JobTicket {
            id: Uuid::new_v4(),
            backend: "test".into(),
        }
    }

    fn start(p: &mut Process) {
        p.prepare_attempt().unwrap();
        p.attach(ticket());
        p.update_status(pending()).unwrap();
    }

    #[test]
    fn test_new_process() {
        let p = process(None);
        assert_eq!(p.status(), Status::New);
        assert_eq!(p.attempts(), 0);
        assert!(p.result().is_none());
        assert!(p.ticket().is_none());
        assert!(p.is_active());
    }

    #[test]
    fn test_happy_path() {
        let mut p = process(None);
        start(&mut p);
        assert_eq!(p.status(), Status::Pending);
        assert!(p.ticket().is_some());
        assert!(p.start_time().is_some());

        let reached = p.update_status(StatusUpdate::Done(serde_json::json!(7))).unwrap();
        assert_eq!(reached, Status::Done);
        assert!(p.ticket().is_none());
        assert!(p.elapsed_time().is_some());
        assert_eq!(p.result().and_then(TaskResult::value), Some(&serde_json::json!(7)));
        assert_eq!(p.attempts(), 1);
    }

    #[test]
    fn test_done_is_final() {
        let mut p = process(None);
        start(&mut p);
        p.update_status(StatusUpdate::Done(serde_json::json!(1))).unwrap();

        for update in [
            StatusUpdate::New,
            pending(),
            StatusUpdate::Done(serde_json::json!(2)),
            StatusUpdate::Failed(failure()),
            StatusUpdate::Retry(failure()),
        ] {
            assert!(p.update_status(update).is_err());
            assert_eq!(p.status(), Status::Done);
            assert_eq!(p.result().and_then(TaskResult::value), Some(&serde_json::json!(1)));
        }
        assert!(p.prepare_attempt().is_err());
    }

    #[test]
    fn test_failed_rejects_completion() {
        let mut p = process(None);
        start(&mut p);
        p.update_status(StatusUpdate::Failed(failure())).unwrap();
        assert!(p.update_status(StatusUpdate::Done(serde_json::json!(1))).is_err());
        assert!(p.update_status(StatusUpdate::Failed(failure())).is_err());
        assert!(p.update_status(pending()).is_err());
        assert_eq!(p.status(), Status::Failed);
    }

    #[test]
    fn test_failed_can_be_reset_but_not_started() {
        // NEW is only forbidden from DONE
        let mut p = process(None);
        start(&mut p);
        p.update_status(StatusUpdate::Failed(failure())).unwrap();
        assert_eq!(p.update_status(StatusUpdate::New).unwrap(), Status::New);
        assert!(p.result().is_none());
    }

    #[test]
    fn test_retry_then_restart() {
        let mut p = process(Some(3));
        start(&mut p);
        assert_eq!(p.update_status(StatusUpdate::Retry(failure())).unwrap(), Status::Retry);
        assert!(p.update_status(StatusUpdate::Retry(failure())).is_err());

        start(&mut p);
        assert_eq!(p.attempts(), 2);
        assert_eq!(p.status(), Status::Pending);
        assert_eq!(p.progress(), 0.0);
    }

    #[test]
    fn test_retry_reroutes_to_failed_when_exhausted() {
        let mut p = process(Some(2));
        start(&mut p);
        p.update_status(StatusUpdate::Retry(failure())).unwrap();
        start(&mut p);
        let reached = p.update_status(StatusUpdate::Retry(failure())).unwrap();
        assert_eq!(reached, Status::Failed);
        assert_eq!(p.attempts(), 2);
        assert_eq!(p.result().and_then(TaskResult::error).map(TaskError::error_type), Some("ValueError"));
        assert!(p.prepare_attempt().is_err());
    }

    #[test]
    fn test_unbounded_attempts() {
        let mut p = process(None);
        for _ in 0..20 {
            start(&mut p);
            assert_eq!(p.update_status(StatusUpdate::Retry(failure())).unwrap(), Status::Retry);
        }
        assert_eq!(p.attempts(), 20);
    }

    #[test]
    fn test_fail_without_start_has_zero_elapsed() {
        let mut p = process(None);
        p.update_status(StatusUpdate::Failed(failure())).unwrap();
        assert_eq!(p.elapsed_time(), Some(Duration::ZERO));
    }

    #[test]
    fn test_progress_only_while_pending() {
        let mut p = process(None);
        assert!(!p.update_progress(0.5));
        assert_eq!(p.progress_contribution(), 0.0);

        start(&mut p);
        assert!(p.update_progress(0.5));
        assert!(p.progress_update().is_some());
        assert_eq!(p.progress_contribution(), 0.5);

        p.update_status(StatusUpdate::Done(serde_json::Value::Null)).unwrap();
        assert!(!p.update_progress(0.1));
        assert_eq!(p.progress_contribution(), 1.0);
    }

    #[test]
    fn test_is_stuck() {
        let mut p = process(None);
        let started = Utc::now() - chrono::Duration::seconds(10);
        p.update_status(StatusUpdate::Pending { started_at: started }).unwrap();
        assert!(p.is_stuck(Utc::now(), Duration::from_secs(5)));
        assert!(!p.is_stuck(Utc::now(), Duration::from_secs(60)));
    }

    #[test]
    fn test_restore_done() {
        let mut p = process(None);
        p.restore_done(serde_json::json!("cached")).unwrap();
        assert_eq!(p.status(), Status::Done);
        assert_eq!(p.report().status, Status::Done);
        assert!(p.restore_done(serde_json::json!(1)).is_err());
    }

    #[test]
    fn test_count_active() {
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), process(None));
        let mut done = process(None);
        done.update_status(StatusUpdate::Done(serde_json::Value::Null)).unwrap();
        map.insert("b".to_string(), done);
        assert_eq!(count_active(&map), 1);
    }
}
