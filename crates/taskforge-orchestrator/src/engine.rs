use crate::backend::{ExecutionBackend, LocalPool};
use crate::channel::{MessageChannel, MessageSender};
use crate::checkpoint::{snapshot, CheckpointStore, Snapshot};
use crate::classify::{CompletionClassifier, RetryPredicate};
use crate::config::OrchestratorConfig;
use crate::monitor::{log_full_status, log_status, truncate_fmt, ReportSchedule};
use crate::process::{count_active, Process};
use crate::task::Task;
use crate::trampoline;
use crate::types::{Message, MessageBody, RunReport, Status, StatusUpdate};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use taskforge_core::{TaskError, TaskFailure, TaskforgeError, TaskforgeResult};
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

/// Runs a set of tasks to completion on an execution backend.
///
/// The orchestrator owns one [`Process`] per task and is the only code that
/// mutates them. Each run drives a polling loop that drains status messages,
/// then progress and log messages, fails tasks stuck past `timeout` plus the
/// grace period, resubmits tasks waiting for a retry, sleeps, prints reports
/// and writes a checkpoint if anything changed. It returns once every task is
/// `DONE` or `FAILED`.
///
/// Errors inside the loop (invalid transitions, submission failures,
/// checkpoint I/O) are logged and resolved in place; only invalid input is
/// reported through the returned `Result`.
pub struct Orchestrator {
    config: OrchestratorConfig,
    backend: Option<Arc<dyn ExecutionBackend>>,
    retry_predicate: Option<RetryPredicate>,
    span: Span,
    resume: Option<Snapshot>,
}

impl Orchestrator {
    /// Run on a local worker pool built from `config`, created for each run
    /// and shut down at its end.
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            backend: None,
            retry_predicate: None,
            span: info_span!("orchestrator"),
            resume: None,
        }
    }

    /// Run on a backend owned by the caller. It is not shut down after a run.
    pub fn with_backend(config: OrchestratorConfig, backend: Arc<dyn ExecutionBackend>) -> Self {
        Self {
            backend: Some(backend),
            ..Self::new(config)
        }
    }

    /// Retry raised errors for which `predicate` returns true.
    pub fn with_retry_predicate(
        mut self,
        predicate: impl Fn(&TaskError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retry_predicate = Some(Arc::new(predicate));
        self
    }

    /// Span every log line of a run is recorded under.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Skip tasks a previous run recorded as `DONE`, reusing their values.
    pub fn resume_from(mut self, snapshot: Snapshot) -> Self {
        self.resume = Some(snapshot);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Run every task until it is `DONE` or `FAILED`.
    ///
    /// Fails only on invalid configuration, an empty or duplicate task id, or
    /// when the local pool cannot be created. Must be called from within a
    /// Tokio runtime.
    pub async fn run<I, K>(&self, tasks: I) -> TaskforgeResult<RunReport>
    where
        I: IntoIterator<Item = (K, Task)>,
        K: Into<String>,
    {
        self.config.validate()?;
        let tasks = collect_tasks(tasks)?;
        if tasks.is_empty() {
            return Ok(RunReport::default());
        }

        let (backend, owned) = match &self.backend {
            Some(backend) => (Arc::clone(backend), false),
            None => {
                let pool = LocalPool::new(self.config.children, self.config.max_tasks_per_child)?;
                (Arc::new(pool) as Arc<dyn ExecutionBackend>, true)
            }
        };

        let report = self
            .reconcile(tasks, Arc::clone(&backend))
            .instrument(self.span.clone())
            .await;

        if owned {
            backend.shutdown().await;
        }
        Ok(report)
    }

    async fn reconcile(
        &self,
        tasks: BTreeMap<String, Task>,
        backend: Arc<dyn ExecutionBackend>,
    ) -> RunReport {
        let mut channel = MessageChannel::new();
        let sender = channel.sender();
        let classifier = CompletionClassifier::new(sender.clone(), self.retry_predicate.clone());
        let launcher = Launcher {
            backend: backend.as_ref(),
            sender: &sender,
            classifier: &classifier,
            timeout: self.config.timeout(),
        };

        let store = self.config.checkpoint_dir.as_ref().map(CheckpointStore::new);
        if let Some(store) = &store {
            if let Err(e) = store.ensure_dir().await {
                error!(error = %e, "Checkpoint directory unavailable");
            }
        }

        let mut processes: BTreeMap<String, Process> = tasks
            .into_iter()
            .map(|(id, task)| {
                let process = Process::new(id.clone(), task, self.config.max_attempts);
                (id, process)
            })
            .collect();
        self.restore(&mut processes);

        info!(
            tasks = processes.len(),
            backend = backend.name(),
            capacity = backend.capacity(),
            "Starting run"
        );
        for process in processes.values_mut() {
            if process.status() == Status::New {
                launcher.start(process);
            }
        }

        let verbosity = self.config.verbosity();
        let poll_interval = self.config.poll_interval();
        let stuck_after = self.config.stuck_after();
        let mut schedule =
            ReportSchedule::new(self.config.full_report_every, self.config.summary_cooldown);
        let mut checkpoint_due = false;

        while count_active(&processes) > 0 {
            let mut changed = false;

            for message in channel.drain_state() {
                apply_status(&mut processes, message);
                changed = true;
                checkpoint_due = true;
            }

            for message in channel.drain_log() {
                apply_log(&mut processes, message);
            }

            if let Some(limit) = stuck_after {
                if fail_stuck(&mut processes, limit) {
                    changed = true;
                    checkpoint_due = true;
                }
            }

            for process in processes.values_mut() {
                if process.status() == Status::Retry {
                    launcher.start(process);
                    info!(task_id = %process.id(), attempt = process.attempts(), "Task will restart");
                    changed = true;
                }
            }

            tokio::time::sleep(poll_interval).await;

            let due = schedule.tick(changed);
            if due.full {
                log_full_status(&processes, verbosity);
            }
            if due.summary {
                log_status(&processes, verbosity);
            }

            if std::mem::take(&mut checkpoint_due) {
                if let Some(store) = &store {
                    match store.save(&snapshot(&processes)).await {
                        Ok(path) => debug!(path = %path.display(), "Checkpoint written"),
                        Err(e) => error!(error = %e, "Checkpoint failed"),
                    }
                }
            }
        }

        channel.close();
        log_full_status(&processes, verbosity);

        let report = RunReport {
            tasks: processes
                .iter()
                .map(|(id, p)| (id.clone(), p.report()))
                .collect(),
        };
        info!(
            done = report.count(Status::Done),
            failed = report.count(Status::Failed),
            "Run finished"
        );
        report
    }

    fn restore(&self, processes: &mut BTreeMap<String, Process>) {
        let Some(previous) = &self.resume else {
            return;
        };
        let mut restored = 0;
        for (id, (status, value)) in previous {
            if *status != Status::Done {
                continue;
            }
            match processes.get_mut(id) {
                Some(process) => match process.restore_done(value.clone()) {
                    Ok(()) => restored += 1,
                    Err(e) => warn!(error = %e, "Unable to restore task"),
                },
                None => debug!(task_id = %id, "Checkpointed task is not part of this run"),
            }
        }
        info!(restored, "Resumed from checkpoint");
    }
}

/// Everything needed to hand one attempt to the backend.
struct Launcher<'a> {
    backend: &'a dyn ExecutionBackend,
    sender: &'a MessageSender,
    classifier: &'a CompletionClassifier,
    timeout: Option<Duration>,
}

impl Launcher<'_> {
    /// Submit the next attempt; a submission failure fails the task.
    fn start(&self, process: &mut Process) {
        if let Err(e) = self.submit(process) {
            error!(task_id = %process.id(), error = %e, "Unable to submit task");
            let failure = TaskFailure::new(
                TaskError::abnormal_termination(format!("submission failed: {e}")),
                format!("backend {} rejected attempt {}", self.backend.name(), process.attempts() + 1),
            );
            if let Err(e) = process.update_status(StatusUpdate::Failed(failure)) {
                error!(error = %e, "Unable to fail task");
            }
        }
    }

    fn submit(&self, process: &mut Process) -> TaskforgeResult<()> {
        process.prepare_attempt()?;
        let job = trampoline::job(process.id(), process.task().clone(), self.sender.clone());
        let pending = self.backend.submit(job, self.timeout)?;
        let ticket = self
            .backend
            .on_complete(pending, self.classifier.callback(process.id()));
        debug!(task_id = %process.id(), ticket = %ticket, "Task submitted");
        process.attach(ticket);
        Ok(())
    }
}

fn collect_tasks<I, K>(tasks: I) -> TaskforgeResult<BTreeMap<String, Task>>
where
    I: IntoIterator<Item = (K, Task)>,
    K: Into<String>,
{
    let mut map = BTreeMap::new();
    for (id, task) in tasks {
        let id: String = id.into();
        if id.trim().is_empty() {
            return Err(TaskforgeError::Config("task ids must not be empty".into()));
        }
        if map.insert(id.clone(), task).is_some() {
            return Err(TaskforgeError::Config(format!("duplicate task id '{id}'")));
        }
    }
    Ok(map)
}

fn apply_status(processes: &mut BTreeMap<String, Process>, message: Message) {
    let MessageBody::Status(update) = message.body else {
        warn!(task_id = %message.task_id, kind = ?message.kind(), "Unexpected message on state queue");
        return;
    };
    let Some(process) = processes.get_mut(&message.task_id) else {
        warn!(task_id = %message.task_id, "Status for unknown task");
        return;
    };

    let detail = truncate_fmt(describe(&update), 100);
    match process.update_status(update) {
        Ok(status) => info!(
            task_id = %message.task_id,
            at = %message.timestamp,
            status = %status,
            "New status [{detail}]"
        ),
        Err(e) => error!(error = %e, "Rejected status update"),
    }
}

fn apply_log(processes: &mut BTreeMap<String, Process>, message: Message) {
    match message.body {
        MessageBody::Progress(fraction) => {
            if let Some(process) = processes.get_mut(&message.task_id) {
                if process.update_progress(fraction) {
                    debug!(task_id = %message.task_id, "{:.0}%", 100.0 * fraction);
                }
            }
        }
        MessageBody::Log(text) => info!(task_id = %message.task_id, "{text}"),
        MessageBody::Status(_) => {
            warn!(task_id = %message.task_id, "Unexpected status on log queue");
        }
    }
}

/// Fail every process pending for longer than `limit`. True if any was.
fn fail_stuck(processes: &mut BTreeMap<String, Process>, limit: Duration) -> bool {
    let now = Utc::now();
    let mut any = false;
    for process in processes.values_mut().filter(|p| p.is_stuck(now, limit)) {
        any = true;
        let since = process
            .start_time()
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();
        error!(task_id = %process.id(), since = %since, "Timeout error, task looks stuck");
        let failure = TaskFailure::new(
            TaskError::timeout("Unrecoverable timeout"),
            format!("pending since {since}, more than {limit:?}"),
        );
        if let Err(e) = process.update_status(StatusUpdate::Failed(failure)) {
            error!(error = %e, "Unable to fail stuck task");
        }
    }
    any
}

fn describe(update: &StatusUpdate) -> String {
    match update {
        StatusUpdate::New => String::new(),
        StatusUpdate::Pending { started_at } => started_at.to_rfc3339(),
        StatusUpdate::Done(value) => value.to_string(),
        StatusUpdate::Retry(failure) | StatusUpdate::Failed(failure) => failure.error.to_string(),
    }
}
