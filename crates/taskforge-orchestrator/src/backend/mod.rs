//! Execution back-ends: the facilities that actually run task attempts.
//!
//! The orchestrator only ever talks to the [`ExecutionBackend`] trait: it
//! submits a [`Job`], receives a [`PendingJob`], and registers a completion
//! callback. Two implementations ship with the crate:
//!
//! - [`LocalPool`]: a bounded pool of worker threads with worker recycling.
//! - [`ClusterBackend`]: capacity-bounded remote-style executor slots whose
//!   outcomes cross a serialized wire envelope.

/// Capacity-bounded cluster client.
pub mod cluster;
/// Bounded local worker pool.
pub mod local;

pub use cluster::{ClusterBackend, ClusterConfig};
pub use local::LocalPool;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::time::Duration;
use taskforge_core::{TaskFailure, TaskforgeResult};
use tokio::sync::oneshot;
use uuid::Uuid;

/// One attempt of a task, ready to run on a worker.
pub type Job = Box<dyn FnOnce() -> Result<serde_json::Value, TaskFailure> + Send + 'static>;

/// Invoked exactly once when a submitted job resolves.
pub type CompletionCallback = Box<dyn FnOnce(JobOutcome) + Send + 'static>;

/// How a job ended, as observed by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    /// The job returned normally.
    Returned(serde_json::Value),
    /// The job returned an error.
    Raised(TaskFailure),
    /// The worker died before reporting (panic, lost node, shutdown).
    Expired {
        /// What was observed.
        reason: String,
    },
    /// The job ran past the backend's timeout and was abandoned.
    TimedOut {
        /// The timeout that was exceeded.
        after: Duration,
    },
}

/// Opaque handle to an in-flight job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobTicket {
    pub id: Uuid,
    /// Name of the backend that accepted the job.
    pub backend: String,
}

impl JobTicket {
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            backend: backend.into(),
        }
    }
}

impl std::fmt::Display for JobTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.backend, self.id)
    }
}

type TimeoutHook = Box<dyn FnOnce() + Send + 'static>;

/// Receiving side of a submitted job.
///
/// The timeout clock starts when the worker actually picks the job up, not
/// when it is queued. Once a job has timed out the orchestrator forgets it;
/// reclaiming the worker that is still running it is the backend's business
/// (see [`PendingJob::on_timeout`]).
pub struct PendingJob {
    ticket: JobTicket,
    started: oneshot::Receiver<()>,
    outcome: oneshot::Receiver<JobOutcome>,
    timeout: Option<Duration>,
    on_timeout: Option<TimeoutHook>,
}

impl PendingJob {
    pub fn new(
        ticket: JobTicket,
        started: oneshot::Receiver<()>,
        outcome: oneshot::Receiver<JobOutcome>,
    ) -> Self {
        Self {
            ticket,
            started,
            outcome,
            timeout: None,
            on_timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run `hook` if the job is abandoned after timing out.
    pub fn on_timeout(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_timeout = Some(Box::new(hook));
        self
    }

    pub fn ticket(&self) -> &JobTicket {
        &self.ticket
    }

    /// Wait for the job to finish, time out, or be dropped by its worker.
    pub async fn resolve(self) -> JobOutcome {
        let PendingJob {
            ticket,
            started,
            outcome,
            timeout,
            on_timeout,
        } = self;

        if started.await.is_err() {
            return JobOutcome::Expired {
                reason: format!("job {ticket} was dropped before it started"),
            };
        }

        let received = match timeout {
            Some(limit) => match tokio::time::timeout(limit, outcome).await {
                Ok(received) => received,
                Err(_) => {
                    if let Some(hook) = on_timeout {
                        hook();
                    }
                    return JobOutcome::TimedOut { after: limit };
                }
            },
            None => outcome.await,
        };

        received.unwrap_or_else(|_| JobOutcome::Expired {
            reason: format!("worker running job {ticket} exited without reporting"),
        })
    }
}

/// Sending side of a submitted job, held by whoever runs it.
pub struct JobSlot {
    started: Option<oneshot::Sender<()>>,
    outcome: oneshot::Sender<JobOutcome>,
}

impl JobSlot {
    /// Signal that execution began; starts the timeout clock.
    pub fn mark_started(&mut self) {
        if let Some(tx) = self.started.take() {
            let _ = tx.send(());
        }
    }

    /// Deliver the outcome. Silently dropped if nobody is listening any more.
    pub fn finish(mut self, outcome: JobOutcome) {
        self.mark_started();
        let _ = self.outcome.send(outcome);
    }
}

/// Create the paired [`JobSlot`] / [`PendingJob`] for a new job.
pub fn job_channel(backend: &str) -> (JobSlot, PendingJob) {
    let (started_tx, started_rx) = oneshot::channel();
    let (outcome_tx, outcome_rx) = oneshot::channel();
    let slot = JobSlot {
        started: Some(started_tx),
        outcome: outcome_tx,
    };
    let pending = PendingJob::new(JobTicket::new(backend), started_rx, outcome_rx);
    (slot, pending)
}

/// An external facility able to run jobs asynchronously.
///
/// Implementations own their workers: the orchestrator never assumes an
/// abandoned job's resources are freed when it stops tracking it.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Short name used in tickets and logs.
    fn name(&self) -> &str;

    /// How many jobs can run at the same time.
    fn capacity(&self) -> usize;

    /// Queue a job for execution. `timeout` bounds its running time.
    fn submit(&self, job: Job, timeout: Option<Duration>) -> TaskforgeResult<PendingJob>;

    /// Arrange for `callback` to run when `pending` resolves.
    ///
    /// Must be called from within a Tokio runtime.
    fn on_complete(&self, pending: PendingJob, callback: CompletionCallback) -> JobTicket {
        let ticket = pending.ticket().clone();
        tokio::spawn(async move {
            let outcome = pending.resolve().await;
            callback(outcome);
        });
        ticket
    }

    /// Stop accepting jobs and release idle resources.
    async fn shutdown(&self);
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_resolve_returns_outcome() {
        let (slot, pending) = job_channel("test");
        slot.finish(JobOutcome::Returned(serde_json::json!(1)));
        assert_eq!(pending.resolve().await, JobOutcome::Returned(serde_json::json!(1)));
    }

    #[tokio::test]
    async fn test_resolve_dropped_before_start() {
        let (slot, pending) = job_channel("test");
        drop(slot);
        assert!(matches!(pending.resolve().await, JobOutcome::Expired { .. }));
    }

    #[tokio::test]
    async fn test_resolve_dropped_after_start() {
        let (mut slot, pending) = job_channel("test");
        slot.mark_started();
        drop(slot);
        match pending.resolve().await {
            JobOutcome::Expired { reason } => assert!(reason.contains("without reporting")),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_resolve_times_out_and_runs_hook() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let (mut slot, pending) = job_channel("test");
        let pending = pending
            .with_timeout(Some(Duration::from_millis(20)))
            .on_timeout(move || flag.store(true, Ordering::SeqCst));
        slot.mark_started();

        let outcome = pending.resolve().await;
        assert_eq!(
            outcome,
            JobOutcome::TimedOut {
                after: Duration::from_millis(20)
            }
        );
        assert!(fired.load(Ordering::SeqCst));
        drop(slot);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(3u8);
        assert_eq!(panic_message(payload.as_ref()), "worker panicked");
    }

    #[test]
    fn test_ticket_display() {
        let ticket = JobTicket::new("local");
        assert!(ticket.to_string().starts_with("local:"));
    }
}
