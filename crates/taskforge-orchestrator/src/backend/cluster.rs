use super::{job_channel, panic_message, ExecutionBackend, Job, JobOutcome, PendingJob};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use taskforge_core::{TaskError, TaskFailure, TaskforgeError, TaskforgeResult};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Shape of the compute cluster a [`ClusterBackend`] dispatches to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Number of executor nodes.
    #[serde(default = "default_nodes")]
    pub nodes: usize,
    /// Concurrent jobs per node.
    #[serde(default = "default_slots_per_node")]
    pub slots_per_node: usize,
}

fn default_nodes() -> usize {
    1
}

fn default_slots_per_node() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            nodes: default_nodes(),
            slots_per_node: default_slots_per_node(),
        }
    }
}

impl ClusterConfig {
    /// Jobs the whole cluster can run at once.
    pub fn capacity(&self) -> usize {
        self.nodes.saturating_mul(self.slots_per_node)
    }
}

/// Client for a capacity-bounded cluster of executor slots.
///
/// Parallelism is bounded by the cluster's capacity, not by a local worker
/// count. Each job runs on an executor slot and its outcome is encoded to the
/// wire format and decoded again before it is reported, so whatever reaches
/// the orchestrator has crossed a real serialization boundary. A job that
/// exceeds its timeout keeps its slot until it returns; the cluster, not the
/// orchestrator, reclaims it.
pub struct ClusterBackend {
    config: ClusterConfig,
    slots: Arc<Semaphore>,
    dispatched: Arc<AtomicUsize>,
}

const NAME: &str = "cluster";

impl ClusterBackend {
    pub fn new(config: ClusterConfig) -> TaskforgeResult<Self> {
        let capacity = config.capacity();
        if capacity == 0 {
            return Err(TaskforgeError::Config(
                "cluster needs at least one node with one slot".to_string(),
            ));
        }
        info!(
            nodes = config.nodes,
            slots_per_node = config.slots_per_node,
            "Cluster client connected"
        );
        Ok(Self {
            config,
            slots: Arc::new(Semaphore::new(capacity)),
            dispatched: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Slots not currently running a job.
    pub fn idle_slots(&self) -> usize {
        self.slots.available_permits()
    }
}

#[async_trait]
impl ExecutionBackend for ClusterBackend {
    fn name(&self) -> &str {
        NAME
    }

    fn capacity(&self) -> usize {
        self.config.capacity()
    }

    fn submit(&self, job: Job, timeout: Option<Duration>) -> TaskforgeResult<PendingJob> {
        if self.slots.is_closed() {
            return Err(TaskforgeError::Backend("cluster client is closed".to_string()));
        }

        let (mut slot, pending) = job_channel(NAME);
        let slots = Arc::clone(&self.slots);
        let sequence = self.dispatched.fetch_add(1, Ordering::SeqCst);
        let node = sequence % self.config.nodes.max(1);
        let ticket = pending.ticket().clone();

        tokio::spawn(async move {
            // A closed semaphore drops the slot, which expires the job.
            let Ok(permit) = slots.acquire_owned().await else {
                return;
            };
            slot.mark_started();
            debug!(ticket = %ticket, node, "Job scheduled on cluster node");

            let outcome = match tokio::task::spawn_blocking(job).await {
                Ok(Ok(value)) => JobOutcome::Returned(value),
                Ok(Err(failure)) => JobOutcome::Raised(failure),
                Err(e) if e.is_panic() => JobOutcome::Expired {
                    reason: format!(
                        "executor on node {node} terminated abruptly: {}",
                        panic_message(e.into_panic().as_ref())
                    ),
                },
                Err(e) => JobOutcome::Expired {
                    reason: format!("executor on node {node} was cancelled: {e}"),
                },
            };
            drop(permit);
            slot.finish(transfer(outcome));
        });

        Ok(pending.with_timeout(timeout))
    }

    async fn shutdown(&self) {
        self.slots.close();
        info!(
            dispatched = self.dispatched.load(Ordering::SeqCst),
            "Cluster client closed"
        );
    }
}

/// Move an outcome across the wire: encode, then decode on the client side.
fn transfer(outcome: JobOutcome) -> JobOutcome {
    let decoded = serde_json::to_vec(&outcome)
        .and_then(|bytes| serde_json::from_slice::<JobOutcome>(&bytes));
    match decoded {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(error = %e, "Job outcome could not cross the wire");
            JobOutcome::Raised(TaskFailure::new(
                TaskError::NonSerializableResult {
                    reason: e.to_string(),
                },
                "outcome rejected by cluster wire envelope",
            ))
        }
    }
}
