use super::{job_channel, panic_message, ExecutionBackend, Job, JobOutcome, JobSlot, PendingJob};
use async_trait::async_trait;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use taskforge_core::{TaskforgeError, TaskforgeResult};
use tracing::{debug, error, info, warn};

/// A bounded pool of worker threads.
///
/// - At most `children` jobs run at once.
/// - A worker retires after `max_tasks_per_child` jobs (0 = never) and is
///   replaced, which caps whatever a long-lived worker accumulates.
/// - A job that panics takes its worker down; the pool reports the job as
///   expired and starts a replacement.
/// - A job that outlives its timeout is abandoned: the pool starts a
///   replacement right away, and the stuck worker exits as soon as the job
///   finally returns. Its late result is discarded.
pub struct LocalPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    children: usize,
    max_tasks_per_child: usize,
    queue: Mutex<VecDeque<Queued>>,
    available: Condvar,
    shutting_down: AtomicBool,
    next_worker_id: AtomicUsize,
    live_workers: AtomicUsize,
}

struct Queued {
    job: Job,
    slot: JobSlot,
    state: Arc<Mutex<RunState>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Queued,
    Running,
    Finished,
    Abandoned,
}

const NAME: &str = "local";

impl LocalPool {
    /// Start a pool with `children` workers.
    pub fn new(children: usize, max_tasks_per_child: usize) -> TaskforgeResult<Self> {
        if children == 0 {
            return Err(TaskforgeError::Config(
                "local pool needs at least one worker".to_string(),
            ));
        }
        let inner = Arc::new(PoolInner {
            children,
            max_tasks_per_child,
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            shutting_down: AtomicBool::new(false),
            next_worker_id: AtomicUsize::new(0),
            live_workers: AtomicUsize::new(0),
        });
        for _ in 0..children {
            spawn_worker(&inner)
                .map_err(|e| TaskforgeError::Backend(format!("failed to start worker: {e}")))?;
        }
        info!(children, max_tasks_per_child, "Local pool started");
        Ok(Self { inner })
    }

    /// Worker threads currently alive, including ones stuck on abandoned jobs.
    pub fn live_workers(&self) -> usize {
        self.inner.live_workers.load(Ordering::SeqCst)
    }

    /// Total workers ever started (initial ones plus replacements).
    pub fn workers_started(&self) -> usize {
        self.inner.next_worker_id.load(Ordering::SeqCst)
    }

    /// Jobs waiting for a free worker.
    pub fn queued(&self) -> usize {
        self.inner.queue.lock().len()
    }

    fn close(&self) -> usize {
        let dropped = {
            let mut queue = self.inner.queue.lock();
            self.inner.shutting_down.store(true, Ordering::SeqCst);
            queue.drain(..).count()
        };
        self.inner.available.notify_all();
        dropped
    }
}

#[async_trait]
impl ExecutionBackend for LocalPool {
    fn name(&self) -> &str {
        NAME
    }

    fn capacity(&self) -> usize {
        self.inner.children
    }

    fn submit(&self, job: Job, timeout: Option<Duration>) -> TaskforgeResult<PendingJob> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(TaskforgeError::Backend("local pool is shut down".to_string()));
        }

        let (slot, pending) = job_channel(NAME);
        let state = Arc::new(Mutex::new(RunState::Queued));
        let hook_state = Arc::clone(&state);
        let pool = Arc::downgrade(&self.inner);
        let pending = pending
            .with_timeout(timeout)
            .on_timeout(move || abandon(&hook_state, &pool));

        self.inner.queue.lock().push_back(Queued { job, slot, state });
        self.inner.available.notify_one();
        Ok(pending)
    }

    async fn shutdown(&self) {
        let dropped = self.close();
        info!(
            dropped,
            live_workers = self.live_workers(),
            "Local pool shut down"
        );
    }
}

impl Drop for LocalPool {
    fn drop(&mut self) {
        self.close();
    }
}

fn abandon(state: &Mutex<RunState>, pool: &Weak<PoolInner>) {
    {
        let mut state = state.lock();
        if *state != RunState::Running {
            return;
        }
        *state = RunState::Abandoned;
    }
    if let Some(inner) = pool.upgrade() {
        warn!("Worker stuck on a timed-out job, starting a replacement");
        if let Err(e) = spawn_worker(&inner) {
            error!(error = %e, "Failed to start replacement worker");
        }
    }
}

fn spawn_worker(inner: &Arc<PoolInner>) -> std::io::Result<()> {
    if inner.shutting_down.load(Ordering::SeqCst) {
        return Ok(());
    }
    let worker_id = inner.next_worker_id.fetch_add(1, Ordering::SeqCst);
    let worker_inner = Arc::clone(inner);
    inner.live_workers.fetch_add(1, Ordering::SeqCst);
    let spawned = thread::Builder::new()
        .name(format!("taskforge-worker-{worker_id}"))
        .spawn(move || worker_loop(worker_inner, worker_id));
    if spawned.is_err() {
        inner.live_workers.fetch_sub(1, Ordering::SeqCst);
    }
    spawned.map(|_| ())
}

fn next_job(inner: &PoolInner) -> Option<Queued> {
    let mut queue = inner.queue.lock();
    loop {
        if let Some(job) = queue.pop_front() {
            return Some(job);
        }
        if inner.shutting_down.load(Ordering::SeqCst) {
            return None;
        }
        inner.available.wait(&mut queue);
    }
}

fn worker_loop(inner: Arc<PoolInner>, worker_id: usize) {
    debug!(worker_id, "Worker started");
    let mut completed = 0usize;

    let reason = loop {
        let Some(Queued {
            job,
            mut slot,
            state,
        }) = next_job(&inner)
        else {
            break "shutdown";
        };

        *state.lock() = RunState::Running;
        slot.mark_started();

        let (outcome, died) = match panic::catch_unwind(AssertUnwindSafe(job)) {
            Ok(Ok(value)) => (JobOutcome::Returned(value), false),
            Ok(Err(failure)) => (JobOutcome::Raised(failure), false),
            Err(payload) => (
                JobOutcome::Expired {
                    reason: format!(
                        "worker {worker_id} terminated abruptly: {}",
                        panic_message(payload.as_ref())
                    ),
                },
                true,
            ),
        };

        let abandoned = {
            let mut state = state.lock();
            let abandoned = *state == RunState::Abandoned;
            *state = RunState::Finished;
            abandoned
        };
        slot.finish(outcome);
        completed += 1;

        // A replacement was started when the job was abandoned.
        if abandoned {
            break "abandoned";
        }
        if died {
            replace(&inner, worker_id);
            break "died";
        }
        if inner.max_tasks_per_child > 0 && completed >= inner.max_tasks_per_child {
            replace(&inner, worker_id);
            break "recycled";
        }
    };

    inner.live_workers.fetch_sub(1, Ordering::SeqCst);
    debug!(worker_id, completed, reason, "Worker exited");
}

fn replace(inner: &Arc<PoolInner>, worker_id: usize) {
    if let Err(e) = spawn_worker(inner) {
        error!(worker_id, error = %e, "Failed to start replacement worker");
    }
}
