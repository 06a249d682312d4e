//! Worker pool serving per-transaction job queues in least-weight order.
//!
//! All queue state lives behind one mutex; the heap holds at most one entry
//! per transaction with pending jobs, keyed by the weight the transaction has
//! accumulated since its queue was last empty. Payloads run outside the lock.
//!
//! Threads come in two kinds. Default threads wait on the condvar when idle.
//! Extra threads are spawned while more threads are blocked on full send
//! queues than extra threads exist, and exit once idle after no thread is
//! blocked anymore.

use std::any::Any;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use colex_common::error::ERR_PRIMITIVE_SERVER;
use colex_common::{MetricsRegistry, TxnId};
use colex_wire::{BatchResult, JobHeader, Message};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::job::{Job, JobStatus};

/// Pause before a rescheduled job is enqueued again.
pub const RESCHEDULE_DELAY: Duration = Duration::from_micros(500);

/// Idle extra threads re-check the stop flag at this interval.
const EXTRA_IDLE_POLL: Duration = Duration::from_millis(50);

/// Accounting hook for threads blocked outside the scheduler.
pub trait BlockedThreads: Send + Sync {
    fn inc_blocked_threads(&self);
    fn dec_blocked_threads(&self);
}

#[derive(Default)]
struct QueueState {
    txns: HashMap<TxnId, VecDeque<Job>>,
    weights: BinaryHeap<Reverse<(u64, TxnId)>>,
}

impl QueueState {
    fn queued(&self) -> usize {
        self.txns.values().map(VecDeque::len).sum()
    }

    fn next_job(&mut self) -> Option<Job> {
        while let Some(Reverse((weight, txn))) = self.weights.pop() {
            let Some(queue) = self.txns.get_mut(&txn) else {
                continue;
            };
            let Some(job) = queue.pop_front() else {
                self.txns.remove(&txn);
                continue;
            };
            if queue.is_empty() {
                self.txns.remove(&txn);
            } else {
                self.weights
                    .push(Reverse((weight + u64::from(job.weight), txn)));
            }
            return Some(job);
        }
        None
    }
}

struct Shared {
    name: String,
    default_threads: usize,
    state: Mutex<QueueState>,
    cond: Condvar,
    thread_count: AtomicUsize,
    extra_threads: AtomicUsize,
    blocked_threads: AtomicUsize,
    stop_extra: AtomicBool,
    running: AtomicBool,
    jobs_running: AtomicUsize,
    next_thread: AtomicUsize,
    handles: Mutex<Vec<JoinHandle<()>>>,
    metrics: MetricsRegistry,
}

/// Weighted fair scheduler over a pool of OS threads.
pub struct FairScheduler {
    shared: Arc<Shared>,
}

impl FairScheduler {
    /// Start `threads` default workers.
    pub fn new(name: impl Into<String>, threads: usize, metrics: MetricsRegistry) -> Self {
        let shared = Arc::new(Shared {
            name: name.into(),
            default_threads: threads.max(1),
            state: Mutex::new(QueueState::default()),
            cond: Condvar::new(),
            thread_count: AtomicUsize::new(0),
            extra_threads: AtomicUsize::new(0),
            blocked_threads: AtomicUsize::new(0),
            stop_extra: AtomicBool::new(true),
            running: AtomicBool::new(true),
            jobs_running: AtomicUsize::new(0),
            next_thread: AtomicUsize::new(0),
            handles: Mutex::new(Vec::new()),
            metrics,
        });
        for _ in 0..shared.default_threads {
            shared.spawn_worker(false);
        }
        Self { shared }
    }

    pub fn add_job(&self, job: Job) {
        self.shared.add_job(job);
    }

    /// Drop every queued job whose removal id matches. Running jobs finish.
    pub fn remove_jobs(&self, id: u32) {
        let mut state = self.shared.state.lock();
        let before = state.queued();
        state.txns.retain(|_, queue| {
            queue.retain(|job| job.id != id);
            !queue.is_empty()
        });
        let QueueState { txns, weights } = &mut *state;
        weights.retain(|Reverse((_, txn))| txns.contains_key(txn));
        let removed = before - state.queued();
        if removed > 0 {
            debug!(pool = %self.shared.name, id, removed, "removed queued jobs");
        }
        self.shared.publish_queue(state.queued());
    }

    pub fn thread_count(&self) -> usize {
        self.shared.thread_count.load(Ordering::Acquire)
    }

    pub fn extra_thread_count(&self) -> usize {
        self.shared.extra_threads.load(Ordering::Acquire)
    }

    pub fn blocked_thread_count(&self) -> usize {
        self.shared.blocked_threads.load(Ordering::Acquire)
    }

    pub fn queue_size(&self) -> usize {
        self.shared.state.lock().queued()
    }

    pub fn jobs_running(&self) -> usize {
        self.shared.jobs_running.load(Ordering::Acquire)
    }

    /// Stop accepting jobs, drop the queues, wake and join every worker.
    /// Jobs already running complete first.
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        {
            let mut state = self.shared.state.lock();
            *state = QueueState::default();
        }
        self.shared.cond.notify_all();
        let handles: Vec<_> = self.shared.handles.lock().drain(..).collect();
        let me = thread::current().id();
        for handle in handles {
            if handle.thread().id() == me {
                continue;
            }
            if handle.join().is_err() {
                warn!(pool = %self.shared.name, "worker thread panicked during shutdown");
            }
        }
    }
}

impl BlockedThreads for FairScheduler {
    fn inc_blocked_threads(&self) {
        let n = self.shared.blocked_threads.fetch_add(1, Ordering::AcqRel) + 1;
        self.shared
            .metrics
            .set_scheduler_blocked_threads(&self.shared.name, n as u64);
    }

    fn dec_blocked_threads(&self) {
        let prev = self
            .shared
            .blocked_threads
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .unwrap_or(0);
        self.shared
            .metrics
            .set_scheduler_blocked_threads(&self.shared.name, prev.saturating_sub(1) as u64);
    }
}

impl Drop for FairScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn add_job(self: &Arc<Self>, job: Job) {
        if !self.running.load(Ordering::Acquire) {
            debug!(pool = %self.name, unique_id = %job.unique_id, "scheduler stopped, job dropped");
            return;
        }
        let mut state = self.state.lock();
        if self.thread_count.load(Ordering::Acquire) < self.default_threads {
            self.spawn_worker(false);
        }
        let blocked = self.blocked_threads.load(Ordering::Acquire);
        if blocked > self.extra_threads.load(Ordering::Acquire) {
            self.stop_extra.store(false, Ordering::Release);
            self.spawn_worker(true);
        } else if blocked == 0 {
            self.stop_extra.store(true, Ordering::Release);
        }

        let txn = job.txn_id;
        let weight = u64::from(job.weight);
        let QueueState { txns, weights } = &mut *state;
        let queue = txns.entry(txn).or_default();
        if queue.is_empty() {
            weights.push(Reverse((weight, txn)));
        }
        queue.push_back(job);
        let queued = state.queued();
        drop(state);
        self.cond.notify_one();
        self.publish_queue(queued);
    }

    fn spawn_worker(self: &Arc<Self>, extra: bool) {
        self.thread_count.fetch_add(1, Ordering::AcqRel);
        if extra {
            self.extra_threads.fetch_add(1, Ordering::AcqRel);
        }
        let n = self.next_thread.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("{}-{n}", self.name))
            .spawn(move || shared.worker_loop(extra));
        match spawned {
            Ok(handle) => {
                let mut handles = self.handles.lock();
                handles.retain(|h| !h.is_finished());
                handles.push(handle);
            }
            Err(e) => {
                self.release_thread(extra);
                error!(pool = %self.name, error = %e, "failed to spawn worker thread");
            }
        }
    }

    fn release_thread(&self, extra: bool) {
        self.thread_count.fetch_sub(1, Ordering::AcqRel);
        if extra {
            self.extra_threads.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn worker_loop(self: Arc<Self>, extra: bool) {
        loop {
            let Some(job) = self.wait_for_job(extra) else {
                self.release_thread(extra);
                return;
            };

            let running = self.jobs_running.fetch_add(1, Ordering::AcqRel) + 1;
            self.metrics
                .set_scheduler_running_jobs(&self.name, running as u64);
            let outcome = catch_unwind(AssertUnwindSafe(|| job.functor.run()));
            let running = self.jobs_running.fetch_sub(1, Ordering::AcqRel) - 1;
            self.metrics
                .set_scheduler_running_jobs(&self.name, running as u64);

            match outcome {
                Ok(Ok(JobStatus::Done)) => {}
                Ok(Ok(JobStatus::Reschedule)) => {
                    thread::sleep(RESCHEDULE_DELAY);
                    self.metrics.inc_scheduler_rescheduled_jobs(&self.name);
                    self.add_job(job);
                }
                Ok(Err(err)) => {
                    self.fault(&job, &err.to_string(), extra);
                    return;
                }
                Err(payload) => {
                    self.fault(&job, &panic_message(payload.as_ref()), extra);
                    return;
                }
            }
        }
    }

    /// Block until a job is available. `None` tells the thread to exit.
    fn wait_for_job(&self, extra: bool) -> Option<Job> {
        let mut state = self.state.lock();
        loop {
            if !self.running.load(Ordering::Acquire) {
                return None;
            }
            if let Some(job) = state.next_job() {
                let queued = state.queued();
                drop(state);
                self.publish_queue(queued);
                return Some(job);
            }
            if extra {
                if self.stop_extra.load(Ordering::Acquire) {
                    return None;
                }
                let _ = self.cond.wait_for(&mut state, EXTRA_IDLE_POLL);
            } else {
                self.cond.wait(&mut state);
            }
        }
    }

    /// The worker dies with the job; the next `add_job` replaces it.
    fn fault(&self, job: &Job, message: &str, extra: bool) {
        self.release_thread(extra);
        self.metrics.inc_scheduler_worker_faults(&self.name);
        error!(
            pool = %self.name,
            unique_id = %job.unique_id,
            step_id = %job.step_id,
            txn_id = %job.txn_id,
            error = message,
            "job failed, worker thread exits"
        );
        let Some(sock) = job.sock.as_ref() else {
            return;
        };
        let header = JobHeader::new(job.session, job.step_id, job.unique_id);
        let report = Message::BatchResult(BatchResult::error(
            header,
            ERR_PRIMITIVE_SERVER,
            format!("internal error: {message}"),
        ));
        let written = report.encode().and_then(|frame| sock.write_frame(&frame));
        if let Err(e) = written {
            warn!(pool = %self.name, unique_id = %job.unique_id, error = %e, "could not report job failure");
        }
    }

    fn publish_queue(&self, queued: usize) {
        self.metrics
            .set_scheduler_queued_jobs(&self.name, queued as u64);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}
