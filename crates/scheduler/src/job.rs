use std::fmt;
use std::sync::Arc;

use colex_common::{Result, StepId, TxnId, UniqueId};
use colex_wire::OutputConnection;

/// Outcome of one run of a job payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Done,
    /// Not finished; enqueue the job again after a short delay.
    Reschedule,
}

/// Work executed by a scheduler thread.
pub trait JobFunctor: Send + Sync {
    fn run(&self) -> Result<JobStatus>;
}

impl<F> JobFunctor for F
where
    F: Fn() -> Result<JobStatus> + Send + Sync,
{
    fn run(&self) -> Result<JobStatus> {
        self()
    }
}

/// Wrap a closure as a job payload.
pub fn functor<F>(f: F) -> Arc<dyn JobFunctor>
where
    F: Fn() -> Result<JobStatus> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// One schedulable unit of work.
#[derive(Clone)]
pub struct Job {
    pub unique_id: UniqueId,
    pub step_id: StepId,
    pub session: u32,
    /// Fairness accounting key.
    pub txn_id: TxnId,
    /// Cost charged to the transaction each time this job is selected.
    pub weight: u32,
    pub priority: u32,
    /// Key matched by [`crate::FairScheduler::remove_jobs`].
    pub id: u32,
    pub functor: Arc<dyn JobFunctor>,
    /// Where a failure report goes if the payload faults.
    pub sock: Option<Arc<dyn OutputConnection>>,
}

impl Job {
    /// A weight-1 job whose removal id is its unique id.
    pub fn new(
        unique_id: UniqueId,
        step_id: StepId,
        txn_id: TxnId,
        functor: Arc<dyn JobFunctor>,
    ) -> Self {
        Self {
            unique_id,
            step_id,
            session: 0,
            txn_id,
            weight: 1,
            priority: 0,
            id: unique_id.0,
            functor,
            sock: None,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_session(mut self, session: u32) -> Self {
        self.session = session;
        self
    }

    pub fn with_sock(mut self, sock: Arc<dyn OutputConnection>) -> Self {
        self.sock = Some(sock);
        self
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("unique_id", &self.unique_id)
            .field("step_id", &self.step_id)
            .field("txn_id", &self.txn_id)
            .field("weight", &self.weight)
            .field("id", &self.id)
            .field("has_sock", &self.sock.is_some())
            .finish()
    }
}
