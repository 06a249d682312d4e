//! A batch group: every executor instance of one unique id, their shared
//! join tables and the dispatcher their results go through.

use std::collections::HashSet;
use std::sync::Arc;

use arrow_schema::SchemaRef;
use colex_common::{ConnectionId, Result, TxnId};
use colex_dispatch::Dispatcher;
use colex_scheduler::{BlockedThreads, JobStatus};
use colex_wire::{CreateBatch, JobHeader, JoinBuild, OutputConnection, RunBatch};
use parking_lot::Mutex;
use tracing::debug;

use crate::executor::{BatchExecutor, ExecutorContext};

pub struct BatchGroup {
    txn: TxnId,
    ctx: ExecutorContext,
    /// Compiled once; owns the join build and hands out duplicates.
    prototype: BatchExecutor,
    executors: Mutex<Vec<Arc<Mutex<BatchExecutor>>>>,
    connections: Mutex<HashSet<ConnectionId>>,
    dispatcher: Dispatcher,
}

impl BatchGroup {
    pub fn new(
        create: &CreateBatch,
        ctx: ExecutorContext,
        blocked: Arc<dyn BlockedThreads>,
    ) -> Result<Self> {
        let prototype = BatchExecutor::new(create, ctx.clone())?;
        let dispatcher = Dispatcher::new(create.unique, &ctx.config, blocked, ctx.metrics.clone())?;
        debug!(
            unique_id = %create.unique,
            step_id = %create.step,
            txn_id = %create.txn,
            mode = ?create.output_mode,
            joins = create.joins.len(),
            "batch group created"
        );
        Ok(Self {
            txn: create.txn,
            ctx,
            prototype,
            executors: Mutex::new(Vec::new()),
            connections: Mutex::new(HashSet::new()),
            dispatcher,
        })
    }

    pub fn header(&self) -> JobHeader {
        self.prototype.header()
    }

    pub fn txn(&self) -> TxnId {
        self.txn
    }

    pub fn oids(&self) -> &[u32] {
        self.prototype.oids()
    }

    pub fn output_schema(&self) -> SchemaRef {
        self.prototype.output_schema()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Executor instances created so far.
    pub fn instance_count(&self) -> usize {
        self.executors.lock().len()
    }

    pub fn add_joiner(&self, build: &JoinBuild) -> Result<()> {
        self.prototype.add_to_joiner(build)
    }

    /// Whether every join table holds its expected entries.
    pub fn end_joiner(&self) -> Result<bool> {
        self.prototype.end_of_joiner()
    }

    pub fn abort(&self) {
        self.dispatcher.abort();
    }

    pub fn is_aborted(&self) -> bool {
        self.dispatcher.is_aborted()
    }

    pub fn send_more(&self, credits: i32) {
        self.dispatcher.send_more(credits);
    }

    /// Run one run message on a free executor instance.
    ///
    /// Reschedules while the join build is incomplete, while the send queue
    /// is too big, and when every instance is busy and no more may be
    /// created.
    pub fn run(&self, run: &RunBatch, sock: &Arc<dyn OutputConnection>) -> Result<JobStatus> {
        if let Some(joins) = self.prototype.join_runtime() {
            if !joins.is_complete() {
                return Ok(JobStatus::Reschedule);
            }
        }
        if self.dispatcher.is_aborted() {
            return Ok(JobStatus::Done);
        }
        if self.dispatcher.size_too_big() {
            return Ok(JobStatus::Reschedule);
        }

        let instances: Vec<Arc<Mutex<BatchExecutor>>> = self.executors.lock().clone();
        for instance in &instances {
            if let Some(mut executor) = instance.try_lock() {
                return self.run_on(&mut executor, run, sock);
            }
        }

        let instance = {
            let mut list = self.executors.lock();
            if list.len() >= self.ctx.config.processor_threads.max(1) {
                return Ok(JobStatus::Reschedule);
            }
            let instance = Arc::new(Mutex::new(self.prototype.duplicate()));
            list.push(Arc::clone(&instance));
            instance
        };
        let mut executor = instance.lock();
        self.run_on(&mut executor, run, sock)
    }

    fn run_on(
        &self,
        executor: &mut BatchExecutor,
        run: &RunBatch,
        sock: &Arc<dyn OutputConnection>,
    ) -> Result<JobStatus> {
        let conn = sock.id();
        let new_connection = self.connections.lock().insert(conn);
        let outcome = executor
            .reset(run)
            .and_then(|()| executor.execute(&self.dispatcher, sock, new_connection));
        if new_connection && !matches!(outcome, Ok(JobStatus::Done)) {
            self.connections.lock().remove(&conn);
        }
        outcome
    }
}
