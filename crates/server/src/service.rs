//! Command handler: turns decoded messages into batch groups and scheduler
//! jobs.

use std::collections::HashMap;
use std::sync::Arc;

use colex_common::{ColexError, Result, UniqueId};
use colex_executor::{BatchGroup, ExecutorContext};
use colex_scheduler::{functor, BlockedThreads, FairScheduler, Job, JobFunctor, JobStatus};
use colex_wire::{
    BatchResult, CreateBatch, JobHeader, JoinBuild, Message, OutputConnection, RunBatch,
};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

type GroupMap = Arc<RwLock<HashMap<UniqueId, Arc<BatchGroup>>>>;

/// Owns every live batch group of a worker process.
pub struct BatchService {
    ctx: ExecutorContext,
    scheduler: Arc<FairScheduler>,
    groups: GroupMap,
}

impl BatchService {
    pub fn new(ctx: ExecutorContext, scheduler: Arc<FairScheduler>) -> Self {
        Self {
            ctx,
            scheduler,
            groups: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn context(&self) -> &ExecutorContext {
        &self.ctx
    }

    pub fn scheduler(&self) -> &Arc<FairScheduler> {
        &self.scheduler
    }

    pub fn group(&self, unique: UniqueId) -> Option<Arc<BatchGroup>> {
        self.groups.read().get(&unique).cloned()
    }

    pub fn group_count(&self) -> usize {
        self.groups.read().len()
    }

    /// Handle one inbound message received on `conn`.
    ///
    /// Errors are protocol violations of the message itself; failures of
    /// scheduled work are reported on the connection by the job.
    pub fn handle(&self, msg: Message, conn: &Arc<dyn OutputConnection>) -> Result<()> {
        match msg {
            Message::CreateBatch(create) => self.create(&create),
            Message::RunBatch(run) => self.run(run, conn),
            Message::AddJoiner(build) => self.add_joiner(build, conn),
            Message::EndJoiner(header) => self.end_joiner(header, conn),
            Message::DestroyBatch(header) => {
                self.destroy(header);
                Ok(())
            }
            Message::Abort(header) => {
                self.abort(header);
                Ok(())
            }
            Message::FlowControl(fc) => {
                let group = self.require(fc.header.unique)?;
                group.send_more(fc.credits);
                Ok(())
            }
            Message::BatchResult(result) => Err(ColexError::Protocol(format!(
                "worker received a batch result for {}",
                result.header.unique
            ))),
        }
    }

    fn require(&self, unique: UniqueId) -> Result<Arc<BatchGroup>> {
        self.group(unique)
            .ok_or_else(|| ColexError::Protocol(format!("no batch with unique id {unique}")))
    }

    fn create(&self, create: &CreateBatch) -> Result<()> {
        if self.groups.read().contains_key(&create.unique) {
            return Err(ColexError::Protocol(format!(
                "batch {} already exists",
                create.unique
            )));
        }
        let blocked: Arc<dyn BlockedThreads> = self.scheduler.clone();
        let group = Arc::new(BatchGroup::new(create, self.ctx.clone(), blocked)?);
        self.groups.write().insert(create.unique, group);
        info!(
            unique_id = %create.unique,
            step_id = %create.step,
            txn_id = %create.txn,
            session = create.session,
            "batch created"
        );
        Ok(())
    }

    fn job(
        &self,
        group: &BatchGroup,
        conn: &Arc<dyn OutputConnection>,
        work: Arc<dyn JobFunctor>,
    ) -> Job {
        let header = group.header();
        Job::new(header.unique, header.step, group.txn(), work)
            .with_weight(self.ctx.config.weight_per_run)
            .with_session(header.session)
            .with_sock(Arc::clone(conn))
    }

    fn run(&self, run: RunBatch, conn: &Arc<dyn OutputConnection>) -> Result<()> {
        let group = self.require(run.header.unique)?;
        let work = {
            let group = Arc::clone(&group);
            let groups = Arc::clone(&self.groups);
            let sock = Arc::clone(conn);
            let source = Arc::clone(&self.ctx.source);
            let metrics = self.ctx.metrics.clone();
            functor(move || match group.run(&run, &sock) {
                Err(err) if err.is_restart() => {
                    let header = group.header();
                    warn!(unique_id = %header.unique, step_id = %header.step, error = %err, "restarting batch run");
                    source.invalidate(group.oids());
                    metrics.inc_batch_restarts(header.unique.0);
                    Ok(JobStatus::Reschedule)
                }
                Err(err @ ColexError::Protocol(_)) => {
                    fail_group(&groups, &group, &sock, &err);
                    Ok(JobStatus::Done)
                }
                other => other,
            })
        };
        self.scheduler.add_job(self.job(&group, conn, work));
        Ok(())
    }

    fn add_joiner(&self, build: JoinBuild, conn: &Arc<dyn OutputConnection>) -> Result<()> {
        let group = self.require(build.header.unique)?;
        let work = {
            let group = Arc::clone(&group);
            let groups = Arc::clone(&self.groups);
            let sock = Arc::clone(conn);
            functor(move || {
                if let Err(err) = group.add_joiner(&build) {
                    fail_group(&groups, &group, &sock, &err);
                }
                Ok(JobStatus::Done)
            })
        };
        self.scheduler.add_job(self.job(&group, conn, work));
        Ok(())
    }

    /// Queue the completeness check; it reschedules until every join table
    /// holds its announced entries.
    fn end_joiner(&self, header: JobHeader, conn: &Arc<dyn OutputConnection>) -> Result<()> {
        let group = self.require(header.unique)?;
        let work = {
            let group = Arc::clone(&group);
            let groups = Arc::clone(&self.groups);
            let sock = Arc::clone(conn);
            functor(move || match group.end_joiner() {
                Ok(true) => {
                    debug!(unique_id = %group.header().unique, "join build complete");
                    Ok(JobStatus::Done)
                }
                Ok(false) if group.is_aborted() => Ok(JobStatus::Done),
                Ok(false) => Ok(JobStatus::Reschedule),
                Err(err) => {
                    fail_group(&groups, &group, &sock, &err);
                    Ok(JobStatus::Done)
                }
            })
        };
        self.scheduler.add_job(self.job(&group, conn, work));
        Ok(())
    }

    fn destroy(&self, header: JobHeader) {
        self.scheduler.remove_jobs(header.unique.0);
        if self.groups.write().remove(&header.unique).is_some() {
            info!(unique_id = %header.unique, step_id = %header.step, "batch destroyed");
        } else {
            debug!(unique_id = %header.unique, "destroy for unknown batch");
        }
    }

    fn abort(&self, header: JobHeader) {
        self.scheduler.remove_jobs(header.unique.0);
        match self.group(header.unique) {
            Some(group) => {
                group.abort();
                info!(unique_id = %header.unique, step_id = %header.step, "batch aborted");
            }
            None => debug!(unique_id = %header.unique, "abort for unknown batch"),
        }
    }
}

/// Abort a group after a protocol violation, drop it from the live set and
/// tell the consumer.
fn fail_group(
    groups: &GroupMap,
    group: &BatchGroup,
    sock: &Arc<dyn OutputConnection>,
    err: &ColexError,
) {
    let header = group.header();
    warn!(unique_id = %header.unique, step_id = %header.step, error = %err, "batch failed, discarding group");
    group.abort();
    groups.write().remove(&header.unique);
    let report = Message::BatchResult(BatchResult::error(header, err.status_code(), err.to_string()));
    if let Err(e) = report.encode().and_then(|frame| sock.write_frame(&frame)) {
        warn!(unique_id = %header.unique, error = %e, "could not report batch failure");
    }
}
