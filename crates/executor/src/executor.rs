//! Batch executor.
//!
//! A [`BatchExecutor`] is created from a creation message and re-armed per
//! run message with [`BatchExecutor::reset`]. [`BatchExecutor::execute`]
//! then walks the run's blocks: load column blocks, filter, and either ship
//! row ids / element values or build a row group that is projected, joined,
//! optionally aggregated and sent through the group's dispatcher.
//!
//! Errors:
//! - malformed create/run messages are `ColexError::Protocol`;
//! - data errors are sent as failed-batch results and the run ends;
//! - `ColexError::RestartRequired` from the block source propagates unchanged.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use arrow::array::{
    Array, ArrayRef, Decimal128Array, Float32Array, Float64Array, Int64Array,
};
use arrow::compute::{cast, filter_record_batch};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use arrow_schema::{Field, Schema, SchemaRef};
use colex_common::{
    ColexError, MemoryManager, MemoryReservation, MetricsRegistry, ProcessorConfig, Result,
    ROWS_PER_BLOCK,
};
use colex_dispatch::{Dispatcher, ResultMessage};
use colex_execution::{
    compile_expr, evaluate_predicate, ColumnKind, FunctionRegistry, PhysicalExpr,
};
use colex_scheduler::JobStatus;
use colex_wire::{
    BatchFlags, BoolOp, CheckpointRange, CreateBatch, IoCounters, JobHeader, JoinBuild,
    OutputConnection, OutputMode, ResultPayload, RidSet, RunBatch, StepDescriptor,
};
use tracing::{debug, warn};

use crate::aggregate::{AggregatePlan, Aggregator};
use crate::filter::{checkpoint_range, run_filters, FilterStep, StepValues};
use crate::join::JoinRuntime;
use crate::output::{chunk_rows, element_values, encode_block, encode_error, with_rid_column};
use crate::source::{BlockSource, LoadedBlock};

/// Services an executor runs against, injected by the bootstrap.
#[derive(Clone)]
pub struct ExecutorContext {
    pub config: Arc<ProcessorConfig>,
    pub source: Arc<dyn BlockSource>,
    pub functions: Arc<FunctionRegistry>,
    pub metrics: MetricsRegistry,
    pub memory: Arc<MemoryManager>,
}

impl ExecutorContext {
    /// Context with builtin functions, a fresh metrics registry and a memory
    /// manager sized from `config`.
    pub fn new(config: ProcessorConfig, source: Arc<dyn BlockSource>) -> Self {
        let memory = MemoryManager::new(config.engine_mem_budget_bytes);
        Self {
            config: Arc::new(config),
            source,
            functions: Arc::new(FunctionRegistry::with_builtins()),
            metrics: MetricsRegistry::new(),
            memory,
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsRegistry) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_functions(mut self, functions: Arc<FunctionRegistry>) -> Self {
        self.functions = functions;
        self
    }
}

/// Where an executor is within the current block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    Idle,
    Filtering,
    Projecting,
    Joining,
    Aggregating,
    Emitted,
}

enum ProjectStep {
    Column { oid: u32, kind: ColumnKind, slot: usize },
    PassThru { filter_step: usize },
    Expression {
        expr: Arc<dyn PhysicalExpr>,
        /// Projected columns before this step.
        input: SchemaRef,
    },
}

/// Immutable, compiled form of a creation message; shared by duplicates.
pub(crate) struct BatchPlan {
    header: JobHeader,
    mode: OutputMode,
    flags: BatchFlags,
    bool_op: BoolOp,
    filters: Vec<FilterStep>,
    projects: Vec<ProjectStep>,
    large_schema: SchemaRef,
    fe1: Option<Arc<dyn PhysicalExpr>>,
    fe2: Option<Arc<dyn PhysicalExpr>>,
    aggregate: Option<Arc<AggregatePlan>>,
    /// (oid, kind) per LBID slot of a run message, filter steps first.
    column_steps: Vec<(u32, ColumnKind)>,
    oids: Vec<u32>,
}

impl BatchPlan {
    fn compile(
        create: &CreateBatch,
        ctx: &ExecutorContext,
    ) -> Result<(Self, Option<JoinRuntime>)> {
        let functions = ctx.functions.as_ref();
        let row_group = create.output_mode == OutputMode::RowGroup;
        if !row_group
            && (!create.project_steps.is_empty()
                || !create.joins.is_empty()
                || create.aggregator.is_some()
                || create.fe1.is_some()
                || create.fe2.is_some())
        {
            return Err(ColexError::Protocol(format!(
                "{:?} output takes no projection, join, aggregation or row-group filter",
                create.output_mode
            )));
        }
        if create.aggregator.is_some()
            && create.flags.contains(BatchFlags::SEND_RIDS_AT_DELIVERY)
        {
            return Err(ColexError::Protocol(
                "row ids cannot be sent with aggregated output".to_string(),
            ));
        }

        let mut column_steps = Vec::new();
        let mut oids = BTreeSet::new();
        let mut filters = Vec::with_capacity(create.filter_steps.len());
        for (i, step) in create.filter_steps.iter().enumerate() {
            let StepDescriptor::Column {
                oid,
                kind,
                predicate,
            } = step
            else {
                return Err(ColexError::Protocol(format!(
                    "filter step {i} must load a column"
                )));
            };
            filters.push(FilterStep::compile(*oid, *kind, predicate.as_ref(), functions)?);
            column_steps.push((*oid, *kind));
            oids.insert(*oid);
        }

        let mut projects = Vec::with_capacity(create.project_steps.len());
        let mut fields: Vec<Field> = Vec::new();
        for (i, step) in create.project_steps.iter().enumerate() {
            match step {
                StepDescriptor::Column { oid, kind, .. } => {
                    kind.validate()?;
                    projects.push(ProjectStep::Column {
                        oid: *oid,
                        kind: *kind,
                        slot: column_steps.len(),
                    });
                    column_steps.push((*oid, *kind));
                    oids.insert(*oid);
                    fields.push(Field::new(format!("col{oid}"), kind.data_type(), true));
                }
                StepDescriptor::PassThru { oid, filter_step } => {
                    let source = filters.get(usize::from(*filter_step)).ok_or_else(|| {
                        ColexError::Protocol(format!(
                            "projection step {i} passes through missing filter step {filter_step}"
                        ))
                    })?;
                    oids.insert(*oid);
                    fields.push(Field::new(format!("col{oid}"), source.kind.data_type(), true));
                    projects.push(ProjectStep::PassThru {
                        filter_step: usize::from(*filter_step),
                    });
                }
                StepDescriptor::Expression { name, expr } => {
                    let input: SchemaRef = Arc::new(Schema::new(fields.clone()));
                    let expr = compile_expr(expr, &input, functions)?;
                    fields.push(Field::new(name, expr.data_type(), true));
                    projects.push(ProjectStep::Expression { expr, input });
                }
            }
        }
        if column_steps.is_empty() {
            return Err(ColexError::Protocol(
                "batch loads no column".to_string(),
            ));
        }
        if matches!(
            create.output_mode,
            OutputMode::RowIds | OutputMode::Values | OutputMode::RowIdsAndValues
        ) && filters.is_empty()
        {
            return Err(ColexError::Protocol(format!(
                "{:?} output needs at least one filter step",
                create.output_mode
            )));
        }

        let large_schema: SchemaRef = Arc::new(Schema::new(fields));
        let fe1 = create
            .fe1
            .as_ref()
            .map(|e| compile_expr(e, &large_schema, functions))
            .transpose()?;
        let joins = if create.joins.is_empty() {
            None
        } else {
            Some(JoinRuntime::new(
                &create.joins,
                &large_schema,
                &ctx.config,
                functions,
            )?)
        };
        let joined_schema = joins
            .as_ref()
            .map_or_else(|| Arc::clone(&large_schema), |j| Arc::clone(j.output_schema()));
        let fe2 = create
            .fe2
            .as_ref()
            .map(|e| compile_expr(e, &joined_schema, functions))
            .transpose()?;
        let aggregate = create
            .aggregator
            .as_ref()
            .map(|a| AggregatePlan::new(a, &joined_schema).map(Arc::new))
            .transpose()?;

        let plan = Self {
            header: create.job_header(),
            mode: create.output_mode,
            flags: create.flags,
            bool_op: create.bool_op,
            filters,
            projects,
            large_schema,
            fe1,
            fe2,
            aggregate,
            column_steps,
            oids: oids.into_iter().collect(),
        };
        Ok((plan, joins))
    }
}

enum Rids {
    Scan,
    Listed { base_rid: u64, rids: Vec<u16> },
}

/// Scratch of one armed run.
struct Run {
    block_count: u32,
    rids: Rids,
    /// Pre-fetched first filter column, aligned with the listed rids.
    values: Option<ArrayRef>,
    start_lbids: Vec<u64>,
}

/// Everything one block produced, ready to encode.
struct BlockResult {
    checkpoint: Option<CheckpointRange>,
    counters: IoCounters,
    payloads: Vec<ResultPayload>,
}

pub struct BatchExecutor {
    plan: Arc<BatchPlan>,
    joins: Option<Arc<JoinRuntime>>,
    ctx: ExecutorContext,
    first_instance: bool,
    state: ExecutorState,
    run: Option<Run>,
    aggregator: Option<Aggregator>,
    reservation: Option<MemoryReservation>,
    sock_rotation: usize,
    announce_connection: bool,
}

impl std::fmt::Debug for BatchExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchExecutor")
            .field("unique_id", &self.plan.header.unique)
            .field("mode", &self.plan.mode)
            .field("state", &self.state)
            .field("first_instance", &self.first_instance)
            .finish()
    }
}

impl BatchExecutor {
    /// Compile a creation message into the first executor of a group.
    pub fn new(create: &CreateBatch, ctx: ExecutorContext) -> Result<Self> {
        let (plan, joins) = BatchPlan::compile(create, &ctx)?;
        Ok(Self::instance(
            Arc::new(plan),
            joins.map(Arc::new),
            ctx,
            true,
        ))
    }

    fn instance(
        plan: Arc<BatchPlan>,
        joins: Option<Arc<JoinRuntime>>,
        ctx: ExecutorContext,
        first_instance: bool,
    ) -> Self {
        let aggregator = plan.aggregate.as_ref().map(|a| Aggregator::new(Arc::clone(a)));
        Self {
            plan,
            joins,
            ctx,
            first_instance,
            state: ExecutorState::Idle,
            run: None,
            aggregator,
            reservation: None,
            sock_rotation: 0,
            announce_connection: false,
        }
    }

    /// Another instance sharing the compiled plan and the join tables, with
    /// scratch of its own.
    pub fn duplicate(&self) -> Self {
        Self::instance(
            Arc::clone(&self.plan),
            self.joins.clone(),
            self.ctx.clone(),
            false,
        )
    }

    pub fn header(&self) -> JobHeader {
        self.plan.header
    }

    pub fn state(&self) -> ExecutorState {
        self.state
    }

    pub fn is_first_instance(&self) -> bool {
        self.first_instance
    }

    /// Storage objects the batch reads.
    pub fn oids(&self) -> &[u32] {
        &self.plan.oids
    }

    pub fn join_runtime(&self) -> Option<&Arc<JoinRuntime>> {
        self.joins.as_ref()
    }

    /// Schema of the row groups this executor emits (row-group mode).
    pub fn output_schema(&self) -> SchemaRef {
        let base = match (&self.plan.aggregate, &self.joins) {
            (Some(agg), _) => Arc::clone(agg.output_schema()),
            (None, Some(joins)) => Arc::clone(joins.output_schema()),
            (None, None) => Arc::clone(&self.plan.large_schema),
        };
        if self.plan.flags.contains(BatchFlags::SEND_RIDS_AT_DELIVERY) {
            let mut fields: Vec<Field> = base.fields().iter().map(|f| f.as_ref().clone()).collect();
            fields.push(Field::new(
                crate::output::RID_COLUMN,
                arrow_schema::DataType::UInt64,
                false,
            ));
            return Arc::new(Schema::new(fields));
        }
        base
    }

    pub fn add_to_joiner(&self, build: &JoinBuild) -> Result<()> {
        let joins = self.joins.as_ref().ok_or_else(|| {
            ColexError::Protocol("join build for a batch without joins".to_string())
        })?;
        let entries = joins.add_to_joiner(build)?;
        self.ctx.metrics.record_join_build(
            self.plan.header.unique.0,
            build.joiner_index,
            entries as u64,
        );
        Ok(())
    }

    /// Completeness gate; duplicates and join-less batches are always done.
    pub fn end_of_joiner(&self) -> Result<bool> {
        match &self.joins {
            Some(joins) if self.first_instance => joins.end_of_joiner(),
            _ => Ok(true),
        }
    }

    /// Arm the executor for one run message. Resetting twice with the same
    /// message leaves the executor in the same state.
    pub fn reset(&mut self, run: &RunBatch) -> Result<()> {
        let expected = self.plan.column_steps.len();
        if run.start_lbids.len() != expected {
            return Err(ColexError::Protocol(format!(
                "run carries {} start LBIDs for {expected} column steps",
                run.start_lbids.len()
            )));
        }
        if run.block_count == 0 {
            return Err(ColexError::Protocol("run covers no block".to_string()));
        }

        let rids = match &run.rids {
            RidSet::Scan => Rids::Scan,
            RidSet::Absolute(abs) => {
                let block = ROWS_PER_BLOCK as u64;
                let base_rid = abs.first().map_or(0, |r| r - r % block);
                let mut rids = Vec::with_capacity(abs.len());
                for r in abs {
                    match r.checked_sub(base_rid) {
                        Some(rel) if rel < block => rids.push(rel as u16),
                        _ => {
                            return Err(ColexError::Protocol(format!(
                                "absolute row id {r} is outside the block at {base_rid}"
                            )))
                        }
                    }
                }
                Rids::Listed { base_rid, rids }
            }
            RidSet::Relative { base_rid, rids, .. } => {
                if let Some(bad) = rids.iter().find(|r| usize::from(**r) >= ROWS_PER_BLOCK) {
                    return Err(ColexError::Protocol(format!(
                        "relative row id {bad} is outside a block"
                    )));
                }
                Rids::Listed {
                    base_rid: *base_rid,
                    rids: rids.clone(),
                }
            }
        };
        if let Rids::Listed { rids, .. } = &rids {
            if rids.windows(2).any(|w| w[0] >= w[1]) {
                return Err(ColexError::Protocol(
                    "row ids must be strictly ascending".to_string(),
                ));
            }
            if run.block_count > 1 {
                return Err(ColexError::Protocol(
                    "a run with explicit row ids covers exactly one block".to_string(),
                ));
            }
        }

        let values = match (&run.values, &rids) {
            (None, _) => None,
            (Some(_), Rids::Scan) => {
                return Err(ColexError::Protocol(
                    "pre-fetched values need an explicit row id list".to_string(),
                ))
            }
            (Some(values), Rids::Listed { rids, .. }) => {
                if values.len() != rids.len() {
                    return Err(ColexError::Protocol(format!(
                        "{} pre-fetched values for {} row ids",
                        values.len(),
                        rids.len()
                    )));
                }
                let first = self.plan.filters.first().ok_or_else(|| {
                    ColexError::Protocol("pre-fetched values without a filter step".to_string())
                })?;
                Some(prefetched_array(first.kind, values)?)
            }
        };

        self.run = Some(Run {
            block_count: run.block_count,
            rids,
            values,
            start_lbids: run.start_lbids.clone(),
        });
        self.state = ExecutorState::Idle;
        if let Some(agg) = &mut self.aggregator {
            agg.reset();
            if self.reservation.is_none() {
                self.reservation = Some(
                    self.ctx
                        .memory
                        .reserve(self.ctx.config.aggregation_mem_bytes),
                );
            }
        }
        Ok(())
    }

    /// Run the armed blocks and queue their results.
    ///
    /// Results of a run are held back until its last block finished, so a
    /// run that fails with a restart can be replayed from its first block
    /// without the consumer seeing any block twice.
    ///
    /// Returns `Reschedule` without touching the run when the dispatcher's
    /// queue is too big, and `Done` without work once it was aborted.
    pub fn execute(
        &mut self,
        dispatcher: &Dispatcher,
        sock: &Arc<dyn OutputConnection>,
        new_connection: bool,
    ) -> Result<JobStatus> {
        if dispatcher.is_aborted() {
            self.run = None;
            return Ok(JobStatus::Done);
        }
        if dispatcher.size_too_big() {
            return Ok(JobStatus::Reschedule);
        }
        let run = self.run.take().ok_or_else(|| {
            ColexError::Protocol("batch executed before it was reset".to_string())
        })?;
        self.announce_connection = new_connection;

        let started = Instant::now();
        let rotation = self.sock_rotation;
        let mut pending = Vec::new();
        let outcome = self.execute_blocks(&run, &mut pending);
        self.state = ExecutorState::Idle;
        let unique = self.plan.header.unique;
        match outcome {
            Ok(()) => {
                self.flush(dispatcher, sock, pending)?;
                Ok(JobStatus::Done)
            }
            Err(err @ ColexError::Data { .. }) => {
                if let Some(agg) = &mut self.aggregator {
                    agg.reset();
                }
                warn!(unique_id = %unique, step_id = %self.plan.header.step, code = err.status_code(), error = %err, "batch failed on data");
                self.ctx.metrics.record_batch_block(
                    unique.0,
                    "data_error",
                    started.elapsed().as_secs_f64(),
                );
                self.flush(dispatcher, sock, pending)?;
                let frame = encode_error(self.plan.header, &err)?;
                self.send(dispatcher, sock, frame, self.sock_rotation)?;
                Ok(JobStatus::Done)
            }
            Err(err) => {
                if let Some(agg) = &mut self.aggregator {
                    agg.reset();
                }
                self.sock_rotation = rotation;
                Err(err)
            }
        }
    }

    fn flush(
        &mut self,
        dispatcher: &Dispatcher,
        sock: &Arc<dyn OutputConnection>,
        pending: Vec<(bytes::Bytes, usize)>,
    ) -> Result<()> {
        for (frame, sock_index) in pending {
            self.send(dispatcher, sock, frame, sock_index)?;
        }
        Ok(())
    }

    fn send(
        &mut self,
        dispatcher: &Dispatcher,
        sock: &Arc<dyn OutputConnection>,
        frame: bytes::Bytes,
        sock_index: usize,
    ) -> Result<()> {
        let announce = std::mem::take(&mut self.announce_connection);
        dispatcher.send_result(ResultMessage::new(frame, Arc::clone(sock), sock_index), announce)
    }

    fn next_sock_index(&mut self) -> usize {
        let idx = self.sock_rotation;
        self.sock_rotation = (idx + 1) % self.ctx.config.connections_per_consumer.max(1);
        idx
    }

    /// Process every block of `run`, appending each block's frames and
    /// socket slot to `pending`.
    fn execute_blocks(&mut self, run: &Run, pending: &mut Vec<(bytes::Bytes, usize)>) -> Result<()> {
        for block in 0..run.block_count {
            let started = Instant::now();
            let result = self.process_block(run, block)?;
            self.state = ExecutorState::Emitted;
            let frames = encode_block(
                self.plan.header,
                result.checkpoint,
                result.counters,
                result.payloads,
            )?;
            let sock_index = self.next_sock_index();
            pending.extend(frames.into_iter().map(|frame| (frame, sock_index)));
            self.ctx.metrics.record_batch_block(
                self.plan.header.unique.0,
                "ok",
                started.elapsed().as_secs_f64(),
            );
        }
        Ok(())
    }

    fn load(&self, slot: usize, block: u32, run: &Run, counters: &mut IoCounters) -> Result<LoadedBlock> {
        let (oid, kind) = self.plan.column_steps[slot];
        let lbid = run.start_lbids[slot] + u64::from(block) * u64::from(kind.width());
        let loaded = self.ctx.source.load_block(oid, lbid, kind)?;
        if loaded.was_cached {
            counters.cached_io += 1;
        } else {
            counters.physical_io += 1;
        }
        counters.touched_blocks += 1;
        if self.plan.flags.contains(BatchFlags::LBID_TRACE) {
            debug!(
                unique_id = %self.plan.header.unique,
                oid,
                lbid,
                cached = loaded.was_cached,
                rows = loaded.values.len(),
                "lbid trace"
            );
        }
        Ok(loaded)
    }

    fn process_block(&mut self, run: &Run, block: u32) -> Result<BlockResult> {
        let plan = Arc::clone(&self.plan);
        self.state = ExecutorState::Filtering;
        let mut counters = IoCounters::default();
        let mut first_block: Option<(u64, usize)> = None;

        let mut filter_values = Vec::with_capacity(plan.filters.len());
        for slot in 0..plan.filters.len() {
            if slot == 0 && block == 0 {
                if let (Some(values), Rids::Listed { rids, .. }) = (&run.values, &run.rids) {
                    filter_values.push(StepValues::Aligned {
                        rids: rids.clone(),
                        values: Arc::clone(values),
                    });
                    continue;
                }
            }
            let loaded = self.load(slot, block, run, &mut counters)?;
            first_block.get_or_insert((loaded.first_rid, loaded.values.len()));
            filter_values.push(StepValues::Block(loaded.values));
        }

        let mut project_values: Vec<Option<StepValues>> = Vec::with_capacity(plan.projects.len());
        for step in &plan.projects {
            project_values.push(match step {
                ProjectStep::Column { slot, .. } => {
                    let loaded = self.load(*slot, block, run, &mut counters)?;
                    first_block.get_or_insert((loaded.first_rid, loaded.values.len()));
                    Some(StepValues::Block(loaded.values))
                }
                _ => None,
            });
        }

        let (base_rid, input) = match &run.rids {
            Rids::Scan => {
                let (first_rid, len) = first_block.ok_or_else(|| {
                    ColexError::Execution("scan loaded no column block".to_string())
                })?;
                (first_rid, (0..len).map(|r| r as u16).collect::<Vec<u16>>())
            }
            Rids::Listed { base_rid, rids } => (*base_rid, rids.clone()),
        };

        let survivors = run_filters(&plan.filters, &filter_values, &input, plan.bool_op)?;

        let checkpoint = match (&run.rids, plan.filters.first(), filter_values.first()) {
            (Rids::Scan, Some(step), Some(StepValues::Block(values))) => {
                let lbid = run.start_lbids[0] + u64::from(block) * u64::from(step.kind.width());
                checkpoint_range(step.kind, values, lbid)?
            }
            _ => None,
        };

        let payloads = match plan.mode {
            OutputMode::RowIds => vec![ResultPayload::RowIds {
                base_rid,
                rids: survivors,
            }],
            OutputMode::Values | OutputMode::RowIdsAndValues => {
                let last = plan.filters.len() - 1;
                let taken = filter_values[last].take(&survivors)?;
                let values = element_values(
                    plan.filters[last].kind,
                    &taken,
                    plan.flags.contains(BatchFlags::NEED_STR_VALUES),
                )?;
                let rids = if plan.mode == OutputMode::Values {
                    Vec::new()
                } else {
                    survivors
                };
                vec![ResultPayload::Elements {
                    base_rid,
                    rids,
                    values,
                }]
            }
            OutputMode::RowGroup => {
                let out = self.row_group(
                    &plan,
                    &filter_values,
                    &project_values,
                    base_rid,
                    &survivors,
                    block + 1 == run.block_count,
                )?;
                chunk_rows(&out, self.ctx.config.rows_per_block)
                    .into_iter()
                    .map(ResultPayload::RowGroup)
                    .collect()
            }
        };

        Ok(BlockResult {
            checkpoint,
            counters,
            payloads,
        })
    }

    fn row_group(
        &mut self,
        plan: &BatchPlan,
        filter_values: &[StepValues],
        project_values: &[Option<StepValues>],
        base_rid: u64,
        survivors: &[u16],
        last_block: bool,
    ) -> Result<RecordBatch> {
        self.state = ExecutorState::Projecting;
        let options = RecordBatchOptions::new().with_row_count(Some(survivors.len()));
        let mut columns: Vec<ArrayRef> = Vec::with_capacity(plan.projects.len());
        for (step, loaded) in plan.projects.iter().zip(project_values) {
            let column = match (step, loaded) {
                (ProjectStep::Column { .. }, Some(values)) => values.take(survivors)?,
                (ProjectStep::PassThru { filter_step }, _) => {
                    filter_values[*filter_step].take(survivors)?
                }
                (ProjectStep::Expression { expr, input }, _) => {
                    let partial =
                        RecordBatch::try_new_with_options(Arc::clone(input), columns.clone(), &options)
                            .map_err(|e| {
                                ColexError::Execution(format!("expression input failed: {e}"))
                            })?;
                    expr.evaluate(&partial)?
                }
                (ProjectStep::Column { oid, .. }, None) => {
                    return Err(ColexError::Execution(format!(
                        "column {oid} was not loaded for projection"
                    )))
                }
            };
            columns.push(column);
        }
        let mut batch =
            RecordBatch::try_new_with_options(Arc::clone(&plan.large_schema), columns, &options)
                .map_err(|e| ColexError::Execution(format!("row group build failed: {e}")))?;
        let mut rids: Vec<u64> = survivors.iter().map(|r| base_rid + u64::from(*r)).collect();

        if let Some(fe1) = &plan.fe1 {
            (batch, rids) = apply_row_filter(fe1.as_ref(), &batch, rids)?;
        }
        if let Some(joins) = &self.joins {
            self.state = ExecutorState::Joining;
            let joined = joins.join(&batch)?;
            rids = joined
                .large_rows
                .values()
                .iter()
                .map(|i| rids[*i as usize])
                .collect();
            batch = joined.batch;
        }
        if let Some(fe2) = &plan.fe2 {
            (batch, rids) = apply_row_filter(fe2.as_ref(), &batch, rids)?;
        }

        if let Some(agg) = &mut self.aggregator {
            self.state = ExecutorState::Aggregating;
            agg.update(&batch)?;
            let pressure = self
                .reservation
                .as_ref()
                .is_some_and(|r| r.signal().should_flush(agg.estimated_bytes()));
            if last_block || pressure {
                if pressure && !last_block {
                    debug!(unique_id = %plan.header.unique, bytes = agg.estimated_bytes(), "flushing partial aggregate");
                }
                return agg.emit();
            }
            return Ok(agg.empty_batch());
        }
        if plan.flags.contains(BatchFlags::SEND_RIDS_AT_DELIVERY) {
            return with_rid_column(&batch, &rids);
        }
        Ok(batch)
    }
}

fn apply_row_filter(
    expr: &dyn PhysicalExpr,
    batch: &RecordBatch,
    rids: Vec<u64>,
) -> Result<(RecordBatch, Vec<u64>)> {
    let mask = evaluate_predicate(expr, batch)?;
    let filtered = filter_record_batch(batch, &mask)
        .map_err(|e| ColexError::Execution(format!("row group filter failed: {e}")))?;
    let rids = rids
        .into_iter()
        .zip(mask.values().iter())
        .filter_map(|(rid, keep)| keep.then_some(rid))
        .collect();
    Ok((filtered, rids))
}

/// Typed array for pre-fetched first-column values, which travel as raw
/// 64-bit payloads.
fn prefetched_array(kind: ColumnKind, values: &[i64]) -> Result<ArrayRef> {
    let array: ArrayRef = match kind {
        ColumnKind::Int { .. } => {
            let raw: ArrayRef = Arc::new(Int64Array::from(values.to_vec()));
            cast(&raw, &kind.data_type())
                .map_err(|e| ColexError::Protocol(format!("pre-fetched values: {e}")))?
        }
        ColumnKind::Decimal {
            precision, scale, ..
        } => Arc::new(
            Decimal128Array::from_iter_values(values.iter().map(|v| i128::from(*v)))
                .with_precision_and_scale(precision, scale)
                .map_err(|e| ColexError::Protocol(format!("pre-fetched values: {e}")))?,
        ),
        ColumnKind::Float { width: 4 } => Arc::new(Float32Array::from_iter_values(
            values.iter().map(|v| f32::from_bits(*v as u32)),
        )),
        ColumnKind::Float { .. } => Arc::new(Float64Array::from_iter_values(
            values.iter().map(|v| f64::from_bits(*v as u64)),
        )),
        other => {
            return Err(ColexError::Protocol(format!(
                "pre-fetched values are not supported for {other:?}"
            )))
        }
    };
    Ok(array)
}

#[cfg(test)]
#[path = "executor_tests.rs"]
mod tests;
