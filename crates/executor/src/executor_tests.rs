use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use arrow::array::{AsArray, Int32Array, StringArray};
use arrow::datatypes::{DataType, Int64Type, UInt64Type};
use colex_common::error::ERR_MORE_THAN_ONE_ROW;
use colex_common::{StepId, TxnId, UniqueId};
use colex_execution::{encode_group_key, BinaryOp, ColumnDesc, Expr, RowSchema, ScalarValue};
use colex_scheduler::BlockedThreads;
use colex_wire::{
    AggFunc, AggregateSpec, AggregatorDescriptor, ElementValues, JoinDescriptor, JoinEntries,
    JoinKey, JoinKind, MemoryConnection, Message, ResultBody, ResultData,
};

use super::*;
use crate::group::BatchGroup;
use crate::source::{BlockSource, LoadedBlock, MemoryBlockSource};

struct NoBlocked;

impl BlockedThreads for NoBlocked {
    fn inc_blocked_threads(&self) {}
    fn dec_blocked_threads(&self) {}
}

struct Harness {
    source: Arc<MemoryBlockSource>,
    ctx: ExecutorContext,
    conn: Arc<MemoryConnection>,
    sock: Arc<dyn OutputConnection>,
    dispatcher: Dispatcher,
}

/// Fails the first load of `lbid` with a restart request.
struct StaleOnce {
    inner: Arc<MemoryBlockSource>,
    lbid: u64,
    tripped: AtomicBool,
}

impl BlockSource for StaleOnce {
    fn load_block(&self, oid: u32, lbid: u64, kind: ColumnKind) -> Result<LoadedBlock> {
        if lbid == self.lbid && !self.tripped.swap(true, Ordering::SeqCst) {
            return Err(ColexError::RestartRequired(format!(
                "metadata of oid {oid} changed"
            )));
        }
        self.inner.load_block(oid, lbid, kind)
    }

    fn invalidate(&self, oids: &[u32]) {
        self.inner.invalidate(oids);
    }
}

impl Harness {
    fn new() -> Self {
        Self::with_config(ProcessorConfig::default())
    }

    fn with_config(config: ProcessorConfig) -> Self {
        let source = Arc::new(MemoryBlockSource::new());
        Self::build(config, source.clone(), source)
    }

    fn build(
        config: ProcessorConfig,
        source: Arc<MemoryBlockSource>,
        blocks: Arc<dyn BlockSource>,
    ) -> Self {
        let ctx = ExecutorContext::new(config, blocks);
        let conn = Arc::new(MemoryConnection::new(1));
        let sock: Arc<dyn OutputConnection> = conn.clone();
        let dispatcher = Dispatcher::new(
            UniqueId(3),
            &ctx.config,
            Arc::new(NoBlocked),
            ctx.metrics.clone(),
        )
        .expect("dispatcher");
        Self {
            source,
            ctx,
            conn,
            sock,
            dispatcher,
        }
    }

    fn put_ints(&self, oid: u32, lbid: u64, first_rid: u64, values: Vec<Option<i32>>) {
        self.source
            .put_column(oid, ColumnKind::INT, lbid, first_rid, Arc::new(Int32Array::from(values)))
            .expect("put column");
    }

    fn executor(&self, create: &CreateBatch) -> BatchExecutor {
        BatchExecutor::new(create, self.ctx.clone()).expect("executor")
    }

    fn run(&self, executor: &mut BatchExecutor, run: &RunBatch) -> JobStatus {
        executor.reset(run).expect("reset");
        executor
            .execute(&self.dispatcher, &self.sock, true)
            .expect("execute")
    }

    fn results(&self) -> Vec<ResultBody> {
        assert!(self.dispatcher.wait_drained(Duration::from_secs(5)));
        self.conn
            .messages()
            .expect("decode")
            .into_iter()
            .filter_map(|m| match m {
                Message::BatchResult(r) => Some(r.body),
                _ => None,
            })
            .collect()
    }

    fn data(&self) -> Vec<ResultData> {
        self.results()
            .into_iter()
            .map(|body| match body {
                ResultBody::Ok(data) => data,
                ResultBody::Error { code, message } => panic!("failed batch {code}: {message}"),
            })
            .collect()
    }

    fn row_groups(&self) -> Vec<RecordBatch> {
        self.data()
            .into_iter()
            .filter_map(|d| match d.payload {
                ResultPayload::RowGroup(batch) => Some(batch),
                _ => None,
            })
            .collect()
    }
}

fn create(mode: OutputMode) -> CreateBatch {
    CreateBatch::new(mode, TxnId(1), 7, StepId(2), UniqueId(3))
}

fn scan(start_lbids: Vec<u64>, block_count: u32) -> RunBatch {
    RunBatch {
        header: JobHeader::new(7, StepId(2), UniqueId(3)),
        db_root: 0,
        block_count,
        rids: RidSet::Scan,
        values: None,
        start_lbids,
    }
}

fn value_cmp(op: BinaryOp, n: i64) -> Expr {
    Expr::binary(Expr::col(0, "value"), op, Expr::lit_i64(n))
}

fn ints(column: &ArrayRef) -> Vec<Option<i64>> {
    let wide = cast(column, &DataType::Int64).expect("cast");
    wide.as_primitive::<Int64Type>().iter().collect()
}

fn strings(column: &ArrayRef) -> Vec<Option<String>> {
    column
        .as_string::<i32>()
        .iter()
        .map(|v| v.map(str::to_string))
        .collect()
}

#[test]
fn and_or_filters_ship_surviving_rids() {
    let h = Harness::new();
    h.put_ints(10, 0, 0, (0..20).map(Some).collect());
    h.put_ints(11, 1000, 0, (100..120).map(Some).collect());

    let and = create(OutputMode::RowIds)
        .with_filter(StepDescriptor::filter(10, ColumnKind::INT, value_cmp(BinaryOp::Lt, 10)))
        .with_filter(StepDescriptor::filter(11, ColumnKind::INT, value_cmp(BinaryOp::Gt, 104)));
    let mut exec = h.executor(&and);
    assert_eq!(h.run(&mut exec, &scan(vec![0, 1000], 1)), JobStatus::Done);

    let or = create(OutputMode::RowIds)
        .with_bool_op(BoolOp::Or)
        .with_filter(StepDescriptor::filter(10, ColumnKind::INT, value_cmp(BinaryOp::Lt, 2)))
        .with_filter(StepDescriptor::filter(11, ColumnKind::INT, value_cmp(BinaryOp::Gt, 117)));
    let mut exec = h.executor(&or);
    assert_eq!(h.run(&mut exec, &scan(vec![0, 1000], 1)), JobStatus::Done);

    let data = h.data();
    assert_eq!(data.len(), 2);
    assert_eq!(
        data[0].payload,
        ResultPayload::RowIds {
            base_rid: 0,
            rids: vec![5, 6, 7, 8, 9],
        }
    );
    assert_eq!(
        data[1].payload,
        ResultPayload::RowIds {
            base_rid: 0,
            rids: vec![0, 1, 18, 19],
        }
    );
    let cp = data[0].checkpoint.expect("checkpoint");
    assert_eq!((cp.lbid, cp.min, cp.max), (0, 0, 19));
    assert_eq!(data[0].counters.physical_io, 2);
}

#[test]
fn prefetched_values_skip_the_first_load() {
    let h = Harness::new();
    let create = create(OutputMode::RowIdsAndValues)
        .with_filter(StepDescriptor::filter(10, ColumnKind::INT, value_cmp(BinaryOp::Gt, 5)));
    let mut exec = h.executor(&create);
    let rids = vec![1, 3, 4];
    let run = RunBatch {
        rids: RidSet::Relative {
            rid_map: RidSet::rid_map_of(&rids),
            base_rid: 8192,
            rids,
        },
        values: Some(vec![9, 2, 7]),
        ..scan(vec![0], 1)
    };
    assert_eq!(h.run(&mut exec, &run), JobStatus::Done);
    assert_eq!(h.source.load_count(), 0);

    let data = h.data();
    assert_eq!(
        data[0].payload,
        ResultPayload::Elements {
            base_rid: 8192,
            rids: vec![1, 4],
            values: ElementValues::Int(vec![Some(9), Some(7)]),
        }
    );
    assert!(data[0].checkpoint.is_none());
}

#[test]
fn absolute_rids_must_share_a_block() {
    let h = Harness::new();
    h.put_ints(10, 0, 0, vec![Some(1)]);
    let mut exec = h.executor(
        &create(OutputMode::RowIds).with_filter(StepDescriptor::column(10, ColumnKind::INT)),
    );
    let run = RunBatch {
        rids: RidSet::Absolute(vec![8190, 8200]),
        ..scan(vec![0], 1)
    };
    assert!(matches!(exec.reset(&run), Err(ColexError::Protocol(_))));
    let unsorted = RunBatch {
        rids: RidSet::Absolute(vec![5, 3]),
        ..scan(vec![0], 1)
    };
    assert!(matches!(exec.reset(&unsorted), Err(ColexError::Protocol(_))));
    assert!(matches!(
        exec.reset(&scan(vec![0, 8], 1)),
        Err(ColexError::Protocol(_))
    ));
}

#[test]
fn projection_expressions_and_delivery_rids() {
    let h = Harness::new();
    h.put_ints(10, 0, 100, (0..10).map(Some).collect());
    let create = create(OutputMode::RowGroup)
        .with_flags(BatchFlags::SEND_RIDS_AT_DELIVERY)
        .with_filter(StepDescriptor::filter(10, ColumnKind::INT, value_cmp(BinaryOp::Lt, 3)))
        .with_project(StepDescriptor::PassThru {
            oid: 10,
            filter_step: 0,
        })
        .with_project(StepDescriptor::Expression {
            name: "twice".to_string(),
            expr: Expr::binary(Expr::col(0, "col10"), BinaryOp::Plus, Expr::col(0, "col10")),
        });
    let mut exec = h.executor(&create);
    assert_eq!(exec.oids(), &[10]);
    assert_eq!(h.run(&mut exec, &scan(vec![0], 1)), JobStatus::Done);

    let groups = h.row_groups();
    assert_eq!(groups.len(), 1);
    let batch = &groups[0];
    assert_eq!(ints(batch.column(1)), vec![Some(0), Some(2), Some(4)]);
    let rids: Vec<u64> = batch
        .column_by_name(crate::output::RID_COLUMN)
        .expect("rid column")
        .as_primitive::<UInt64Type>()
        .values()
        .to_vec();
    assert_eq!(rids, vec![100, 101, 102]);
}

/// Large side keys `large`, small side {(1,"a"), (1,"b"), (2,"c")}.
fn join_rows(kind: JoinKind, large: Vec<Option<i32>>) -> Vec<(Option<i64>, Option<String>)> {
    let h = Harness::new();
    h.put_ints(20, 0, 0, large);
    let small = RowSchema::new(vec![ColumnDesc::new("name", ColumnKind::LongString)])
        .expect("small schema");
    let create = create(OutputMode::RowGroup)
        .with_project(StepDescriptor::column(20, ColumnKind::INT))
        .with_join(JoinDescriptor {
            kind,
            size: 3,
            key: JoinKey::Scalar {
                large_key_col: 0,
                null_value: u64::MAX,
            },
            filter: None,
            small_schema: Some(small.columns().to_vec()),
        });
    let mut exec = h.executor(&create);
    assert!(!exec.end_of_joiner().expect("gate"));
    let rows = small
        .batch(vec![Arc::new(StringArray::from(vec!["a", "b", "c"]))])
        .expect("small rows");
    exec.add_to_joiner(&JoinBuild {
        header: exec.header(),
        joiner_index: 0,
        start_pos: 0,
        entries: JoinEntries::Scalar(vec![(1, 0), (1, 1), (2, 2)]),
        small_rows: Some(rows),
    })
    .expect("build");
    assert!(exec.end_of_joiner().expect("gate"));
    assert_eq!(h.run(&mut exec, &scan(vec![0], 1)), JobStatus::Done);

    let groups = h.row_groups();
    assert_eq!(groups.len(), 1);
    let batch = &groups[0];
    ints(batch.column(0))
        .into_iter()
        .zip(strings(batch.column(1)))
        .collect()
}

fn row(key: i64, name: Option<&str>) -> (Option<i64>, Option<String>) {
    (Some(key), name.map(str::to_string))
}

#[test]
fn join_kinds_pair_large_rows_with_small_rows() {
    let large = || vec![Some(1), Some(2), Some(3)];
    assert_eq!(
        join_rows(JoinKind::INNER, large()),
        vec![row(1, Some("a")), row(1, Some("b")), row(2, Some("c"))]
    );
    assert_eq!(
        join_rows(JoinKind::LARGE_OUTER, large()),
        vec![
            row(1, Some("a")),
            row(1, Some("b")),
            row(2, Some("c")),
            row(3, None)
        ]
    );
    assert_eq!(join_rows(JoinKind::ANTI, vec![Some(3)]), vec![row(3, None)]);
    assert!(join_rows(JoinKind::ANTI, vec![Some(1)]).is_empty());
    assert_eq!(
        join_rows(JoinKind::SEMI, large()),
        vec![row(1, None), row(2, None)]
    );
}

#[test]
fn anti_join_with_null_matching_rejects_on_small_null() {
    let run_anti = |kind: JoinKind| -> usize {
        let h = Harness::new();
        h.put_ints(20, 0, 0, vec![Some(2)]);
        let create = create(OutputMode::RowGroup)
            .with_project(StepDescriptor::column(20, ColumnKind::INT))
            .with_join(JoinDescriptor {
                kind,
                size: 2,
                key: JoinKey::Scalar {
                    large_key_col: 0,
                    null_value: u64::MAX,
                },
                filter: None,
                small_schema: None,
            });
        let mut exec = h.executor(&create);
        exec.add_to_joiner(&JoinBuild {
            header: exec.header(),
            joiner_index: 0,
            start_pos: 0,
            entries: JoinEntries::Scalar(vec![(1, 0), (u64::MAX, 1)]),
            small_rows: None,
        })
        .expect("build");
        assert!(exec.end_of_joiner().expect("gate"));
        assert_eq!(h.run(&mut exec, &scan(vec![0], 1)), JobStatus::Done);
        h.row_groups().iter().map(RecordBatch::num_rows).sum()
    };
    assert_eq!(run_anti(JoinKind::ANTI), 1);
    assert_eq!(run_anti(JoinKind::ANTI | JoinKind::MATCH_NULLS), 0);
}

#[test]
fn scalar_join_with_two_matches_fails_the_batch() {
    let h = Harness::new();
    h.put_ints(20, 0, 0, vec![Some(1)]);
    let create = create(OutputMode::RowGroup)
        .with_project(StepDescriptor::column(20, ColumnKind::INT))
        .with_join(JoinDescriptor {
            kind: JoinKind::SCALAR | JoinKind::LARGE_OUTER,
            size: 2,
            key: JoinKey::Scalar {
                large_key_col: 0,
                null_value: u64::MAX,
            },
            filter: None,
            small_schema: None,
        });
    let mut exec = h.executor(&create);
    exec.add_to_joiner(&JoinBuild {
        header: exec.header(),
        joiner_index: 0,
        start_pos: 0,
        entries: JoinEntries::Scalar(vec![(1, 0), (1, 1)]),
        small_rows: None,
    })
    .expect("build");
    assert!(exec.end_of_joiner().expect("gate"));
    assert_eq!(h.run(&mut exec, &scan(vec![0], 1)), JobStatus::Done);

    let results = h.results();
    assert_eq!(results.len(), 1);
    assert!(matches!(
        results[0],
        ResultBody::Error {
            code: ERR_MORE_THAN_ONE_ROW,
            ..
        }
    ));
    assert_eq!(exec.state(), ExecutorState::Idle);
}

#[test]
fn reset_twice_is_the_same_as_once() {
    let h = Harness::new();
    h.put_ints(10, 0, 0, (0..8).map(Some).collect());
    let mut exec = h.executor(
        &create(OutputMode::RowIds)
            .with_filter(StepDescriptor::filter(10, ColumnKind::INT, value_cmp(BinaryOp::Lt, 4))),
    );
    let rids = vec![1, 5, 6];
    let run = RunBatch {
        rids: RidSet::Relative {
            rid_map: RidSet::rid_map_of(&rids),
            base_rid: 0,
            rids,
        },
        ..scan(vec![0], 1)
    };
    exec.reset(&run).expect("reset");
    exec.reset(&run).expect("reset");
    assert_eq!(
        exec.execute(&h.dispatcher, &h.sock, true).expect("execute"),
        JobStatus::Done
    );
    // A run is consumed by execute.
    assert!(exec.execute(&h.dispatcher, &h.sock, false).is_err());

    let data = h.data();
    assert_eq!(data.len(), 1);
    assert_eq!(
        data[0].payload,
        ResultPayload::RowIds {
            base_rid: 0,
            rids: vec![1],
        }
    );
}

#[test]
fn aggregation_emits_once_on_the_last_block() {
    let h = Harness::new();
    let rows = ROWS_PER_BLOCK as i32 + 4;
    h.put_ints(30, 0, 0, (0..rows).map(|i| Some(i % 2)).collect());
    let create = create(OutputMode::RowGroup)
        .with_project(StepDescriptor::column(30, ColumnKind::INT))
        .with_aggregator(AggregatorDescriptor {
            group_by: vec![0],
            aggregates: vec![AggregateSpec {
                func: AggFunc::Count,
                column: None,
                name: "n".to_string(),
            }],
        });
    let mut exec = h.executor(&create);
    assert_eq!(h.run(&mut exec, &scan(vec![0], 2)), JobStatus::Done);

    let groups = h.row_groups();
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0].num_rows(), 0);
    assert_eq!(groups[1].num_rows(), 2);
    let total: i64 = ints(groups[1].column_by_name("n").expect("count column"))
        .into_iter()
        .flatten()
        .sum();
    assert_eq!(total, i64::from(rows));
}

#[test]
fn stale_metadata_propagates_a_restart() {
    let h = Harness::new();
    h.put_ints(10, 0, 0, vec![Some(1), Some(2)]);
    let mut exec = h.executor(
        &create(OutputMode::RowIds).with_filter(StepDescriptor::column(10, ColumnKind::INT)),
    );
    h.source.mark_stale(10);
    exec.reset(&scan(vec![0], 1)).expect("reset");
    let err = exec
        .execute(&h.dispatcher, &h.sock, true)
        .expect_err("restart");
    assert!(err.is_restart());

    h.source.invalidate(exec.oids());
    assert_eq!(h.run(&mut exec, &scan(vec![0], 1)), JobStatus::Done);
    assert_eq!(h.data().len(), 1);
}

#[test]
fn invalid_batches_are_rejected_at_creation() {
    let h = Harness::new();
    let no_filter = create(OutputMode::Values).with_project(StepDescriptor::column(1, ColumnKind::INT));
    assert!(matches!(
        BatchExecutor::new(&no_filter, h.ctx.clone()),
        Err(ColexError::Protocol(_))
    ));
    let values_only = create(OutputMode::Values);
    assert!(BatchExecutor::new(&values_only, h.ctx.clone()).is_err());
    let agg_with_rids = create(OutputMode::RowGroup)
        .with_flags(BatchFlags::SEND_RIDS_AT_DELIVERY)
        .with_project(StepDescriptor::column(1, ColumnKind::INT))
        .with_aggregator(AggregatorDescriptor::default());
    assert!(matches!(
        BatchExecutor::new(&agg_with_rids, h.ctx.clone()),
        Err(ColexError::Protocol(_))
    ));
    let bad_pass_thru = create(OutputMode::RowGroup).with_project(StepDescriptor::PassThru {
        oid: 1,
        filter_step: 0,
    });
    assert!(matches!(
        BatchExecutor::new(&bad_pass_thru, h.ctx.clone()),
        Err(ColexError::Protocol(_))
    ));
}

#[test]
fn group_reschedules_until_the_join_build_completes() {
    let h = Harness::new();
    h.put_ints(20, 0, 0, vec![Some(1), Some(5)]);
    let create = create(OutputMode::RowGroup)
        .with_project(StepDescriptor::column(20, ColumnKind::INT))
        .with_join(JoinDescriptor {
            kind: JoinKind::INNER,
            size: 1,
            key: JoinKey::Scalar {
                large_key_col: 0,
                null_value: u64::MAX,
            },
            filter: None,
            small_schema: None,
        });
    let group = BatchGroup::new(&create, h.ctx.clone(), Arc::new(NoBlocked)).expect("group");
    let run = scan(vec![0], 1);
    assert_eq!(group.run(&run, &h.sock).expect("run"), JobStatus::Reschedule);
    assert_eq!(group.instance_count(), 0);

    group
        .add_joiner(&JoinBuild {
            header: group.header(),
            joiner_index: 0,
            start_pos: 0,
            entries: JoinEntries::Scalar(vec![(5, 0)]),
            small_rows: None,
        })
        .expect("build");
    assert!(group.end_joiner().expect("gate"));
    assert_eq!(group.run(&run, &h.sock).expect("run"), JobStatus::Done);
    assert_eq!(group.run(&run, &h.sock).expect("run"), JobStatus::Done);
    assert_eq!(group.instance_count(), 1);
    assert!(group.dispatcher().wait_drained(Duration::from_secs(5)));

    let keys: Vec<Option<i64>> = h
        .row_groups()
        .iter()
        .flat_map(|batch| ints(batch.column(0)))
        .collect();
    assert_eq!(keys, vec![Some(5), Some(5)]);

    group.abort();
    assert_eq!(group.run(&run, &h.sock).expect("run"), JobStatus::Done);
}

#[test]
fn restart_mid_run_replays_without_duplicate_results() {
    let memory = Arc::new(MemoryBlockSource::new());
    let flaky = Arc::new(StaleOnce {
        inner: Arc::clone(&memory),
        lbid: u64::from(ColumnKind::INT.width()),
        tripped: AtomicBool::new(false),
    });
    let h = Harness::build(ProcessorConfig::default(), memory, flaky);
    let rows = ROWS_PER_BLOCK as i32 + 3;
    h.put_ints(10, 0, 0, (0..rows).map(Some).collect());
    let mut exec = h.executor(&create(OutputMode::RowIds).with_filter(StepDescriptor::filter(
        10,
        ColumnKind::INT,
        value_cmp(BinaryOp::Gt, i64::from(rows) - 6),
    )));

    exec.reset(&scan(vec![0], 2)).expect("reset");
    let err = exec
        .execute(&h.dispatcher, &h.sock, true)
        .expect_err("restart");
    assert!(err.is_restart());
    assert!(h.dispatcher.wait_drained(Duration::from_secs(5)));
    assert_eq!(h.conn.frame_count(), 0);

    assert_eq!(h.run(&mut exec, &scan(vec![0], 2)), JobStatus::Done);
    let data = h.data();
    assert_eq!(data.len(), 2);
    assert_eq!(
        data[0].payload,
        ResultPayload::RowIds {
            base_rid: 0,
            rids: vec![8190, 8191],
        }
    );
    assert_eq!(
        data[1].payload,
        ResultPayload::RowIds {
            base_rid: ROWS_PER_BLOCK as u64,
            rids: vec![0, 1, 2],
        }
    );
}

#[test]
fn reset_with_another_slice_discards_the_previous_one() {
    let h = Harness::new();
    h.put_ints(20, 0, 0, vec![Some(1), Some(2), Some(3), Some(1)]);
    let small = RowSchema::new(vec![ColumnDesc::new("name", ColumnKind::LongString)])
        .expect("small schema");
    let create = create(OutputMode::RowGroup)
        .with_flags(BatchFlags::SEND_RIDS_AT_DELIVERY)
        .with_project(StepDescriptor::column(20, ColumnKind::INT))
        .with_join(JoinDescriptor {
            kind: JoinKind::INNER,
            size: 3,
            key: JoinKey::Scalar {
                large_key_col: 0,
                null_value: u64::MAX,
            },
            filter: None,
            small_schema: Some(small.columns().to_vec()),
        });
    let mut exec = h.executor(&create);
    exec.add_to_joiner(&JoinBuild {
        header: exec.header(),
        joiner_index: 0,
        start_pos: 0,
        entries: JoinEntries::Scalar(vec![(1, 0), (1, 1), (2, 2)]),
        small_rows: Some(
            small
                .batch(vec![Arc::new(StringArray::from(vec!["a", "b", "c"]))])
                .expect("small rows"),
        ),
    })
    .expect("build");
    assert!(exec.end_of_joiner().expect("gate"));

    let slice = |rids: Vec<u16>| RunBatch {
        rids: RidSet::Relative {
            rid_map: RidSet::rid_map_of(&rids),
            base_rid: 0,
            rids,
        },
        ..scan(vec![0], 1)
    };
    // Keys 1 and 2, three joined rows, are never executed.
    exec.reset(&slice(vec![0, 1])).expect("reset");
    exec.reset(&slice(vec![2, 3])).expect("reset");
    assert_eq!(
        exec.execute(&h.dispatcher, &h.sock, true).expect("execute"),
        JobStatus::Done
    );
    assert_eq!(h.run(&mut exec, &slice(vec![0, 1])), JobStatus::Done);

    let groups = h.row_groups();
    assert_eq!(groups.len(), 2);
    let delivered = |batch: &RecordBatch| -> Vec<u64> {
        batch
            .column_by_name(crate::output::RID_COLUMN)
            .expect("rid column")
            .as_primitive::<UInt64Type>()
            .values()
            .to_vec()
    };
    assert_eq!(ints(groups[0].column(0)), vec![Some(1), Some(1)]);
    assert_eq!(
        strings(groups[0].column(1)),
        vec![Some("a".to_string()), Some("b".to_string())]
    );
    assert_eq!(delivered(&groups[0]), vec![3, 3]);
    assert_eq!(groups[1].num_rows(), 3);
    assert_eq!(delivered(&groups[1]), vec![0, 0, 1]);
}

#[test]
fn memory_pressure_flushes_partial_aggregates_early() {
    let h = Harness::with_config(ProcessorConfig {
        engine_mem_budget_bytes: 1,
        ..ProcessorConfig::default()
    });
    let rows = ROWS_PER_BLOCK as i32 + 4;
    h.put_ints(30, 0, 0, (0..rows).map(|i| Some(i % 2)).collect());
    let create = create(OutputMode::RowGroup)
        .with_project(StepDescriptor::column(30, ColumnKind::INT))
        .with_aggregator(AggregatorDescriptor {
            group_by: vec![0],
            aggregates: vec![AggregateSpec {
                func: AggFunc::Count,
                column: None,
                name: "n".to_string(),
            }],
        });
    let mut exec = h.executor(&create);
    assert_eq!(h.run(&mut exec, &scan(vec![0], 2)), JobStatus::Done);

    let groups = h.row_groups();
    assert_eq!(groups.len(), 2);
    let counts = |batch: &RecordBatch| -> Vec<i64> {
        ints(batch.column_by_name("n").expect("count column"))
            .into_iter()
            .flatten()
            .collect()
    };
    assert_eq!(groups[0].num_rows(), 2);
    assert_eq!(counts(&groups[0]).iter().sum::<i64>(), ROWS_PER_BLOCK as i64);
    // The flush started the state over: the last block only counts its own rows.
    assert_eq!(counts(&groups[1]), vec![2, 2]);
}

#[test]
fn composite_keys_join_on_every_key_column() {
    let h = Harness::new();
    h.put_ints(20, 0, 0, vec![Some(1), Some(1), Some(2), None]);
    h.put_ints(21, 100, 0, vec![Some(1), Some(2), Some(2), Some(1)]);
    let small = RowSchema::new(vec![ColumnDesc::new("name", ColumnKind::LongString)])
        .expect("small schema");
    let create = create(OutputMode::RowGroup)
        .with_project(StepDescriptor::column(20, ColumnKind::INT))
        .with_project(StepDescriptor::column(21, ColumnKind::INT))
        .with_join(JoinDescriptor {
            kind: JoinKind::INNER,
            size: 4,
            key: JoinKey::Typeless {
                large_key_cols: vec![0, 1],
            },
            filter: None,
            small_schema: Some(small.columns().to_vec()),
        });
    let mut exec = h.executor(&create);
    let key = |a: i64, b: i64| {
        Some(encode_group_key(&[ScalarValue::Int64(a), ScalarValue::Int64(b)]))
    };
    exec.add_to_joiner(&JoinBuild {
        header: exec.header(),
        joiner_index: 0,
        start_pos: 0,
        entries: JoinEntries::Typeless(vec![key(1, 1), key(1, 1), key(2, 2), key(1, 3)]),
        small_rows: Some(
            small
                .batch(vec![Arc::new(StringArray::from(vec!["a", "b", "c", "d"]))])
                .expect("small rows"),
        ),
    })
    .expect("build");
    assert!(exec.end_of_joiner().expect("gate"));
    assert_eq!(h.run(&mut exec, &scan(vec![0, 100], 1)), JobStatus::Done);

    let groups = h.row_groups();
    assert_eq!(groups.len(), 1);
    let batch = &groups[0];
    assert_eq!(ints(batch.column(0)), vec![Some(1), Some(1), Some(2)]);
    assert_eq!(ints(batch.column(1)), vec![Some(1), Some(1), Some(2)]);
    assert_eq!(
        strings(batch.column(2)),
        vec![Some("a".to_string()), Some("b".to_string()), Some("c".to_string())]
    );
}

#[test]
fn join_build_larger_than_announced_is_rejected() {
    let h = Harness::new();
    let create = create(OutputMode::RowGroup)
        .with_project(StepDescriptor::column(20, ColumnKind::INT))
        .with_join(JoinDescriptor {
            kind: JoinKind::INNER,
            size: 1,
            key: JoinKey::Scalar {
                large_key_col: 0,
                null_value: u64::MAX,
            },
            filter: None,
            small_schema: None,
        });
    let exec = h.executor(&create);
    exec.add_to_joiner(&JoinBuild {
        header: exec.header(),
        joiner_index: 0,
        start_pos: 0,
        entries: JoinEntries::Scalar(vec![(1, 0), (2, 1)]),
        small_rows: None,
    })
    .expect("build");
    assert!(matches!(exec.end_of_joiner(), Err(ColexError::Protocol(_))));
}
