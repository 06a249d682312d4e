//! Typed messages and their frame encoding.

use std::io::{ErrorKind, Read};

use arrow::record_batch::RecordBatch;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use colex_common::{ColexError, Result, StepId, TxnId, UniqueId};
use colex_execution::{decode_row_group, encode_row_group, ColumnDesc, Expr};

use crate::codec::{
    get_bool, get_bytes, get_count, get_i128, get_i32, get_i64, get_opt_json, get_string, get_u16,
    get_u32, get_u64, get_u8, put_bytes, put_opt_json, put_string,
};
use crate::frame::{Command, FrameHeader, JobHeader, FRAME_HEADER_LEN};

/// Initial body buffer for a streamed frame.
const READ_CHUNK: usize = 64 * 1024;
use crate::types::{
    AggregatorDescriptor, BatchFlags, BoolOp, JoinDescriptor, OutputMode, StepDescriptor,
};

/// Creation message for a batch group.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateBatch {
    pub output_mode: OutputMode,
    pub txn: TxnId,
    pub session: u32,
    pub step: StepId,
    pub unique: UniqueId,
    pub version: u32,
    pub flags: BatchFlags,
    /// Width of the widest column, sent when `HAS_WIDE_COLUMNS` is set.
    pub wide_column_width: Option<u8>,
    pub bool_op: BoolOp,
    /// Row-group filter applied before joins.
    pub fe1: Option<Expr>,
    /// Row-group filter applied after joins.
    pub fe2: Option<Expr>,
    pub joins: Vec<JoinDescriptor>,
    pub filter_steps: Vec<StepDescriptor>,
    pub project_steps: Vec<StepDescriptor>,
    pub aggregator: Option<AggregatorDescriptor>,
}

impl CreateBatch {
    pub fn new(output_mode: OutputMode, txn: TxnId, session: u32, step: StepId, unique: UniqueId) -> Self {
        let mut flags = BatchFlags::empty();
        flags.set(BatchFlags::HAS_ROWGROUP, output_mode == OutputMode::RowGroup);
        Self {
            output_mode,
            txn,
            session,
            step,
            unique,
            version: 0,
            flags,
            wide_column_width: None,
            bool_op: BoolOp::And,
            fe1: None,
            fe2: None,
            joins: Vec::new(),
            filter_steps: Vec::new(),
            project_steps: Vec::new(),
            aggregator: None,
        }
    }

    pub fn with_bool_op(mut self, op: BoolOp) -> Self {
        self.bool_op = op;
        self
    }

    pub fn with_flags(mut self, flags: BatchFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn with_filter(mut self, step: StepDescriptor) -> Self {
        self.filter_steps.push(step);
        self
    }

    pub fn with_project(mut self, step: StepDescriptor) -> Self {
        self.project_steps.push(step);
        self
    }

    pub fn with_join(mut self, join: JoinDescriptor) -> Self {
        self.flags |= BatchFlags::HAS_JOINER;
        if join.small_schema.is_some() {
            self.flags |= BatchFlags::JOIN_ROWGROUP_DATA;
        }
        self.joins.push(join);
        self
    }

    pub fn with_aggregator(mut self, aggregator: AggregatorDescriptor) -> Self {
        self.aggregator = Some(aggregator);
        self
    }

    pub fn with_wide_columns(mut self, width: u8) -> Self {
        self.flags |= BatchFlags::HAS_WIDE_COLUMNS;
        self.wide_column_width = Some(width);
        self
    }

    pub fn job_header(&self) -> JobHeader {
        JobHeader::new(self.session, self.step, self.unique).with_version(self.txn, self.version)
    }

    fn encode_body(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u8(self.output_mode as u8);
        buf.put_u32_le(self.txn.0);
        buf.put_u32_le(self.session);
        buf.put_u32_le(self.step.0);
        buf.put_u32_le(self.unique.0);
        buf.put_u32_le(self.version);
        buf.put_u16_le(self.flags.bits());
        if self.flags.contains(BatchFlags::HAS_WIDE_COLUMNS) {
            buf.put_u8(self.wide_column_width.unwrap_or(16));
        }
        buf.put_u8(self.bool_op as u8);
        if self.flags.contains(BatchFlags::HAS_ROWGROUP) {
            put_opt_json(buf, self.fe1.as_ref())?;
            put_opt_json(buf, self.fe2.as_ref())?;
        }
        if self.flags.contains(BatchFlags::HAS_JOINER) {
            buf.put_u32_le(self.joins.len() as u32);
            for join in &self.joins {
                join.encode(buf)?;
            }
            if self.flags.contains(BatchFlags::JOIN_ROWGROUP_DATA) {
                for join in &self.joins {
                    put_opt_json(buf, join.small_schema.as_ref())?;
                }
            }
        }
        buf.put_u32_le(self.filter_steps.len() as u32);
        for step in &self.filter_steps {
            step.encode(buf)?;
        }
        buf.put_u32_le(self.project_steps.len() as u32);
        for step in &self.project_steps {
            step.encode(buf)?;
        }
        put_opt_json(buf, self.aggregator.as_ref())
    }

    fn decode_body(buf: &mut Bytes) -> Result<Self> {
        let output_mode = OutputMode::try_from(get_u8(buf, "output mode")?)?;
        let txn = TxnId(get_u32(buf, "txn id")?);
        let session = get_u32(buf, "session id")?;
        let step = StepId(get_u32(buf, "step id")?);
        let unique = UniqueId(get_u32(buf, "unique id")?);
        let version = get_u32(buf, "version")?;
        let flags = BatchFlags::from_bits(get_u16(buf, "batch flags")?)
            .ok_or_else(|| ColexError::Protocol("unknown batch flag bits".to_string()))?;
        let wide_column_width = flags
            .contains(BatchFlags::HAS_WIDE_COLUMNS)
            .then(|| get_u8(buf, "wide column width"))
            .transpose()?;
        let bool_op = BoolOp::try_from(get_u8(buf, "bool op")?)?;

        if flags.contains(BatchFlags::HAS_ROWGROUP) != (output_mode == OutputMode::RowGroup) {
            return Err(ColexError::Protocol(
                "HAS_ROWGROUP disagrees with the output mode".to_string(),
            ));
        }
        let (fe1, fe2) = if flags.contains(BatchFlags::HAS_ROWGROUP) {
            (
                get_opt_json(buf, "fe1")?,
                get_opt_json(buf, "fe2")?,
            )
        } else {
            (None, None)
        };

        let mut joins = Vec::new();
        if flags.contains(BatchFlags::HAS_JOINER) {
            if output_mode != OutputMode::RowGroup {
                return Err(ColexError::Protocol(
                    "joins require row group output".to_string(),
                ));
            }
            let n = get_count(buf, 7, "joiner count")?;
            for _ in 0..n {
                joins.push(JoinDescriptor::decode(buf)?);
            }
            if joins.is_empty() {
                return Err(ColexError::Protocol(
                    "HAS_JOINER set without join descriptors".to_string(),
                ));
            }
            if flags.contains(BatchFlags::JOIN_ROWGROUP_DATA) {
                for join in &mut joins {
                    join.small_schema = get_opt_json::<Vec<ColumnDesc>>(buf, "small side schema")?;
                }
            }
        }

        let n = get_count(buf, 1, "filter step count")?;
        let mut filter_steps = Vec::with_capacity(n);
        for _ in 0..n {
            filter_steps.push(StepDescriptor::decode(buf)?);
        }
        let n = get_count(buf, 1, "project step count")?;
        let mut project_steps = Vec::with_capacity(n);
        for _ in 0..n {
            project_steps.push(StepDescriptor::decode(buf)?);
        }
        let aggregator = get_opt_json(buf, "aggregator")?;

        Ok(Self {
            output_mode,
            txn,
            session,
            step,
            unique,
            version,
            flags,
            wide_column_width,
            bool_op,
            fe1,
            fe2,
            joins,
            filter_steps,
            project_steps,
            aggregator,
        })
    }
}

/// Input row ids of a run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RidSet {
    /// Scan every row of every block.
    #[default]
    Scan,
    /// Absolute row ids, all within the first block.
    Absolute(Vec<u64>),
    /// Block-relative row ids.
    Relative {
        rid_map: u16,
        base_rid: u64,
        rids: Vec<u16>,
    },
}

impl RidSet {
    /// Sub-block occupancy bitmap: bit `i` covers rows `[i*512, (i+1)*512)`.
    pub fn rid_map_of(rids: &[u16]) -> u16 {
        rids.iter().fold(0, |m, r| m | (1 << (r >> 9)))
    }
}

/// Per-slice reset of an existing batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunBatch {
    pub header: JobHeader,
    pub db_root: u16,
    pub block_count: u32,
    pub rids: RidSet,
    /// Pre-fetched values of the first filter column, aligned with `rids`.
    pub values: Option<Vec<i64>>,
    /// Start LBID per column step, filter steps first.
    pub start_lbids: Vec<u64>,
}

impl RunBatch {
    fn encode_body(&self, buf: &mut BytesMut) {
        self.header.encode(buf);
        buf.put_u16_le(self.db_root);
        buf.put_u32_le(self.block_count);
        match &self.rids {
            RidSet::Scan => buf.put_u8(0),
            RidSet::Absolute(rids) => {
                buf.put_u8(1);
                buf.put_u32_le(rids.len() as u32);
                for r in rids {
                    buf.put_u64_le(*r);
                }
            }
            RidSet::Relative {
                rid_map,
                base_rid,
                rids,
            } => {
                buf.put_u8(2);
                buf.put_u32_le(rids.len() as u32);
                buf.put_u16_le(*rid_map);
                buf.put_u64_le(*base_rid);
                for r in rids {
                    buf.put_u16_le(*r);
                }
            }
        }
        match &self.values {
            Some(values) => {
                buf.put_u8(1);
                buf.put_u32_le(values.len() as u32);
                for v in values {
                    buf.put_i64_le(*v);
                }
            }
            None => buf.put_u8(0),
        }
        buf.put_u32_le(self.start_lbids.len() as u32);
        for lbid in &self.start_lbids {
            buf.put_u64_le(*lbid);
        }
    }

    fn decode_body(buf: &mut Bytes) -> Result<Self> {
        let header = JobHeader::decode(buf)?;
        let db_root = get_u16(buf, "db root")?;
        let block_count = get_u32(buf, "block count")?;
        if block_count == 0 {
            return Err(ColexError::Protocol("run with zero blocks".to_string()));
        }
        let rids = match get_u8(buf, "rid set type")? {
            0 => RidSet::Scan,
            1 => {
                let n = get_count(buf, 8, "rid count")?;
                let mut rids = Vec::with_capacity(n);
                for _ in 0..n {
                    rids.push(get_u64(buf, "absolute rid")?);
                }
                RidSet::Absolute(rids)
            }
            2 => {
                let n = get_count(buf, 2, "rid count")?;
                let rid_map = get_u16(buf, "rid map")?;
                let base_rid = get_u64(buf, "base rid")?;
                let mut rids = Vec::with_capacity(n);
                for _ in 0..n {
                    rids.push(get_u16(buf, "relative rid")?);
                }
                RidSet::Relative {
                    rid_map,
                    base_rid,
                    rids,
                }
            }
            other => return Err(ColexError::Protocol(format!("unknown rid set type {other}"))),
        };
        let values = if get_bool(buf, "values flag")? {
            let n = get_count(buf, 8, "value count")?;
            let mut values = Vec::with_capacity(n);
            for _ in 0..n {
                values.push(get_i64(buf, "value")?);
            }
            Some(values)
        } else {
            None
        };
        let n = get_count(buf, 8, "lbid count")?;
        let mut start_lbids = Vec::with_capacity(n);
        for _ in 0..n {
            start_lbids.push(get_u64(buf, "start lbid")?);
        }
        Ok(Self {
            header,
            db_root,
            block_count,
            rids,
            values,
            start_lbids,
        })
    }
}

/// Keys delivered by one join-build message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinEntries {
    /// (key, small-side row) pairs.
    Scalar(Vec<(u64, u32)>),
    /// Encoded keys; `None` is a null key. Row of entry `i` is `start_pos + i`.
    ///
    /// Each key must be `colex_execution::encode_group_key` over the key
    /// columns' values in `JoinKey::Typeless::large_key_cols` order, with
    /// values normalized the way `scalar_from_array` reads them: signed
    /// integers as `Int64`, unsigned as `UInt64`, floats as `Float64Bits`
    /// and decimals as `Decimal128` with the column's precision and scale.
    /// Keys encoded any other way never match.
    Typeless(Vec<Option<Vec<u8>>>),
}

impl JoinEntries {
    pub fn len(&self) -> usize {
        match self {
            Self::Scalar(v) => v.len(),
            Self::Typeless(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Small-side rows for one join, built into its join table.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinBuild {
    pub header: JobHeader,
    pub joiner_index: u32,
    pub start_pos: u32,
    pub entries: JoinEntries,
    /// Row group holding rows `start_pos..start_pos + n`.
    pub small_rows: Option<RecordBatch>,
}

impl JoinBuild {
    fn encode_body(&self, buf: &mut BytesMut) -> Result<()> {
        self.header.encode(buf);
        buf.put_u32_le(self.entries.len() as u32);
        buf.put_u32_le(self.start_pos);
        buf.put_u32_le(self.joiner_index);
        match &self.entries {
            JoinEntries::Scalar(pairs) => {
                buf.put_u8(0);
                for (k, v) in pairs {
                    buf.put_u64_le(*k);
                    buf.put_u32_le(*v);
                }
            }
            JoinEntries::Typeless(keys) => {
                buf.put_u8(1);
                for key in keys {
                    match key {
                        Some(bytes) => {
                            buf.put_u8(0);
                            put_bytes(buf, bytes);
                        }
                        None => buf.put_u8(1),
                    }
                }
            }
        }
        match &self.small_rows {
            Some(batch) => {
                buf.put_u8(1);
                put_bytes(buf, &encode_row_group(batch)?);
            }
            None => buf.put_u8(0),
        }
        Ok(())
    }

    fn decode_body(buf: &mut Bytes) -> Result<Self> {
        let header = JobHeader::decode(buf)?;
        let count = get_u32(buf, "join build count")? as usize;
        let start_pos = get_u32(buf, "start position")?;
        let joiner_index = get_u32(buf, "joiner index")?;
        let entries = match get_u8(buf, "join key type")? {
            0 => {
                if buf.remaining() < count.saturating_mul(12) {
                    return Err(ColexError::Protocol("truncated join build pairs".to_string()));
                }
                let mut pairs = Vec::with_capacity(count);
                for _ in 0..count {
                    pairs.push((get_u64(buf, "join key")?, get_u32(buf, "join value")?));
                }
                JoinEntries::Scalar(pairs)
            }
            1 => {
                if buf.remaining() < count {
                    return Err(ColexError::Protocol("truncated typeless keys".to_string()));
                }
                let mut keys = Vec::with_capacity(count);
                for _ in 0..count {
                    keys.push(if get_bool(buf, "null key flag")? {
                        None
                    } else {
                        Some(get_bytes(buf, "typeless key")?.to_vec())
                    });
                }
                JoinEntries::Typeless(keys)
            }
            other => return Err(ColexError::Protocol(format!("unknown join key type {other}"))),
        };
        let small_rows = if get_bool(buf, "small rows flag")? {
            let bytes = get_bytes(buf, "small rows")?;
            Some(decode_row_group(&bytes)?)
        } else {
            None
        };
        Ok(Self {
            header,
            joiner_index,
            start_pos,
            entries,
            small_rows,
        })
    }
}

/// Block min/max summary used by the storage layer to skip future blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointRange {
    pub lbid: u64,
    /// 8 for narrow ranges, 16 for wide decimal ranges.
    pub width: u8,
    pub min: i128,
    pub max: i128,
}

/// Trailing I/O accounting of a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IoCounters {
    pub cached_io: u32,
    pub physical_io: u32,
    pub touched_blocks: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementValues {
    Int(Vec<Option<i64>>),
    Str(Vec<Option<String>>),
}

impl ElementValues {
    pub fn len(&self) -> usize {
        match self {
            Self::Int(v) => v.len(),
            Self::Str(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResultPayload {
    RowIds {
        base_rid: u64,
        rids: Vec<u16>,
    },
    /// Values of the last filter column; `rids` is empty in values-only mode.
    Elements {
        base_rid: u64,
        rids: Vec<u16>,
        values: ElementValues,
    },
    RowGroup(RecordBatch),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultData {
    pub checkpoint: Option<CheckpointRange>,
    pub payload: ResultPayload,
    pub counters: IoCounters,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResultBody {
    Ok(ResultData),
    /// Failed batch; the code travels in the frame status.
    Error { code: u16, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchResult {
    pub header: JobHeader,
    pub body: ResultBody,
}

impl BatchResult {
    pub fn error(header: JobHeader, code: u16, message: impl Into<String>) -> Self {
        Self {
            header,
            body: ResultBody::Error {
                code,
                message: message.into(),
            },
        }
    }

    pub fn status(&self) -> u16 {
        match &self.body {
            ResultBody::Ok(_) => 0,
            ResultBody::Error { code, .. } => *code,
        }
    }

    fn encode_body(&self, buf: &mut BytesMut) -> Result<()> {
        self.header.encode(buf);
        let data = match &self.body {
            ResultBody::Error { message, .. } => {
                put_string(buf, message);
                return Ok(());
            }
            ResultBody::Ok(data) => data,
        };
        match &data.checkpoint {
            Some(cp) => {
                buf.put_u8(1);
                buf.put_u64_le(cp.lbid);
                buf.put_u8(cp.width);
                if cp.width == 16 {
                    buf.put_i128_le(cp.min);
                    buf.put_i128_le(cp.max);
                } else {
                    buf.put_i64_le(cp.min as i64);
                    buf.put_i64_le(cp.max as i64);
                }
            }
            None => buf.put_u8(0),
        }
        match &data.payload {
            ResultPayload::RowIds { base_rid, rids } => {
                buf.put_u8(0);
                put_rids(buf, *base_rid, rids);
            }
            ResultPayload::Elements {
                base_rid,
                rids,
                values,
            } => {
                buf.put_u8(1);
                put_rids(buf, *base_rid, rids);
                match values {
                    ElementValues::Int(values) => {
                        buf.put_u8(0);
                        buf.put_u32_le(values.len() as u32);
                        for v in values {
                            buf.put_u8(u8::from(v.is_none()));
                            buf.put_i64_le(v.unwrap_or_default());
                        }
                    }
                    ElementValues::Str(values) => {
                        buf.put_u8(1);
                        buf.put_u32_le(values.len() as u32);
                        for v in values {
                            buf.put_u8(u8::from(v.is_none()));
                            put_string(buf, v.as_deref().unwrap_or_default());
                        }
                    }
                }
            }
            ResultPayload::RowGroup(batch) => {
                buf.put_u8(2);
                put_bytes(buf, &encode_row_group(batch)?);
            }
        }
        buf.put_u32_le(data.counters.cached_io);
        buf.put_u32_le(data.counters.physical_io);
        buf.put_u32_le(data.counters.touched_blocks);
        Ok(())
    }

    fn decode_body(status: u16, buf: &mut Bytes) -> Result<Self> {
        let header = JobHeader::decode(buf)?;
        if status != 0 {
            return Ok(Self::error(header, status, get_string(buf, "error message")?));
        }
        let checkpoint = if get_bool(buf, "checkpoint flag")? {
            let lbid = get_u64(buf, "checkpoint lbid")?;
            let width = get_u8(buf, "checkpoint width")?;
            let (min, max) = match width {
                8 => (
                    i128::from(get_i64(buf, "checkpoint min")?),
                    i128::from(get_i64(buf, "checkpoint max")?),
                ),
                16 => (get_i128(buf, "checkpoint min")?, get_i128(buf, "checkpoint max")?),
                other => {
                    return Err(ColexError::Protocol(format!(
                        "unsupported checkpoint width {other}"
                    )))
                }
            };
            Some(CheckpointRange {
                lbid,
                width,
                min,
                max,
            })
        } else {
            None
        };
        let payload = match get_u8(buf, "payload type")? {
            0 => {
                let (base_rid, rids) = get_rids(buf)?;
                ResultPayload::RowIds { base_rid, rids }
            }
            1 => {
                let (base_rid, rids) = get_rids(buf)?;
                let values = match get_u8(buf, "element type")? {
                    0 => {
                        let n = get_count(buf, 9, "element count")?;
                        let mut values = Vec::with_capacity(n);
                        for _ in 0..n {
                            let null = get_bool(buf, "element null")?;
                            let v = get_i64(buf, "element")?;
                            values.push((!null).then_some(v));
                        }
                        ElementValues::Int(values)
                    }
                    1 => {
                        let n = get_count(buf, 5, "element count")?;
                        let mut values = Vec::with_capacity(n);
                        for _ in 0..n {
                            let null = get_bool(buf, "element null")?;
                            let v = get_string(buf, "element")?;
                            values.push((!null).then_some(v));
                        }
                        ElementValues::Str(values)
                    }
                    other => {
                        return Err(ColexError::Protocol(format!("unknown element type {other}")))
                    }
                };
                ResultPayload::Elements {
                    base_rid,
                    rids,
                    values,
                }
            }
            2 => {
                let bytes = get_bytes(buf, "row group")?;
                ResultPayload::RowGroup(decode_row_group(&bytes)?)
            }
            other => return Err(ColexError::Protocol(format!("unknown payload type {other}"))),
        };
        let counters = IoCounters {
            cached_io: get_u32(buf, "cached io")?,
            physical_io: get_u32(buf, "physical io")?,
            touched_blocks: get_u32(buf, "touched blocks")?,
        };
        Ok(Self {
            header,
            body: ResultBody::Ok(ResultData {
                checkpoint,
                payload,
                counters,
            }),
        })
    }
}

fn put_rids(buf: &mut BytesMut, base_rid: u64, rids: &[u16]) {
    buf.put_u64_le(base_rid);
    buf.put_u32_le(rids.len() as u32);
    for r in rids {
        buf.put_u16_le(*r);
    }
}

fn get_rids(buf: &mut Bytes) -> Result<(u64, Vec<u16>)> {
    let base_rid = get_u64(buf, "base rid")?;
    let n = get_count(buf, 2, "rid count")?;
    let mut rids = Vec::with_capacity(n);
    for _ in 0..n {
        rids.push(get_u16(buf, "rid")?);
    }
    Ok((base_rid, rids))
}

/// Credit grant from a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowControl {
    pub header: JobHeader,
    /// `-1` disables flow control, `0` pauses, `n > 0` grants n sends.
    pub credits: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    CreateBatch(CreateBatch),
    RunBatch(RunBatch),
    DestroyBatch(JobHeader),
    AddJoiner(JoinBuild),
    EndJoiner(JobHeader),
    Abort(JobHeader),
    FlowControl(FlowControl),
    BatchResult(BatchResult),
}

impl Message {
    pub fn command(&self) -> Command {
        match self {
            Self::CreateBatch(_) => Command::CreateBatch,
            Self::RunBatch(_) => Command::RunBatch,
            Self::DestroyBatch(_) => Command::DestroyBatch,
            Self::AddJoiner(_) => Command::AddJoiner,
            Self::EndJoiner(_) => Command::EndJoiner,
            Self::Abort(_) => Command::Abort,
            Self::FlowControl(_) => Command::FlowControl,
            Self::BatchResult(_) => Command::BatchResult,
        }
    }

    pub fn unique_id(&self) -> UniqueId {
        match self {
            Self::CreateBatch(m) => m.unique,
            Self::RunBatch(m) => m.header.unique,
            Self::AddJoiner(m) => m.header.unique,
            Self::FlowControl(m) => m.header.unique,
            Self::BatchResult(m) => m.header.unique,
            Self::DestroyBatch(h) | Self::EndJoiner(h) | Self::Abort(h) => h.unique,
        }
    }

    /// Frame header plus body.
    pub fn encode(&self) -> Result<Bytes> {
        let mut body = BytesMut::new();
        let mut status = 0;
        match self {
            Self::CreateBatch(m) => m.encode_body(&mut body)?,
            Self::RunBatch(m) => m.encode_body(&mut body),
            Self::AddJoiner(m) => m.encode_body(&mut body)?,
            Self::FlowControl(m) => {
                m.header.encode(&mut body);
                body.put_i32_le(m.credits);
            }
            Self::BatchResult(m) => {
                status = m.status();
                m.encode_body(&mut body)?;
            }
            Self::DestroyBatch(h) | Self::EndJoiner(h) | Self::Abort(h) => h.encode(&mut body),
        }
        let mut out = BytesMut::with_capacity(FRAME_HEADER_LEN + body.len());
        FrameHeader::new(self.command(), status, body.len() as u32).encode(&mut out);
        out.extend_from_slice(&body);
        Ok(out.freeze())
    }

    /// Decode a body whose frame header was already read.
    pub fn decode(header: &FrameHeader, mut body: Bytes) -> Result<Self> {
        if body.len() != header.size as usize {
            return Err(ColexError::Protocol(format!(
                "frame declares {} body bytes, got {}",
                header.size,
                body.len()
            )));
        }
        let buf = &mut body;
        let msg = match header.command {
            Command::CreateBatch => Self::CreateBatch(CreateBatch::decode_body(buf)?),
            Command::RunBatch => Self::RunBatch(RunBatch::decode_body(buf)?),
            Command::DestroyBatch => Self::DestroyBatch(JobHeader::decode(buf)?),
            Command::AddJoiner => Self::AddJoiner(JoinBuild::decode_body(buf)?),
            Command::EndJoiner => Self::EndJoiner(JobHeader::decode(buf)?),
            Command::Abort => Self::Abort(JobHeader::decode(buf)?),
            Command::FlowControl => Self::FlowControl(FlowControl {
                header: JobHeader::decode(buf)?,
                credits: get_i32(buf, "credits")?,
            }),
            Command::BatchResult => {
                Self::BatchResult(BatchResult::decode_body(header.status, buf)?)
            }
        };
        if buf.has_remaining() {
            return Err(ColexError::Protocol(format!(
                "{} trailing bytes after {:?}",
                buf.remaining(),
                header.command
            )));
        }
        Ok(msg)
    }

    /// Decode one complete frame.
    pub fn from_frame(mut frame: Bytes) -> Result<Self> {
        let header = FrameHeader::decode(&mut frame)?;
        Self::decode(&header, frame)
    }

    /// Read one frame from a byte stream; `None` on clean end of stream.
    pub fn read_from(reader: &mut impl Read) -> Result<Option<Self>> {
        let mut head = [0_u8; FRAME_HEADER_LEN];
        match reader.read_exact(&mut head) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        // Sizes above MAX_FRAME_BYTES are rejected here.
        let header = FrameHeader::decode(&mut &head[..])?;
        let expected = header.size as usize;
        // Grow with the bytes that actually arrive, not with the claimed size.
        let mut body = Vec::with_capacity(expected.min(READ_CHUNK));
        reader
            .by_ref()
            .take(u64::from(header.size))
            .read_to_end(&mut body)?;
        if body.len() != expected {
            return Err(ColexError::Protocol(format!(
                "truncated {:?} frame: {} of {expected} body bytes",
                header.command,
                body.len()
            )));
        }
        Self::decode(&header, Bytes::from(body)).map(Some)
    }
}
