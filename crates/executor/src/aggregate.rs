//! Partial group-by aggregation over joined row groups.
//!
//! State is kept per encoded group key in first-seen order and emitted as a
//! row group: group columns, then one column per aggregate, then one hidden
//! count column per AVG so downstream merges stay exact.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::ArrayRef;
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use colex_common::error::ERR_VALUE_OUT_OF_RANGE;
use colex_common::{ColexError, Result};
use colex_execution::{encode_group_key, scalar_from_array, scalars_to_array, ScalarValue};
use colex_wire::{AggFunc, AggregatorDescriptor};

#[derive(Debug, Clone)]
struct AggSpec {
    func: AggFunc,
    column: Option<usize>,
    name: String,
    out_type: DataType,
}

#[derive(Debug, Clone)]
enum AggState {
    Count(i64),
    SumInt(i64),
    SumFloat(f64),
    Min(Option<ScalarValue>),
    Max(Option<ScalarValue>),
    Avg { sum: f64, count: i64 },
}

#[derive(Debug, Clone)]
struct GroupEntry {
    key: Vec<ScalarValue>,
    states: Vec<AggState>,
}

/// Compiled aggregator: input positions and output layout.
#[derive(Debug)]
pub(crate) struct AggregatePlan {
    group_by: Vec<usize>,
    specs: Vec<AggSpec>,
    output_schema: SchemaRef,
}

/// Type a group or MIN/MAX value takes once read through [`ScalarValue`].
fn widened(dt: &DataType) -> Result<DataType> {
    Ok(match dt {
        DataType::Int8 | DataType::Int16 | DataType::Int32 | DataType::Int64 => DataType::Int64,
        DataType::UInt8 | DataType::UInt16 | DataType::UInt32 | DataType::UInt64 => {
            DataType::UInt64
        }
        DataType::Float32 | DataType::Float64 => DataType::Float64,
        DataType::Utf8 | DataType::LargeUtf8 => DataType::Utf8,
        DataType::Decimal128(..) | DataType::Binary | DataType::Boolean => dt.clone(),
        other => {
            return Err(ColexError::Unsupported(format!(
                "aggregation over {other:?}"
            )))
        }
    })
}

fn is_integer(dt: &DataType) -> bool {
    matches!(
        dt,
        DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
    )
}

fn avg_count_col_name(name: &str) -> String {
    format!("__colex_avg_count_{name}")
}

impl AggregatePlan {
    pub(crate) fn new(desc: &AggregatorDescriptor, input: &SchemaRef) -> Result<Self> {
        let width = input.fields().len();
        let field_of = |col: u32, what: &str| {
            input.fields().get(col as usize).ok_or_else(|| {
                ColexError::Protocol(format!(
                    "{what} column {col} is outside the {width}-column input"
                ))
            })
        };

        let mut fields = Vec::new();
        let mut group_by = Vec::with_capacity(desc.group_by.len());
        for col in &desc.group_by {
            let field = field_of(*col, "group-by")?;
            fields.push(Field::new(field.name(), widened(field.data_type())?, true));
            group_by.push(*col as usize);
        }

        let mut specs = Vec::with_capacity(desc.aggregates.len());
        for agg in &desc.aggregates {
            let input_type = agg
                .column
                .map(|col| field_of(col, "aggregate").map(|f| f.data_type().clone()))
                .transpose()?;
            let out_type = match (agg.func, &input_type) {
                (AggFunc::Count, _) => DataType::Int64,
                (_, None) => {
                    return Err(ColexError::Protocol(format!(
                        "aggregate {} needs an input column",
                        agg.name
                    )))
                }
                (AggFunc::Sum, Some(dt)) if is_integer(dt) => DataType::Int64,
                (AggFunc::Sum, Some(dt)) => {
                    widened(dt)?;
                    DataType::Float64
                }
                (AggFunc::Min | AggFunc::Max, Some(dt)) => widened(dt)?,
                (AggFunc::Avg, Some(_)) => DataType::Float64,
            };
            fields.push(Field::new(&agg.name, out_type.clone(), true));
            specs.push(AggSpec {
                func: agg.func,
                column: agg.column.map(|c| c as usize),
                name: agg.name.clone(),
                out_type,
            });
        }
        for spec in specs.iter().filter(|s| s.func == AggFunc::Avg) {
            fields.push(Field::new(avg_count_col_name(&spec.name), DataType::Int64, true));
        }

        Ok(Self {
            group_by,
            specs,
            output_schema: Arc::new(Schema::new(fields)),
        })
    }

    pub(crate) fn output_schema(&self) -> &SchemaRef {
        &self.output_schema
    }

    fn init_states(&self) -> Vec<AggState> {
        self.specs
            .iter()
            .map(|s| match s.func {
                AggFunc::Count => AggState::Count(0),
                AggFunc::Sum if s.out_type == DataType::Int64 => AggState::SumInt(0),
                AggFunc::Sum => AggState::SumFloat(0.0),
                AggFunc::Min => AggState::Min(None),
                AggFunc::Max => AggState::Max(None),
                AggFunc::Avg => AggState::Avg { sum: 0.0, count: 0 },
            })
            .collect()
    }
}

/// Accumulated partial state of one executor.
#[derive(Debug)]
pub(crate) struct Aggregator {
    plan: Arc<AggregatePlan>,
    index: HashMap<Vec<u8>, usize>,
    groups: Vec<GroupEntry>,
    estimated_bytes: usize,
}

impl Aggregator {
    pub(crate) fn new(plan: Arc<AggregatePlan>) -> Self {
        Self {
            plan,
            index: HashMap::new(),
            groups: Vec::new(),
            estimated_bytes: 0,
        }
    }

    pub(crate) fn estimated_bytes(&self) -> usize {
        self.estimated_bytes
    }

    pub(crate) fn reset(&mut self) {
        self.index.clear();
        self.groups.clear();
        self.estimated_bytes = 0;
    }

    pub(crate) fn update(&mut self, batch: &RecordBatch) -> Result<()> {
        let group_arrays: Vec<&ArrayRef> =
            self.plan.group_by.iter().map(|c| batch.column(*c)).collect();
        let agg_arrays: Vec<Option<&ArrayRef>> = self
            .plan
            .specs
            .iter()
            .map(|s| s.column.map(|c| batch.column(c)))
            .collect();

        for row in 0..batch.num_rows() {
            let key = group_arrays
                .iter()
                .map(|a| scalar_from_array(a, row))
                .collect::<Result<Vec<_>>>()?;
            let encoded = encode_group_key(&key);
            let slot = match self.index.get(&encoded) {
                Some(slot) => *slot,
                None => {
                    self.estimated_bytes += 96
                        + encoded.len()
                        + key.iter().map(ScalarValue::estimate_bytes).sum::<usize>()
                        + 16 * self.plan.specs.len();
                    self.groups.push(GroupEntry {
                        key,
                        states: self.plan.init_states(),
                    });
                    self.index.insert(encoded, self.groups.len() - 1);
                    self.groups.len() - 1
                }
            };
            let states = &mut self.groups[slot].states;
            for (idx, spec) in self.plan.specs.iter().enumerate() {
                let value = match agg_arrays[idx] {
                    Some(array) => scalar_from_array(array, row)?,
                    // COUNT(*) counts every row.
                    None => ScalarValue::Boolean(true),
                };
                update_state(&mut states[idx], spec, value)?;
            }
        }
        Ok(())
    }

    /// Emit the accumulated groups and start over.
    pub(crate) fn emit(&mut self) -> Result<RecordBatch> {
        if self.plan.group_by.is_empty() && self.groups.is_empty() {
            self.groups.push(GroupEntry {
                key: Vec::new(),
                states: self.plan.init_states(),
            });
        }
        let schema = Arc::clone(&self.plan.output_schema);
        let mut cols: Vec<Vec<ScalarValue>> = Vec::with_capacity(schema.fields().len());
        for g in 0..self.plan.group_by.len() {
            cols.push(self.groups.iter().map(|e| e.key[g].clone()).collect());
        }
        for a in 0..self.plan.specs.len() {
            cols.push(
                self.groups
                    .iter()
                    .map(|e| state_to_scalar(&e.states[a]))
                    .collect(),
            );
        }
        for (a, _) in self
            .plan
            .specs
            .iter()
            .enumerate()
            .filter(|(_, s)| s.func == AggFunc::Avg)
        {
            cols.push(
                self.groups
                    .iter()
                    .map(|e| match &e.states[a] {
                        AggState::Avg { count, .. } => ScalarValue::Int64(*count),
                        _ => ScalarValue::Null,
                    })
                    .collect(),
            );
        }
        let arrays = cols
            .iter()
            .enumerate()
            .map(|(idx, col)| scalars_to_array(col, schema.field(idx).data_type()))
            .collect::<Result<Vec<_>>>()?;
        let batch = RecordBatch::try_new(schema, arrays)
            .map_err(|e| ColexError::Execution(format!("aggregate output batch failed: {e}")))?;
        self.reset();
        Ok(batch)
    }

    pub(crate) fn empty_batch(&self) -> RecordBatch {
        RecordBatch::new_empty(Arc::clone(&self.plan.output_schema))
    }
}

fn update_state(state: &mut AggState, spec: &AggSpec, value: ScalarValue) -> Result<()> {
    if value.is_null() {
        return Ok(());
    }
    let overflow = || {
        ColexError::data(
            ERR_VALUE_OUT_OF_RANGE,
            format!("SUM overflow in aggregate {}", spec.name),
        )
    };
    match state {
        AggState::Count(acc) => *acc += 1,
        AggState::SumInt(acc) => {
            let v = match value {
                ScalarValue::Int64(v) => v,
                ScalarValue::UInt64(v) => i64::try_from(v).map_err(|_| overflow())?,
                _ => return Ok(()),
            };
            *acc = acc.checked_add(v).ok_or_else(overflow)?;
        }
        AggState::SumFloat(acc) => {
            if let Some(v) = value.as_f64() {
                *acc += v;
            }
        }
        AggState::Min(cur) => {
            let replace = match cur {
                None => true,
                Some(existing) => value
                    .compare(existing)
                    .ok_or_else(|| mixed_types(spec))?
                    .is_lt(),
            };
            if replace {
                *cur = Some(value);
            }
        }
        AggState::Max(cur) => {
            let replace = match cur {
                None => true,
                Some(existing) => value
                    .compare(existing)
                    .ok_or_else(|| mixed_types(spec))?
                    .is_gt(),
            };
            if replace {
                *cur = Some(value);
            }
        }
        AggState::Avg { sum, count } => {
            if let Some(v) = value.as_f64() {
                *sum += v;
                *count += 1;
            }
        }
    }
    Ok(())
}

fn mixed_types(spec: &AggSpec) -> ColexError {
    ColexError::Execution(format!(
        "cannot compare values of different types in {}",
        spec.name
    ))
}

fn state_to_scalar(state: &AggState) -> ScalarValue {
    match state {
        AggState::Count(v) | AggState::SumInt(v) => ScalarValue::Int64(*v),
        AggState::SumFloat(v) => ScalarValue::Float64Bits(v.to_bits()),
        AggState::Min(v) | AggState::Max(v) => v.clone().unwrap_or(ScalarValue::Null),
        // Partial AVG ships the sum; the hidden count column carries the rest.
        AggState::Avg { sum, .. } => ScalarValue::Float64Bits(sum.to_bits()),
    }
}
