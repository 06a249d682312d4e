//! Result payload shaping: element values, the delivery rid column and
//! row-group chunking into encoded result frames.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray, UInt64Array};
use arrow::compute::cast;
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema};
use bytes::Bytes;
use colex_common::error::ERR_VALUE_OUT_OF_RANGE;
use colex_common::{ColexError, Result};
use colex_execution::{scalar_from_array, ColumnKind, ScalarValue};
use colex_wire::{
    BatchResult, CheckpointRange, ElementValues, IoCounters, JobHeader, Message, ResultBody,
    ResultData, ResultPayload,
};

/// Name of the row id column appended when rids are sent at delivery.
pub const RID_COLUMN: &str = "rid";

/// Values of the last filter column in wire form.
///
/// String kinds (and any kind when strings were requested) travel as text;
/// everything else as 64-bit integers, floats by their bit pattern.
pub(crate) fn element_values(
    kind: ColumnKind,
    values: &ArrayRef,
    want_strings: bool,
) -> Result<ElementValues> {
    if kind.is_string() || kind == ColumnKind::Blob || want_strings {
        if let DataType::Binary = values.data_type() {
            let bin = values.as_binary::<i32>();
            return Ok(ElementValues::Str(
                bin.iter()
                    .map(|v| v.map(|b| String::from_utf8_lossy(b).into_owned()))
                    .collect(),
            ));
        }
        let text = cast(values.as_ref(), &DataType::Utf8)
            .map_err(|e| ColexError::Execution(format!("string value cast failed: {e}")))?;
        return Ok(ElementValues::Str(
            text.as_string::<i32>()
                .iter()
                .map(|v| v.map(str::to_string))
                .collect(),
        ));
    }

    let mut out = Vec::with_capacity(values.len());
    for row in 0..values.len() {
        let v = match scalar_from_array(values, row)? {
            ScalarValue::Null => None,
            ScalarValue::Int64(v) => Some(v),
            ScalarValue::UInt64(v) => Some(v as i64),
            ScalarValue::Float64Bits(bits) => Some(bits as i64),
            ScalarValue::Boolean(b) => Some(i64::from(b)),
            ScalarValue::Decimal128 { value, .. } => Some(i64::try_from(value).map_err(|_| {
                ColexError::data(
                    ERR_VALUE_OUT_OF_RANGE,
                    format!("decimal value {value} does not fit in 64 bits"),
                )
            })?),
            other => {
                return Err(ColexError::Execution(format!(
                    "unexpected {other:?} in a {kind:?} column"
                )))
            }
        };
        out.push(v);
    }
    Ok(ElementValues::Int(out))
}

/// Append the absolute row id of every row as the last column.
pub(crate) fn with_rid_column(batch: &RecordBatch, rids: &[u64]) -> Result<RecordBatch> {
    let mut fields: Vec<Field> = batch
        .schema()
        .fields()
        .iter()
        .map(|f| f.as_ref().clone())
        .collect();
    fields.push(Field::new(RID_COLUMN, DataType::UInt64, false));
    let mut columns = batch.columns().to_vec();
    columns.push(Arc::new(UInt64Array::from(rids.to_vec())));
    RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
        .map_err(|e| ColexError::Execution(format!("rid column append failed: {e}")))
}

/// Split a row group into chunks of at most `rows` rows; an empty group
/// still yields one (empty) chunk.
pub(crate) fn chunk_rows(batch: &RecordBatch, rows: usize) -> Vec<RecordBatch> {
    let rows = rows.max(1);
    if batch.num_rows() <= rows {
        return vec![batch.clone()];
    }
    (0..batch.num_rows())
        .step_by(rows)
        .map(|start| batch.slice(start, rows.min(batch.num_rows() - start)))
        .collect()
}

/// Encode one block's payloads. The checkpoint and the block counters ride
/// on the first frame only.
pub(crate) fn encode_block(
    header: JobHeader,
    checkpoint: Option<CheckpointRange>,
    counters: IoCounters,
    payloads: Vec<ResultPayload>,
) -> Result<Vec<Bytes>> {
    payloads
        .into_iter()
        .enumerate()
        .map(|(i, payload)| {
            let data = ResultData {
                checkpoint: if i == 0 { checkpoint } else { None },
                payload,
                counters: if i == 0 { counters } else { IoCounters::default() },
            };
            Message::BatchResult(BatchResult {
                header,
                body: ResultBody::Ok(data),
            })
            .encode()
        })
        .collect()
}

pub(crate) fn encode_error(header: JobHeader, err: &ColexError) -> Result<Bytes> {
    Message::BatchResult(BatchResult::error(header, err.status_code(), err.to_string())).encode()
}

#[cfg(test)]
mod tests {
    use arrow::array::{BinaryArray, Decimal128Array, Float64Array, Int32Array, StringArray};

    use super::*;

    #[test]
    fn integers_and_floats_travel_as_i64() {
        let ints: ArrayRef = Arc::new(Int32Array::from(vec![Some(-3), None]));
        assert_eq!(
            element_values(ColumnKind::INT, &ints, false).expect("values"),
            ElementValues::Int(vec![Some(-3), None])
        );
        let floats: ArrayRef = Arc::new(Float64Array::from(vec![1.5]));
        assert_eq!(
            element_values(ColumnKind::Float { width: 8 }, &floats, false).expect("values"),
            ElementValues::Int(vec![Some(1.5_f64.to_bits() as i64)])
        );
    }

    #[test]
    fn wide_decimals_out_of_range_fail_as_data_errors() {
        let kind = ColumnKind::Decimal {
            width: 16,
            precision: 38,
            scale: 0,
        };
        let wide: ArrayRef = Arc::new(
            Decimal128Array::from(vec![i128::from(i64::MAX) + 1])
                .with_precision_and_scale(38, 0)
                .expect("decimal"),
        );
        let err = element_values(kind, &wide, false).expect_err("out of range");
        assert_eq!(err.status_code(), ERR_VALUE_OUT_OF_RANGE);
    }

    #[test]
    fn strings_are_requested_or_native() {
        let ints: ArrayRef = Arc::new(Int32Array::from(vec![7]));
        assert_eq!(
            element_values(ColumnKind::INT, &ints, true).expect("values"),
            ElementValues::Str(vec![Some("7".to_string())])
        );
        let text: ArrayRef = Arc::new(StringArray::from(vec![Some("x"), None]));
        assert_eq!(
            element_values(ColumnKind::LongString, &text, false).expect("values"),
            ElementValues::Str(vec![Some("x".to_string()), None])
        );
        let blob: ArrayRef = Arc::new(BinaryArray::from(vec![b"ab".as_ref()]));
        assert_eq!(
            element_values(ColumnKind::Blob, &blob, false).expect("values"),
            ElementValues::Str(vec![Some("ab".to_string())])
        );
    }

    #[test]
    fn chunks_never_exceed_the_row_limit() {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int32, true)]));
        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(Int32Array::from_iter_values(0..10))],
        )
        .expect("batch");
        let sizes: Vec<usize> = chunk_rows(&batch, 4).iter().map(|b| b.num_rows()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(chunk_rows(&batch.slice(0, 0), 4).len(), 1);

        let with_rids = with_rid_column(&batch.slice(0, 2), &[100, 101]).expect("rids");
        assert_eq!(with_rids.schema().field(1).name(), RID_COLUMN);
    }
}
