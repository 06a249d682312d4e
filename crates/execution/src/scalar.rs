//! Row-at-a-time scalar values used by aggregation, checkpoint ranges and
//! typeless join keys.

use std::cmp::Ordering;
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, AsArray, BinaryBuilder, BooleanBuilder, Decimal128Builder, Float64Builder,
    Int64Builder, StringBuilder, UInt64Builder,
};
use arrow::datatypes::{
    Decimal128Type, Float32Type, Float64Type, Int16Type, Int32Type, Int64Type, Int8Type,
    UInt16Type, UInt32Type, UInt64Type, UInt8Type,
};
use arrow_schema::DataType;
use colex_common::{ColexError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScalarValue {
    Int64(i64),
    UInt64(u64),
    Float64Bits(u64),
    Decimal128 { value: i128, precision: u8, scale: i8 },
    Utf8(String),
    Binary(Vec<u8>),
    Boolean(bool),
    Null,
}

impl ScalarValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Order two values of the same family; `None` across families or nulls.
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Int64(a), Self::Int64(b)) => Some(a.cmp(b)),
            (Self::UInt64(a), Self::UInt64(b)) => Some(a.cmp(b)),
            (Self::Float64Bits(a), Self::Float64Bits(b)) => {
                f64::from_bits(*a).partial_cmp(&f64::from_bits(*b))
            }
            (Self::Decimal128 { value: a, .. }, Self::Decimal128 { value: b, .. }) => Some(a.cmp(b)),
            (Self::Utf8(a), Self::Utf8(b)) => Some(a.cmp(b)),
            (Self::Binary(a), Self::Binary(b)) => Some(a.cmp(b)),
            (Self::Boolean(a), Self::Boolean(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Numeric view used by SUM/AVG over mixed inputs.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int64(v) => Some(*v as f64),
            Self::UInt64(v) => Some(*v as f64),
            Self::Float64Bits(v) => Some(f64::from_bits(*v)),
            Self::Decimal128 { value, scale, .. } => {
                Some(*value as f64 / 10_f64.powi(i32::from(*scale)))
            }
            _ => None,
        }
    }

    /// Raw integer payload for checkpoint ranges.
    pub fn as_i128(&self) -> Option<i128> {
        match self {
            Self::Int64(v) => Some(i128::from(*v)),
            Self::UInt64(v) => Some(i128::from(*v)),
            Self::Decimal128 { value, .. } => Some(*value),
            _ => None,
        }
    }

    pub fn estimate_bytes(&self) -> usize {
        match self {
            Self::Int64(_) | Self::UInt64(_) | Self::Float64Bits(_) => 8,
            Self::Decimal128 { .. } => 16,
            Self::Utf8(s) => s.len(),
            Self::Binary(b) => b.len(),
            Self::Boolean(_) => 1,
            Self::Null => 0,
        }
    }
}

pub fn scalar_from_array(array: &ArrayRef, row: usize) -> Result<ScalarValue> {
    if array.is_null(row) {
        return Ok(ScalarValue::Null);
    }
    let v = match array.data_type() {
        DataType::Int8 => ScalarValue::Int64(i64::from(array.as_primitive::<Int8Type>().value(row))),
        DataType::Int16 => {
            ScalarValue::Int64(i64::from(array.as_primitive::<Int16Type>().value(row)))
        }
        DataType::Int32 => {
            ScalarValue::Int64(i64::from(array.as_primitive::<Int32Type>().value(row)))
        }
        DataType::Int64 => ScalarValue::Int64(array.as_primitive::<Int64Type>().value(row)),
        DataType::UInt8 => {
            ScalarValue::UInt64(u64::from(array.as_primitive::<UInt8Type>().value(row)))
        }
        DataType::UInt16 => {
            ScalarValue::UInt64(u64::from(array.as_primitive::<UInt16Type>().value(row)))
        }
        DataType::UInt32 => {
            ScalarValue::UInt64(u64::from(array.as_primitive::<UInt32Type>().value(row)))
        }
        DataType::UInt64 => ScalarValue::UInt64(array.as_primitive::<UInt64Type>().value(row)),
        DataType::Float32 => ScalarValue::Float64Bits(
            f64::from(array.as_primitive::<Float32Type>().value(row)).to_bits(),
        ),
        DataType::Float64 => {
            ScalarValue::Float64Bits(array.as_primitive::<Float64Type>().value(row).to_bits())
        }
        DataType::Decimal128(precision, scale) => ScalarValue::Decimal128 {
            value: array.as_primitive::<Decimal128Type>().value(row),
            precision: *precision,
            scale: *scale,
        },
        DataType::Utf8 => ScalarValue::Utf8(array.as_string::<i32>().value(row).to_string()),
        DataType::LargeUtf8 => ScalarValue::Utf8(array.as_string::<i64>().value(row).to_string()),
        DataType::Binary => ScalarValue::Binary(array.as_binary::<i32>().value(row).to_vec()),
        DataType::Boolean => ScalarValue::Boolean(array.as_boolean().value(row)),
        other => {
            return Err(ColexError::Unsupported(format!(
                "scalar type not supported yet: {other:?}"
            )))
        }
    };
    Ok(v)
}

fn mismatch(dt: &DataType, v: &ScalarValue) -> ColexError {
    ColexError::Execution(format!(
        "type mismatch while building {dt:?} array from {v:?}"
    ))
}

pub fn scalars_to_array(values: &[ScalarValue], dt: &DataType) -> Result<ArrayRef> {
    match dt {
        DataType::Int64 => {
            let mut b = Int64Builder::with_capacity(values.len());
            for v in values {
                match v {
                    ScalarValue::Int64(x) => b.append_value(*x),
                    ScalarValue::UInt64(x) => b.append_value(*x as i64),
                    ScalarValue::Null => b.append_null(),
                    other => return Err(mismatch(dt, other)),
                }
            }
            Ok(Arc::new(b.finish()))
        }
        DataType::UInt64 => {
            let mut b = UInt64Builder::with_capacity(values.len());
            for v in values {
                match v {
                    ScalarValue::UInt64(x) => b.append_value(*x),
                    ScalarValue::Null => b.append_null(),
                    other => return Err(mismatch(dt, other)),
                }
            }
            Ok(Arc::new(b.finish()))
        }
        DataType::Float64 => {
            let mut b = Float64Builder::with_capacity(values.len());
            for v in values {
                match v {
                    ScalarValue::Null => b.append_null(),
                    other => match other.as_f64() {
                        Some(x) => b.append_value(x),
                        None => return Err(mismatch(dt, other)),
                    },
                }
            }
            Ok(Arc::new(b.finish()))
        }
        DataType::Decimal128(precision, scale) => {
            let mut b = Decimal128Builder::with_capacity(values.len());
            for v in values {
                match v {
                    ScalarValue::Decimal128 { value, .. } => b.append_value(*value),
                    ScalarValue::Null => b.append_null(),
                    other => return Err(mismatch(dt, other)),
                }
            }
            let arr = b
                .finish()
                .with_precision_and_scale(*precision, *scale)
                .map_err(|e| ColexError::Execution(format!("decimal build failed: {e}")))?;
            Ok(Arc::new(arr))
        }
        DataType::Utf8 => {
            let mut b = StringBuilder::with_capacity(values.len(), values.len() * 8);
            for v in values {
                match v {
                    ScalarValue::Utf8(x) => b.append_value(x),
                    ScalarValue::Null => b.append_null(),
                    other => return Err(mismatch(dt, other)),
                }
            }
            Ok(Arc::new(b.finish()))
        }
        DataType::Binary => {
            let mut b = BinaryBuilder::with_capacity(values.len(), values.len() * 8);
            for v in values {
                match v {
                    ScalarValue::Binary(x) => b.append_value(x),
                    ScalarValue::Null => b.append_null(),
                    other => return Err(mismatch(dt, other)),
                }
            }
            Ok(Arc::new(b.finish()))
        }
        DataType::Boolean => {
            let mut b = BooleanBuilder::with_capacity(values.len());
            for v in values {
                match v {
                    ScalarValue::Boolean(x) => b.append_value(*x),
                    ScalarValue::Null => b.append_null(),
                    other => return Err(mismatch(dt, other)),
                }
            }
            Ok(Arc::new(b.finish()))
        }
        other => Err(ColexError::Unsupported(format!(
            "output type not supported yet: {other:?}"
        ))),
    }
}

/// Byte encoding of a tuple that hashes and compares like the tuple itself.
pub fn encode_group_key(values: &[ScalarValue]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 16);
    for value in values {
        match value {
            ScalarValue::Null => out.push(0),
            ScalarValue::Int64(v) => {
                out.push(1);
                out.extend_from_slice(&v.to_le_bytes());
            }
            ScalarValue::UInt64(v) => {
                out.push(2);
                out.extend_from_slice(&v.to_le_bytes());
            }
            ScalarValue::Float64Bits(v) => {
                out.push(3);
                out.extend_from_slice(&v.to_le_bytes());
            }
            ScalarValue::Decimal128 { value, scale, .. } => {
                out.push(4);
                out.push(*scale as u8);
                out.extend_from_slice(&value.to_le_bytes());
            }
            ScalarValue::Boolean(v) => {
                out.push(5);
                out.push(u8::from(*v));
            }
            ScalarValue::Utf8(s) => {
                out.push(6);
                out.extend_from_slice(&(s.len() as u32).to_le_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            ScalarValue::Binary(b) => {
                out.push(7);
                out.extend_from_slice(&(b.len() as u32).to_le_bytes());
                out.extend_from_slice(b);
            }
        }
        out.push(0xff);
    }
    out
}
