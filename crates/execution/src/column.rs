//! Column kinds and their mapping to Arrow storage.
//!
//! Every column a batch touches is described by a [`ColumnKind`]. The kind
//! fixes the physical width used for LBID arithmetic and checkpoint ranges,
//! the Arrow type blocks are materialized as, and the sentinel a scalar join
//! key carries when the source value is null.

use arrow::array::{Array, AsArray};
use arrow::datatypes::{
    ArrowPrimitiveType, Decimal128Type, Int16Type, Int32Type, Int64Type, Int8Type, UInt16Type,
    UInt32Type, UInt64Type, UInt8Type,
};
use arrow_schema::DataType;
use colex_common::{ColexError, Result};
use serde::{Deserialize, Serialize};

/// Closed set of column families the engine can load, filter and ship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnKind {
    /// 1, 2, 4 or 8 byte integer.
    Int { width: u8, signed: bool },
    /// Narrow (8 byte) or wide (16 byte) fixed point.
    Decimal { width: u8, precision: u8, scale: i8 },
    /// 4 or 8 byte IEEE float.
    Float { width: u8 },
    /// Inline string of at most `width` bytes.
    ShortString { width: u8 },
    /// Dictionary-backed string.
    LongString,
    Blob,
}

impl ColumnKind {
    pub const BIGINT: Self = Self::Int {
        width: 8,
        signed: true,
    };
    pub const INT: Self = Self::Int {
        width: 4,
        signed: true,
    };

    /// Reject widths the block layer never produces.
    pub fn validate(&self) -> Result<()> {
        let ok = match *self {
            Self::Int { width, .. } => matches!(width, 1 | 2 | 4 | 8),
            Self::Decimal {
                width, precision, ..
            } => matches!(width, 8 | 16) && precision > 0 && precision <= 38,
            Self::Float { width } => matches!(width, 4 | 8),
            Self::ShortString { width } => (1..=8).contains(&width),
            Self::LongString | Self::Blob => true,
        };
        if ok {
            Ok(())
        } else {
            Err(ColexError::Protocol(format!("invalid column kind {self:?}")))
        }
    }

    /// Physical bytes per value in a storage block.
    pub fn width(&self) -> u8 {
        match *self {
            Self::Int { width, .. }
            | Self::Decimal { width, .. }
            | Self::Float { width }
            | Self::ShortString { width } => width,
            Self::LongString | Self::Blob => 8,
        }
    }

    /// Decimal columns wider than 64 bits need the wide checkpoint format.
    pub fn is_wide(&self) -> bool {
        matches!(self, Self::Decimal { width: 16, .. })
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Self::ShortString { .. } | Self::LongString)
    }

    /// Integer and narrow decimal columns can key a scalar hash join.
    pub fn supports_scalar_key(&self) -> bool {
        matches!(self, Self::Int { .. } | Self::Decimal { width: 8, .. })
    }

    pub fn data_type(&self) -> DataType {
        match *self {
            Self::Int { width, signed } => match (width, signed) {
                (1, true) => DataType::Int8,
                (2, true) => DataType::Int16,
                (4, true) => DataType::Int32,
                (_, true) => DataType::Int64,
                (1, false) => DataType::UInt8,
                (2, false) => DataType::UInt16,
                (4, false) => DataType::UInt32,
                (_, false) => DataType::UInt64,
            },
            Self::Decimal {
                precision, scale, ..
            } => DataType::Decimal128(precision, scale),
            Self::Float { width: 4 } => DataType::Float32,
            Self::Float { .. } => DataType::Float64,
            Self::ShortString { .. } | Self::LongString => DataType::Utf8,
            Self::Blob => DataType::Binary,
        }
    }

    /// Inverse of [`ColumnKind::data_type`] for types the engine understands.
    pub fn from_data_type(dt: &DataType) -> Result<Self> {
        let kind = match dt {
            DataType::Int8 => Self::Int {
                width: 1,
                signed: true,
            },
            DataType::Int16 => Self::Int {
                width: 2,
                signed: true,
            },
            DataType::Int32 => Self::INT,
            DataType::Int64 => Self::BIGINT,
            DataType::UInt8 => Self::Int {
                width: 1,
                signed: false,
            },
            DataType::UInt16 => Self::Int {
                width: 2,
                signed: false,
            },
            DataType::UInt32 => Self::Int {
                width: 4,
                signed: false,
            },
            DataType::UInt64 => Self::Int {
                width: 8,
                signed: false,
            },
            DataType::Decimal128(precision, scale) => Self::Decimal {
                width: if *precision > 18 { 16 } else { 8 },
                precision: *precision,
                scale: *scale,
            },
            DataType::Float32 => Self::Float { width: 4 },
            DataType::Float64 => Self::Float { width: 8 },
            DataType::Utf8 | DataType::LargeUtf8 => Self::LongString,
            DataType::Binary | DataType::LargeBinary => Self::Blob,
            other => {
                return Err(ColexError::Unsupported(format!(
                    "no column kind for {other:?}"
                )))
            }
        };
        Ok(kind)
    }

    /// Value a scalar join key carries when the source row is null.
    ///
    /// Signed integers use the most negative value of their width, unsigned
    /// integers the largest, matching the block layer's null markers.
    pub fn null_sentinel(&self) -> u64 {
        match *self {
            Self::Int {
                width,
                signed: true,
            } => match width {
                1 => i8::MIN as i64 as u64,
                2 => i16::MIN as i64 as u64,
                4 => i32::MIN as i64 as u64,
                _ => i64::MIN as u64,
            },
            Self::Int {
                width,
                signed: false,
            } => match width {
                1 => u8::MAX as u64,
                2 => u16::MAX as u64,
                4 => u32::MAX as u64,
                _ => u64::MAX,
            },
            Self::Decimal { .. } => i64::MIN as u64,
            _ => u64::MAX,
        }
    }
}

/// Extract scalar join keys from one column; nulls stay `None`.
pub fn scalar_keys(array: &dyn Array) -> Result<Vec<Option<u64>>> {
    let keys = match array.data_type() {
        DataType::Int8 => keys_of::<Int8Type>(array, |v| v as i64 as u64),
        DataType::Int16 => keys_of::<Int16Type>(array, |v| v as i64 as u64),
        DataType::Int32 => keys_of::<Int32Type>(array, |v| v as i64 as u64),
        DataType::Int64 => keys_of::<Int64Type>(array, |v| v as u64),
        DataType::UInt8 => keys_of::<UInt8Type>(array, u64::from),
        DataType::UInt16 => keys_of::<UInt16Type>(array, u64::from),
        DataType::UInt32 => keys_of::<UInt32Type>(array, u64::from),
        DataType::UInt64 => keys_of::<UInt64Type>(array, |v| v),
        DataType::Decimal128(..) => keys_of::<Decimal128Type>(array, |v| v as i64 as u64),
        other => {
            return Err(ColexError::Unsupported(format!(
                "scalar join key over {other:?}"
            )))
        }
    };
    Ok(keys)
}

fn keys_of<T: ArrowPrimitiveType>(
    array: &dyn Array,
    f: impl Fn(T::Native) -> u64,
) -> Vec<Option<u64>> {
    array.as_primitive::<T>().iter().map(|v| v.map(&f)).collect()
}
