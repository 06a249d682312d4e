//! Batch configuration carried by creation messages.

use bitflags::bitflags;
use bytes::{Buf, BufMut};
use colex_common::{ColexError, Result};
use colex_execution::{ColumnDesc, ColumnKind, Expr};
use serde::{Deserialize, Serialize};

use crate::codec::{
    get_count, get_json, get_opt_json, get_string, get_u16, get_u32, get_u64, get_u8, put_json,
    put_opt_json, put_string,
};

/// What a batch sends back per block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OutputMode {
    /// Surviving row ids only.
    RowIds = 0,
    /// Values of the last filter column.
    Values = 1,
    /// Row ids paired with values.
    RowIdsAndValues = 2,
    /// Projected, optionally joined and aggregated row groups.
    RowGroup = 3,
}

impl TryFrom<u8> for OutputMode {
    type Error = ColexError;

    fn try_from(v: u8) -> Result<Self> {
        Ok(match v {
            0 => Self::RowIds,
            1 => Self::Values,
            2 => Self::RowIdsAndValues,
            3 => Self::RowGroup,
            other => return Err(ColexError::Protocol(format!("unknown output mode {other}"))),
        })
    }
}

/// How filter steps combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BoolOp {
    And = 0,
    Or = 1,
}

impl TryFrom<u8> for BoolOp {
    type Error = ColexError;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Self::And),
            1 => Ok(Self::Or),
            other => Err(ColexError::Protocol(format!("unknown bool op {other}"))),
        }
    }
}

bitflags! {
    /// Behaviour switches of a batch.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BatchFlags: u16 {
        const NEED_STR_VALUES       = 0x0001;
        const GOT_ABS_RIDS          = 0x0002;
        const GOT_VALUES            = 0x0004;
        const LBID_TRACE            = 0x0008;
        const SEND_RIDS_AT_DELIVERY = 0x0010;
        const HAS_JOINER            = 0x0020;
        const HAS_ROWGROUP          = 0x0040;
        const JOIN_ROWGROUP_DATA    = 0x0080;
        const HAS_WIDE_COLUMNS      = 0x0100;
    }
}

bitflags! {
    /// Join semantics of one join descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct JoinKind: u16 {
        const INNER       = 0x0001;
        const LARGE_OUTER = 0x0002;
        const SMALL_OUTER = 0x0004;
        const SEMI        = 0x0008;
        const ANTI        = 0x0010;
        const SCALAR      = 0x0020;
        const MATCH_NULLS = 0x0040;
        const WITH_FILTER = 0x0080;
    }
}

/// One step of the filter or projection list.
#[derive(Debug, Clone, PartialEq)]
pub enum StepDescriptor {
    /// Load a column block. As a filter step `predicate` selects rows; as a
    /// projection step it is ignored.
    Column {
        oid: u32,
        kind: ColumnKind,
        predicate: Option<Expr>,
    },
    /// Re-use the values loaded by filter step `filter_step`.
    PassThru { oid: u32, filter_step: u16 },
    /// Compute a column from the projected columns before it.
    Expression { name: String, expr: Expr },
}

impl StepDescriptor {
    pub fn column(oid: u32, kind: ColumnKind) -> Self {
        Self::Column {
            oid,
            kind,
            predicate: None,
        }
    }

    pub fn filter(oid: u32, kind: ColumnKind, predicate: Expr) -> Self {
        Self::Column {
            oid,
            kind,
            predicate: Some(predicate),
        }
    }

    /// Storage object this step reads, if any.
    pub fn oid(&self) -> Option<u32> {
        match self {
            Self::Column { oid, .. } | Self::PassThru { oid, .. } => Some(*oid),
            Self::Expression { .. } => None,
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) -> Result<()> {
        match self {
            Self::Column {
                oid,
                kind,
                predicate,
            } => {
                buf.put_u8(0);
                buf.put_u32_le(*oid);
                put_column_kind(buf, kind);
                put_opt_json(buf, predicate.as_ref())
            }
            Self::PassThru { oid, filter_step } => {
                buf.put_u8(1);
                buf.put_u32_le(*oid);
                buf.put_u16_le(*filter_step);
                Ok(())
            }
            Self::Expression { name, expr } => {
                buf.put_u8(2);
                put_string(buf, name);
                put_json(buf, expr)
            }
        }
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        match get_u8(buf, "step type")? {
            0 => Ok(Self::Column {
                oid: get_u32(buf, "step oid")?,
                kind: get_column_kind(buf)?,
                predicate: get_opt_json(buf, "step predicate")?,
            }),
            1 => Ok(Self::PassThru {
                oid: get_u32(buf, "step oid")?,
                filter_step: get_u16(buf, "pass-thru source")?,
            }),
            2 => Ok(Self::Expression {
                name: get_string(buf, "expression name")?,
                expr: get_json(buf, "expression")?,
            }),
            other => Err(ColexError::Protocol(format!("unknown step type {other}"))),
        }
    }
}

pub(crate) fn put_column_kind(buf: &mut impl BufMut, kind: &ColumnKind) {
    match *kind {
        ColumnKind::Int { width, signed } => {
            buf.put_u8(0);
            buf.put_u8(width);
            buf.put_u8(u8::from(signed));
            buf.put_u8(0);
        }
        ColumnKind::Decimal {
            width,
            precision,
            scale,
        } => {
            buf.put_u8(1);
            buf.put_u8(width);
            buf.put_u8(precision);
            buf.put_i8(scale);
        }
        ColumnKind::Float { width } => {
            buf.put_u8(2);
            buf.put_u8(width);
            buf.put_u16_le(0);
        }
        ColumnKind::ShortString { width } => {
            buf.put_u8(3);
            buf.put_u8(width);
            buf.put_u16_le(0);
        }
        ColumnKind::LongString => buf.put_u32_le(4),
        ColumnKind::Blob => buf.put_u32_le(5),
    }
}

pub(crate) fn get_column_kind(buf: &mut impl Buf) -> Result<ColumnKind> {
    let tag = get_u8(buf, "column kind")?;
    let width = get_u8(buf, "column width")?;
    let a = get_u8(buf, "column kind arg")?;
    let b = get_u8(buf, "column kind arg")?;
    let kind = match tag {
        0 => ColumnKind::Int {
            width,
            signed: a != 0,
        },
        1 => ColumnKind::Decimal {
            width,
            precision: a,
            scale: b as i8,
        },
        2 => ColumnKind::Float { width },
        3 => ColumnKind::ShortString { width },
        4 => ColumnKind::LongString,
        5 => ColumnKind::Blob,
        other => return Err(ColexError::Protocol(format!("unknown column kind {other}"))),
    };
    kind.validate()?;
    Ok(kind)
}

/// How the large side derives its join key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinKey {
    /// One integer column; `null_value` is the sentinel small-side keys use for null.
    Scalar { large_key_col: u32, null_value: u64 },
    /// One or more columns encoded into an opaque byte key. The large side
    /// encodes each row with `encode_group_key` over these columns in order;
    /// small-side keys in `JoinEntries::Typeless` must use the same encoding.
    /// A row with any null key column has a null key.
    Typeless { large_key_cols: Vec<u32> },
}

/// One hash join against a small side built through join-build messages.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinDescriptor {
    pub kind: JoinKind,
    /// Number of small-side entries the build must deliver before probing.
    pub size: u32,
    pub key: JoinKey,
    /// Post-match filter over (large row ++ small row).
    pub filter: Option<Expr>,
    /// Small-side row layout, present when small rows travel with the join.
    pub small_schema: Option<Vec<ColumnDesc>>,
}

impl JoinDescriptor {
    pub fn is_typeless(&self) -> bool {
        matches!(self.key, JoinKey::Typeless { .. })
    }

    pub fn encode(&self, buf: &mut impl BufMut) -> Result<()> {
        buf.put_u16_le(self.kind.bits());
        buf.put_u32_le(self.size);
        match &self.key {
            JoinKey::Scalar {
                large_key_col,
                null_value,
            } => {
                buf.put_u8(0);
                buf.put_u32_le(*large_key_col);
                buf.put_u64_le(*null_value);
            }
            JoinKey::Typeless { large_key_cols } => {
                buf.put_u8(1);
                buf.put_u32_le(large_key_cols.len() as u32);
                for c in large_key_cols {
                    buf.put_u32_le(*c);
                }
            }
        }
        put_opt_json(buf, self.filter.as_ref())
    }

    /// Decodes everything but the small-side schema, which travels in its
    /// own section of the creation message.
    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        let kind = JoinKind::from_bits(get_u16(buf, "join kind")?)
            .ok_or_else(|| ColexError::Protocol("unknown join kind bits".to_string()))?;
        let size = get_u32(buf, "join size")?;
        let key = match get_u8(buf, "join key type")? {
            0 => JoinKey::Scalar {
                large_key_col: get_u32(buf, "large key column")?,
                null_value: get_u64(buf, "null value")?,
            },
            1 => {
                let n = get_count(buf, 4, "key column count")?;
                let mut large_key_cols = Vec::with_capacity(n);
                for _ in 0..n {
                    large_key_cols.push(get_u32(buf, "key column")?);
                }
                if large_key_cols.is_empty() {
                    return Err(ColexError::Protocol(
                        "typeless join needs at least one key column".to_string(),
                    ));
                }
                JoinKey::Typeless { large_key_cols }
            }
            other => return Err(ColexError::Protocol(format!("unknown join key type {other}"))),
        };
        let filter: Option<Expr> = get_opt_json(buf, "join filter")?;
        if filter.is_some() != kind.contains(JoinKind::WITH_FILTER) {
            return Err(ColexError::Protocol(
                "join filter presence disagrees with WITH_FILTER".to_string(),
            ));
        }
        Ok(Self {
            kind,
            size,
            key,
            filter,
            small_schema: None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggFunc {
    Count,
    Sum,
    Min,
    Max,
    Avg,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateSpec {
    pub func: AggFunc,
    /// Input column; `None` only for `COUNT(*)`.
    pub column: Option<u32>,
    pub name: String,
}

/// Partial group-by over the joined row group.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AggregatorDescriptor {
    pub group_by: Vec<u32>,
    pub aggregates: Vec<AggregateSpec>,
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use colex_execution::BinaryOp;

    use super::*;

    #[test]
    fn steps_round_trip() {
        let steps = vec![
            StepDescriptor::filter(
                10,
                ColumnKind::INT,
                Expr::binary(Expr::col(0, "value"), BinaryOp::Lt, Expr::lit_i64(5)),
            ),
            StepDescriptor::PassThru {
                oid: 10,
                filter_step: 0,
            },
            StepDescriptor::column(
                11,
                ColumnKind::Decimal {
                    width: 16,
                    precision: 30,
                    scale: -2,
                },
            ),
            StepDescriptor::Expression {
                name: "twice".to_string(),
                expr: Expr::binary(Expr::col(0, "a"), BinaryOp::Plus, Expr::col(0, "a")),
            },
        ];
        let mut out = BytesMut::new();
        for s in &steps {
            s.encode(&mut out).expect("encode");
        }
        let mut buf = out.freeze();
        let decoded: Vec<_> = (0..steps.len())
            .map(|_| StepDescriptor::decode(&mut buf).expect("decode"))
            .collect();
        assert_eq!(decoded, steps);
    }

    #[test]
    fn invalid_column_width_is_rejected() {
        let mut out = BytesMut::new();
        out.put_slice(&[0, 3, 1, 0]);
        assert!(get_column_kind(&mut out.freeze()).is_err());
    }

    #[test]
    fn join_filter_must_match_flag() {
        let join = JoinDescriptor {
            kind: JoinKind::INNER,
            size: 2,
            key: JoinKey::Scalar {
                large_key_col: 0,
                null_value: u64::MAX,
            },
            filter: Some(Expr::lit_i64(1)),
            small_schema: None,
        };
        let mut out = BytesMut::new();
        join.encode(&mut out).expect("encode");
        assert!(JoinDescriptor::decode(&mut out.freeze()).is_err());
    }
}
