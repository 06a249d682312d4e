use arrow_schema::DataType;
use serde::{Deserialize, Serialize};

/// Serializable scalar expression shipped inside creation messages.
///
/// Filter predicates, post-join filters and expression projections all use
/// this tree. Column references resolve against the schema the expression is
/// compiled for (a one-column block schema for filter steps, the projected
/// row group for everything else).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// Column resolved by name at compile time.
    Column(String),
    /// Column resolved by position; `name` is informational.
    ColumnRef { name: String, index: usize },
    Literal(LiteralValue),
    BinaryOp {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
    Cast {
        expr: Box<Expr>,
        to_type: DataType,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    IsNull(Box<Expr>),
    IsNotNull(Box<Expr>),
    /// Call into the injected function registry.
    ScalarFunction { name: String, args: Vec<Expr> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LiteralValue {
    Int64(i64),
    Float64(f64),
    Utf8(String),
    Boolean(bool),
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Plus,
    Minus,
    Multiply,
    Divide,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Eq | Self::NotEq | Self::Lt | Self::LtEq | Self::Gt | Self::GtEq
        )
    }
}

impl Expr {
    /// Positional column reference.
    pub fn col(index: usize, name: impl Into<String>) -> Self {
        Self::ColumnRef {
            name: name.into(),
            index,
        }
    }

    pub fn lit_i64(v: i64) -> Self {
        Self::Literal(LiteralValue::Int64(v))
    }

    pub fn lit_str(v: impl Into<String>) -> Self {
        Self::Literal(LiteralValue::Utf8(v.into()))
    }

    pub fn binary(left: Expr, op: BinaryOp, right: Expr) -> Self {
        Self::BinaryOp {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    pub fn and(self, other: Expr) -> Self {
        Self::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Expr) -> Self {
        Self::Or(Box::new(self), Box::new(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn casts_survive_json_transport() {
        let expr = Expr::Cast {
            expr: Box::new(Expr::col(0, "value")),
            to_type: DataType::Decimal128(12, 2),
        }
        .and(Expr::IsNotNull(Box::new(Expr::Column("value".to_string()))));
        let json = serde_json::to_vec(&expr).expect("encode");
        let back: Expr = serde_json::from_slice(&json).expect("decode");
        assert_eq!(back, expr);
        assert!(BinaryOp::LtEq.is_comparison());
        assert!(!BinaryOp::Divide.is_comparison());
    }
}
