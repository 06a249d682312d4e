//! Expression compilation and evaluation for batch steps.
//!
//! Input contract:
//! - column references are positional (`ColumnRef`) or resolved by name;
//! - operand types are coerced here, callers do not insert casts.
//!
//! Output contract:
//! - each evaluation returns an `ArrayRef` aligned to input batch row count.

use std::sync::Arc;

use arrow::array::{
    new_null_array, Array, ArrayRef, BooleanArray, BooleanBuilder, Float64Builder, Int64Builder,
    StringBuilder,
};
use arrow::compute::kernels::{
    boolean::{and_kleene, not, or_kleene},
    cast::cast,
    cmp::{eq, gt, gt_eq, lt, lt_eq, neq},
    numeric::{add, div, mul, sub},
};
use arrow::compute::{is_not_null, is_null};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, SchemaRef};
use colex_common::{ColexError, Result};

use crate::expr::{BinaryOp, Expr, LiteralValue};
use crate::functions::{FunctionRegistry, ScalarFunction};

/// Executable expression.
pub trait PhysicalExpr: Send + Sync {
    /// Static output data type of this expression.
    fn data_type(&self) -> DataType;
    /// Evaluate the expression for every row in `batch`.
    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef>;
}

/// Compile a serialized expression against `input_schema`.
pub fn compile_expr(
    expr: &Expr,
    input_schema: &SchemaRef,
    functions: &FunctionRegistry,
) -> Result<Arc<dyn PhysicalExpr>> {
    match expr {
        Expr::ColumnRef { index, name } => {
            if *index >= input_schema.fields().len() {
                return Err(ColexError::Protocol(format!(
                    "column reference '{name}' at {index} is outside a {}-column input",
                    input_schema.fields().len()
                )));
            }
            let dt = input_schema.field(*index).data_type().clone();
            Ok(Arc::new(ColumnExpr { index: *index, dt }))
        }
        Expr::Column(name) => {
            let idx = input_schema
                .fields()
                .iter()
                .position(|f| f.name() == name)
                .ok_or_else(|| ColexError::Protocol(format!("unknown column: {name}")))?;
            let dt = input_schema.field(idx).data_type().clone();
            Ok(Arc::new(ColumnExpr { index: idx, dt }))
        }

        Expr::Literal(v) => Ok(Arc::new(LiteralExpr {
            v: v.clone(),
            dt: literal_type(v),
        })),

        Expr::Cast { expr, to_type } => {
            let inner = compile_expr(expr, input_schema, functions)?;
            Ok(Arc::new(CastExpr {
                inner,
                to_type: to_type.clone(),
            }))
        }

        Expr::Not(e) => {
            let inner = compile_expr(e, input_schema, functions)?;
            Ok(Arc::new(NotExpr { inner }))
        }

        Expr::IsNull(e) | Expr::IsNotNull(e) => {
            let inner = compile_expr(e, input_schema, functions)?;
            Ok(Arc::new(NullCheckExpr {
                inner,
                negated: matches!(expr, Expr::IsNotNull(_)),
            }))
        }

        Expr::And(a, b) | Expr::Or(a, b) => {
            let left = compile_expr(a, input_schema, functions)?;
            let right = compile_expr(b, input_schema, functions)?;
            Ok(Arc::new(BoolBinaryExpr {
                left,
                right,
                op: if matches!(expr, Expr::And(..)) {
                    BoolOp::And
                } else {
                    BoolOp::Or
                },
            }))
        }

        Expr::BinaryOp { left, op, right } => {
            let l = compile_expr(left, input_schema, functions)?;
            let r = compile_expr(right, input_schema, functions)?;
            let operand = common_type(&l.data_type(), &r.data_type())?;
            if !op.is_comparison() && !operand.is_numeric() {
                return Err(ColexError::Unsupported(format!(
                    "arithmetic is not supported for {operand:?}"
                )));
            }
            let out = if op.is_comparison() {
                DataType::Boolean
            } else {
                operand.clone()
            };
            Ok(Arc::new(BinaryExpr {
                left: coerce(l, &operand),
                right: coerce(r, &operand),
                op: *op,
                out,
            }))
        }

        Expr::ScalarFunction { name, args } => {
            let compiled_args = args
                .iter()
                .map(|a| compile_expr(a, input_schema, functions))
                .collect::<Result<Vec<_>>>()?;
            let function = functions.get(name).ok_or_else(|| {
                ColexError::Unsupported(format!("scalar function '{name}' is not registered"))
            })?;
            let out = function.return_type(
                &compiled_args
                    .iter()
                    .map(|arg| arg.data_type())
                    .collect::<Vec<_>>(),
            )?;
            Ok(Arc::new(ScalarFunctionExpr {
                name: name.clone(),
                function,
                args: compiled_args,
                out,
            }))
        }
    }
}

/// Evaluate a compiled predicate into a selection mask; nulls count as false.
pub fn evaluate_predicate(expr: &dyn PhysicalExpr, batch: &RecordBatch) -> Result<BooleanArray> {
    let arr = expr.evaluate(batch)?;
    let mask = arr
        .as_any()
        .downcast_ref::<BooleanArray>()
        .ok_or_else(|| {
            ColexError::Execution(format!(
                "predicate must be boolean, got {:?}",
                arr.data_type()
            ))
        })?;
    if mask.null_count() == 0 {
        return Ok(mask.clone());
    }
    let values: Vec<bool> = mask.iter().map(|v| v.unwrap_or(false)).collect();
    Ok(BooleanArray::from(values))
}

struct ColumnExpr {
    index: usize,
    dt: DataType,
}

impl PhysicalExpr for ColumnExpr {
    fn data_type(&self) -> DataType {
        self.dt.clone()
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        Ok(batch.column(self.index).clone())
    }
}

struct LiteralExpr {
    v: LiteralValue,
    dt: DataType,
}

impl PhysicalExpr for LiteralExpr {
    fn data_type(&self) -> DataType {
        self.dt.clone()
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        Ok(literal_to_array(&self.v, batch.num_rows()))
    }
}

struct CastExpr {
    inner: Arc<dyn PhysicalExpr>,
    to_type: DataType,
}

impl PhysicalExpr for CastExpr {
    fn data_type(&self) -> DataType {
        self.to_type.clone()
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let arr = self.inner.evaluate(batch)?;
        cast(&arr, &self.to_type).map_err(|e| ColexError::Execution(format!("cast failed: {e}")))
    }
}

struct NotExpr {
    inner: Arc<dyn PhysicalExpr>,
}

impl PhysicalExpr for NotExpr {
    fn data_type(&self) -> DataType {
        DataType::Boolean
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let arr = self.inner.evaluate(batch)?;
        let b = as_boolean(&arr, "NOT")?;
        let out = not(b).map_err(|e| ColexError::Execution(format!("not failed: {e}")))?;
        Ok(Arc::new(out))
    }
}

struct NullCheckExpr {
    inner: Arc<dyn PhysicalExpr>,
    negated: bool,
}

impl PhysicalExpr for NullCheckExpr {
    fn data_type(&self) -> DataType {
        DataType::Boolean
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let arr = self.inner.evaluate(batch)?;
        let out = if self.negated {
            is_not_null(arr.as_ref())
        } else {
            is_null(arr.as_ref())
        }
        .map_err(|e| ColexError::Execution(format!("null check failed: {e}")))?;
        Ok(Arc::new(out))
    }
}

#[derive(Clone, Copy)]
enum BoolOp {
    And,
    Or,
}

struct BoolBinaryExpr {
    left: Arc<dyn PhysicalExpr>,
    right: Arc<dyn PhysicalExpr>,
    op: BoolOp,
}

impl PhysicalExpr for BoolBinaryExpr {
    fn data_type(&self) -> DataType {
        DataType::Boolean
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let l = self.left.evaluate(batch)?;
        let r = self.right.evaluate(batch)?;
        let lb = as_boolean(&l, "AND/OR")?;
        let rb = as_boolean(&r, "AND/OR")?;

        let out = match self.op {
            BoolOp::And => and_kleene(lb, rb),
            BoolOp::Or => or_kleene(lb, rb),
        }
        .map_err(|e| ColexError::Execution(format!("boolean kernel failed: {e}")))?;

        Ok(Arc::new(out))
    }
}

struct BinaryExpr {
    left: Arc<dyn PhysicalExpr>,
    right: Arc<dyn PhysicalExpr>,
    op: BinaryOp,
    out: DataType,
}

impl PhysicalExpr for BinaryExpr {
    fn data_type(&self) -> DataType {
        self.out.clone()
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let l = self.left.evaluate(batch)?;
        let r = self.right.evaluate(batch)?;

        if self.op.is_comparison() {
            let res = match self.op {
                BinaryOp::Eq => eq(&l, &r),
                BinaryOp::NotEq => neq(&l, &r),
                BinaryOp::Lt => lt(&l, &r),
                BinaryOp::LtEq => lt_eq(&l, &r),
                BinaryOp::Gt => gt(&l, &r),
                _ => gt_eq(&l, &r),
            }
            .map_err(|e| ColexError::Execution(format!("cmp kernel failed: {e}")))?;
            return Ok(Arc::new(res));
        }

        match self.op {
            BinaryOp::Plus => add(&l, &r),
            BinaryOp::Minus => sub(&l, &r),
            BinaryOp::Multiply => mul(&l, &r),
            _ => div(&l, &r),
        }
        .map_err(|e| ColexError::Execution(format!("arith kernel failed: {e}")))
    }
}

struct ScalarFunctionExpr {
    name: String,
    function: Arc<dyn ScalarFunction>,
    args: Vec<Arc<dyn PhysicalExpr>>,
    out: DataType,
}

impl PhysicalExpr for ScalarFunctionExpr {
    fn data_type(&self) -> DataType {
        self.out.clone()
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let arrays = self
            .args
            .iter()
            .map(|arg| arg.evaluate(batch))
            .collect::<Result<Vec<_>>>()?;
        self.function
            .invoke(&arrays)
            .map_err(|e| ColexError::Execution(format!("function '{}' failed: {e}", self.name)))
    }
}

fn as_boolean<'a>(arr: &'a ArrayRef, what: &str) -> Result<&'a BooleanArray> {
    arr.as_any()
        .downcast_ref::<BooleanArray>()
        .ok_or_else(|| ColexError::Execution(format!("{what} expects boolean")))
}

fn literal_type(v: &LiteralValue) -> DataType {
    match v {
        LiteralValue::Int64(_) => DataType::Int64,
        LiteralValue::Float64(_) => DataType::Float64,
        LiteralValue::Utf8(_) => DataType::Utf8,
        LiteralValue::Boolean(_) => DataType::Boolean,
        LiteralValue::Null => DataType::Null,
    }
}

fn literal_to_array(v: &LiteralValue, len: usize) -> ArrayRef {
    match v {
        LiteralValue::Int64(x) => {
            let mut b = Int64Builder::with_capacity(len);
            b.append_value_n(*x, len);
            Arc::new(b.finish())
        }
        LiteralValue::Float64(x) => {
            let mut b = Float64Builder::with_capacity(len);
            b.append_value_n(*x, len);
            Arc::new(b.finish())
        }
        LiteralValue::Boolean(x) => {
            let mut b = BooleanBuilder::with_capacity(len);
            b.append_n(len, *x);
            Arc::new(b.finish())
        }
        LiteralValue::Utf8(s) => {
            let mut b = StringBuilder::with_capacity(len, s.len() * len);
            for _ in 0..len {
                b.append_value(s);
            }
            Arc::new(b.finish())
        }
        LiteralValue::Null => new_null_array(&DataType::Null, len),
    }
}

fn is_integer(dt: &DataType) -> bool {
    dt.is_integer()
}

fn is_fractional(dt: &DataType) -> bool {
    dt.is_floating() || matches!(dt, DataType::Decimal128(..) | DataType::Decimal256(..))
}

/// Operand type both sides of a binary expression are cast to.
fn common_type(l: &DataType, r: &DataType) -> Result<DataType> {
    if l == r {
        return Ok(l.clone());
    }
    match (l, r) {
        (DataType::Null, other) | (other, DataType::Null) => Ok(other.clone()),
        (a, b) if is_integer(a) && is_integer(b) => Ok(DataType::Int64),
        (a, b) if (is_integer(a) || is_fractional(a)) && (is_integer(b) || is_fractional(b)) => {
            Ok(DataType::Float64)
        }
        (DataType::Utf8, DataType::LargeUtf8) | (DataType::LargeUtf8, DataType::Utf8) => {
            Ok(DataType::Utf8)
        }
        _ => Err(ColexError::Unsupported(format!(
            "no common type for {l:?} and {r:?}"
        ))),
    }
}

fn coerce(expr: Arc<dyn PhysicalExpr>, to: &DataType) -> Arc<dyn PhysicalExpr> {
    if &expr.data_type() == to {
        expr
    } else {
        Arc::new(CastExpr {
            inner: expr,
            to_type: to.clone(),
        })
    }
}
