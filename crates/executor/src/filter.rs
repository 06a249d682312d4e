//! Filter stage: per-step predicates over column blocks and their AND/OR
//! combination into a surviving row id list.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, UInt32Array};
use arrow::compute::take;
use arrow::record_batch::RecordBatch;
use arrow_schema::{Field, Schema, SchemaRef};
use colex_common::{ColexError, Result};
use colex_execution::{
    compile_expr, evaluate_predicate, scalar_from_array, ColumnKind, Expr, FunctionRegistry,
    PhysicalExpr,
};
use colex_wire::{BoolOp, CheckpointRange};

/// Values of one column step for the current block.
#[derive(Debug, Clone)]
pub(crate) enum StepValues {
    /// A whole block, indexed by block-relative row id.
    Block(ArrayRef),
    /// Pre-fetched values aligned with an explicit, ascending rid list.
    Aligned { rids: Vec<u16>, values: ArrayRef },
}

impl StepValues {
    /// Number of addressable rows of the block.
    pub(crate) fn block_len(&self) -> usize {
        match self {
            Self::Block(values) => values.len(),
            Self::Aligned { rids, .. } => rids.last().map_or(0, |r| usize::from(*r) + 1),
        }
    }

    /// Values at `rids`, in rid order.
    pub(crate) fn take(&self, rids: &[u16]) -> Result<ArrayRef> {
        let indices = match self {
            Self::Block(values) => {
                if let Some(bad) = rids.iter().find(|r| usize::from(**r) >= values.len()) {
                    return Err(ColexError::Protocol(format!(
                        "row id {bad} is outside a {}-row block",
                        values.len()
                    )));
                }
                UInt32Array::from_iter_values(rids.iter().map(|r| u32::from(*r)))
            }
            Self::Aligned { rids: aligned, .. } => {
                let mut positions = Vec::with_capacity(rids.len());
                for r in rids {
                    let pos = aligned.binary_search(r).map_err(|_| {
                        ColexError::Execution(format!("row id {r} has no pre-fetched value"))
                    })?;
                    positions.push(pos as u32);
                }
                UInt32Array::from(positions)
            }
        };
        let source = match self {
            Self::Block(values) | Self::Aligned { values, .. } => values,
        };
        take(source.as_ref(), &indices, None)
            .map_err(|e| ColexError::Execution(format!("column take failed: {e}")))
    }
}

/// Compiled filter step: one column and an optional predicate over it.
pub(crate) struct FilterStep {
    pub(crate) oid: u32,
    pub(crate) kind: ColumnKind,
    predicate: Option<Arc<dyn PhysicalExpr>>,
    schema: SchemaRef,
}

impl std::fmt::Debug for FilterStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterStep")
            .field("oid", &self.oid)
            .field("kind", &self.kind)
            .field("has_predicate", &self.predicate.is_some())
            .finish()
    }
}

impl FilterStep {
    /// The predicate sees a single nullable column named `value`.
    pub(crate) fn compile(
        oid: u32,
        kind: ColumnKind,
        predicate: Option<&Expr>,
        functions: &FunctionRegistry,
    ) -> Result<Self> {
        kind.validate()?;
        let schema: SchemaRef = Arc::new(Schema::new(vec![Field::new(
            "value",
            kind.data_type(),
            true,
        )]));
        let predicate = predicate
            .map(|p| compile_expr(p, &schema, functions))
            .transpose()?;
        Ok(Self {
            oid,
            kind,
            predicate,
            schema,
        })
    }

    /// Subset of `rids` whose value passes the predicate.
    pub(crate) fn select(&self, values: &StepValues, rids: &[u16]) -> Result<Vec<u16>> {
        let Some(predicate) = &self.predicate else {
            return Ok(rids.to_vec());
        };
        if rids.is_empty() {
            return Ok(Vec::new());
        }
        let column = values.take(rids)?;
        let batch = RecordBatch::try_new(Arc::clone(&self.schema), vec![column])
            .map_err(|e| ColexError::Execution(format!("filter input batch failed: {e}")))?;
        let mask = evaluate_predicate(predicate.as_ref(), &batch)?;
        Ok(rids
            .iter()
            .zip(mask.values().iter())
            .filter_map(|(rid, keep)| keep.then_some(*rid))
            .collect())
    }
}

/// Combine every filter step over `input`.
///
/// AND narrows the rid list step by step and stops once it is empty. OR
/// evaluates every step over the full input and unions the results.
pub(crate) fn run_filters(
    steps: &[FilterStep],
    values: &[StepValues],
    input: &[u16],
    op: BoolOp,
) -> Result<Vec<u16>> {
    if steps.is_empty() {
        return Ok(input.to_vec());
    }
    match op {
        BoolOp::And => {
            let mut rids = input.to_vec();
            for (step, vals) in steps.iter().zip(values) {
                if rids.is_empty() {
                    break;
                }
                rids = step.select(vals, &rids)?;
            }
            Ok(rids)
        }
        BoolOp::Or => {
            let mut acc = Vec::new();
            for (step, vals) in steps.iter().zip(values) {
                acc.extend(step.select(vals, input)?);
            }
            acc.sort_unstable();
            acc.dedup();
            Ok(acc)
        }
    }
}

/// Min/max summary of an integer or decimal block; `None` for other kinds
/// and for blocks without a non-null value.
pub(crate) fn checkpoint_range(
    kind: ColumnKind,
    values: &ArrayRef,
    lbid: u64,
) -> Result<Option<CheckpointRange>> {
    if !matches!(kind, ColumnKind::Int { .. } | ColumnKind::Decimal { .. }) {
        return Ok(None);
    }
    let mut bounds: Option<(i128, i128)> = None;
    for row in 0..values.len() {
        let Some(v) = scalar_from_array(values, row)?.as_i128() else {
            continue;
        };
        bounds = Some(match bounds {
            None => (v, v),
            Some((lo, hi)) => (lo.min(v), hi.max(v)),
        });
    }
    Ok(bounds.map(|(min, max)| CheckpointRange {
        lbid,
        width: if kind.is_wide() { 16 } else { 8 },
        min,
        max,
    }))
}

#[cfg(test)]
mod tests {
    use arrow::array::{Decimal128Array, Int32Array, StringArray};
    use colex_execution::BinaryOp;

    use super::*;

    fn block(values: Vec<Option<i32>>) -> StepValues {
        StepValues::Block(Arc::new(Int32Array::from(values)))
    }

    fn lt(n: i64) -> Expr {
        Expr::binary(Expr::col(0, "value"), BinaryOp::Lt, Expr::lit_i64(n))
    }

    fn gt(n: i64) -> Expr {
        Expr::binary(Expr::col(0, "value"), BinaryOp::Gt, Expr::lit_i64(n))
    }

    fn step(expr: Option<Expr>) -> FilterStep {
        FilterStep::compile(1, ColumnKind::INT, expr.as_ref(), &FunctionRegistry::with_builtins())
            .expect("compile")
    }

    #[test]
    fn and_narrows_and_or_unions() {
        let a = block(vec![Some(1), Some(5), Some(9), None, Some(3)]);
        let b = block(vec![Some(10), Some(20), Some(30), Some(40), Some(50)]);
        let steps = vec![step(Some(lt(6))), step(Some(gt(25)))];
        let values = vec![a, b];
        let input: Vec<u16> = (0..5).collect();

        let and = run_filters(&steps, &values, &input, BoolOp::And).expect("and");
        assert_eq!(and, vec![4]);
        let or = run_filters(&steps, &values, &input, BoolOp::Or).expect("or");
        assert_eq!(or, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn missing_predicate_keeps_everything() {
        let values = vec![block(vec![None, Some(2)])];
        let rids = run_filters(&[step(None)], &values, &[0, 1], BoolOp::And).expect("filter");
        assert_eq!(rids, vec![0, 1]);
    }

    #[test]
    fn aligned_values_resolve_by_rid() {
        let aligned = StepValues::Aligned {
            rids: vec![3, 7, 9],
            values: Arc::new(Int32Array::from(vec![4, 8, 2])),
        };
        assert_eq!(aligned.block_len(), 10);
        let kept = step(Some(lt(5))).select(&aligned, &[3, 7, 9]).expect("select");
        assert_eq!(kept, vec![3, 9]);
        assert!(aligned.take(&[4]).is_err());
    }

    #[test]
    fn rids_past_the_block_are_rejected() {
        let err = block(vec![Some(1)]).take(&[1]).expect_err("out of range");
        assert!(matches!(err, ColexError::Protocol(_)));
    }

    #[test]
    fn checkpoint_ranges_cover_numeric_kinds() {
        let ints: ArrayRef = Arc::new(Int32Array::from(vec![Some(4), None, Some(-2)]));
        let cp = checkpoint_range(ColumnKind::INT, &ints, 42)
            .expect("cp")
            .expect("range");
        assert_eq!((cp.lbid, cp.width, cp.min, cp.max), (42, 8, -2, 4));

        let wide: ArrayRef = Arc::new(
            Decimal128Array::from(vec![i128::MAX, 7])
                .with_precision_and_scale(38, 0)
                .expect("decimal"),
        );
        let kind = ColumnKind::Decimal {
            width: 16,
            precision: 38,
            scale: 0,
        };
        let cp = checkpoint_range(kind, &wide, 1).expect("cp").expect("range");
        assert_eq!((cp.width, cp.min, cp.max), (16, 7, i128::MAX));

        let nulls: ArrayRef = Arc::new(Int32Array::from(vec![None, None]));
        assert!(checkpoint_range(ColumnKind::INT, &nulls, 0).expect("cp").is_none());
        let strings: ArrayRef = Arc::new(StringArray::from(vec!["a"]));
        assert!(checkpoint_range(ColumnKind::LongString, &strings, 0)
            .expect("cp")
            .is_none());
    }
}
