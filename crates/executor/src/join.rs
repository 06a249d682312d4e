//! Shared join state of a batch group: one hash table (and optional small-side
//! row store) per join, built by join-build messages and probed by every
//! executor instance once complete.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arrow::array::{Array, ArrayRef, UInt32Array};
use arrow::compute::take;
use arrow::record_batch::RecordBatch;
use arrow_schema::{Field, Schema, SchemaRef};
use colex_common::error::ERR_MORE_THAN_ONE_ROW;
use colex_common::{ColexError, ProcessorConfig, Result};
use colex_execution::{
    compile_expr, encode_group_key, evaluate_predicate, scalar_keys, ColumnKind, FunctionRegistry,
    PhysicalExpr, RowCursor, RowSchema,
};
use colex_join::{ScalarJoinTable, SmallRowStore, TypelessJoinTable, TypelessKey};
use colex_wire::{JoinBuild, JoinDescriptor, JoinEntries, JoinKey, JoinKind};
use parking_lot::Mutex;
use tracing::debug;

enum SideTable {
    Scalar {
        table: ScalarJoinTable,
        large_key_col: usize,
        null_value: u64,
    },
    Typeless {
        table: TypelessJoinTable,
        large_key_cols: Vec<usize>,
        /// Layout of the key columns alone.
        key_schema: Arc<RowSchema>,
    },
}

impl SideTable {
    fn len(&self) -> usize {
        match self {
            Self::Scalar { table, .. } => table.len(),
            Self::Typeless { table, .. } => table.len(),
        }
    }

    fn complete(&self, expected: usize) -> Result<bool> {
        match self {
            Self::Scalar { table, .. } => table.complete(expected),
            Self::Typeless { table, .. } => table.complete(expected),
        }
    }
}

enum LargeKey {
    Scalar(u64),
    Typeless(TypelessKey),
}

struct JoinSide {
    kind: JoinKind,
    size: usize,
    table: SideTable,
    store: Option<SmallRowStore>,
    /// Small rows whose key is null; never inserted into the table.
    null_rows: Mutex<Vec<u32>>,
    filter: Option<Arc<dyn PhysicalExpr>>,
    /// Large row ++ small row, the input of `filter`.
    pair_schema: Option<SchemaRef>,
}

/// Per large row outcome of one join: `None` rejects the row, otherwise the
/// small rows it pairs with (`None` entries pair with the null small row).
type Outcome = Option<Vec<Option<u32>>>;

/// Joined row group plus, per output row, the large row it came from.
#[derive(Debug)]
pub struct Joined {
    pub batch: RecordBatch,
    pub large_rows: UInt32Array,
}

/// Join tables shared by every executor of a batch group.
pub struct JoinRuntime {
    sides: Vec<JoinSide>,
    large_schema: SchemaRef,
    output_schema: SchemaRef,
    complete: AtomicBool,
}

impl std::fmt::Debug for JoinRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinRuntime")
            .field("joins", &self.sides.len())
            .field("complete", &self.is_complete())
            .finish()
    }
}

impl JoinRuntime {
    /// Validate the descriptors against the large-side row group schema.
    pub fn new(
        joins: &[JoinDescriptor],
        large_schema: &SchemaRef,
        config: &ProcessorConfig,
        functions: &FunctionRegistry,
    ) -> Result<Self> {
        let buckets = config.join_bucket_count();
        let backoff = Duration::from_micros(config.join_backoff_micros);
        let mut sides = Vec::with_capacity(joins.len());
        let mut out_fields: Vec<Field> = large_schema
            .fields()
            .iter()
            .map(|f| f.as_ref().clone())
            .collect();

        for (idx, join) in joins.iter().enumerate() {
            let table = match &join.key {
                JoinKey::Scalar {
                    large_key_col,
                    null_value,
                } => {
                    let col = *large_key_col as usize;
                    let field = large_schema.fields().get(col).ok_or_else(|| {
                        ColexError::Protocol(format!(
                            "join {idx} key column {col} is outside the large side"
                        ))
                    })?;
                    if !ColumnKind::from_data_type(field.data_type())?.supports_scalar_key() {
                        return Err(ColexError::Protocol(format!(
                            "join {idx} key column {col} of type {:?} cannot be a scalar key",
                            field.data_type()
                        )));
                    }
                    SideTable::Scalar {
                        table: ScalarJoinTable::new(buckets, backoff),
                        large_key_col: col,
                        null_value: *null_value,
                    }
                }
                JoinKey::Typeless { large_key_cols } => {
                    let cols: Vec<usize> = large_key_cols.iter().map(|c| *c as usize).collect();
                    if let Some(bad) = cols.iter().find(|c| **c >= large_schema.fields().len()) {
                        return Err(ColexError::Protocol(format!(
                            "join {idx} key column {bad} is outside the large side"
                        )));
                    }
                    let key_fields = large_schema.project(&cols).map_err(|e| {
                        ColexError::Protocol(format!("join {idx} key columns: {e}"))
                    })?;
                    SideTable::Typeless {
                        table: TypelessJoinTable::new(buckets, backoff),
                        key_schema: Arc::new(RowSchema::from_arrow(&Arc::new(key_fields))?),
                        large_key_cols: cols,
                    }
                }
            };

            let store = match &join.small_schema {
                Some(columns) => {
                    let small = RowSchema::new(columns.clone())?;
                    out_fields.extend(small.arrow_schema().fields().iter().map(|f| {
                        f.as_ref().clone().with_nullable(true)
                    }));
                    Some(SmallRowStore::new(Arc::clone(small.arrow_schema())))
                }
                None => None,
            };

            let (filter, pair_schema) = match &join.filter {
                Some(expr) => {
                    let small = store.as_ref().ok_or_else(|| {
                        ColexError::Protocol(format!(
                            "join {idx} has a post-match filter but no small-side rows"
                        ))
                    })?;
                    let fields: Vec<Field> = large_schema
                        .fields()
                        .iter()
                        .chain(small.schema().fields().iter())
                        .map(|f| f.as_ref().clone())
                        .collect();
                    let pair: SchemaRef = Arc::new(Schema::new(fields));
                    (Some(compile_expr(expr, &pair, functions)?), Some(pair))
                }
                None => (None, None),
            };

            sides.push(JoinSide {
                kind: join.kind,
                size: join.size as usize,
                table,
                store,
                null_rows: Mutex::new(Vec::new()),
                filter,
                pair_schema,
            });
        }

        Ok(Self {
            sides,
            large_schema: Arc::clone(large_schema),
            output_schema: Arc::new(Schema::new(out_fields)),
            complete: AtomicBool::new(false),
        })
    }

    pub fn join_count(&self) -> usize {
        self.sides.len()
    }

    /// Schema of the large-side row group the joins probe.
    pub fn large_schema(&self) -> &SchemaRef {
        &self.large_schema
    }

    /// Large columns followed by the small columns of every join that
    /// carries small-side rows.
    pub fn output_schema(&self) -> &SchemaRef {
        &self.output_schema
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    /// Add one build message. Returns the number of keys it carried.
    pub fn add_to_joiner(&self, build: &JoinBuild) -> Result<usize> {
        let idx = build.joiner_index as usize;
        let side = self.sides.get(idx).ok_or_else(|| {
            ColexError::Protocol(format!(
                "join build for joiner {idx} but the batch has {} joins",
                self.sides.len()
            ))
        })?;
        if self.is_complete() {
            return Err(ColexError::Protocol(format!(
                "join build for joiner {idx} after the joins were completed"
            )));
        }

        // Rows first: a table that reaches its size implies every row chunk
        // of that build already landed in the store.
        if let Some(rows) = &build.small_rows {
            let store = side.store.as_ref().ok_or_else(|| {
                ColexError::Protocol(format!("joiner {idx} does not take small-side rows"))
            })?;
            store.push(build.start_pos, rows.clone())?;
        }

        match (&side.table, &build.entries) {
            (SideTable::Scalar { table, null_value, .. }, JoinEntries::Scalar(pairs)) => {
                let mut nulls = Vec::new();
                let mut keyed = Vec::with_capacity(pairs.len());
                for (key, row) in pairs {
                    if key == null_value {
                        nulls.push(*row);
                    } else {
                        keyed.push((*key, *row));
                    }
                }
                side.null_rows.lock().extend(nulls);
                table.insert_batch(keyed)?;
            }
            (SideTable::Typeless { table, .. }, JoinEntries::Typeless(keys)) => {
                let mut nulls = Vec::new();
                let mut keyed = Vec::with_capacity(keys.len());
                for (i, key) in keys.iter().enumerate() {
                    let row = build.start_pos + i as u32;
                    match key {
                        Some(bytes) => keyed.push((TypelessKey(bytes.clone()), row)),
                        None => nulls.push(row),
                    }
                }
                side.null_rows.lock().extend(nulls);
                table.insert_batch(keyed)?;
            }
            _ => {
                return Err(ColexError::Protocol(format!(
                    "joiner {idx} received entries of the wrong key type"
                )))
            }
        }
        Ok(build.entries.len())
    }

    /// Completeness gate. Returns `false` until every join holds its
    /// announced number of entries, then seals tables and row stores.
    pub fn end_of_joiner(&self) -> Result<bool> {
        if self.is_complete() {
            return Ok(true);
        }
        let mut all = true;
        for side in &self.sides {
            let nulls = side.null_rows.lock().len();
            if !side.table.complete(side.size.saturating_sub(nulls))? {
                all = false;
            }
        }
        if !all {
            return Ok(false);
        }
        for side in &self.sides {
            if let Some(store) = &side.store {
                store.seal()?;
            }
            side.null_rows.lock().sort_unstable();
        }
        self.complete.store(true, Ordering::Release);
        debug!(joins = self.sides.len(), "join build complete");
        Ok(true)
    }

    /// Probe every join with `batch` (a large-side row group) and expand the
    /// accepted rows into the joined row group.
    pub fn join(&self, batch: &RecordBatch) -> Result<Joined> {
        if !self.is_complete() {
            return Err(ColexError::Execution(
                "probe before the join build completed".to_string(),
            ));
        }
        let outcomes = self
            .sides
            .iter()
            .enumerate()
            .map(|(idx, side)| self.probe_side(idx, side, batch))
            .collect::<Result<Vec<_>>>()?;

        let mut large_idx: Vec<u32> = Vec::new();
        let mut small_idx: Vec<Vec<Option<u32>>> = vec![Vec::new(); self.sides.len()];
        for row in 0..batch.num_rows() {
            let mut lists = Vec::with_capacity(outcomes.len());
            for outcome in &outcomes {
                match &outcome[row] {
                    Some(list) => lists.push(list),
                    None => break,
                }
            }
            if lists.len() != outcomes.len() {
                continue;
            }
            // Nested expansion, join 0 outermost.
            let mut combos: Vec<Vec<Option<u32>>> = vec![Vec::new()];
            for list in lists {
                let mut next = Vec::with_capacity(combos.len() * list.len());
                for combo in &combos {
                    for m in list {
                        let mut c = combo.clone();
                        c.push(*m);
                        next.push(c);
                    }
                }
                combos = next;
            }
            for combo in combos {
                large_idx.push(row as u32);
                for (j, m) in combo.into_iter().enumerate() {
                    small_idx[j].push(m);
                }
            }
        }

        let large_rows = UInt32Array::from(large_idx);
        let mut columns = take_columns(batch.columns(), &large_rows)?;
        for (side, rows) in self.sides.iter().zip(small_idx) {
            if let Some(store) = &side.store {
                let indices = UInt32Array::from(rows);
                columns.extend(take_columns(store.rows()?.columns(), &indices)?);
            }
        }
        let batch = RecordBatch::try_new(Arc::clone(&self.output_schema), columns)
            .map_err(|e| ColexError::Execution(format!("joined row group failed: {e}")))?;
        Ok(Joined { batch, large_rows })
    }

    fn large_keys(&self, side: &JoinSide, batch: &RecordBatch) -> Result<Vec<Option<LargeKey>>> {
        match &side.table {
            SideTable::Scalar {
                large_key_col,
                null_value,
                ..
            } => Ok(scalar_keys(batch.column(*large_key_col).as_ref())?
                .into_iter()
                .map(|k| k.filter(|v| v != null_value).map(LargeKey::Scalar))
                .collect()),
            SideTable::Typeless {
                large_key_cols,
                key_schema,
                ..
            } => {
                let key_batch = batch
                    .project(large_key_cols)
                    .map_err(|e| ColexError::Execution(format!("join key projection: {e}")))?;
                let all: Vec<usize> = (0..large_key_cols.len()).collect();
                let mut keys = Vec::with_capacity(batch.num_rows());
                let mut cursor = RowCursor::new(key_batch, Arc::clone(key_schema))?;
                while cursor.is_valid() {
                    let values = cursor.values(&all)?;
                    keys.push(if values.iter().any(|v| v.is_null()) {
                        None
                    } else {
                        Some(LargeKey::Typeless(TypelessKey(encode_group_key(&values))))
                    });
                    cursor.advance();
                }
                Ok(keys)
            }
        }
    }

    fn probe_side(&self, idx: usize, side: &JoinSide, batch: &RecordBatch) -> Result<Vec<Outcome>> {
        let kind = side.kind;
        let anti = kind.contains(JoinKind::ANTI);
        let match_nulls = kind.contains(JoinKind::MATCH_NULLS);
        let has_filter = side.filter.is_some();
        let null_rows = side.null_rows.lock().clone();
        let small_rows = match &side.store {
            Some(store) => store.rows()?.num_rows(),
            None => side.table.len() + null_rows.len(),
        };
        let small_empty = side.table.len() == 0 && null_rows.is_empty();

        let keys = self.large_keys(side, batch)?;
        let mut candidates: Vec<Vec<u32>> = Vec::with_capacity(keys.len());
        for key in &keys {
            let mut rows = match key {
                Some(LargeKey::Scalar(k)) => match &side.table {
                    SideTable::Scalar { table, .. } => table.probe(k)?.to_vec(),
                    SideTable::Typeless { .. } => Vec::new(),
                },
                Some(LargeKey::Typeless(k)) => match &side.table {
                    SideTable::Typeless { table, .. } => table.probe(k)?.to_vec(),
                    SideTable::Scalar { .. } => Vec::new(),
                },
                None if anti && has_filter => (0..small_rows as u32).collect(),
                None if match_nulls && !anti => null_rows.clone(),
                None => Vec::new(),
            };
            rows.sort_unstable();
            candidates.push(rows);
        }

        let accepted = match (&side.filter, &side.pair_schema, &side.store) {
            (Some(filter), Some(pair_schema), Some(store)) => {
                filter_pairs(filter.as_ref(), pair_schema, batch, store, &candidates)?
            }
            _ => candidates,
        };

        let mut outcomes = Vec::with_capacity(keys.len());
        for (key, matches) in keys.iter().zip(accepted) {
            if kind.contains(JoinKind::SCALAR) && matches.len() > 1 {
                return Err(ColexError::data(
                    ERR_MORE_THAN_ONE_ROW,
                    format!("join {idx}: scalar subquery returned more than one row"),
                ));
            }
            let outcome = if anti {
                let keep = if small_empty {
                    true
                } else if key.is_none() {
                    if has_filter {
                        matches.is_empty()
                    } else {
                        !match_nulls
                    }
                } else if match_nulls && !has_filter && !null_rows.is_empty() {
                    false
                } else {
                    matches.is_empty()
                };
                keep.then(|| vec![None])
            } else if kind.contains(JoinKind::SEMI) {
                match matches.first() {
                    None => None,
                    Some(first) if kind.contains(JoinKind::SCALAR) => Some(vec![Some(*first)]),
                    Some(_) => Some(vec![None]),
                }
            } else if matches.is_empty() {
                kind.contains(JoinKind::LARGE_OUTER).then(|| vec![None])
            } else {
                Some(matches.into_iter().map(Some).collect())
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }
}

/// Evaluate a post-match filter over every (large row, candidate) pair and
/// keep the candidates that pass.
fn filter_pairs(
    filter: &dyn PhysicalExpr,
    pair_schema: &SchemaRef,
    batch: &RecordBatch,
    store: &SmallRowStore,
    candidates: &[Vec<u32>],
) -> Result<Vec<Vec<u32>>> {
    let mut large = Vec::new();
    let mut small = Vec::new();
    for (row, rows) in candidates.iter().enumerate() {
        for r in rows {
            large.push(row as u32);
            small.push(*r);
        }
    }
    if large.is_empty() {
        return Ok(vec![Vec::new(); candidates.len()]);
    }
    let mut columns = take_columns(batch.columns(), &UInt32Array::from(large))?;
    columns.extend(take_columns(
        store.rows()?.columns(),
        &UInt32Array::from(small),
    )?);
    let pairs = RecordBatch::try_new(Arc::clone(pair_schema), columns)
        .map_err(|e| ColexError::Execution(format!("join filter input failed: {e}")))?;
    let mask = evaluate_predicate(filter, &pairs)?;

    let mut pos = 0;
    let mut accepted = Vec::with_capacity(candidates.len());
    for rows in candidates {
        let mut kept = Vec::new();
        for r in rows {
            if mask.value(pos) {
                kept.push(*r);
            }
            pos += 1;
        }
        accepted.push(kept);
    }
    Ok(accepted)
}

fn take_columns(columns: &[ArrayRef], indices: &UInt32Array) -> Result<Vec<ArrayRef>> {
    columns
        .iter()
        .map(|c| {
            take(c.as_ref(), indices, None)
                .map_err(|e| ColexError::Execution(format!("join take failed: {e}")))
        })
        .collect()
}
