//! Row schemas and row cursors over columnar row groups.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef};
use arrow::record_batch::RecordBatch;
use arrow_schema::{Field, Schema, SchemaRef};
use colex_common::{ColexError, Result};
use serde::{Deserialize, Serialize};

use crate::column::ColumnKind;
use crate::scalar::{scalar_from_array, ScalarValue};

/// Name and kind of one row-group column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDesc {
    pub name: String,
    pub kind: ColumnKind,
}

impl ColumnDesc {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Read-only row layout shared by every cursor over a row group.
#[derive(Debug, Clone, PartialEq)]
pub struct RowSchema {
    columns: Vec<ColumnDesc>,
    arrow: SchemaRef,
}

impl RowSchema {
    pub fn new(columns: Vec<ColumnDesc>) -> Result<Self> {
        for c in &columns {
            c.kind.validate()?;
        }
        let fields: Vec<Field> = columns
            .iter()
            .map(|c| Field::new(&c.name, c.kind.data_type(), true))
            .collect();
        Ok(Self {
            columns,
            arrow: Arc::new(Schema::new(fields)),
        })
    }

    pub fn from_arrow(schema: &SchemaRef) -> Result<Self> {
        let columns = schema
            .fields()
            .iter()
            .map(|f| Ok(ColumnDesc::new(f.name(), ColumnKind::from_data_type(f.data_type())?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            columns,
            arrow: Arc::clone(schema),
        })
    }

    pub fn arrow_schema(&self) -> &SchemaRef {
        &self.arrow
    }

    pub fn columns(&self) -> &[ColumnDesc] {
        &self.columns
    }

    pub fn column(&self, i: usize) -> &ColumnDesc {
        &self.columns[i]
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Sum of fixed column widths; used for memory estimates.
    pub fn row_width(&self) -> usize {
        self.columns.iter().map(|c| c.kind.width() as usize).sum()
    }

    /// Schema of `self` followed by `other`, as seen by post-join filters.
    pub fn concat(&self, other: &RowSchema) -> RowSchema {
        let columns: Vec<ColumnDesc> = self
            .columns
            .iter()
            .chain(other.columns.iter())
            .cloned()
            .collect();
        let fields: Vec<Arc<Field>> = self
            .arrow
            .fields()
            .iter()
            .chain(other.arrow.fields().iter())
            .cloned()
            .collect();
        RowSchema {
            columns,
            arrow: Arc::new(Schema::new(fields)),
        }
    }

    /// Wrap columns into a row group of this schema.
    pub fn batch(&self, columns: Vec<ArrayRef>) -> Result<RecordBatch> {
        RecordBatch::try_new(Arc::clone(&self.arrow), columns)
            .map_err(|e| ColexError::Execution(format!("row group build failed: {e}")))
    }

    pub fn empty_batch(&self) -> RecordBatch {
        RecordBatch::new_empty(Arc::clone(&self.arrow))
    }
}

/// Position within a row group: buffer handle, row offset and shared schema.
#[derive(Debug, Clone)]
pub struct RowCursor {
    batch: RecordBatch,
    row: usize,
    schema: Arc<RowSchema>,
}

impl RowCursor {
    pub fn new(batch: RecordBatch, schema: Arc<RowSchema>) -> Result<Self> {
        if batch.num_columns() != schema.len() {
            return Err(ColexError::Execution(format!(
                "row group has {} columns, schema expects {}",
                batch.num_columns(),
                schema.len()
            )));
        }
        Ok(Self {
            batch,
            row: 0,
            schema,
        })
    }

    pub fn row(&self) -> usize {
        self.row
    }

    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn schema(&self) -> &Arc<RowSchema> {
        &self.schema
    }

    pub fn is_valid(&self) -> bool {
        self.row < self.batch.num_rows()
    }

    pub fn seek(&mut self, row: usize) {
        self.row = row;
    }

    /// Step to the next row; returns whether the cursor still points at one.
    pub fn advance(&mut self) -> bool {
        self.row += 1;
        self.is_valid()
    }

    pub fn is_null(&self, col: usize) -> bool {
        self.batch.column(col).is_null(self.row)
    }

    pub fn value(&self, col: usize) -> Result<ScalarValue> {
        if !self.is_valid() {
            return Err(ColexError::Execution(format!(
                "row cursor at {} is past the end of a {}-row group",
                self.row,
                self.batch.num_rows()
            )));
        }
        scalar_from_array(self.batch.column(col), self.row)
    }

    /// Values of `cols` at the current row.
    pub fn values(&self, cols: &[usize]) -> Result<Vec<ScalarValue>> {
        cols.iter().map(|c| self.value(*c)).collect()
    }
}

#[cfg(test)]
mod tests {
    use arrow::array::{Int64Array, StringArray};

    use super::*;

    fn schema() -> Arc<RowSchema> {
        Arc::new(
            RowSchema::new(vec![
                ColumnDesc::new("k", ColumnKind::BIGINT),
                ColumnDesc::new("v", ColumnKind::LongString),
            ])
            .expect("schema"),
        )
    }

    #[test]
    fn cursor_walks_rows_and_reads_values() {
        let schema = schema();
        let batch = schema
            .batch(vec![
                Arc::new(Int64Array::from(vec![1, 2])),
                Arc::new(StringArray::from(vec![Some("a"), None])),
            ])
            .expect("batch");
        let mut cursor = RowCursor::new(batch, Arc::clone(&schema)).expect("cursor");
        assert_eq!(cursor.value(0).expect("k"), ScalarValue::Int64(1));
        assert!(cursor.advance());
        assert!(cursor.is_null(1));
        assert!(!cursor.advance());
        assert!(cursor.value(0).is_err());
    }

    #[test]
    fn concat_appends_columns() {
        let s = schema();
        let joined = s.concat(&s);
        assert_eq!(joined.len(), 4);
        assert_eq!(joined.arrow_schema().fields().len(), 4);
        assert_eq!(joined.row_width(), 32);
    }
}
