//! Positional store for small-side rows of a typeless (row group) join.

use std::sync::OnceLock;

use arrow::compute::concat_batches;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use colex_common::{ColexError, Result};
use parking_lot::Mutex;

/// Small-side rows received in chunks, each tagged with the position of its
/// first row. Sealing orders the chunks and requires them to tile `0..n`.
#[derive(Debug)]
pub struct SmallRowStore {
    schema: SchemaRef,
    chunks: Mutex<Vec<(u32, RecordBatch)>>,
    sealed: OnceLock<RecordBatch>,
}

impl SmallRowStore {
    pub fn new(schema: SchemaRef) -> Self {
        Self {
            schema,
            chunks: Mutex::new(Vec::new()),
            sealed: OnceLock::new(),
        }
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn push(&self, start_pos: u32, rows: RecordBatch) -> Result<()> {
        if self.sealed.get().is_some() {
            return Err(ColexError::Execution(
                "small-side rows added after the join was completed".to_string(),
            ));
        }
        if rows.schema().fields() != self.schema.fields() {
            return Err(ColexError::Protocol(format!(
                "small-side row group at {start_pos} does not match the join schema"
            )));
        }
        self.chunks.lock().push((start_pos, rows));
        Ok(())
    }

    /// Rows received so far.
    pub fn row_count(&self) -> usize {
        if let Some(rows) = self.sealed.get() {
            return rows.num_rows();
        }
        self.chunks.lock().iter().map(|(_, b)| b.num_rows()).sum()
    }

    /// Concatenate the chunks in position order. Idempotent.
    pub fn seal(&self) -> Result<()> {
        if self.sealed.get().is_some() {
            return Ok(());
        }
        let mut chunks = self.chunks.lock();
        chunks.sort_by_key(|(pos, _)| *pos);
        let mut expected = 0_usize;
        for (pos, batch) in chunks.iter() {
            if *pos as usize != expected {
                return Err(ColexError::Protocol(format!(
                    "small-side rows are not contiguous: expected position {expected}, got {pos}"
                )));
            }
            expected += batch.num_rows();
        }
        let batches: Vec<RecordBatch> = chunks.drain(..).map(|(_, b)| b).collect();
        let rows = concat_batches(&self.schema, &batches)
            .map_err(|e| ColexError::Execution(format!("small-side concat failed: {e}")))?;
        let _ = self.sealed.set(rows);
        Ok(())
    }

    /// Sealed rows; an error before [`SmallRowStore::seal`].
    pub fn rows(&self) -> Result<&RecordBatch> {
        self.sealed.get().ok_or_else(|| {
            ColexError::Execution("small-side rows read before the join was completed".to_string())
        })
    }
}
