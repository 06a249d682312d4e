//! Arrow IPC stream framing for row groups carried in wire messages.

use std::io::Cursor;
use std::sync::Arc;

use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;
use arrow_schema::Schema;
use colex_common::{ColexError, Result};

/// Encode a set of record batches as Arrow IPC stream bytes.
pub fn encode_record_batches_ipc(schema: &Schema, batches: &[RecordBatch]) -> Result<Vec<u8>> {
    let mut out = Vec::<u8>::new();
    {
        let mut writer = StreamWriter::try_new(&mut out, schema)
            .map_err(|e| ColexError::Execution(format!("ipc writer init failed: {e}")))?;
        for batch in batches {
            writer
                .write(batch)
                .map_err(|e| ColexError::Execution(format!("ipc write failed: {e}")))?;
        }
        writer
            .finish()
            .map_err(|e| ColexError::Execution(format!("ipc finish failed: {e}")))?;
    }
    Ok(out)
}

/// Decode Arrow IPC stream bytes produced by [`encode_record_batches_ipc`].
pub fn decode_record_batches_ipc(bytes: &[u8]) -> Result<Vec<RecordBatch>> {
    let reader = StreamReader::try_new(Cursor::new(bytes), None)
        .map_err(|e| ColexError::Protocol(format!("ipc reader init failed: {e}")))?;
    reader
        .map(|b| b.map_err(|e| ColexError::Protocol(format!("ipc read failed: {e}"))))
        .collect()
}

/// Encode one row group; an empty group still carries its schema.
pub fn encode_row_group(batch: &RecordBatch) -> Result<Vec<u8>> {
    encode_record_batches_ipc(batch.schema_ref(), std::slice::from_ref(batch))
}

/// Decode a single row group, concatenating if the stream holds several.
pub fn decode_row_group(bytes: &[u8]) -> Result<RecordBatch> {
    let reader = StreamReader::try_new(Cursor::new(bytes), None)
        .map_err(|e| ColexError::Protocol(format!("ipc reader init failed: {e}")))?;
    let schema = reader.schema();
    let mut batches = reader
        .map(|b| b.map_err(|e| ColexError::Protocol(format!("ipc read failed: {e}"))))
        .collect::<Result<Vec<_>>>()?;
    if batches.len() <= 1 {
        return Ok(batches
            .pop()
            .unwrap_or_else(|| RecordBatch::new_empty(Arc::clone(&schema))));
    }
    arrow::compute::concat_batches(&schema, &batches)
        .map_err(|e| ColexError::Protocol(format!("row group concat failed: {e}")))
}
