//! Execution-layer primitives shared by the batch executor and the wire codec.
//!
//! Architecture role:
//! - serializable expression trees and their compilation to Arrow kernels
//! - column kinds, scalar values and row cursors over row groups
//! - Arrow IPC framing for row groups shipped in messages
//!
//! Key modules:
//! - [`expr`]
//! - [`expressions`]
//! - [`functions`]
//! - [`column`]
//! - [`row`]

pub mod column;
pub mod expr;
pub mod expressions;
pub mod functions;
pub mod ipc;
pub mod row;
pub mod scalar;

// Re-export only what you want at the crate root (no globs).
pub use column::{scalar_keys, ColumnKind};
pub use expr::{BinaryOp, Expr, LiteralValue};
pub use expressions::{compile_expr, evaluate_predicate, PhysicalExpr};
pub use functions::{FunctionRegistry, ScalarFunction};
pub use ipc::{
    decode_record_batches_ipc, decode_row_group, encode_record_batches_ipc, encode_row_group,
};
pub use row::{ColumnDesc, RowCursor, RowSchema};
pub use scalar::{encode_group_key, scalar_from_array, scalars_to_array, ScalarValue};
