//! Binary wire protocol between clients and the batch engine.
//!
//! Every message is a 12-byte [`FrameHeader`] followed by a body. Bodies are
//! little-endian and start with a [`JobHeader`] (creation messages carry the
//! same ids inline). Expressions, schemas and aggregator descriptors travel
//! as length-prefixed JSON; row groups as Arrow IPC streams.
//!
//! Key modules:
//! - [`frame`]
//! - [`message`]
//! - [`types`]
//! - [`connection`]

pub mod codec;
pub mod connection;
pub mod frame;
pub mod message;
pub mod types;

pub use connection::{MemoryConnection, OutputConnection, StreamConnection};
pub use frame::{Command, FrameHeader, JobHeader, FRAME_HEADER_LEN, MAX_FRAME_BYTES};
pub use message::{
    BatchResult, CheckpointRange, CreateBatch, ElementValues, FlowControl, IoCounters, JoinBuild,
    JoinEntries, Message, ResultBody, ResultData, ResultPayload, RidSet, RunBatch,
};
pub use types::{
    AggFunc, AggregateSpec, AggregatorDescriptor, BatchFlags, BoolOp, JoinDescriptor, JoinKey,
    JoinKind, OutputMode, StepDescriptor,
};
