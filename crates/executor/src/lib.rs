//! Batch executor for colex column blocks.
//!
//! Architecture role:
//! - compiles a creation message into a shared plan ([`BatchExecutor::new`])
//! - runs filter steps over column blocks read through a [`BlockSource`]
//! - projects, joins against prebuilt small sides and aggregates row groups
//! - groups executor instances of one batch behind a dispatcher ([`BatchGroup`])
//!
//! Key modules:
//! - `executor`
//! - `group`
//! - `join`
//! - `source`

mod aggregate;
mod executor;
mod filter;
mod group;
mod join;
mod output;
pub mod source;

pub use executor::{BatchExecutor, ExecutorContext, ExecutorState};
pub use group::BatchGroup;
pub use join::{JoinRuntime, Joined};
pub use output::RID_COLUMN;
pub use source::{BlockSource, LoadedBlock, MemoryBlockSource};
