//! Hash-join build side for colex batch executors.
//!
//! A join table is filled concurrently by many build jobs, each inserting a
//! slice of the small side, and becomes probe-able only after the
//! completeness check has seen the declared number of entries. The small
//! side's row values are kept next to it in a [`SmallRowStore`], addressed by
//! the positions the table maps keys to.

pub mod rows;
pub mod table;

pub use rows::SmallRowStore;
pub use table::{JoinTable, ScalarJoinTable, TypelessJoinTable, TypelessKey};
