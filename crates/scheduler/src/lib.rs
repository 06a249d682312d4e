//! Weighted fair job scheduler.
//!
//! Worker threads pick jobs from per-transaction FIFO queues, always serving
//! the transaction with the least accumulated weight. Threads blocked on a
//! full send queue are reported back through [`BlockedThreads`] so the pool
//! can temporarily grow beyond its default size.

pub mod job;
pub mod pool;

pub use job::{functor, Job, JobFunctor, JobStatus};
pub use pool::{BlockedThreads, FairScheduler, RESCHEDULE_DELAY};
