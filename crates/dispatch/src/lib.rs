//! Result dispatch for batch groups.
//!
//! Executors hand encoded result frames to a [`Dispatcher`]; one sender
//! thread per dispatcher writes them out. Enqueuers block while the queue
//! holds too many bytes, and the consumer can meter delivery with
//! flow-control credits.

pub mod dispatcher;

pub use dispatcher::{Dispatcher, ResultMessage, SEND_BATCH_LIMIT};
