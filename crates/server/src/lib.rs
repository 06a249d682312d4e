//! Worker-side session handling for colex.
//!
//! [`BatchService`] maps decoded commands onto batch groups and fair
//! scheduler jobs; [`serve`] runs the blocking TCP session loop the
//! `colex-worker` binary is built on.

mod service;
mod session;

pub use service::BatchService;
pub use session::{serve, serve_connection, serve_stream};
