//! Output connections results are written to.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use colex_common::{ColexError, ConnectionId, Result};
use parking_lot::Mutex;

use crate::message::Message;

/// Destination of encoded result frames.
///
/// Implementations serialize concurrent writers internally; one
/// `write_frame` call writes one whole frame.
pub trait OutputConnection: Send + Sync {
    fn id(&self) -> ConnectionId;
    fn write_frame(&self, frame: &[u8]) -> Result<()>;
}

/// Connection over any blocking byte stream (a `TcpStream` in the worker).
pub struct StreamConnection<W: Write + Send> {
    id: ConnectionId,
    writer: Mutex<W>,
}

impl<W: Write + Send> StreamConnection<W> {
    pub fn new(id: ConnectionId, writer: W) -> Self {
        Self {
            id,
            writer: Mutex::new(writer),
        }
    }
}

impl<W: Write + Send> OutputConnection for StreamConnection<W> {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn write_frame(&self, frame: &[u8]) -> Result<()> {
        let mut w = self.writer.lock();
        w.write_all(frame)
            .and_then(|()| w.flush())
            .map_err(|e| ColexError::Transport(format!("write to {} failed: {e}", self.id)))
    }
}

/// In-process connection that keeps every frame it receives.
#[derive(Default)]
pub struct MemoryConnection {
    id: ConnectionId,
    frames: Mutex<Vec<Bytes>>,
    failing: AtomicBool,
}

impl MemoryConnection {
    pub fn new(id: u64) -> Self {
        Self {
            id: ConnectionId(id),
            ..Self::default()
        }
    }

    /// Make subsequent writes fail with a transport error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    pub fn frame_count(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn frames(&self) -> Vec<Bytes> {
        self.frames.lock().clone()
    }

    /// Decode every received frame.
    pub fn messages(&self) -> Result<Vec<Message>> {
        self.frames()
            .into_iter()
            .map(Message::from_frame)
            .collect()
    }
}

impl OutputConnection for MemoryConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn write_frame(&self, frame: &[u8]) -> Result<()> {
        if self.failing.load(Ordering::Acquire) {
            return Err(ColexError::Transport(format!("{} is closed", self.id)));
        }
        self.frames.lock().push(Bytes::copy_from_slice(frame));
        Ok(())
    }
}
