//! Frame and job headers that prefix every message.

use bytes::{Buf, BufMut};
use colex_common::{ColexError, Result, StepId, TxnId, UniqueId};

use crate::codec::{get_u16, get_u32, get_u8, get_bool};

/// Bytes occupied by [`FrameHeader`] on the wire.
pub const FRAME_HEADER_LEN: usize = 12;

/// Interleave marker every frame starts with; used to resynchronise streams.
pub const FRAME_INTERLEAVE: u32 = 0x434f_4c58;

/// Upper bound on a single frame body.
pub const MAX_FRAME_BYTES: u32 = 256 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    CreateBatch = 1,
    RunBatch = 2,
    DestroyBatch = 3,
    AddJoiner = 4,
    EndJoiner = 5,
    Abort = 6,
    FlowControl = 7,
    BatchResult = 8,
}

impl TryFrom<u8> for Command {
    type Error = ColexError;

    fn try_from(v: u8) -> Result<Self> {
        Ok(match v {
            1 => Self::CreateBatch,
            2 => Self::RunBatch,
            3 => Self::DestroyBatch,
            4 => Self::AddJoiner,
            5 => Self::EndJoiner,
            6 => Self::Abort,
            7 => Self::FlowControl,
            8 => Self::BatchResult,
            other => return Err(ColexError::Protocol(format!("unknown command {other}"))),
        })
    }
}

/// `interleave u32 | flags u8 | command u8 | status u16 | size u32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub interleave: u32,
    pub flags: u8,
    pub command: Command,
    /// 0 on success, the error code of a failed result otherwise.
    pub status: u16,
    /// Body bytes following this header.
    pub size: u32,
}

impl FrameHeader {
    pub fn new(command: Command, status: u16, size: u32) -> Self {
        Self {
            interleave: FRAME_INTERLEAVE,
            flags: 0,
            command,
            status,
            size,
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.interleave);
        buf.put_u8(self.flags);
        buf.put_u8(self.command as u8);
        buf.put_u16_le(self.status);
        buf.put_u32_le(self.size);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        let interleave = get_u32(buf, "frame interleave")?;
        if interleave != FRAME_INTERLEAVE {
            return Err(ColexError::Protocol(format!(
                "bad frame interleave marker {interleave:#010x}"
            )));
        }
        let flags = get_u8(buf, "frame flags")?;
        let command = Command::try_from(get_u8(buf, "frame command")?)?;
        let status = get_u16(buf, "frame status")?;
        let size = get_u32(buf, "frame size")?;
        if size > MAX_FRAME_BYTES {
            return Err(ColexError::Protocol(format!(
                "frame of {size} bytes exceeds the {MAX_FRAME_BYTES} byte limit"
            )));
        }
        Ok(Self {
            interleave,
            flags,
            command,
            status,
            size,
        })
    }
}

/// Identity of the job a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobHeader {
    pub session: u32,
    pub step: StepId,
    pub unique: UniqueId,
    /// Transaction and version, present on messages that carry them.
    pub version: Option<(TxnId, u32)>,
}

impl JobHeader {
    pub fn new(session: u32, step: StepId, unique: UniqueId) -> Self {
        Self {
            session,
            step,
            unique,
            version: None,
        }
    }

    pub fn with_version(mut self, txn: TxnId, version: u32) -> Self {
        self.version = Some((txn, version));
        self
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.session);
        buf.put_u32_le(self.step.0);
        buf.put_u32_le(self.unique.0);
        match self.version {
            Some((txn, version)) => {
                buf.put_u8(1);
                buf.put_u32_le(txn.0);
                buf.put_u32_le(version);
            }
            None => buf.put_u8(0),
        }
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        let session = get_u32(buf, "session id")?;
        let step = StepId(get_u32(buf, "step id")?);
        let unique = UniqueId(get_u32(buf, "unique id")?);
        let version = if get_bool(buf, "version flag")? {
            Some((
                TxnId(get_u32(buf, "txn id")?),
                get_u32(buf, "version")?,
            ))
        } else {
            None
        };
        Ok(Self {
            session,
            step,
            unique,
            version,
        })
    }
}
