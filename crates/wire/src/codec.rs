//! Bounds-checked primitive readers and writers over `bytes` buffers.
//!
//! `Buf::get_*` panics on underflow; every read here checks `remaining()`
//! first and turns a short buffer into [`ColexError::Protocol`].

use bytes::{Buf, BufMut, Bytes};
use colex_common::{ColexError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

fn need(buf: &impl Buf, n: usize, what: &str) -> Result<()> {
    if buf.remaining() < n {
        return Err(ColexError::Protocol(format!(
            "truncated message reading {what}: need {n} bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(())
}

pub fn get_u8(buf: &mut impl Buf, what: &str) -> Result<u8> {
    need(buf, 1, what)?;
    Ok(buf.get_u8())
}

pub fn get_bool(buf: &mut impl Buf, what: &str) -> Result<bool> {
    match get_u8(buf, what)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(ColexError::Protocol(format!(
            "invalid boolean {other} for {what}"
        ))),
    }
}

pub fn get_u16(buf: &mut impl Buf, what: &str) -> Result<u16> {
    need(buf, 2, what)?;
    Ok(buf.get_u16_le())
}

pub fn get_u32(buf: &mut impl Buf, what: &str) -> Result<u32> {
    need(buf, 4, what)?;
    Ok(buf.get_u32_le())
}

pub fn get_i32(buf: &mut impl Buf, what: &str) -> Result<i32> {
    need(buf, 4, what)?;
    Ok(buf.get_i32_le())
}

pub fn get_u64(buf: &mut impl Buf, what: &str) -> Result<u64> {
    need(buf, 8, what)?;
    Ok(buf.get_u64_le())
}

pub fn get_i64(buf: &mut impl Buf, what: &str) -> Result<i64> {
    need(buf, 8, what)?;
    Ok(buf.get_i64_le())
}

pub fn get_i128(buf: &mut impl Buf, what: &str) -> Result<i128> {
    need(buf, 16, what)?;
    Ok(buf.get_i128_le())
}

/// Element count followed by that many elements; the count is checked
/// against the remaining bytes so a corrupt count cannot allocate wildly.
pub fn get_count(buf: &mut impl Buf, min_elem_bytes: usize, what: &str) -> Result<usize> {
    let n = get_u32(buf, what)? as usize;
    need(buf, n.saturating_mul(min_elem_bytes), what)?;
    Ok(n)
}

pub fn put_bytes(buf: &mut impl BufMut, bytes: &[u8]) {
    buf.put_u32_le(bytes.len() as u32);
    buf.put_slice(bytes);
}

pub fn get_bytes(buf: &mut impl Buf, what: &str) -> Result<Bytes> {
    let n = get_u32(buf, what)? as usize;
    need(buf, n, what)?;
    Ok(buf.copy_to_bytes(n))
}

pub fn put_string(buf: &mut impl BufMut, s: &str) {
    put_bytes(buf, s.as_bytes());
}

pub fn get_string(buf: &mut impl Buf, what: &str) -> Result<String> {
    let bytes = get_bytes(buf, what)?;
    String::from_utf8(bytes.to_vec())
        .map_err(|e| ColexError::Protocol(format!("{what} is not utf-8: {e}")))
}

/// Length-prefixed `serde_json` payload.
pub fn put_json<T: Serialize>(buf: &mut impl BufMut, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value)
        .map_err(|e| ColexError::Execution(format!("json encode failed: {e}")))?;
    put_bytes(buf, &bytes);
    Ok(())
}

pub fn get_json<T: DeserializeOwned>(buf: &mut impl Buf, what: &str) -> Result<T> {
    let bytes = get_bytes(buf, what)?;
    serde_json::from_slice(&bytes)
        .map_err(|e| ColexError::Protocol(format!("{what} decode failed: {e}")))
}

/// Presence byte followed by a JSON payload.
pub fn put_opt_json<T: Serialize>(buf: &mut impl BufMut, value: Option<&T>) -> Result<()> {
    match value {
        Some(v) => {
            buf.put_u8(1);
            put_json(buf, v)
        }
        None => {
            buf.put_u8(0);
            Ok(())
        }
    }
}

pub fn get_opt_json<T: DeserializeOwned>(buf: &mut impl Buf, what: &str) -> Result<Option<T>> {
    get_bool(buf, what)?
        .then(|| get_json(buf, what))
        .transpose()
}
