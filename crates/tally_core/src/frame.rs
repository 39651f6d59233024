//! Wire framing: one message is `(tag: u16, length: u32, payload)`.
//!
//! Both integers are big-endian. The handshake preamble (a single byte with
//! the dialing party's identity) precedes the first frame on outbound
//! connections and is handled by the connection, not here.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Sequence tag as carried on the wire.
pub type Tag = u16;

/// Size of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 6;

/// Default upper bound on a single payload (64 MiB).
pub const DEFAULT_MAX_PAYLOAD: u32 = 64 * 1024 * 1024;

/// A decoded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: Tag,
    pub payload: Bytes,
}

/// Encode one message: 6-byte header followed by the payload.
pub fn encode(tag: Tag, payload: &[u8]) -> Result<Bytes, ProtocolError> {
    let len = u32::try_from(payload.len()).map_err(|_| ProtocolError::PayloadTooLarge {
        len: payload.len() as u64,
        max: u32::MAX,
    })?;
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u16(tag);
    buf.put_u32(len);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Try to parse one message from the front of `buf`.
///
/// Returns `Ok(None)` when the header or payload is not yet complete; nothing
/// is consumed in that case. On success returns the frame and the number of
/// bytes it occupied.
pub fn decode(buf: &[u8], max_payload: u32) -> Result<Option<(Frame, usize)>, ProtocolError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let tag = u16::from_be_bytes([buf[0], buf[1]]);
    let len = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]);
    if len > max_payload {
        return Err(ProtocolError::PayloadTooLarge {
            len: u64::from(len),
            max: max_payload,
        });
    }

    let total = HEADER_LEN + len as usize;
    if buf.len() < total {
        return Ok(None);
    }
    let payload = Bytes::copy_from_slice(&buf[HEADER_LEN..total]);
    Ok(Some((Frame { tag, payload }, total)))
}

/// Drain every complete frame from an accumulation buffer, leaving any
/// trailing partial frame in place.
pub fn drain(buf: &mut BytesMut, max_payload: u32) -> Result<Vec<Frame>, ProtocolError> {
    let mut frames = Vec::new();
    while let Some((frame, used)) = decode(&buf[..], max_payload)? {
        buf.advance(used);
        frames.push(frame);
    }
    Ok(frames)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
