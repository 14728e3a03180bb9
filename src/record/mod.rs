//! On-disk recording format.
//!
//! ```text
//! header  := "TRPL" version:u8 session:[u8; 16]
//! record  := count:u8 (1 = request only, 2 = request + response) message{count}
//!          | 0 (segment mark: an appended run starts here)
//! message := direction:u8 stream:u64 seq:u64 offset_ns:u64
//!            meta_count:u16 (key_len:u16 key value_len:u16 value){meta_count}
//!            payload_len:u32 payload
//! ```
//!
//! All integers are big-endian. `offset_ns` is relative to the first record
//! written in the session, so a recording can be replayed with its original
//! pacing. Appending to a recording writes a segment mark first; offsets
//! after the mark restart from the first record of the appended run. Records are read one at a time; a recording never has to fit in
//! memory.

mod reader;
mod writer;

pub use reader::{Entry, RecordReader};
pub use writer::RecordWriter;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ReplayError;
use crate::protocol::{Direction, Message, MessageId, Meta, StreamId};

pub const MAGIC: &[u8; 4] = b"TRPL";
pub const VERSION: u8 = 1;
pub const HEADER_LEN: usize = MAGIC.len() + 1 + 16;

/// Larger payloads are treated as corruption.
pub const MAX_PAYLOAD_BYTES: usize = 64 * 1024 * 1024;

/// Record count byte that starts an appended segment.
pub(crate) const SEGMENT_MARK: u8 = 0;

const DIRECTION_REQUEST: u8 = 0;
const DIRECTION_RESPONSE: u8 = 1;

/// Serialize the file header.
pub fn encode_header(session: uuid::Uuid) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[..4].copy_from_slice(MAGIC);
    header[4] = VERSION;
    header[5..].copy_from_slice(session.as_bytes());
    header
}

/// Validate a file header and return its session ID.
pub fn decode_header(header: &[u8; HEADER_LEN]) -> Result<uuid::Uuid, ReplayError> {
    if &header[..4] != MAGIC {
        return Err(ReplayError::Recording("not a recording (bad magic)".into()));
    }
    if header[4] != VERSION {
        return Err(ReplayError::Recording(format!(
            "unsupported recording version {}",
            header[4]
        )));
    }
    let mut session = [0u8; 16];
    session.copy_from_slice(&header[5..]);
    Ok(uuid::Uuid::from_bytes(session))
}

/// Append one message entry to `buf`.
pub(crate) fn encode_message(
    buf: &mut BytesMut,
    message: &Message,
    base_ns: u64,
) -> Result<(), ReplayError> {
    let payload = message.payload();
    if payload.len() > MAX_PAYLOAD_BYTES {
        return Err(ReplayError::Recording(format!(
            "payload of {} bytes exceeds the {} byte limit",
            payload.len(),
            MAX_PAYLOAD_BYTES
        )));
    }
    let meta_count = u16::try_from(message.meta().len())
        .map_err(|_| ReplayError::Recording("too many metadata entries".into()))?;

    buf.put_u8(match message.direction() {
        Direction::Request => DIRECTION_REQUEST,
        Direction::Response => DIRECTION_RESPONSE,
    });
    buf.put_u64(message.id().stream.as_u64());
    buf.put_u64(message.id().seq);
    buf.put_u64(message.timestamp_ns().saturating_sub(base_ns));
    buf.put_u16(meta_count);
    for (key, value) in message.meta() {
        put_str(buf, key)?;
        put_str(buf, value)?;
    }
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    Ok(())
}

fn put_str(buf: &mut BytesMut, s: &str) -> Result<(), ReplayError> {
    let len = u16::try_from(s.len())
        .map_err(|_| ReplayError::Recording("metadata entry longer than 65535 bytes".into()))?;
    buf.put_u16(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

/// Fixed-size prefix of a message entry, before metadata.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EntryHead {
    pub direction: Direction,
    pub id: MessageId,
    pub offset_ns: u64,
    pub meta_count: u16,
}

pub(crate) const ENTRY_HEAD_LEN: usize = 1 + 8 + 8 + 8 + 2;

pub(crate) fn decode_entry_head(mut raw: &[u8]) -> Result<EntryHead, ReplayError> {
    let direction = match raw.get_u8() {
        DIRECTION_REQUEST => Direction::Request,
        DIRECTION_RESPONSE => Direction::Response,
        other => {
            return Err(ReplayError::Recording(format!(
                "invalid direction byte {other}"
            )))
        }
    };
    let stream = StreamId::from_raw(raw.get_u64());
    let seq = raw.get_u64();
    let offset_ns = raw.get_u64();
    let meta_count = raw.get_u16();
    Ok(EntryHead {
        direction,
        id: MessageId::new(stream, seq),
        offset_ns,
        meta_count,
    })
}

pub(crate) fn build_message(head: EntryHead, meta: &Meta, payload: Bytes) -> Message {
    Message::new(head.id, head.direction, payload, head.offset_ns).with_meta_map(meta)
}
