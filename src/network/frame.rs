//! The wire framing for peer messages. Every message is prefixed by a
//! 4-byte little-endian payload length, counting every byte after itself,
//! followed by the body:
//!
//! len:                  u32 LE
//! id:                   u32 LE
//! in_response_to:       u32 LE
//! waiting_for_response: u8 (0/1)
//! kind_len:             i32 LE
//! kind:                 UTF-8
//! payload_len:          i32 LE
//! payload:              JSON UTF-8
//!
//! A reader buffers bytes per peer until at least 4 bytes are present, then
//! until the full body is available, and only then parses. Remaining bytes
//! stay buffered for the next frame. Malformed frames are dropped without
//! tearing down the connection.

use super::connection::Direction;
use super::message::Message;
use super::NodeId;
use crate::document::Value;
use crate::errdata;
use crate::error::Result;

/// The largest accepted frame body. A peer advertising more than this is
/// sending garbage, and the stream cannot be resynchronized.
pub const MAX_FRAME_LEN: usize = 16 << 20;

/// Encodes a message into a full frame, including the length prefix.
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    let kind = message.kind.as_bytes();
    let payload = message.payload.encode()?;

    let mut frame = Vec::with_capacity(4 + 13 + 8 + kind.len() + payload.len());
    frame.extend_from_slice(&[0; 4]); // length, patched below
    frame.extend_from_slice(&message.id.to_le_bytes());
    frame.extend_from_slice(&message.in_response_to.to_le_bytes());
    frame.push(message.waiting_for_response as u8);
    frame.extend_from_slice(&(kind.len() as i32).to_le_bytes());
    frame.extend_from_slice(kind);
    frame.extend_from_slice(&(payload.len() as i32).to_le_bytes());
    frame.extend_from_slice(&payload);

    let len = (frame.len() - 4) as u32;
    frame[0..4].copy_from_slice(&len.to_le_bytes());
    Ok(frame)
}

/// Extracts the next complete frame body from a receive buffer, leaving any
/// remaining bytes in place. Returns None until a full frame is buffered. A
/// length prefix beyond the frame size limit cannot be resynchronized, so
/// the buffer is discarded.
pub fn extract(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let Some(&[a, b, c, d]) = buffer.get(0..4) else {
        return None;
    };
    let len = u32::from_le_bytes([a, b, c, d]) as usize;
    if len > MAX_FRAME_LEN {
        log::debug!("Dropping oversized frame of {len} bytes");
        buffer.clear();
        return None;
    }
    if buffer.len() < 4 + len {
        return None;
    }
    let body = buffer[4..4 + len].to_vec();
    buffer.drain(..4 + len);
    Some(body)
}

/// Decodes a frame body into a message arriving from the given peer over
/// the given registry direction.
pub fn decode(body: &[u8], address: NodeId, direction: Direction) -> Result<Message> {
    let mut reader = Reader { body, pos: 0 };
    let id = reader.read_u32()?;
    let in_response_to = reader.read_u32()?;
    let waiting_for_response = reader.read_u8()? != 0;
    let kind = String::from_utf8(reader.read_block()?.to_vec())
        .map_err(|e| crate::error::Error::InvalidData(format!("non-UTF-8 kind: {e}")))?;
    let payload = Value::decode(reader.read_block()?)?;
    if reader.pos != body.len() {
        return errdata!("{} trailing bytes after frame body", body.len() - reader.pos);
    }
    Ok(Message { id, in_response_to, waiting_for_response, kind, payload, address, direction })
}

/// A bounds-checked cursor over a frame body.
struct Reader<'a> {
    body: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn read_u8(&mut self) -> Result<u8> {
        let Some(&byte) = self.body.get(self.pos) else {
            return errdata!("frame body truncated at byte {}", self.pos);
        };
        self.pos += 1;
        Ok(byte)
    }

    fn read_u32(&mut self) -> Result<u32> {
        let Some(&[a, b, c, d]) = self.body.get(self.pos..self.pos + 4) else {
            return errdata!("frame body truncated at byte {}", self.pos);
        };
        self.pos += 4;
        Ok(u32::from_le_bytes([a, b, c, d]))
    }

    /// Reads an i32-length-prefixed block of bytes.
    fn read_block(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u32()? as i32;
        if len < 0 {
            return errdata!("negative block length {len}");
        }
        let len = len as usize;
        let Some(bytes) = self.body.get(self.pos..self.pos + len) else {
            return errdata!("block of {len} bytes exceeds frame body");
        };
        self.pos += len;
        Ok(bytes)
    }
}
