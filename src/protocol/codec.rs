//! Frame layout: `[len: u32 LE][crc32: u32 LE][json payload]`.

use super::messages::Envelope;
use crate::error::{Error, Result};

pub const FRAME_HEADER_LEN: usize = 8;
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

pub fn encode(envelope: &Envelope) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(envelope)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(Error::Corrupt("frame exceeds maximum length"));
    }
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

pub fn decode(frame: &[u8]) -> Result<Envelope> {
    if frame.len() < FRAME_HEADER_LEN {
        return Err(Error::Corrupt("frame shorter than header"));
    }
    let len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    let crc = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
    let payload = &frame[FRAME_HEADER_LEN..];
    if payload.len() != len {
        return Err(Error::Corrupt("frame length mismatch"));
    }
    if crc32fast::hash(payload) != crc {
        return Err(Error::Corrupt("frame checksum mismatch"));
    }
    Ok(serde_json::from_slice(payload)?)
}
