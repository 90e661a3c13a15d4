//! Framing: length-prefix (4 bytes LE) + bincode payload.
//!
//! A clean EOF before the length header means the peer closed the connection; it is never
//! an empty message.

use serde::de::DeserializeOwned;
use serde::Serialize;

pub(crate) const LEN_SIZE: usize = 4;
/// Largest accepted payload. A 512 KiB piece plus envelope fits comfortably.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Encode a message into a single frame: 4 bytes LE length + bincode payload.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(msg).map_err(FrameEncodeError::Encode)?;
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    let len = payload.len() as u32;
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Error encoding a message into a frame (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Decode a frame payload (the bytes after the length header).
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, FrameDecodeError> {
    bincode::deserialize(payload).map_err(FrameDecodeError)
}

/// Payload bytes that are not a valid message of the expected type.
#[derive(Debug, thiserror::Error)]
#[error("decode error: {0}")]
pub struct FrameDecodeError(#[from] pub bincode::Error);
