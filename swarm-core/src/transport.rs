//! Async frame I/O over any byte stream, shared by the tracker and the transfer server.

use std::io;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::wire::{self, FrameDecodeError, FrameEncodeError, LEN_SIZE, MAX_FRAME_LEN};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("frame of {0} bytes exceeds limit")]
    TooLarge(u32),
    /// The whole payload was consumed, so the stream is still aligned on a frame boundary.
    #[error("malformed payload: {0}")]
    Malformed(FrameDecodeError),
    #[error("encode error: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("connection idle for {0:?}")]
    Idle(Duration),
}

impl TransportError {
    /// True when the connection can keep serving after replying with an error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TransportError::Malformed(_))
    }
}

/// Read one frame. `Ok(None)` on clean EOF before the length header.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, TransportError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; LEN_SIZE];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(TransportError::TooLarge(len));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    wire::decode_payload(&payload)
        .map(Some)
        .map_err(TransportError::Malformed)
}

/// Like `read_frame`, but gives up after `idle` without a complete frame.
pub async fn read_frame_within<R, T>(
    reader: &mut R,
    idle: Duration,
) -> Result<Option<T>, TransportError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    match tokio::time::timeout(idle, read_frame(reader)).await {
        Ok(r) => r,
        Err(_) => Err(TransportError::Idle(idle)),
    }
}

pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = wire::encode_frame(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::FileId;
    use crate::protocol::PeerRequest;

    #[tokio::test]
    async fn eof_before_header_is_close() {
        let mut empty: &[u8] = &[];
        let got: Option<PeerRequest> = read_frame(&mut empty).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn write_then_read() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let req = PeerRequest::Piece {
            file_id: FileId(2),
            piece_index: 5,
        };
        write_frame(&mut a, &req).await.unwrap();
        write_frame(&mut a, &PeerRequest::Close).await.unwrap();
        drop(a);
        let first: Option<PeerRequest> = read_frame(&mut b).await.unwrap();
        assert_eq!(first, Some(req));
        let second: Option<PeerRequest> = read_frame(&mut b).await.unwrap();
        assert_eq!(second, Some(PeerRequest::Close));
        let end: Option<PeerRequest> = read_frame(&mut b).await.unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn garbage_payload_is_recoverable() {
        let mut bytes = 2u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0xff, 0xff]);
        let follow = wire::encode_frame(&PeerRequest::Close).unwrap();
        bytes.extend_from_slice(&follow);
        let mut reader: &[u8] = &bytes;

        let err = read_frame::<_, PeerRequest>(&mut reader).await.unwrap_err();
        assert!(err.is_recoverable());
        let next: Option<PeerRequest> = read_frame(&mut reader).await.unwrap();
        assert_eq!(next, Some(PeerRequest::Close));
    }

    #[tokio::test]
    async fn oversized_frame_is_fatal() {
        let bytes = (MAX_FRAME_LEN + 1).to_le_bytes();
        let mut reader: &[u8] = &bytes;
        let err = read_frame::<_, PeerRequest>(&mut reader).await.unwrap_err();
        assert!(matches!(err, TransportError::TooLarge(_)));
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn idle_reader_times_out() {
        let (_a, mut b) = tokio::io::duplex(64);
        let err = read_frame_within::<_, PeerRequest>(&mut b, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Idle(_)));
    }
}
