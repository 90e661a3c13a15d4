//! Peer-to-peer piece transfer: the server every peer runs for its holdings, and the
//! outbound connection a downloader opens to each source.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use swarm_core::protocol::{PeerRequest, PeerResponse};
use swarm_core::transport::{read_frame, read_frame_within, write_frame, TransportError};
use swarm_core::{Bitmap, FileId, PieceError, PieceManager};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::storage::PieceStore;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("connect to {addr} failed: {source}")]
    Connect { addr: SocketAddr, source: io::Error },
    #[error("source refused: {0}")]
    Rejected(PieceError),
    #[error("source could not decode request: {0}")]
    Malformed(String),
    #[error("source closed the connection")]
    Closed,
    #[error("unexpected reply to {0}")]
    Unexpected(&'static str),
}

pub struct TransferServer {
    listener: TcpListener,
    pieces: Arc<PieceManager>,
    store: Arc<PieceStore>,
    idle_timeout: Duration,
}

impl TransferServer {
    pub async fn bind(
        addr: SocketAddr,
        pieces: Arc<PieceManager>,
        store: Arc<PieceStore>,
        idle_timeout: Duration,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            pieces,
            store,
            idle_timeout,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> io::Result<()> {
        info!(addr = %self.listener.local_addr()?, "transfer server listening");
        loop {
            let (stream, remote) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let pieces = self.pieces.clone();
            let store = self.store.clone();
            let idle = self.idle_timeout;
            tokio::spawn(async move {
                match serve(stream, &pieces, &store, idle).await {
                    Ok(()) => debug!(%remote, "transfer connection closed"),
                    Err(e) => debug!(%remote, error = %e, "transfer connection dropped"),
                }
            });
        }
    }
}

async fn serve(
    mut stream: TcpStream,
    pieces: &PieceManager,
    store: &PieceStore,
    idle: Duration,
) -> Result<(), TransportError> {
    loop {
        let request: PeerRequest = match read_frame_within(&mut stream, idle).await {
            Ok(Some(req)) => req,
            Ok(None) => return Ok(()),
            Err(e) if e.is_recoverable() => {
                let reply = PeerResponse::Malformed {
                    reason: e.to_string(),
                };
                write_frame(&mut stream, &reply).await?;
                continue;
            }
            Err(e) => return Err(e),
        };
        let response = match request {
            PeerRequest::Piece {
                file_id,
                piece_index,
            } => serve_piece(pieces, store, file_id, piece_index).await,
            PeerRequest::Bitmap { file_id } => match pieces.bitmap_for(file_id) {
                Ok(bitmap) => PeerResponse::Bitmap { file_id, bitmap },
                Err(e) => PeerResponse::Rejected(e),
            },
            PeerRequest::Close => return Ok(()),
        };
        write_frame(&mut stream, &response).await?;
    }
}

async fn serve_piece(
    pieces: &PieceManager,
    store: &PieceStore,
    file_id: FileId,
    piece_index: u32,
) -> PeerResponse {
    if let Err(e) = pieces.piece_to_serve(file_id, piece_index) {
        debug!(%file_id, piece_index, error = %e, "refusing piece");
        return PeerResponse::Rejected(e);
    }
    match store.read_piece(file_id, piece_index).await {
        Ok(data) => PeerResponse::Piece {
            file_id,
            piece_index,
            data,
        },
        Err(e) => {
            warn!(%file_id, piece_index, error = %e, "piece read failed");
            PeerResponse::Rejected(PieceError::Storage(e.to_string()))
        }
    }
}

/// One outbound connection to a source peer's transfer server. Connecting and every reply
/// must complete within `timeout`, so a stalled source surfaces as an error.
pub struct TransferConnection {
    stream: TcpStream,
    addr: SocketAddr,
    timeout: Duration,
}

impl TransferConnection {
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self, TransferError> {
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(TransferError::Connect { addr, source }),
            Err(_) => {
                return Err(TransferError::Connect {
                    addr,
                    source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                })
            }
        };
        Ok(Self {
            stream,
            addr,
            timeout,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn call(&mut self, request: &PeerRequest) -> Result<PeerResponse, TransferError> {
        write_frame(&mut self.stream, request).await?;
        match read_frame_within(&mut self.stream, self.timeout).await? {
            Some(PeerResponse::Rejected(e)) => Err(TransferError::Rejected(e)),
            Some(PeerResponse::Malformed { reason }) => Err(TransferError::Malformed(reason)),
            Some(resp) => Ok(resp),
            None => Err(TransferError::Closed),
        }
    }

    pub async fn fetch_bitmap(&mut self, file_id: FileId) -> Result<Bitmap, TransferError> {
        match self.call(&PeerRequest::Bitmap { file_id }).await? {
            PeerResponse::Bitmap { file_id: f, bitmap } if f == file_id => Ok(bitmap),
            _ => Err(TransferError::Unexpected("bitmap request")),
        }
    }

    pub async fn fetch_piece(&mut self, file_id: FileId, piece_index: u32) -> Result<Vec<u8>, TransferError> {
        let request = PeerRequest::Piece {
            file_id,
            piece_index,
        };
        match self.call(&request).await? {
            PeerResponse::Piece {
                file_id: f,
                piece_index: i,
                data,
            } if f == file_id && i == piece_index => Ok(data),
            _ => Err(TransferError::Unexpected("piece request")),
        }
    }

    /// Best effort; the server also treats a dropped socket as close.
    pub async fn close(mut self) {
        let _ = write_frame(&mut self.stream, &PeerRequest::Close).await;
    }
}
