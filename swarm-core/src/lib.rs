//! Swarm protocol core.
//! Registry, piece bookkeeping and scheduling are pure; `transport` adds async framing helpers
//! over any `AsyncRead`/`AsyncWrite` so the tracker and peer binaries share one codec.

pub mod error;
pub mod ids;
pub mod membership;
pub mod piece;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod transport;
pub mod wire;

pub use error::{ErrorKind, PieceError, RegistryError};
pub use ids::{FileId, GroupId, PeerId};
pub use piece::{Bitmap, PieceManager, PIECE_SIZE};
pub use protocol::{Holding, PeerRequest, PeerResponse, TrackerRequest, TrackerResponse};
pub use registry::Registry;
pub use wire::{encode_frame, FrameDecodeError, FrameEncodeError};
