//! Error taxonomy shared by the tracker, the piece manager and the wire.
//!
//! Every rejection is a concrete variant; `kind()` folds it into one of the five
//! classes clients react to. Both enums travel over the wire inside `Rejected`
//! responses, so they are serde types as well as `std::error::Error`s.

use serde::{Deserialize, Serialize};

use crate::ids::{FileId, GroupId, PeerId};
use crate::membership::JoinState;

/// Coarse error class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Unknown peer, group or file id.
    NotFound,
    /// Action needs leadership, membership or a login that is not held.
    NotAuthorized,
    /// Request conflicts with current state (double join, bad index, ...).
    InvalidState,
    /// Requested piece or file is not held by the contacted peer.
    Unavailable,
    /// Connection dropped or frame malformed.
    Transport,
}

/// Rejection of a tracker command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum RegistryError {
    #[error("{0} not found")]
    PeerNotFound(PeerId),
    #[error("{0} not found")]
    GroupNotFound(GroupId),
    #[error("{0} not found")]
    FileNotFound(FileId),
    #[error("username {0:?} is already registered")]
    DuplicateUsername(String),
    #[error("bad credentials for {0}")]
    BadCredentials(PeerId),
    #[error("not logged in")]
    NotLoggedIn,
    #[error("{peer} is not authorized for this operation on {group}")]
    NotAuthorized { peer: PeerId, group: GroupId },
    #[error("{peer} shares no group with any holder of {file}")]
    FileNotVisible { peer: PeerId, file: FileId },
    #[error("file of {size} bytes exceeds the {max}-byte limit")]
    FileTooLarge { size: u64, max: u64 },
    #[error("{peer} is already a member of {group}")]
    AlreadyMember { peer: PeerId, group: GroupId },
    #[error("{peer} already has a pending request for {group}")]
    AlreadyPending { peer: PeerId, group: GroupId },
    #[error("{peer} has no pending request for {group}")]
    NoSuchRequest { peer: PeerId, group: GroupId },
    #[error("invalid membership transition from {from:?} for {peer} in {group}")]
    InvalidTransition {
        peer: PeerId,
        group: GroupId,
        from: JoinState,
    },
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::PeerNotFound(_)
            | RegistryError::GroupNotFound(_)
            | RegistryError::FileNotFound(_) => ErrorKind::NotFound,
            RegistryError::BadCredentials(_)
            | RegistryError::NotLoggedIn
            | RegistryError::NotAuthorized { .. }
            | RegistryError::FileNotVisible { .. } => ErrorKind::NotAuthorized,
            RegistryError::DuplicateUsername(_)
            | RegistryError::FileTooLarge { .. }
            | RegistryError::AlreadyMember { .. }
            | RegistryError::AlreadyPending { .. }
            | RegistryError::NoSuchRequest { .. }
            | RegistryError::InvalidTransition { .. } => ErrorKind::InvalidState,
        }
    }
}

/// Rejection from the local piece manager or a remote transfer server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum PieceError {
    #[error("{0} is not in the local catalog")]
    UnknownFile(FileId),
    #[error("piece {piece_index} out of range for {file_id} ({piece_count} pieces)")]
    IndexOutOfRange {
        file_id: FileId,
        piece_index: u32,
        piece_count: u32,
    },
    #[error("piece {piece_index} of {file_id} not available")]
    PieceNotAvailable { file_id: FileId, piece_index: u32 },
    #[error("storage error: {0}")]
    Storage(String),
}

impl PieceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PieceError::UnknownFile(_) => ErrorKind::NotFound,
            PieceError::IndexOutOfRange { .. } => ErrorKind::InvalidState,
            PieceError::PieceNotAvailable { .. } | PieceError::Storage(_) => ErrorKind::Unavailable,
        }
    }
}
