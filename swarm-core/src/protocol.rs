//! Swarm wire protocol: tracker commands, peer-to-peer piece messages and the record
//! summaries carried in replies.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::error::{PieceError, RegistryError};
use crate::ids::{FileId, GroupId, PeerId};
use crate::piece::Bitmap;

/// Default tracker TCP port.
pub const DEFAULT_TRACKER_PORT: u16 = 45000;

/// How much of a file a holder advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Holding {
    /// At least one piece.
    Partial,
    /// Every piece.
    Seed,
}

/// Commands a peer sends to the tracker. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackerRequest {
    /// Create an account. An unspecified IP in `transfer_addr` is replaced by the connection's remote IP.
    Register {
        username: String,
        secret: String,
        transfer_addr: SocketAddr,
    },
    Login {
        peer_id: PeerId,
        secret: String,
    },
    Logout,
    CreateGroup,
    ListGroups,
    JoinGroup {
        group_id: GroupId,
    },
    /// Pending join requests; leader only.
    ListJoinRequests {
        group_id: GroupId,
    },
    ReplyJoinRequest {
        group_id: GroupId,
        peer_id: PeerId,
        approve: bool,
    },
    /// Announce a complete local file.
    UploadFile {
        filename: String,
        size: u64,
    },
    ListFiles {
        group_id: GroupId,
    },
    /// Ask for the holders of a file the caller may see.
    DownloadFile {
        file_id: FileId,
    },
    LeaveGroup {
        group_id: GroupId,
    },
    /// Announce partial possession or completion of a downloaded file.
    ReportHolding {
        file_id: FileId,
        holding: Holding,
    },
    /// Close the tracker connection.
    Exit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSummary {
    pub group_id: GroupId,
    pub leader: PeerId,
    /// Members in join order; the leader is first.
    pub members: Vec<PeerId>,
    pub pending: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSummary {
    pub file_id: FileId,
    pub filename: String,
    pub size: u64,
    pub piece_count: u32,
    pub seeds: usize,
    pub holders: usize,
}

/// Where to reach a holder's transfer server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEndpoint {
    pub peer_id: PeerId,
    pub addr: SocketAddr,
    pub holding: Holding,
}

/// Result of a successful `LeaveGroup`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaveOutcome {
    Left,
    /// The leader left; leadership passed to the next member by join order.
    LeaderPromoted { new_leader: PeerId },
    /// The leader was the last member.
    Dissolved,
}

/// Tracker replies. One success variant per command; every rejection is `Rejected`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackerResponse {
    Registered { peer_id: PeerId },
    LoggedIn { peer_id: PeerId },
    LoggedOut,
    GroupCreated { group_id: GroupId },
    Groups(Vec<GroupSummary>),
    JoinRequested { group_id: GroupId },
    JoinRequests { group_id: GroupId, pending: Vec<PeerId> },
    JoinResolved { group_id: GroupId, peer_id: PeerId, approved: bool },
    FileAnnounced(FileSummary),
    Files { group_id: GroupId, files: Vec<FileSummary> },
    FileSources { file: FileSummary, peers: Vec<PeerEndpoint> },
    LeftGroup { group_id: GroupId, outcome: LeaveOutcome },
    HoldingReported { file_id: FileId, holding: Holding },
    Goodbye,
    Rejected(RegistryError),
    /// Frame arrived but did not decode; the connection stays open.
    Malformed { reason: String },
}

/// Peer-to-peer requests to a transfer server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRequest {
    Piece { file_id: FileId, piece_index: u32 },
    Bitmap { file_id: FileId },
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerResponse {
    Piece {
        file_id: FileId,
        piece_index: u32,
        data: Vec<u8>,
    },
    Bitmap {
        file_id: FileId,
        bitmap: Bitmap,
    },
    Rejected(PieceError),
    Malformed {
        reason: String,
    },
}
