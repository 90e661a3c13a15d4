//! Swarm peer: tracker session, local piece storage and the transfer server other peers
//! download from.

pub mod client;
pub mod command;
pub mod config;
pub mod storage;
pub mod transfer;

pub use client::{ClientError, DownloadReport, Peer, TrackerClient};
pub use storage::PieceStore;
pub use transfer::{TransferConnection, TransferServer};
