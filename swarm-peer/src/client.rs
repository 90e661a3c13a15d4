//! Tracker client and the peer session built on it.
//!
//! `TrackerClient` is a thin typed wrapper: one method per tracker command, a `Rejected`
//! reply becomes `ClientError::Rejected`. `Peer` adds local state: who is logged in, which
//! files this peer holds, and the download driver that pulls pieces from several sources
//! in parallel.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use swarm_core::piece::LocalFileStatus;
use swarm_core::protocol::{FileSummary, GroupSummary, LeaveOutcome, PeerEndpoint};
use swarm_core::scheduler::{self, Source};
use swarm_core::transport::{read_frame, write_frame, TransportError};
use swarm_core::{
    FileId, GroupId, Holding, PeerId, PieceError, PieceManager, RegistryError, TrackerRequest,
    TrackerResponse,
};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::storage::{PieceStore, StorageError};
use crate::transfer::{TransferConnection, TransferError, TransferServer};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("tracker connection: {0}")]
    Transport(#[from] TransportError),
    #[error("cannot reach tracker at {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("tracker rejected request: {0}")]
    Rejected(#[from] RegistryError),
    #[error("tracker could not decode request: {0}")]
    Malformed(String),
    #[error("tracker closed the connection")]
    Disconnected,
    #[error("unexpected tracker reply to {0}")]
    Unexpected(&'static str),
    #[error("not logged in")]
    NotLoggedIn,
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("piece: {0}")]
    Piece(#[from] PieceError),
    #[error("transfer: {0}")]
    Transfer(#[from] TransferError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{missing} pieces of {file_id} are held by no reachable source")]
    NoSources { file_id: FileId, missing: usize },
}

/// Connection to the tracker's command endpoint.
pub struct TrackerClient {
    stream: TcpStream,
}

macro_rules! expect_reply {
    ($resp:expr, $cmd:literal, $pat:pat => $out:expr) => {
        match $resp {
            $pat => Ok($out),
            _ => Err(ClientError::Unexpected($cmd)),
        }
    };
}

impl TrackerClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| ClientError::Connect { addr, source })?;
        Ok(Self { stream })
    }

    /// Send one command and wait for its reply. Commands are answered strictly in order.
    pub async fn call(&mut self, request: &TrackerRequest) -> Result<TrackerResponse, ClientError> {
        write_frame(&mut self.stream, request).await?;
        match read_frame(&mut self.stream).await? {
            Some(TrackerResponse::Rejected(e)) => Err(ClientError::Rejected(e)),
            Some(TrackerResponse::Malformed { reason }) => Err(ClientError::Malformed(reason)),
            Some(resp) => Ok(resp),
            None => Err(ClientError::Disconnected),
        }
    }

    pub async fn register(
        &mut self,
        username: &str,
        secret: &str,
        transfer_addr: SocketAddr,
    ) -> Result<PeerId, ClientError> {
        let req = TrackerRequest::Register {
            username: username.to_string(),
            secret: secret.to_string(),
            transfer_addr,
        };
        expect_reply!(self.call(&req).await?, "register",
            TrackerResponse::Registered { peer_id } => peer_id)
    }

    pub async fn login(&mut self, peer_id: PeerId, secret: &str) -> Result<PeerId, ClientError> {
        let req = TrackerRequest::Login {
            peer_id,
            secret: secret.to_string(),
        };
        expect_reply!(self.call(&req).await?, "login",
            TrackerResponse::LoggedIn { peer_id } => peer_id)
    }

    pub async fn logout(&mut self) -> Result<(), ClientError> {
        expect_reply!(self.call(&TrackerRequest::Logout).await?, "logout",
            TrackerResponse::LoggedOut => ())
    }

    pub async fn create_group(&mut self) -> Result<GroupId, ClientError> {
        expect_reply!(self.call(&TrackerRequest::CreateGroup).await?, "create_group",
            TrackerResponse::GroupCreated { group_id } => group_id)
    }

    pub async fn list_groups(&mut self) -> Result<Vec<GroupSummary>, ClientError> {
        expect_reply!(self.call(&TrackerRequest::ListGroups).await?, "list_groups",
            TrackerResponse::Groups(groups) => groups)
    }

    pub async fn join_group(&mut self, group_id: GroupId) -> Result<(), ClientError> {
        expect_reply!(self.call(&TrackerRequest::JoinGroup { group_id }).await?, "join_group",
            TrackerResponse::JoinRequested { .. } => ())
    }

    pub async fn list_join_requests(&mut self, group_id: GroupId) -> Result<Vec<PeerId>, ClientError> {
        let req = TrackerRequest::ListJoinRequests { group_id };
        expect_reply!(self.call(&req).await?, "list_requests",
            TrackerResponse::JoinRequests { pending, .. } => pending)
    }

    pub async fn reply_join_request(
        &mut self,
        group_id: GroupId,
        peer_id: PeerId,
        approve: bool,
    ) -> Result<(), ClientError> {
        let req = TrackerRequest::ReplyJoinRequest {
            group_id,
            peer_id,
            approve,
        };
        expect_reply!(self.call(&req).await?, "reply_request",
            TrackerResponse::JoinResolved { .. } => ())
    }

    pub async fn leave_group(&mut self, group_id: GroupId) -> Result<LeaveOutcome, ClientError> {
        expect_reply!(self.call(&TrackerRequest::LeaveGroup { group_id }).await?, "leave_group",
            TrackerResponse::LeftGroup { outcome, .. } => outcome)
    }

    pub async fn upload_file(&mut self, filename: &str, size: u64) -> Result<FileSummary, ClientError> {
        let req = TrackerRequest::UploadFile {
            filename: filename.to_string(),
            size,
        };
        expect_reply!(self.call(&req).await?, "upload_file",
            TrackerResponse::FileAnnounced(summary) => summary)
    }

    pub async fn list_files(&mut self, group_id: GroupId) -> Result<Vec<FileSummary>, ClientError> {
        expect_reply!(self.call(&TrackerRequest::ListFiles { group_id }).await?, "list_files",
            TrackerResponse::Files { files, .. } => files)
    }

    pub async fn download_file(
        &mut self,
        file_id: FileId,
    ) -> Result<(FileSummary, Vec<PeerEndpoint>), ClientError> {
        expect_reply!(self.call(&TrackerRequest::DownloadFile { file_id }).await?, "download_file",
            TrackerResponse::FileSources { file, peers } => (file, peers))
    }

    pub async fn report_holding(&mut self, file_id: FileId, holding: Holding) -> Result<(), ClientError> {
        let req = TrackerRequest::ReportHolding { file_id, holding };
        expect_reply!(self.call(&req).await?, "report_holding",
            TrackerResponse::HoldingReported { .. } => ())
    }

    pub async fn exit(mut self) -> Result<(), ClientError> {
        expect_reply!(self.call(&TrackerRequest::Exit).await?, "exit",
            TrackerResponse::Goodbye => ())
    }
}

/// Outcome of a finished download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    pub file_id: FileId,
    pub path: PathBuf,
    /// Pieces fetched by this call; zero when the file was already complete.
    pub pieces_fetched: u32,
    pub sources_used: usize,
}

/// A peer: tracker session plus the local piece catalog its transfer server shares.
pub struct Peer {
    tracker: TrackerClient,
    pieces: Arc<PieceManager>,
    store: Arc<PieceStore>,
    transfer_addr: SocketAddr,
    download_dir: PathBuf,
    /// Limit on connecting to a source and on each reply from it.
    transfer_timeout: Duration,
    session: Option<PeerId>,
    usernames: HashMap<PeerId, String>,
}

impl Peer {
    /// Bind the transfer server, spawn it, and connect to the tracker. `idle_timeout` bounds
    /// both the transfer server's wait for requests and this peer's wait on its sources.
    pub async fn launch(
        tracker_addr: SocketAddr,
        transfer_bind: SocketAddr,
        download_dir: PathBuf,
        idle_timeout: Duration,
    ) -> Result<Self, ClientError> {
        let pieces = Arc::new(PieceManager::new());
        let store = Arc::new(PieceStore::new());
        let server = TransferServer::bind(transfer_bind, pieces.clone(), store.clone(), idle_timeout).await?;
        let transfer_addr = server.local_addr()?;
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                warn!(error = %e, "transfer server stopped");
            }
        });
        let tracker = TrackerClient::connect(tracker_addr).await?;
        info!(%tracker_addr, %transfer_addr, "peer started");
        Ok(Self {
            tracker,
            pieces,
            store,
            transfer_addr,
            download_dir,
            transfer_timeout: idle_timeout,
            session: None,
            usernames: HashMap::new(),
        })
    }

    pub fn transfer_addr(&self) -> SocketAddr {
        self.transfer_addr
    }

    pub fn peer_id(&self) -> Option<PeerId> {
        self.session
    }

    /// Username of the logged-in account, when it was registered from this process.
    pub fn username(&self) -> Option<&str> {
        self.session
            .and_then(|id| self.usernames.get(&id))
            .map(String::as_str)
    }

    pub fn pieces(&self) -> &Arc<PieceManager> {
        &self.pieces
    }

    fn require_session(&self) -> Result<PeerId, ClientError> {
        self.session.ok_or(ClientError::NotLoggedIn)
    }

    /// Create an account advertising this peer's transfer server. Does not log in.
    pub async fn register(&mut self, username: &str, secret: &str) -> Result<PeerId, ClientError> {
        let peer_id = self
            .tracker
            .register(username, secret, self.transfer_addr)
            .await?;
        self.usernames.insert(peer_id, username.to_string());
        Ok(peer_id)
    }

    pub async fn login(&mut self, peer_id: PeerId, secret: &str) -> Result<(), ClientError> {
        let peer_id = self.tracker.login(peer_id, secret).await?;
        self.session = Some(peer_id);
        Ok(())
    }

    pub async fn logout(&mut self) -> Result<(), ClientError> {
        self.tracker.logout().await?;
        self.session = None;
        Ok(())
    }

    pub async fn create_group(&mut self) -> Result<GroupId, ClientError> {
        self.require_session()?;
        self.tracker.create_group().await
    }

    pub async fn list_groups(&mut self) -> Result<Vec<GroupSummary>, ClientError> {
        self.require_session()?;
        self.tracker.list_groups().await
    }

    pub async fn join_group(&mut self, group_id: GroupId) -> Result<(), ClientError> {
        self.require_session()?;
        self.tracker.join_group(group_id).await
    }

    pub async fn list_requests(&mut self, group_id: GroupId) -> Result<Vec<PeerId>, ClientError> {
        self.require_session()?;
        self.tracker.list_join_requests(group_id).await
    }

    pub async fn reply_request(
        &mut self,
        group_id: GroupId,
        peer_id: PeerId,
        approve: bool,
    ) -> Result<(), ClientError> {
        self.require_session()?;
        self.tracker.reply_join_request(group_id, peer_id, approve).await
    }

    pub async fn leave_group(&mut self, group_id: GroupId) -> Result<LeaveOutcome, ClientError> {
        self.require_session()?;
        self.tracker.leave_group(group_id).await
    }

    pub async fn list_files(&mut self, group_id: GroupId) -> Result<Vec<FileSummary>, ClientError> {
        self.require_session()?;
        self.tracker.list_files(group_id).await
    }

    /// Announce a complete local file and start serving all its pieces.
    pub async fn upload(&mut self, path: &Path) -> Result<FileSummary, ClientError> {
        self.require_session()?;
        let meta = tokio::fs::metadata(path).await?;
        if !meta.is_file() {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a regular file").into());
        }
        let filename = display_name(path);
        let summary = self.tracker.upload_file(&filename, meta.len()).await?;
        self.store.add(summary.file_id, path, summary.size);
        self.pieces
            .register(summary.file_id, &summary.filename, summary.size, true);
        info!(file_id = %summary.file_id, %filename, size = summary.size, "file shared");
        Ok(summary)
    }

    /// Fetch every missing piece of `file_id` into the download directory, then report Seed.
    ///
    /// Each source gets one connection and a disjoint set of pieces. A source that fails is
    /// dropped and its unfinished pieces go to the remaining sources.
    pub async fn download(&mut self, file_id: FileId) -> Result<DownloadReport, ClientError> {
        self.require_session()?;
        if let (Ok(true), Some(path)) = (self.pieces.is_complete(file_id), self.store.path(file_id)) {
            return Ok(DownloadReport {
                file_id,
                path,
                pieces_fetched: 0,
                sources_used: 0,
            });
        }
        let (file, endpoints) = self.tracker.download_file(file_id).await?;

        let dest = match self.store.path(file_id) {
            Some(existing) => existing,
            None => {
                let dest = self.download_dir.join(local_name(&file));
                self.store.allocate(file_id, &dest, file.size).await?;
                dest
            }
        };
        let initial = self.pieces.register(file_id, &file.filename, file.size, false);
        if initial.is_complete() {
            self.tracker.report_holding(file_id, Holding::Seed).await?;
            return Ok(DownloadReport {
                file_id,
                path: dest,
                pieces_fetched: 0,
                sources_used: 0,
            });
        }
        let mut partial_reported = initial.count() > 0;

        let mut addrs: HashMap<PeerId, SocketAddr> = HashMap::new();
        let mut sources: Vec<Source> = Vec::new();
        let mut queries = JoinSet::new();
        for endpoint in endpoints {
            if Some(endpoint.peer_id) == self.session {
                continue;
            }
            let timeout = self.transfer_timeout;
            queries.spawn(async move {
                let bitmap = query_bitmap(endpoint.addr, file_id, timeout).await;
                (endpoint, bitmap)
            });
        }
        while let Some(joined) = queries.join_next().await {
            match joined {
                Ok((endpoint, Ok(bitmap))) => {
                    addrs.insert(endpoint.peer_id, endpoint.addr);
                    sources.push((endpoint.peer_id, bitmap));
                }
                Ok((endpoint, Err(e))) => {
                    warn!(peer = %endpoint.peer_id, addr = %endpoint.addr, error = %e, "source unreachable")
                }
                Err(e) => warn!(error = %e, "bitmap query panicked"),
            }
        }
        scheduler::shuffle_sources(&mut sources);
        let sources_used = sources.len();

        let mut fetched_total = 0u32;
        loop {
            let missing: Vec<u32> = self.pieces.missing_pieces(file_id)?.collect();
            if missing.is_empty() {
                break;
            }
            let mut assignment = scheduler::assign_pieces(&missing, &sources);
            if assignment.is_empty() {
                return Err(ClientError::NoSources {
                    file_id,
                    missing: missing.len(),
                });
            }
            debug!(%file_id, pieces = assignment.len(), sources = sources.len(), "download round");

            let mut tasks = JoinSet::new();
            self.spawn_fetches(&mut tasks, file_id, &assignment, &addrs);
            while let Some(joined) = tasks.join_next().await {
                let outcome = match joined {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!(error = %e, "fetch task panicked");
                        continue;
                    }
                };
                fetched_total += outcome.fetched;
                if outcome.fetched > 0 && !partial_reported && !self.pieces.is_complete(file_id)? {
                    self.tracker.report_holding(file_id, Holding::Partial).await?;
                    partial_reported = true;
                }
                if let Some(err) = outcome.error {
                    warn!(peer = %outcome.source, error = %err, "source failed, reassigning its pieces");
                    sources.retain(|(p, _)| *p != outcome.source);
                    let retry = scheduler::reassign_after_source_failed(&assignment, outcome.source, &sources);
                    self.spawn_fetches(&mut tasks, file_id, &retry, &addrs);
                    assignment.retain(|(_, p)| *p != outcome.source);
                    assignment.extend(retry);
                }
            }
        }

        self.tracker.report_holding(file_id, Holding::Seed).await?;
        info!(%file_id, path = %dest.display(), pieces = fetched_total, "download complete");
        Ok(DownloadReport {
            file_id,
            path: dest,
            pieces_fetched: fetched_total,
            sources_used,
        })
    }

    fn spawn_fetches(
        &self,
        tasks: &mut JoinSet<FetchOutcome>,
        file_id: FileId,
        assignment: &[(u32, PeerId)],
        addrs: &HashMap<PeerId, SocketAddr>,
    ) {
        for (source, plan) in scheduler::by_source(assignment) {
            let Some(addr) = addrs.get(&source).copied() else {
                continue;
            };
            let pieces = self.pieces.clone();
            let store = self.store.clone();
            tasks.spawn(fetch_from_source(
                source,
                addr,
                file_id,
                plan,
                pieces,
                store,
                self.transfer_timeout,
            ));
        }
    }

    /// Local catalog, for "show downloads".
    pub fn downloads(&self) -> Vec<LocalFileStatus> {
        self.pieces.catalog()
    }

    /// Close the tracker connection; the tracker logs this peer out. The transfer server keeps
    /// running until the runtime shuts down.
    pub async fn exit(self) -> Result<(), ClientError> {
        self.tracker.exit().await
    }
}

struct FetchOutcome {
    source: PeerId,
    fetched: u32,
    error: Option<ClientError>,
}

async fn query_bitmap(
    addr: SocketAddr,
    file_id: FileId,
    timeout: Duration,
) -> Result<swarm_core::Bitmap, TransferError> {
    let mut conn = TransferConnection::connect(addr, timeout).await?;
    let bitmap = conn.fetch_bitmap(file_id).await?;
    conn.close().await;
    Ok(bitmap)
}

/// Fetch `plan` from one source over a single connection. Stops at the first failure,
/// including a reply that does not arrive within `timeout`.
async fn fetch_from_source(
    source: PeerId,
    addr: SocketAddr,
    file_id: FileId,
    plan: Vec<u32>,
    pieces: Arc<PieceManager>,
    store: Arc<PieceStore>,
    timeout: Duration,
) -> FetchOutcome {
    let mut fetched = 0u32;
    let result: Result<(), ClientError> = async {
        let mut conn = TransferConnection::connect(addr, timeout).await?;
        for piece_index in plan {
            if pieces.has_piece(file_id, piece_index)? {
                continue;
            }
            let data = conn.fetch_piece(file_id, piece_index).await?;
            store.write_piece(file_id, piece_index, &data).await?;
            if pieces.mark_received(file_id, piece_index)? {
                fetched += 1;
            }
        }
        conn.close().await;
        Ok(())
    }
    .await;
    FetchOutcome {
        source,
        fetched,
        error: result.err(),
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Destination file name inside the download directory. Directory components in the
/// announced name are dropped.
fn local_name(file: &FileSummary) -> String {
    Path::new(&file.filename)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| format!("file-{}", file.file_id.get()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(name: &str) -> FileSummary {
        FileSummary {
            file_id: FileId(4),
            filename: name.to_string(),
            size: 1,
            piece_count: 1,
            seeds: 1,
            holders: 1,
        }
    }

    #[test]
    fn local_name_strips_directories() {
        assert_eq!(local_name(&summary("../../etc/passwd")), "passwd");
        assert_eq!(local_name(&summary("report.pdf")), "report.pdf");
        assert_eq!(local_name(&summary("..")), "file-4");
        assert_eq!(local_name(&summary("")), "file-4");
    }

    #[test]
    fn display_name_uses_last_component() {
        assert_eq!(display_name(Path::new("/tmp/a/b.txt")), "b.txt");
    }
}
