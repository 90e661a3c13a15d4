//! Command dispatcher: validates each tracker command against the connection's session and
//! the registry, applies it, and builds the reply.

use std::net::SocketAddr;
use std::sync::Arc;

use swarm_core::protocol::{TrackerRequest, TrackerResponse};
use swarm_core::{PeerId, Registry, RegistryError};
use tracing::{debug, info};

/// Per-connection login state: the peer and the login token the registry issued.
#[derive(Debug)]
pub struct Session {
    remote: SocketAddr,
    login: Option<(PeerId, u64)>,
}

impl Session {
    pub fn new(remote: SocketAddr) -> Self {
        Self {
            remote,
            login: None,
        }
    }

    pub fn peer(&self) -> Option<PeerId> {
        self.login.map(|(peer, _)| peer)
    }

    /// The session's peer, if this session still holds its newest login. A session
    /// superseded by a login elsewhere is signed out.
    fn require_peer(&mut self, reg: &Registry) -> Result<PeerId, RegistryError> {
        match self.login {
            Some((peer, token)) if reg.holds_login(peer, token) => Ok(peer),
            Some(_) => {
                self.login = None;
                Err(RegistryError::NotLoggedIn)
            }
            None => Err(RegistryError::NotLoggedIn),
        }
    }
}

pub struct Dispatcher {
    registry: Arc<Registry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Handle one command. Every rejection becomes `Rejected` with the concrete error.
    pub fn handle(&self, session: &mut Session, request: TrackerRequest) -> TrackerResponse {
        match self.execute(session, request) {
            Ok(resp) => resp,
            Err(err) => {
                debug!(remote = %session.remote, peer = ?session.peer(), error = %err, "command rejected");
                TrackerResponse::Rejected(err)
            }
        }
    }

    /// Connection closed: the session's peer is logged out unless a newer login took it over.
    pub fn disconnect(&self, session: &mut Session) {
        if let Some((peer, token)) = session.login.take() {
            if let Ok(true) = self.registry.end_session(peer, token) {
                info!(%peer, remote = %session.remote, "peer disconnected, logged out");
            }
        }
    }

    fn execute(
        &self,
        session: &mut Session,
        request: TrackerRequest,
    ) -> Result<TrackerResponse, RegistryError> {
        let reg = &self.registry;
        let resp = match request {
            TrackerRequest::Register {
                username,
                secret,
                transfer_addr,
            } => {
                let addr = if transfer_addr.ip().is_unspecified() {
                    SocketAddr::new(session.remote.ip(), transfer_addr.port())
                } else {
                    transfer_addr
                };
                let peer_id = reg.register_peer(&username, &secret, addr)?;
                info!(%peer_id, %username, %addr, "peer registered");
                TrackerResponse::Registered { peer_id }
            }
            TrackerRequest::Login { peer_id, secret } => {
                if !reg.authenticate(peer_id, &secret) {
                    reg.peer(peer_id)?;
                    return Err(RegistryError::BadCredentials(peer_id));
                }
                if let Some((prev, token)) = session.login.take() {
                    reg.end_session(prev, token)?;
                }
                let token = reg.login(peer_id)?;
                session.login = Some((peer_id, token));
                info!(%peer_id, remote = %session.remote, "peer logged in");
                TrackerResponse::LoggedIn { peer_id }
            }
            TrackerRequest::Logout => {
                if let Some((peer_id, token)) = session.login.take() {
                    if reg.end_session(peer_id, token)? {
                        info!(%peer_id, "peer logged out");
                    }
                }
                TrackerResponse::LoggedOut
            }
            TrackerRequest::CreateGroup => {
                let group_id = reg.create_group(session.require_peer(reg)?)?;
                TrackerResponse::GroupCreated { group_id }
            }
            TrackerRequest::ListGroups => {
                session.require_peer(reg)?;
                TrackerResponse::Groups(reg.list_groups())
            }
            TrackerRequest::JoinGroup { group_id } => {
                reg.request_join(session.require_peer(reg)?, group_id)?;
                TrackerResponse::JoinRequested { group_id }
            }
            TrackerRequest::ListJoinRequests { group_id } => {
                let pending = reg.list_pending(group_id, session.require_peer(reg)?)?;
                TrackerResponse::JoinRequests { group_id, pending }
            }
            TrackerRequest::ReplyJoinRequest {
                group_id,
                peer_id,
                approve,
            } => {
                reg.resolve_join(group_id, session.require_peer(reg)?, peer_id, approve)?;
                TrackerResponse::JoinResolved {
                    group_id,
                    peer_id,
                    approved: approve,
                }
            }
            TrackerRequest::UploadFile { filename, size } => {
                let file_id = reg.announce_file(session.require_peer(reg)?, &filename, size)?;
                TrackerResponse::FileAnnounced(reg.file(file_id)?)
            }
            TrackerRequest::ListFiles { group_id } => {
                let files = reg.list_files(group_id, session.require_peer(reg)?)?;
                TrackerResponse::Files { group_id, files }
            }
            TrackerRequest::DownloadFile { file_id } => {
                let peers = reg.peers_for_file(file_id, session.require_peer(reg)?)?;
                TrackerResponse::FileSources {
                    file: reg.file(file_id)?,
                    peers,
                }
            }
            TrackerRequest::LeaveGroup { group_id } => {
                let outcome = reg.leave_group(session.require_peer(reg)?, group_id)?;
                TrackerResponse::LeftGroup { group_id, outcome }
            }
            TrackerRequest::ReportHolding { file_id, holding } => {
                let holding = reg.report_holding(session.require_peer(reg)?, file_id, holding)?;
                TrackerResponse::HoldingReported { file_id, holding }
            }
            TrackerRequest::Exit => {
                self.disconnect(session);
                TrackerResponse::Goodbye
            }
        };
        Ok(resp)
    }
}
