//! Tracker registry: the authoritative in-memory store of peers, groups and files.
//!
//! All state sits behind one `RwLock`. Mutations take the write lock for the whole operation,
//! so multi-record updates (a join approval touches the group and the peer) are atomic;
//! list and lookup operations share the read lock.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::net::SocketAddr;

use parking_lot::RwLock;

use crate::error::RegistryError;
use crate::ids::{FileId, GroupId, IdCounter, PeerId};
use crate::membership::{JoinEvent, JoinState};
use crate::piece::{piece_count, MAX_FILE_SIZE};
use crate::protocol::{FileSummary, GroupSummary, Holding, LeaveOutcome, PeerEndpoint};

type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Debug)]
struct PeerRecord {
    username: String,
    secret: String,
    addr: SocketAddr,
    logged_in: bool,
    /// Bumped on every login; only the newest login may end the session.
    login_seq: u64,
    files: BTreeSet<FileId>,
    /// Groups led or joined.
    groups: BTreeSet<GroupId>,
}

#[derive(Debug)]
struct GroupRecord {
    leader: PeerId,
    /// Join order; `members[0]` is the leader.
    members: Vec<PeerId>,
    pending: VecDeque<PeerId>,
}

impl GroupRecord {
    fn join_state(&self, peer: PeerId) -> JoinState {
        if self.members.contains(&peer) {
            JoinState::Member
        } else if self.pending.contains(&peer) {
            JoinState::Pending
        } else {
            JoinState::NonMember
        }
    }

    fn summary(&self, group_id: GroupId) -> GroupSummary {
        GroupSummary {
            group_id,
            leader: self.leader,
            members: self.members.clone(),
            pending: self.pending.len(),
        }
    }
}

#[derive(Debug)]
struct FileRecord {
    filename: String,
    size: u64,
    holders: BTreeMap<PeerId, Holding>,
}

impl FileRecord {
    fn summary(&self, file_id: FileId) -> FileSummary {
        FileSummary {
            file_id,
            filename: self.filename.clone(),
            size: self.size,
            piece_count: piece_count(self.size),
            seeds: self
                .holders
                .values()
                .filter(|h| **h == Holding::Seed)
                .count(),
            holders: self.holders.len(),
        }
    }
}

#[derive(Debug)]
struct RegistryState {
    peer_ids: IdCounter,
    group_ids: IdCounter,
    file_ids: IdCounter,
    peers: BTreeMap<PeerId, PeerRecord>,
    usernames: HashMap<String, PeerId>,
    groups: BTreeMap<GroupId, GroupRecord>,
    files: BTreeMap<FileId, FileRecord>,
    /// Content identity is (name, size).
    file_index: HashMap<(String, u64), FileId>,
}

impl RegistryState {
    fn new() -> Self {
        Self {
            peer_ids: IdCounter::new(),
            group_ids: IdCounter::new(),
            file_ids: IdCounter::new(),
            peers: BTreeMap::new(),
            usernames: HashMap::new(),
            groups: BTreeMap::new(),
            files: BTreeMap::new(),
            file_index: HashMap::new(),
        }
    }

    fn peer(&self, peer_id: PeerId) -> Result<&PeerRecord> {
        self.peers
            .get(&peer_id)
            .ok_or(RegistryError::PeerNotFound(peer_id))
    }

    fn peer_mut(&mut self, peer_id: PeerId) -> Result<&mut PeerRecord> {
        self.peers
            .get_mut(&peer_id)
            .ok_or(RegistryError::PeerNotFound(peer_id))
    }

    fn logged_in_peer(&self, peer_id: PeerId) -> Result<&PeerRecord> {
        let peer = self.peer(peer_id)?;
        if !peer.logged_in {
            return Err(RegistryError::NotLoggedIn);
        }
        Ok(peer)
    }

    fn group(&self, group_id: GroupId) -> Result<&GroupRecord> {
        self.groups
            .get(&group_id)
            .ok_or(RegistryError::GroupNotFound(group_id))
    }

    fn group_mut(&mut self, group_id: GroupId) -> Result<&mut GroupRecord> {
        self.groups
            .get_mut(&group_id)
            .ok_or(RegistryError::GroupNotFound(group_id))
    }

    fn file(&self, file_id: FileId) -> Result<&FileRecord> {
        self.files
            .get(&file_id)
            .ok_or(RegistryError::FileNotFound(file_id))
    }

    fn shares_group(&self, a: &PeerRecord, b: PeerId) -> bool {
        self.peers
            .get(&b)
            .map(|other| !a.groups.is_disjoint(&other.groups))
            .unwrap_or(false)
    }
}

/// Public view of a peer record. The secret never leaves the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub username: String,
    pub addr: SocketAddr,
    pub logged_in: bool,
    pub files: Vec<FileId>,
    pub groups: Vec<GroupId>,
}

/// The tracker registry service. Share it as `Arc<Registry>`.
#[derive(Debug)]
pub struct Registry {
    state: RwLock<RegistryState>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState::new()),
        }
    }

    /// Create a logged-out peer. Usernames are unique.
    pub fn register_peer(&self, username: &str, secret: &str, addr: SocketAddr) -> Result<PeerId> {
        let mut st = self.state.write();
        if st.usernames.contains_key(username) {
            return Err(RegistryError::DuplicateUsername(username.to_string()));
        }
        let peer_id = PeerId(st.peer_ids.next());
        st.peers.insert(
            peer_id,
            PeerRecord {
                username: username.to_string(),
                secret: secret.to_string(),
                addr,
                logged_in: false,
                login_seq: 0,
                files: BTreeSet::new(),
                groups: BTreeSet::new(),
            },
        );
        st.usernames.insert(username.to_string(), peer_id);
        tracing::debug!(%peer_id, username, %addr, "registered peer");
        Ok(peer_id)
    }

    /// True only for an existing peer whose stored secret matches exactly.
    pub fn authenticate(&self, peer_id: PeerId, secret: &str) -> bool {
        self.state
            .read()
            .peers
            .get(&peer_id)
            .map(|p| p.secret == secret)
            .unwrap_or(false)
    }

    /// Mark the peer online and return the login token of this session. A newer login
    /// takes the peer over from any older session.
    pub fn login(&self, peer_id: PeerId) -> Result<u64> {
        let mut st = self.state.write();
        let peer = st.peer_mut(peer_id)?;
        peer.logged_in = true;
        peer.login_seq += 1;
        Ok(peer.login_seq)
    }

    /// Idempotent.
    pub fn logout(&self, peer_id: PeerId) -> Result<()> {
        self.state.write().peer_mut(peer_id)?.logged_in = false;
        Ok(())
    }

    /// True while `token` belongs to the newest login of an online peer.
    pub fn holds_login(&self, peer_id: PeerId, token: u64) -> bool {
        self.state
            .read()
            .peers
            .get(&peer_id)
            .map(|p| p.logged_in && p.login_seq == token)
            .unwrap_or(false)
    }

    /// Log out only if `token` is still the newest login. Returns whether the peer went offline.
    pub fn end_session(&self, peer_id: PeerId, token: u64) -> Result<bool> {
        let mut st = self.state.write();
        let peer = st.peer_mut(peer_id)?;
        if peer.login_seq != token || !peer.logged_in {
            return Ok(false);
        }
        peer.logged_in = false;
        Ok(true)
    }

    pub fn create_group(&self, leader: PeerId) -> Result<GroupId> {
        let mut st = self.state.write();
        st.logged_in_peer(leader)?;
        let group_id = GroupId(st.group_ids.next());
        st.groups.insert(
            group_id,
            GroupRecord {
                leader,
                members: vec![leader],
                pending: VecDeque::new(),
            },
        );
        st.peer_mut(leader)?.groups.insert(group_id);
        tracing::debug!(%group_id, %leader, "created group");
        Ok(group_id)
    }

    pub fn list_groups(&self) -> Vec<GroupSummary> {
        let st = self.state.read();
        st.groups.iter().map(|(id, g)| g.summary(*id)).collect()
    }

    pub fn group(&self, group_id: GroupId) -> Result<GroupSummary> {
        Ok(self.state.read().group(group_id)?.summary(group_id))
    }

    /// NonMember -> Pending.
    pub fn request_join(&self, peer_id: PeerId, group_id: GroupId) -> Result<()> {
        let mut st = self.state.write();
        st.logged_in_peer(peer_id)?;
        let group = st.group_mut(group_id)?;
        group
            .join_state(peer_id)
            .transition(JoinEvent::Request, peer_id, group_id)?;
        group.pending.push_back(peer_id);
        Ok(())
    }

    /// Pending requests in arrival order. Leader only.
    pub fn list_pending(&self, group_id: GroupId, requester: PeerId) -> Result<Vec<PeerId>> {
        let st = self.state.read();
        let group = st.group(group_id)?;
        if group.leader != requester {
            return Err(RegistryError::NotAuthorized {
                peer: requester,
                group: group_id,
            });
        }
        Ok(group.pending.iter().copied().collect())
    }

    /// Pending -> Member on approval, Pending -> NonMember on rejection. Leader only.
    pub fn resolve_join(
        &self,
        group_id: GroupId,
        leader: PeerId,
        target: PeerId,
        approve: bool,
    ) -> Result<()> {
        let mut st = self.state.write();
        let group = st.group_mut(group_id)?;
        if group.leader != leader {
            return Err(RegistryError::NotAuthorized {
                peer: leader,
                group: group_id,
            });
        }
        let event = if approve {
            JoinEvent::Approve
        } else {
            JoinEvent::Reject
        };
        let next = group
            .join_state(target)
            .transition(event, target, group_id)?;
        group.pending.retain(|p| *p != target);
        if next == JoinState::Member {
            group.members.push(target);
            st.peer_mut(target)?.groups.insert(group_id);
        }
        tracing::debug!(%group_id, %target, approve, "resolved join request");
        Ok(())
    }

    /// Member -> NonMember. A departing leader hands the group to the next member by join
    /// order; a leader leaving alone dissolves the group.
    pub fn leave_group(&self, peer_id: PeerId, group_id: GroupId) -> Result<LeaveOutcome> {
        let mut st = self.state.write();
        st.peer(peer_id)?;
        let group = st.group_mut(group_id)?;
        group
            .join_state(peer_id)
            .transition(JoinEvent::Leave, peer_id, group_id)?;
        group.members.retain(|p| *p != peer_id);
        let outcome = if group.leader != peer_id {
            LeaveOutcome::Left
        } else {
            match group.members.first().copied() {
                Some(next) => {
                    group.leader = next;
                    LeaveOutcome::LeaderPromoted { new_leader: next }
                }
                None => LeaveOutcome::Dissolved,
            }
        };
        if outcome == LeaveOutcome::Dissolved {
            st.groups.remove(&group_id);
        }
        st.peer_mut(peer_id)?.groups.remove(&group_id);
        tracing::debug!(%group_id, %peer_id, ?outcome, "peer left group");
        Ok(outcome)
    }

    /// Record `peer_id` as a seed of (filename, size), reusing the id of an identical announcement.
    pub fn announce_file(&self, peer_id: PeerId, filename: &str, size: u64) -> Result<FileId> {
        let mut st = self.state.write();
        st.logged_in_peer(peer_id)?;
        if size > MAX_FILE_SIZE {
            return Err(RegistryError::FileTooLarge {
                size,
                max: MAX_FILE_SIZE,
            });
        }
        let key = (filename.to_string(), size);
        let existing = st.file_index.get(&key).copied();
        let file_id = match existing {
            Some(id) => id,
            None => {
                let id = FileId(st.file_ids.next());
                st.files.insert(
                    id,
                    FileRecord {
                        filename: filename.to_string(),
                        size,
                        holders: BTreeMap::new(),
                    },
                );
                st.file_index.insert(key, id);
                id
            }
        };
        if let Some(file) = st.files.get_mut(&file_id) {
            file.holders.insert(peer_id, Holding::Seed);
        }
        st.peer_mut(peer_id)?.files.insert(file_id);
        tracing::debug!(%file_id, %peer_id, filename, size, "file announced");
        Ok(file_id)
    }

    /// Explicit possession update for a downloader: `Partial` once it holds a piece,
    /// `Seed` once it holds all of them. A seed is never downgraded; returns the holding
    /// now on record.
    pub fn report_holding(&self, peer_id: PeerId, file_id: FileId, holding: Holding) -> Result<Holding> {
        let mut st = self.state.write();
        st.logged_in_peer(peer_id)?;
        let recorded = *st
            .files
            .get_mut(&file_id)
            .ok_or(RegistryError::FileNotFound(file_id))?
            .holders
            .entry(peer_id)
            .and_modify(|h| {
                if *h != Holding::Seed {
                    *h = holding;
                }
            })
            .or_insert(holding);
        st.peer_mut(peer_id)?.files.insert(file_id);
        Ok(recorded)
    }

    pub fn file(&self, file_id: FileId) -> Result<FileSummary> {
        Ok(self.state.read().file(file_id)?.summary(file_id))
    }

    /// Files announced by members of `group_id`. Only members may list.
    pub fn list_files(&self, group_id: GroupId, requester: PeerId) -> Result<Vec<FileSummary>> {
        let st = self.state.read();
        let group = st.group(group_id)?;
        if !group.members.contains(&requester) {
            return Err(RegistryError::NotAuthorized {
                peer: requester,
                group: group_id,
            });
        }
        let ids: BTreeSet<FileId> = group
            .members
            .iter()
            .filter_map(|m| st.peers.get(m))
            .flat_map(|p| p.files.iter().copied())
            .collect();
        Ok(ids
            .into_iter()
            .filter_map(|id| st.files.get(&id).map(|f| f.summary(id)))
            .collect())
    }

    /// Logged-in holders of `file_id` that share a group with `requester`.
    /// Fails with `FileNotVisible` when no holder shares a group with the requester.
    pub fn peers_for_file(&self, file_id: FileId, requester: PeerId) -> Result<Vec<PeerEndpoint>> {
        let st = self.state.read();
        let me = st.peer(requester)?;
        let file = st.file(file_id)?;
        let visible: Vec<(PeerId, Holding)> = file
            .holders
            .iter()
            .filter(|(id, _)| **id != requester && st.shares_group(me, **id))
            .map(|(id, h)| (*id, *h))
            .collect();
        if visible.is_empty() {
            return Err(RegistryError::FileNotVisible {
                peer: requester,
                file: file_id,
            });
        }
        Ok(visible
            .into_iter()
            .filter_map(|(id, holding)| {
                let p = st.peers.get(&id)?;
                p.logged_in.then_some(PeerEndpoint {
                    peer_id: id,
                    addr: p.addr,
                    holding,
                })
            })
            .collect())
    }

    pub fn peer(&self, peer_id: PeerId) -> Result<PeerInfo> {
        let st = self.state.read();
        let p = st.peer(peer_id)?;
        Ok(PeerInfo {
            peer_id,
            username: p.username.clone(),
            addr: p.addr,
            logged_in: p.logged_in,
            files: p.files.iter().copied().collect(),
            groups: p.groups.iter().copied().collect(),
        })
    }
}
