//! Tracker and peers wired together over loopback.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use swarm_core::piece::piece_range;
use swarm_core::transport::{read_frame, write_frame};
use swarm_core::{
    Bitmap, ErrorKind, FileId, GroupId, Holding, PeerId, PeerRequest, PeerResponse, Registry,
    PIECE_SIZE,
};
use swarm_peer::{ClientError, Peer, TrackerClient, TransferConnection};
use swarm_tracker::TrackerServer;
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};

const IDLE: Duration = Duration::from_secs(10);

async fn start_tracker() -> SocketAddr {
    start_tracker_with(IDLE).await
}

async fn start_tracker_with(idle: Duration) -> SocketAddr {
    let server = TrackerServer::bind(
        SocketAddr::from(([127, 0, 0, 1], 0)),
        Arc::new(Registry::new()),
        idle,
    )
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    addr
}

async fn start_peer(tracker: SocketAddr, name: &str) -> (Peer, PeerId, TempDir) {
    start_peer_with(tracker, name, IDLE).await
}

async fn start_peer_with(tracker: SocketAddr, name: &str, idle: Duration) -> (Peer, PeerId, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut peer = Peer::launch(
        tracker,
        SocketAddr::from(([127, 0, 0, 1], 0)),
        dir.path().join("downloads"),
        idle,
    )
    .await
    .unwrap();
    let id = peer.register(name, "secret").await.unwrap();
    peer.login(id, "secret").await.unwrap();
    (peer, id, dir)
}

async fn write_sample(dir: &Path, name: &str, len: usize) -> (std::path::PathBuf, Vec<u8>) {
    let data: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
    let path = dir.join(name);
    tokio::fs::write(&path, &data).await.unwrap();
    (path, data)
}

/// What a scripted source does once it has served its quota of pieces.
#[derive(Debug, Clone, Copy)]
enum Exhausted {
    Hangup,
    Stall,
}

/// A transfer endpoint that advertises `bitmap` and serves real piece data, up to `quota`
/// pieces in total across all connections.
struct ScriptedSource {
    addr: SocketAddr,
    requested: Arc<Mutex<Vec<u32>>>,
}

async fn scripted_source(data: Vec<u8>, bitmap: Bitmap, quota: usize, exhausted: Exhausted) -> ScriptedSource {
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requested = Arc::new(Mutex::new(Vec::new()));
    let served = Arc::new(AtomicUsize::new(0));
    let data = Arc::new(data);
    let log = requested.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_scripted(
                stream,
                data.clone(),
                bitmap.clone(),
                quota,
                exhausted,
                served.clone(),
                log.clone(),
            ));
        }
    });
    ScriptedSource { addr, requested }
}

async fn serve_scripted(
    mut stream: TcpStream,
    data: Arc<Vec<u8>>,
    bitmap: Bitmap,
    quota: usize,
    exhausted: Exhausted,
    served: Arc<AtomicUsize>,
    requested: Arc<Mutex<Vec<u32>>>,
) {
    while let Ok(Some(request)) = read_frame::<_, PeerRequest>(&mut stream).await {
        let reply = match request {
            PeerRequest::Bitmap { file_id } => PeerResponse::Bitmap {
                file_id,
                bitmap: bitmap.clone(),
            },
            PeerRequest::Piece { file_id, piece_index } => {
                requested.lock().push(piece_index);
                if served.fetch_add(1, Ordering::SeqCst) >= quota {
                    match exhausted {
                        Exhausted::Hangup => return,
                        Exhausted::Stall => {
                            tokio::time::sleep(Duration::from_secs(3600)).await;
                            return;
                        }
                    }
                }
                let range = piece_range(data.len() as u64, piece_index).unwrap();
                PeerResponse::Piece {
                    file_id,
                    piece_index,
                    data: data[range.start as usize..range.end as usize].to_vec(),
                }
            }
            PeerRequest::Close => return,
        };
        if write_frame(&mut stream, &reply).await.is_err() {
            return;
        }
    }
}

/// Register `addr` as a member of `group`, approved by `leader`. The returned client keeps the
/// account online.
async fn enlist(tracker: SocketAddr, name: &str, addr: SocketAddr, leader: &mut Peer, group: GroupId) -> TrackerClient {
    let mut client = TrackerClient::connect(tracker).await.unwrap();
    let id = client.register(name, "pw", addr).await.unwrap();
    client.login(id, "pw").await.unwrap();
    client.join_group(group).await.unwrap();
    leader.reply_request(group, id, true).await.unwrap();
    client
}

fn rejected_kind(err: ClientError) -> ErrorKind {
    match err {
        ClientError::Rejected(e) => e.kind(),
        other => panic!("expected tracker rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn member_fetches_both_pieces_from_leader() {
    let tracker = start_tracker().await;
    let (mut a, a_id, a_dir) = start_peer(tracker, "alice").await;
    let (mut b, b_id, _b_dir) = start_peer(tracker, "bob").await;

    let group = a.create_group().await.unwrap();
    b.join_group(group).await.unwrap();
    assert_eq!(a.list_requests(group).await.unwrap(), vec![b_id]);
    a.reply_request(group, b_id, true).await.unwrap();
    assert!(a.list_requests(group).await.unwrap().is_empty());
    let groups = b.list_groups().await.unwrap();
    let g = groups.iter().find(|g| g.group_id == group).unwrap();
    assert_eq!(g.leader, a_id);
    assert_eq!(g.members.iter().filter(|m| **m == b_id).count(), 1);

    let (path, data) = write_sample(a_dir.path(), "f.bin", 1_048_576).await;
    let f = a.upload(&path).await.unwrap();
    assert_eq!(f.piece_count, 2);

    let listed = b.list_files(group).await.unwrap();
    assert!(listed.iter().any(|s| s.file_id == f.file_id && s.size == 1_048_576));

    // Fetch piece by piece so completeness can be checked between the two.
    b.pieces().register(f.file_id, &f.filename, f.size, false);
    let mut conn = TransferConnection::connect(a.transfer_addr(), IDLE).await.unwrap();
    let p0 = conn.fetch_piece(f.file_id, 0).await.unwrap();
    assert_eq!(p0, data[..PIECE_SIZE as usize]);
    assert!(b.pieces().mark_received(f.file_id, 0).unwrap());
    assert!(!b.pieces().is_complete(f.file_id).unwrap());

    let p1 = conn.fetch_piece(f.file_id, 1).await.unwrap();
    assert_eq!(p1, data[PIECE_SIZE as usize..]);
    assert!(b.pieces().mark_received(f.file_id, 1).unwrap());
    assert!(b.pieces().is_complete(f.file_id).unwrap());
    conn.close().await;
}

#[tokio::test]
async fn download_writes_identical_file() {
    let tracker = start_tracker().await;
    let (mut a, _, a_dir) = start_peer(tracker, "alice").await;
    let (mut b, b_id, _b_dir) = start_peer(tracker, "bob").await;

    let group = a.create_group().await.unwrap();
    b.join_group(group).await.unwrap();
    a.reply_request(group, b_id, true).await.unwrap();

    let (path, data) = write_sample(a_dir.path(), "video.bin", 3 * PIECE_SIZE as usize + 1234).await;
    let f = a.upload(&path).await.unwrap();

    let report = b.download(f.file_id).await.unwrap();
    assert_eq!(report.pieces_fetched, 4);
    assert_eq!(report.sources_used, 1);
    assert_eq!(tokio::fs::read(&report.path).await.unwrap(), data);
    let status = b.downloads();
    assert_eq!(status.len(), 1);
    assert!(status[0].is_complete());

    // Nothing left to fetch the second time.
    let again = b.download(f.file_id).await.unwrap();
    assert_eq!(again.pieces_fetched, 0);
}

#[tokio::test]
async fn completed_downloader_becomes_a_source() {
    let tracker = start_tracker().await;
    let (mut a, _, a_dir) = start_peer(tracker, "alice").await;
    let (mut b, b_id, _b_dir) = start_peer(tracker, "bob").await;
    let (mut c, c_id, _c_dir) = start_peer(tracker, "carol").await;

    let group = a.create_group().await.unwrap();
    for (peer, id) in [(&mut b, b_id), (&mut c, c_id)] {
        peer.join_group(group).await.unwrap();
        a.reply_request(group, id, true).await.unwrap();
    }

    let (path, data) = write_sample(a_dir.path(), "shared.bin", 5 * PIECE_SIZE as usize).await;
    let f = a.upload(&path).await.unwrap();
    b.download(f.file_id).await.unwrap();

    let files = c.list_files(group).await.unwrap();
    let listed = files.iter().find(|s| s.file_id == f.file_id).unwrap();
    assert_eq!(listed.seeds, 2);

    let report = c.download(f.file_id).await.unwrap();
    assert_eq!(report.sources_used, 2);
    assert_eq!(tokio::fs::read(&report.path).await.unwrap(), data);
}

#[tokio::test]
async fn offline_source_is_skipped() {
    let tracker = start_tracker().await;
    let (mut a, _, a_dir) = start_peer(tracker, "alice").await;
    let (mut b, b_id, _b_dir) = start_peer(tracker, "bob").await;
    let (mut c, c_id, _c_dir) = start_peer(tracker, "carol").await;

    let group = a.create_group().await.unwrap();
    for (peer, id) in [(&mut b, b_id), (&mut c, c_id)] {
        peer.join_group(group).await.unwrap();
        a.reply_request(group, id, true).await.unwrap();
    }
    let (path, data) = write_sample(a_dir.path(), "doc.bin", 2 * PIECE_SIZE as usize).await;
    let f = a.upload(&path).await.unwrap();
    b.download(f.file_id).await.unwrap();
    b.logout().await.unwrap();

    let report = c.download(f.file_id).await.unwrap();
    assert_eq!(report.sources_used, 1);
    assert_eq!(tokio::fs::read(&report.path).await.unwrap(), data);
}

#[tokio::test]
async fn non_member_sees_nothing() {
    let tracker = start_tracker().await;
    let (mut a, _, a_dir) = start_peer(tracker, "alice").await;
    let (mut c, _, _c_dir) = start_peer(tracker, "carol").await;

    let group = a.create_group().await.unwrap();
    let (path, _) = write_sample(a_dir.path(), "secret.bin", 1000).await;
    let f = a.upload(&path).await.unwrap();

    let err = c.list_files(group).await.unwrap_err();
    assert_eq!(rejected_kind(err), ErrorKind::NotAuthorized);
    let err = c.download(f.file_id).await.unwrap_err();
    assert_eq!(rejected_kind(err), ErrorKind::NotAuthorized);
    assert!(c.downloads().is_empty());
}

#[tokio::test]
async fn pending_member_cannot_list_files() {
    let tracker = start_tracker().await;
    let (mut a, _, _a_dir) = start_peer(tracker, "alice").await;
    let (mut b, _, _b_dir) = start_peer(tracker, "bob").await;

    let group = a.create_group().await.unwrap();
    b.join_group(group).await.unwrap();
    let err = b.join_group(group).await.unwrap_err();
    assert_eq!(rejected_kind(err), ErrorKind::InvalidState);
    let err = b.list_files(group).await.unwrap_err();
    assert_eq!(rejected_kind(err), ErrorKind::NotAuthorized);
}

#[tokio::test]
async fn logged_out_peer_is_refused_locally() {
    let tracker = start_tracker().await;
    let (mut a, _, _dir) = start_peer(tracker, "alice").await;
    a.logout().await.unwrap();
    assert!(a.peer_id().is_none());
    assert!(matches!(a.create_group().await, Err(ClientError::NotLoggedIn)));
    assert!(matches!(a.download(FileId(1)).await, Err(ClientError::NotLoggedIn)));
}

#[tokio::test]
async fn partial_holder_serves_only_what_it_has_and_download_resumes() {
    let tracker = start_tracker().await;
    let (mut a, a_id, a_dir) = start_peer(tracker, "alice").await;
    let (mut b, b_id, _b_dir) = start_peer(tracker, "bob").await;
    let group = a.create_group().await.unwrap();
    b.join_group(group).await.unwrap();
    a.reply_request(group, b_id, true).await.unwrap();

    let (path, data) = write_sample(a_dir.path(), "movie.bin", 4 * PIECE_SIZE as usize).await;
    let f = a.upload(&path).await.unwrap();

    let half = Bitmap::from_bits(vec![true, false, true, false]);
    let partial = scripted_source(data.clone(), half, usize::MAX, Exhausted::Hangup).await;
    let mut partial_client = enlist(tracker, "dave", partial.addr, &mut a, group).await;
    partial_client.report_holding(f.file_id, Holding::Partial).await.unwrap();

    // With the seed offline only the even pieces are reachable.
    a.logout().await.unwrap();
    let err = b.download(f.file_id).await.unwrap_err();
    assert!(matches!(err, ClientError::NoSources { missing: 2, .. }), "{err:?}");
    let mut asked = partial.requested.lock().clone();
    asked.sort_unstable();
    assert_eq!(asked, vec![0, 2]);
    let status = b.downloads();
    assert_eq!((status[0].held, status[0].piece_count), (2, 4));

    a.login(a_id, "secret").await.unwrap();
    let listed = a.list_files(group).await.unwrap();
    let summary = listed.iter().find(|s| s.file_id == f.file_id).unwrap();
    assert_eq!((summary.seeds, summary.holders), (1, 3));

    let report = b.download(f.file_id).await.unwrap();
    assert_eq!(report.pieces_fetched, 2);
    assert_eq!(tokio::fs::read(&report.path).await.unwrap(), data);
    let mut asked = partial.requested.lock().clone();
    asked.sort_unstable();
    assert_eq!(asked, vec![0, 2]);
}

#[tokio::test]
async fn pieces_of_a_failed_source_move_to_another() {
    let tracker = start_tracker().await;
    let (mut a, _, a_dir) = start_peer(tracker, "alice").await;
    let (mut b, b_id, _b_dir) = start_peer(tracker, "bob").await;
    let group = a.create_group().await.unwrap();
    b.join_group(group).await.unwrap();
    a.reply_request(group, b_id, true).await.unwrap();

    let (path, data) = write_sample(a_dir.path(), "archive.bin", 4 * PIECE_SIZE as usize).await;
    let f = a.upload(&path).await.unwrap();

    let flaky = scripted_source(data.clone(), Bitmap::full(4), 0, Exhausted::Hangup).await;
    let mut flaky_client = enlist(tracker, "erin", flaky.addr, &mut a, group).await;
    let again = flaky_client.upload_file(&f.filename, f.size).await.unwrap();
    assert_eq!(again.file_id, f.file_id);

    let report = b.download(f.file_id).await.unwrap();
    assert_eq!(report.sources_used, 2);
    assert_eq!(report.pieces_fetched, 4);
    assert_eq!(tokio::fs::read(&report.path).await.unwrap(), data);
    assert_eq!(flaky.requested.lock().len(), 1);
}

#[tokio::test]
async fn stalled_source_times_out_and_download_finishes() {
    let tracker = start_tracker().await;
    let (mut a, _, a_dir) = start_peer(tracker, "alice").await;
    let (mut b, b_id, _b_dir) = start_peer_with(tracker, "bob", Duration::from_millis(300)).await;
    let group = a.create_group().await.unwrap();
    b.join_group(group).await.unwrap();
    a.reply_request(group, b_id, true).await.unwrap();

    let (path, data) = write_sample(a_dir.path(), "slow.bin", 4 * PIECE_SIZE as usize).await;
    let f = a.upload(&path).await.unwrap();

    let stalled = scripted_source(data.clone(), Bitmap::full(4), 0, Exhausted::Stall).await;
    let mut stalled_client = enlist(tracker, "frank", stalled.addr, &mut a, group).await;
    stalled_client.upload_file(&f.filename, f.size).await.unwrap();

    let report = tokio::time::timeout(Duration::from_secs(5), b.download(f.file_id))
        .await
        .expect("download hung on a stalled source")
        .unwrap();
    assert_eq!(tokio::fs::read(&report.path).await.unwrap(), data);
    assert_eq!(stalled.requested.lock().len(), 1);
}

#[tokio::test]
async fn quiet_seeder_stays_online() {
    let tracker = start_tracker_with(Duration::from_millis(300)).await;
    let (mut a, _, a_dir) = start_peer(tracker, "alice").await;
    let (mut b, b_id, _b_dir) = start_peer(tracker, "bob").await;
    let group = a.create_group().await.unwrap();
    b.join_group(group).await.unwrap();
    a.reply_request(group, b_id, true).await.unwrap();
    let (path, data) = write_sample(a_dir.path(), "idle.bin", 1000).await;
    let f = a.upload(&path).await.unwrap();

    tokio::time::sleep(Duration::from_millis(800)).await;

    let report = b.download(f.file_id).await.unwrap();
    assert_eq!(tokio::fs::read(&report.path).await.unwrap(), data);
    assert!(a.list_files(group).await.is_ok());
}
