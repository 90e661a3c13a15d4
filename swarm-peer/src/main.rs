// Swarm peer: interactive shell over a tracker session, serving shared files to other peers.

use std::net::SocketAddr;

use swarm_core::protocol::LeaveOutcome;
use swarm_peer::command::{Command, ParseError, HELP};
use swarm_peer::{config, ClientError, Peer};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("swarm-peer {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = config::load();
    let transfer_bind = SocketAddr::from(([0, 0, 0, 0], cfg.transfer_port));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let peer = Peer::launch(
            cfg.tracker_addr,
            transfer_bind,
            cfg.download_dir.clone(),
            cfg.idle_timeout(),
        )
        .await?;
        tokio::select! {
            r = shell(peer) => r?,
            r = shutdown_signal() => r?,
        }
        tracing::info!("peer shutting down");
        Ok::<(), anyhow::Error>(())
    })
}

/// Read commands from stdin until `exit` or EOF.
async fn shell(mut peer: Peer) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let cmd = match line.parse::<Command>() {
            Ok(cmd) => cmd,
            Err(ParseError::Empty) => continue,
            Err(e) => {
                println!("error: {e}");
                continue;
            }
        };
        if cmd == Command::Exit {
            break;
        }
        match run(&mut peer, cmd).await {
            Ok(()) => {}
            // The tracker is gone; nothing else will work.
            Err(e @ (ClientError::Disconnected | ClientError::Transport(_))) => return Err(e.into()),
            Err(e) => println!("error: {e}"),
        }
    }
    peer.exit().await?;
    Ok(())
}

async fn run(peer: &mut Peer, cmd: Command) -> Result<(), ClientError> {
    match cmd {
        Command::Register { username, secret } => {
            let id = peer.register(&username, &secret).await?;
            println!("registered {username} as {id}; log in with `login {} <secret>`", id.get());
        }
        Command::Login { peer_id, secret } => {
            peer.login(peer_id, &secret).await?;
            println!("logged in as {peer_id}");
        }
        Command::Logout => {
            peer.logout().await?;
            println!("logged out");
        }
        Command::CreateGroup => println!("created {}", peer.create_group().await?),
        Command::ListGroups => {
            for g in peer.list_groups().await? {
                println!(
                    "{}  leader {}  members {}  pending {}",
                    g.group_id,
                    g.leader,
                    g.members.len(),
                    g.pending
                );
            }
        }
        Command::JoinGroup(group) => {
            peer.join_group(group).await?;
            println!("join request sent to {group}");
        }
        Command::ListRequests(group) => {
            for p in peer.list_requests(group).await? {
                println!("{p}");
            }
        }
        Command::AcceptRequest(group, p) => {
            peer.reply_request(group, p, true).await?;
            println!("{p} admitted to {group}");
        }
        Command::RejectRequest(group, p) => {
            peer.reply_request(group, p, false).await?;
            println!("{p} rejected from {group}");
        }
        Command::LeaveGroup(group) => match peer.leave_group(group).await? {
            LeaveOutcome::Left => println!("left {group}"),
            LeaveOutcome::LeaderPromoted { new_leader } => {
                println!("left {group}; {new_leader} is the new leader")
            }
            LeaveOutcome::Dissolved => println!("left {group}; group dissolved"),
        },
        Command::UploadFile(path) => {
            let f = peer.upload(&path).await?;
            println!("shared {} as {} ({} pieces)", f.filename, f.file_id, f.piece_count);
        }
        Command::ListFiles(group) => {
            for f in peer.list_files(group).await? {
                println!(
                    "{}  {}  {} bytes  seeds {}  holders {}",
                    f.file_id, f.filename, f.size, f.seeds, f.holders
                );
            }
        }
        Command::DownloadFile(file) => {
            let report = peer.download(file).await?;
            println!(
                "{} saved to {} ({} pieces from {} sources)",
                report.file_id,
                report.path.display(),
                report.pieces_fetched,
                report.sources_used
            );
        }
        Command::ShowDownloads => {
            for d in peer.downloads() {
                let state = if d.is_complete() { "C" } else { "D" };
                println!("[{state}] {} {} {}/{}", d.file_id, d.name, d.held, d.piece_count);
            }
        }
        Command::Help => println!("{HELP}"),
        Command::Exit => {}
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
