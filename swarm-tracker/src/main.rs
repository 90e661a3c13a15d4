// Swarm tracker daemon: registry of peers, groups and file holders.

use std::net::SocketAddr;
use std::sync::Arc;

use swarm_core::Registry;
use swarm_tracker::{config, TrackerServer};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("swarm-tracker {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = config::load();
    let bind = SocketAddr::new(cfg.bind_addr, cfg.port);
    let registry = Arc::new(Registry::new());

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let server = TrackerServer::bind(bind, registry, cfg.idle_timeout()).await?;
        tokio::select! {
            r = server.run() => r?,
            r = shutdown_signal() => r?,
        }
        tracing::info!("tracker shutting down");
        Ok::<(), anyhow::Error>(())
    })
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
