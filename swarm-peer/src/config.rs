//! Load peer config from file and environment.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use swarm_core::protocol::DEFAULT_TRACKER_PORT;

/// Peer configuration. File: ~/.config/swarm/peer.toml or /etc/swarm/peer.toml.
/// Env overrides: SWARM_TRACKER_ADDR, SWARM_TRANSFER_PORT, SWARM_DOWNLOAD_DIR.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Tracker command endpoint (default 127.0.0.1:45000).
    #[serde(default = "default_tracker_addr")]
    pub tracker_addr: SocketAddr,
    /// Port the transfer server listens on (default 45001; 0 picks a free port).
    #[serde(default = "default_transfer_port")]
    pub transfer_port: u16,
    /// Where downloads are written (default ./downloads).
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Idle timeout for inbound transfer connections in seconds (default 300).
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

fn default_tracker_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], DEFAULT_TRACKER_PORT))
}
fn default_transfer_port() -> u16 {
    45001
}
fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}
fn default_idle_timeout_secs() -> u64 {
    300
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tracker_addr: default_tracker_addr(),
            transfer_port: default_transfer_port(),
            download_dir: default_download_dir(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

impl Config {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |k| std::env::var(k).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(a) = var("SWARM_TRACKER_ADDR").and_then(|s| s.parse::<SocketAddr>().ok()) {
        c.tracker_addr = a;
    }
    if let Some(p) = var("SWARM_TRANSFER_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.transfer_port = p;
    }
    if let Some(d) = var("SWARM_DOWNLOAD_DIR").filter(|s| !s.is_empty()) {
        c.download_dir = PathBuf::from(d);
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/swarm/peer.toml"));
    }
    out.push(PathBuf::from("/etc/swarm/peer.toml"));
    out
}

fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    let text = match std::fs::read_to_string(&path) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "cannot read config, using defaults");
            return None;
        }
    };
    match toml::from_str::<Config>(&text) {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "invalid config, using defaults");
            None
        }
    }
}
