//! Runtime knobs for the `watch` and `serve` commands.

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use versions_watch::DEFAULT_RECEIVE_TIMEOUT;

pub const DEFAULT_LISTEN: SocketAddr = SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::LOCALHOST), 5000);
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Directory tree to watch
    pub root: PathBuf,
    /// Quiet window for coalescing raw filesystem events into one batch
    pub debounce: Duration,
    /// How long the runner waits for a batch before checking for shutdown
    pub receive_timeout: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            debounce: DEFAULT_DEBOUNCE,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
        }
    }
}

impl WatchConfig {
    pub fn from_millis(root: PathBuf, debounce_ms: u64, receive_timeout_ms: u64) -> Self {
        Self {
            root,
            debounce: Duration::from_millis(debounce_ms),
            // A zero timeout would spin the runner loop.
            receive_timeout: Duration::from_millis(receive_timeout_ms.max(1)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServeConfig {
    pub listen: SocketAddr,
    /// Session log served read-only
    pub wal_path: PathBuf,
    /// Blob directory for `/blobs/{sha256}`
    pub snapshot_dir: PathBuf,
}

impl ServeConfig {
    pub fn new(wal_path: PathBuf, snapshot_dir: PathBuf) -> Self {
        Self {
            listen: DEFAULT_LISTEN,
            wal_path,
            snapshot_dir,
        }
    }

    pub fn with_listen(mut self, listen: SocketAddr) -> Self {
        self.listen = listen;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_defaults() {
        let cfg = WatchConfig::default();
        assert_eq!(cfg.root, PathBuf::from("."));
        assert_eq!(cfg.debounce, DEFAULT_DEBOUNCE);
        assert_eq!(cfg.receive_timeout, DEFAULT_RECEIVE_TIMEOUT);
    }

    #[test]
    fn test_zero_receive_timeout_is_clamped() {
        let cfg = WatchConfig::from_millis(PathBuf::from("/tmp"), 0, 0);
        assert_eq!(cfg.debounce, Duration::ZERO);
        assert_eq!(cfg.receive_timeout, Duration::from_millis(1));
    }

    #[test]
    fn test_serve_default_listen() {
        let cfg = ServeConfig::new(PathBuf::from("s.wal"), PathBuf::from("blobs"));
        assert_eq!(cfg.listen.to_string(), "127.0.0.1:5000");
        let cfg = cfg.with_listen("0.0.0.0:8080".parse().unwrap());
        assert_eq!(cfg.listen.port(), 8080);
    }
}
