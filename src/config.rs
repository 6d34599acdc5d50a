//! Peer configuration, loaded from TOML with CLI overrides on top.

use crate::protocol::{timeouts, DEFAULT_PORT};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    pub port: u16,
    pub root: PathBuf,
    pub beacon_period_secs: u64,
    pub discovery_window_secs: u64,
    pub scan_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub broadcast_addr: IpAddr,
    pub log_file: Option<PathBuf>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            root: PathBuf::from("."),
            beacon_period_secs: timeouts::BEACON_PERIOD_SECS,
            discovery_window_secs: timeouts::DISCOVERY_WINDOW_SECS,
            scan_interval_ms: timeouts::SCAN_INTERVAL_MS,
            connect_timeout_ms: timeouts::CONNECT_MS,
            broadcast_addr: IpAddr::V4(Ipv4Addr::BROADCAST),
            log_file: None,
        }
    }
}

impl PeerConfig {
    /// Read `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(data) => toml::from_str(&data)
                .with_context(|| format!("Failed to parse config {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("Failed to read config {}", path.display())),
        }
    }

    pub fn beacon_period(&self) -> Duration {
        Duration::from_secs(self.beacon_period_secs.max(1))
    }

    pub fn discovery_window(&self) -> Duration {
        Duration::from_secs(self.discovery_window_secs)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }
}
