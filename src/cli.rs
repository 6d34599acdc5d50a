//! Command-line options for the `lansync` binary

use crate::config::PeerConfig;
use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

/// Peer-to-peer LAN directory sync
#[derive(Clone, Debug, Parser)]
#[command(author, version, about)]
pub struct PeerOpts {
    /// TOML config file (missing file means defaults)
    #[arg(long, default_value = "lansync.toml")]
    pub config: PathBuf,

    /// TCP+UDP port shared by every peer on the LAN
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory to synchronize
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Append log lines to this file instead of stderr
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,
}

impl PeerOpts {
    /// Config file values with command-line flags layered on top.
    pub fn resolve(&self) -> Result<PeerConfig> {
        let mut config = PeerConfig::load(&self.config)?;
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(root) = &self.root {
            config.root = root.clone();
        }
        if let Some(log_file) = &self.log_file {
            config.log_file = Some(log_file.clone());
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = dir.path().join("lansync.toml");
        std::fs::write(&cfg, "port = 5000\nroot = \"/from/file\"\n").unwrap();

        let opts = PeerOpts::parse_from([
            "lansync",
            "--config",
            cfg.to_str().unwrap(),
            "--root",
            "/from/flag",
        ]);
        let resolved = opts.resolve().unwrap();
        assert_eq!(resolved.port, 5000);
        assert_eq!(resolved.root, PathBuf::from("/from/flag"));
        assert_eq!(resolved.log_file, None);
    }

    #[test]
    fn test_defaults_without_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("none.toml");
        let opts = PeerOpts::parse_from(["lansync", "--config", missing.to_str().unwrap(), "--port", "4500"]);
        let resolved = opts.resolve().unwrap();
        assert_eq!(resolved.port, 4500);
        assert_eq!(resolved.root, PathBuf::from("."));
    }
}
