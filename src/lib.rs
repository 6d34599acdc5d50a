//! lansync library
//!
//! Peer-to-peer directory synchronization for a LAN: UDP beacon discovery,
//! framed file records over TCP and a newer-mtime-wins manifest exchange.

pub mod action;
pub mod broadcast;
pub mod cli;
pub mod config;
pub mod connection;
pub mod console;
pub mod error;
pub mod logger;
pub mod peer;
pub mod protocol;
pub mod protocol_core;
pub mod registry;
pub mod resident;
pub mod sync_dir;
pub mod tree;

pub use error::{PeerError, PeerResult};
