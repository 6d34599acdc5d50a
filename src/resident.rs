//! Background loop that materializes incoming records and acts on manifests.

use crate::action::ActionHandler;
use crate::error::PeerError;
use crate::logger::Logger;
use crate::peer::{Incoming, Peer};
use crate::protocol_core::is_manifest_path;
use crate::tree::FileSystemTree;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

pub struct Resident {
    peer: Arc<Peer>,
    handler: Arc<ActionHandler>,
    logger: Arc<dyn Logger>,
}

impl Resident {
    pub fn new(peer: Arc<Peer>, handler: Arc<ActionHandler>, logger: Arc<dyn Logger>) -> Self {
        Self {
            peer,
            handler,
            logger,
        }
    }

    /// Handle one incoming record. Returns false once the peer is closed.
    pub fn step(&self) -> bool {
        let root = self.handler.directory().path();
        let Some(Incoming { connection, path }) = self.peer.next_incoming_file(root) else {
            return false;
        };
        let Some(rel) = path else {
            self.peer.disconnect_device(&connection);
            return true;
        };
        if !is_manifest_path(&rel) {
            return true;
        }

        let abs = root.join(&rel);
        let parsed = fs::read_to_string(&abs)
            .map_err(PeerError::from)
            .and_then(|data| FileSystemTree::from_json(&data));
        match parsed {
            Ok(manifest) => {
                self.logger.action(
                    connection.endpoint(),
                    manifest.action.as_str(),
                    &manifest.path,
                );
                if let Err(e) = self.handler.incoming_action(&connection, &manifest) {
                    self.logger
                        .error("action", &format!("{}: {e}", connection.endpoint()));
                    if e.is_connection_fatal() {
                        self.peer.disconnect_device(&connection);
                    }
                }
            }
            Err(e) => self
                .logger
                .warn("manifest", &format!("{}: {e}", rel.display())),
        }
        remove_manifest(&abs, self.logger.as_ref());
        true
    }

    pub fn run(&self) {
        while self.step() {}
    }

    /// Run on a dedicated thread until the peer closes.
    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("lansync-resident".into())
            .spawn(move || self.run())
    }
}

fn remove_manifest(path: &Path, logger: &dyn Logger) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => logger.warn("manifest", &format!("failed to remove {}: {e}", path.display())),
    }
}
