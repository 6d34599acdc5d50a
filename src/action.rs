//! Manifest exchange: sending `Sync`/`Fetch` requests and answering them.
//!
//! A `Sync` is answered with the files we hold newer, followed by a `Fetch`
//! scoped the same way so the requester pushes what *it* holds newer. The
//! `Fetch` never triggers another action, which bounds the exchange.

use crate::connection::Connection;
use crate::error::{PeerError, PeerResult};
use crate::logger::Logger;
use crate::protocol::{ACTION_PREFIX, ACTION_SUFFIX};
use crate::protocol_core::wire_path;
use crate::sync_dir::SynchronizedDirectory;
use crate::tree::{diff, Action, FileAction, FileSystemTree};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

pub struct ActionHandler {
    directory: Arc<SynchronizedDirectory>,
    logger: Arc<dyn Logger>,
}

impl ActionHandler {
    pub fn new(directory: Arc<SynchronizedDirectory>, logger: Arc<dyn Logger>) -> Self {
        Self { directory, logger }
    }

    pub fn directory(&self) -> &SynchronizedDirectory {
        &self.directory
    }

    /// Send `action` over `conn`, one manifest per entry of `sub_paths`
    /// (or a single whole-tree manifest when empty).
    ///
    /// Returns how many manifests went out.
    pub fn send_action<P: AsRef<Path>>(
        &self,
        conn: &Connection,
        action: Action,
        sub_paths: &[P],
    ) -> PeerResult<usize> {
        if sub_paths.is_empty() {
            let tree = self.directory.tree::<&Path>(&[])?;
            let manifest = FileSystemTree::new(action, "", tree);
            return self.send_manifest(conn, &manifest).map(usize::from);
        }

        let mut sent = 0;
        for sub in sub_paths {
            let sub = sub.as_ref();
            let tree = self.directory.tree(&[sub])?;
            let manifest = FileSystemTree::new(action, wire_path(sub), tree);
            if self.send_manifest(conn, &manifest)? {
                sent += 1;
            }
        }
        Ok(sent)
    }

    /// Write `manifest` under `.peer/`, send it and remove it again.
    /// Returns false when the temp file could not be produced.
    fn send_manifest(&self, conn: &Connection, manifest: &FileSystemTree) -> PeerResult<bool> {
        let json = manifest.to_json()?;
        let staged = self.directory.peer_dir().and_then(|dir| {
            let mut tmp = tempfile::Builder::new()
                .prefix(&format!("{ACTION_PREFIX}-"))
                .suffix(ACTION_SUFFIX)
                .tempfile_in(&dir)
                .map_err(|e| PeerError::filesystem(&dir, e))?;
            let written = tmp.write_all(json.as_bytes()).and_then(|_| tmp.flush());
            written.map_err(|e| PeerError::filesystem(tmp.path(), e))?;
            Ok(tmp)
        });
        let tmp = match staged {
            Ok(tmp) => tmp,
            Err(e) => {
                self.logger
                    .warn("action", &format!("{} skipped: {e}", manifest.action));
                return Ok(false);
            }
        };

        let Some(rel) = self.directory.relativize(tmp.path()) else {
            self.logger.warn(
                "action",
                &format!("{} is outside the synchronized root", tmp.path().display()),
            );
            return Ok(false);
        };
        let bytes = conn.send_file(self.directory.path(), &rel)?;
        self.logger.sent(conn.endpoint(), &rel, bytes);
        self.logger
            .action(conn.endpoint(), manifest.action.as_str(), &manifest.path);

        if let Err(e) = tmp.close() {
            self.logger.warn("action", &format!("failed to remove manifest: {e}"));
        }
        Ok(true)
    }

    /// React to a manifest received on `conn`. Returns how many files were pushed.
    pub fn incoming_action(&self, conn: &Connection, manifest: &FileSystemTree) -> PeerResult<usize> {
        match manifest.action {
            Action::Sync => {
                let pushed = self.push_newer(conn, manifest)?;
                let scope: Vec<&Path> = manifest.scope().into_iter().collect();
                self.send_action(conn, Action::Fetch, &scope)?;
                Ok(pushed)
            }
            Action::Fetch => self.push_newer(conn, manifest),
            Action::Delete => Ok(0),
        }
    }

    fn push_newer(&self, conn: &Connection, manifest: &FileSystemTree) -> PeerResult<usize> {
        let scope: Vec<&Path> = manifest.scope().into_iter().collect();
        let local = self.directory.tree(&scope)?;
        let mut pushed = 0;
        for FileAction::Push(rel) in diff(&local, &manifest.root) {
            match conn.send_file(self.directory.path(), &rel) {
                Ok(bytes) => {
                    self.logger.sent(conn.endpoint(), &rel, bytes);
                    pushed += 1;
                }
                Err(e) if e.is_connection_fatal() => return Err(e),
                // Vanished or unreadable since the tree was built
                Err(e) => self.logger.warn("push", &e.to_string()),
            }
        }
        Ok(pushed)
    }
}
