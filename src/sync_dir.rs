//! The one directory a peer keeps in sync.

use crate::error::{PeerError, PeerResult};
use crate::protocol::PEER_DIR;
use crate::protocol_core::normalize_under_root;
use crate::tree::{self, TreeDirectory};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct SynchronizedDirectory {
    root: PathBuf,
}

impl SynchronizedDirectory {
    /// Open `path`, creating it if missing.
    pub fn open<P: AsRef<Path>>(path: P) -> PeerResult<Self> {
        let path = path.as_ref();
        fs::create_dir_all(path).map_err(|e| PeerError::filesystem(path, e))?;
        let root = fs::canonicalize(path).map_err(|e| PeerError::filesystem(path, e))?;
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// `<root>/.peer`, created on first use.
    pub fn peer_dir(&self) -> PeerResult<PathBuf> {
        let dir = self.root.join(PEER_DIR);
        fs::create_dir_all(&dir).map_err(|e| PeerError::filesystem(&dir, e))?;
        Ok(dir)
    }

    pub fn tree<P: AsRef<Path>>(&self, sub_paths: &[P]) -> PeerResult<TreeDirectory> {
        tree::build(&self.root, sub_paths).map_err(|e| PeerError::filesystem(&self.root, e))
    }

    /// Path of `abs` relative to the root, if it lies under it.
    pub fn relativize(&self, abs: &Path) -> Option<PathBuf> {
        abs.strip_prefix(&self.root).ok().map(Path::to_path_buf)
    }

    /// Absolute path for a root-relative `rel`, refusing anything that escapes.
    pub fn resolve(&self, rel: &Path) -> PeerResult<PathBuf> {
        normalize_under_root(&self.root, rel).map_err(|e| PeerError::filesystem(rel, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_missing_root() {
        let dir = TempDir::new().unwrap();
        let sd = SynchronizedDirectory::open(dir.path().join("a/b")).unwrap();
        assert!(sd.path().is_dir());
        assert!(sd.path().is_absolute());
        assert!(!sd.path().join(PEER_DIR).exists());
        let peer = sd.peer_dir().unwrap();
        assert!(peer.is_dir());
        assert_eq!(sd.relativize(&peer).unwrap(), PathBuf::from(PEER_DIR));
    }

    #[test]
    fn test_relativize_and_resolve() {
        let dir = TempDir::new().unwrap();
        let sd = SynchronizedDirectory::open(dir.path()).unwrap();
        let abs = sd.path().join("docs/a.txt");
        assert_eq!(sd.relativize(&abs).unwrap(), PathBuf::from("docs/a.txt"));
        assert_eq!(sd.relativize(Path::new("/definitely/elsewhere")), None);
        assert_eq!(sd.resolve(Path::new("docs/a.txt")).unwrap(), abs);
        assert!(matches!(
            sd.resolve(Path::new("../x")),
            Err(PeerError::Filesystem { .. })
        ));
    }

    #[test]
    fn test_tree_ignores_peer_dir() {
        let dir = TempDir::new().unwrap();
        let sd = SynchronizedDirectory::open(dir.path()).unwrap();
        fs::write(sd.path().join("a.txt"), "a").unwrap();
        fs::write(sd.peer_dir().unwrap().join("action-x.json"), "{}").unwrap();
        let t = sd.tree::<&Path>(&[]).unwrap();
        assert_eq!(t.file_count(), 1);
        assert!(t.directories.is_empty());
    }
}
