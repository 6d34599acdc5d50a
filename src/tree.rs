//! Directory-tree manifests and the newer-mtime-wins diff.

use crate::error::PeerResult;
use crate::protocol::{PARTIAL_PREFIX, PEER_DIR};
use crate::protocol_core::{mtime_ms, normalize_under_root};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Sync,
    Fetch,
    /// Reserved; receivers ignore it.
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Sync => "Sync",
            Action::Fetch => "Fetch",
            Action::Delete => "Delete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeFile {
    pub name: String,
    /// Milliseconds since the Unix epoch.
    pub mtime: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeDirectory {
    pub name: String,
    #[serde(default)]
    pub directories: Vec<TreeDirectory>,
    #[serde(default)]
    pub files: Vec<TreeFile>,
}

impl TreeDirectory {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    fn child_dir(&mut self, name: &str) -> &mut TreeDirectory {
        let idx = match self.directories.iter().position(|d| d.name == name) {
            Some(i) => i,
            None => {
                self.directories.push(TreeDirectory::new(name));
                self.directories.len() - 1
            }
        };
        &mut self.directories[idx]
    }

    /// Walk down `rel`, creating missing directories.
    fn dir_at(&mut self, rel: &Path) -> &mut TreeDirectory {
        let mut node = self;
        for part in rel.components() {
            if let Component::Normal(s) = part {
                node = node.child_dir(&s.to_string_lossy());
            }
        }
        node
    }

    fn insert_file(&mut self, rel: &Path, mtime: i64) {
        let Some(name) = rel.file_name() else { return };
        let parent = rel.parent().unwrap_or_else(|| Path::new(""));
        let dir = self.dir_at(parent);
        let name = name.to_string_lossy().into_owned();
        match dir.files.iter_mut().find(|f| f.name == name) {
            Some(f) => f.mtime = mtime,
            None => dir.files.push(TreeFile { name, mtime }),
        }
    }

    fn sort(&mut self) {
        self.files.sort_by(|a, b| a.name.cmp(&b.name));
        self.directories.sort_by(|a, b| a.name.cmp(&b.name));
        for d in &mut self.directories {
            d.sort();
        }
    }

    /// Number of files in this subtree.
    pub fn file_count(&self) -> usize {
        self.files.len() + self.directories.iter().map(|d| d.file_count()).sum::<usize>()
    }
}

/// `(action, scope, tree)` as exchanged between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSystemTree {
    pub action: Action,
    /// Sub-path of the synchronized root the action applies to; empty for
    /// the whole tree.
    #[serde(default)]
    pub path: String,
    pub root: TreeDirectory,
}

impl FileSystemTree {
    pub fn new(action: Action, path: impl Into<String>, root: TreeDirectory) -> Self {
        Self {
            action,
            path: path.into(),
            root,
        }
    }

    pub fn scope(&self) -> Option<&Path> {
        if self.path.is_empty() {
            None
        } else {
            Some(Path::new(&self.path))
        }
    }

    pub fn to_json(&self) -> PeerResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(data: &str) -> PeerResult<Self> {
        Ok(serde_json::from_str(data)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileAction {
    /// Send this root-relative file to the peer.
    Push(PathBuf),
}

fn is_peer_dir(rel: &Path) -> bool {
    matches!(rel.components().next(), Some(Component::Normal(s)) if s == PEER_DIR)
}

/// Snapshot `root` as a tree, skipping `.peer/`.
///
/// With `sub_paths`, only those entries (and the directories leading to them)
/// are included. Sub-paths that do not exist contribute nothing.
pub fn build<P: AsRef<Path>>(root: &Path, sub_paths: &[P]) -> io::Result<TreeDirectory> {
    let name = root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut tree = TreeDirectory::new(name);

    if sub_paths.is_empty() {
        walk_into(&mut tree, root, root);
    } else {
        for sub in sub_paths {
            let abs = normalize_under_root(root, sub.as_ref())?;
            if abs.exists() {
                walk_into(&mut tree, root, &abs);
            }
        }
    }

    tree.sort();
    Ok(tree)
}

fn walk_into(tree: &mut TreeDirectory, root: &Path, start: &Path) {
    let entries = WalkDir::new(start)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| match e.path().strip_prefix(root) {
            Ok(rel) => !is_peer_dir(rel),
            Err(_) => false,
        })
        .filter_map(|e| e.ok()); // skip unreadable entries

    for entry in entries {
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        if rel.as_os_str().is_empty() {
            continue;
        }
        if entry.file_type().is_dir() {
            tree.dir_at(rel);
        } else if entry.file_type().is_file() {
            // Payloads still in flight
            if entry.file_name().to_string_lossy().starts_with(PARTIAL_PREFIX) {
                continue;
            }
            if let Ok(meta) = entry.metadata() {
                tree.insert_file(rel, mtime_ms(&meta));
            }
        }
    }
}

/// Files `local` should push to the owner of `remote`.
///
/// Pre-order over both trees aligned by name; a file is pushed when the remote
/// side lacks it or holds an older copy. Root names are not compared.
pub fn diff(local: &TreeDirectory, remote: &TreeDirectory) -> Vec<FileAction> {
    let mut out = Vec::new();
    diff_into(local, Some(remote), Path::new(""), &mut out);
    out
}

fn diff_into(
    local: &TreeDirectory,
    remote: Option<&TreeDirectory>,
    prefix: &Path,
    out: &mut Vec<FileAction>,
) {
    let theirs: HashMap<&str, i64> = remote
        .map(|r| r.files.iter().map(|f| (f.name.as_str(), f.mtime)).collect())
        .unwrap_or_default();
    for file in &local.files {
        match theirs.get(file.name.as_str()) {
            Some(&mtime) if mtime >= file.mtime => {}
            _ => out.push(FileAction::Push(prefix.join(&file.name))),
        }
    }

    let their_dirs: HashMap<&str, &TreeDirectory> = remote
        .map(|r| r.directories.iter().map(|d| (d.name.as_str(), d)).collect())
        .unwrap_or_default();
    for dir in &local.directories {
        let other = their_dirs.get(dir.name.as_str()).copied();
        diff_into(dir, other, &prefix.join(&dir.name), out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PeerError;
    use crate::protocol_core::filetime_from_ms;
    use std::fs;
    use tempfile::TempDir;

    fn file(name: &str, mtime: i64) -> TreeFile {
        TreeFile {
            name: name.into(),
            mtime,
        }
    }

    fn write(root: &Path, rel: &str, body: &str, mtime: i64) {
        let p = root.join(rel);
        fs::create_dir_all(p.parent().unwrap()).unwrap();
        fs::write(&p, body).unwrap();
        filetime::set_file_mtime(&p, filetime_from_ms(mtime)).unwrap();
    }

    fn pushes(actions: Vec<FileAction>) -> Vec<String> {
        actions
            .into_iter()
            .map(|FileAction::Push(p)| crate::protocol_core::wire_path(&p))
            .collect()
    }

    #[test]
    fn test_build_skips_peer_dir_and_sorts() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write(root, "b.txt", "b", 2000);
        write(root, "a.txt", "a", 1000);
        write(root, "docs/x.md", "x", 3000);
        write(root, ".peer/action-1.json", "{}", 4000);
        write(root, "docs/.lansync-part-Ab12", "partial", 5000);
        fs::create_dir_all(root.join("empty")).unwrap();

        let tree = build::<&Path>(root, &[]).unwrap();
        assert_eq!(tree.files, vec![file("a.txt", 1000), file("b.txt", 2000)]);
        let names: Vec<&str> = tree.directories.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["docs", "empty"]);
        assert_eq!(tree.directories[0].files, vec![file("x.md", 3000)]);
        assert_eq!(tree.file_count(), 3);
    }

    #[test]
    fn test_build_with_sub_paths_keeps_ancestors_only() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write(root, "top.txt", "t", 1);
        write(root, "docs/a.txt", "a", 2);
        write(root, "docs/deep/b.txt", "b", 3);
        write(root, "other/c.txt", "c", 4);

        let tree = build(root, &["docs/deep", "missing"]).unwrap();
        assert!(tree.files.is_empty());
        assert_eq!(tree.directories.len(), 1);
        let docs = &tree.directories[0];
        assert_eq!(docs.name, "docs");
        assert!(docs.files.is_empty());
        assert_eq!(docs.directories[0].files, vec![file("b.txt", 3)]);

        let single = build(root, &["docs/a.txt"]).unwrap();
        assert_eq!(single.directories[0].files, vec![file("a.txt", 2)]);
        assert!(single.directories[0].directories.is_empty());
    }

    #[test]
    fn test_build_rejects_escaping_sub_path() {
        let dir = TempDir::new().unwrap();
        assert!(build(dir.path(), &["../outside"]).is_err());
    }

    #[test]
    fn test_build_never_presents_peer_dir_sub_path() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), ".peer/action-1.json", "{}", 1);
        let tree = build(dir.path(), &[".peer"]).unwrap();
        assert_eq!(tree.file_count(), 0);
    }

    #[test]
    fn test_diff_newer_or_missing_is_pushed() {
        let mut local = TreeDirectory::new("mine");
        local.files = vec![file("new.txt", 5), file("newer.txt", 20), file("older.txt", 1), file("same.txt", 7)];
        let mut sub = TreeDirectory::new("docs");
        sub.files = vec![file("a.txt", 1000)];
        local.directories = vec![sub];

        let mut remote = TreeDirectory::new("theirs");
        remote.files = vec![file("newer.txt", 10), file("older.txt", 9), file("same.txt", 7), file("only-remote.txt", 1)];

        assert_eq!(
            pushes(diff(&local, &remote)),
            vec!["new.txt", "newer.txt", "docs/a.txt"]
        );
    }

    #[test]
    fn test_diff_is_empty_for_identical_trees() {
        let mut t = TreeDirectory::new("x");
        t.files = vec![file("a", 1)];
        assert!(diff(&t, &t).is_empty());
    }

    #[test]
    fn test_manifest_json_shape() {
        let mut root = TreeDirectory::new("sync");
        root.files = vec![file("x.txt", 1730000000000)];
        let m = FileSystemTree::new(Action::Sync, "docs", root);
        let v: serde_json::Value = serde_json::from_str(&m.to_json().unwrap()).unwrap();
        assert_eq!(v["action"], "Sync");
        assert_eq!(v["path"], "docs");
        assert_eq!(v["root"]["name"], "sync");
        assert_eq!(v["root"]["files"][0]["name"], "x.txt");
        assert_eq!(v["root"]["files"][0]["mtime"], 1730000000000i64);
        assert!(v["root"]["directories"].as_array().unwrap().is_empty());
        assert_eq!(FileSystemTree::from_json(&m.to_json().unwrap()).unwrap(), m);
    }

    #[test]
    fn test_manifest_ignores_unknown_fields() {
        let json = r#"{"action":"Fetch","root":{"name":"r","files":[{"name":"a","mtime":3,"size":9}],"extra":1},"version":2}"#;
        let m = FileSystemTree::from_json(json).unwrap();
        assert_eq!(m.action, Action::Fetch);
        assert_eq!(m.scope(), None);
        assert_eq!(m.root.files, vec![file("a", 3)]);
    }

    #[test]
    fn test_manifest_missing_fields_are_malformed() {
        for bad in [
            "{",
            r#"{"path":"","root":{"name":"r"}}"#,
            r#"{"action":"Sync","path":""}"#,
            r#"{"action":"Sync","root":{"name":"r","files":[{"name":"a"}]}}"#,
            r#"{"action":"Merge","root":{"name":"r"}}"#,
        ] {
            assert!(
                matches!(FileSystemTree::from_json(bad), Err(PeerError::ManifestMalformed(_))),
                "accepted {bad}"
            );
        }
    }
}
