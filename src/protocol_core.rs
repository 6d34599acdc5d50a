//! Record header codec and path rules shared by the sender and receiver.

use crate::protocol::{ACTION_PREFIX, ACTION_SUFFIX, MAX_PATH_LEN, PEER_DIR, RECORD_FIXED_BYTES};
use filetime::FileTime;
use std::fs::Metadata;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

/// Decoded fixed part of a file record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub path: String,
    pub mtime_ms: i64,
    pub size: u64,
}

/// Forward-slash form of a relative path, as carried on the wire.
pub fn wire_path(rel: &Path) -> String {
    rel.components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Modification time in milliseconds since the Unix epoch.
pub fn mtime_ms(meta: &Metadata) -> i64 {
    let ft = FileTime::from_last_modification_time(meta);
    ft.unix_seconds() * 1000 + i64::from(ft.nanoseconds() / 1_000_000)
}

pub fn filetime_from_ms(ms: i64) -> FileTime {
    FileTime::from_unix_time(ms.div_euclid(1000), (ms.rem_euclid(1000) * 1_000_000) as u32)
}

/// Build record header
/// Format: PATH_LEN (2) | PATH | MTIME (8) | SIZE (8), big-endian
pub fn build_record_header(path: &str, mtime_ms: i64, size: u64) -> io::Result<Vec<u8>> {
    let bytes = path.as_bytes();
    if bytes.len() > MAX_PATH_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("path too long for record: {} bytes", bytes.len()),
        ));
    }
    let size = i64::try_from(size)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "file too large for record"))?;

    let mut header = Vec::with_capacity(RECORD_FIXED_BYTES + bytes.len());
    header.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    header.extend_from_slice(bytes);
    header.extend_from_slice(&mtime_ms.to_be_bytes());
    header.extend_from_slice(&size.to_be_bytes());
    Ok(header)
}

/// Read one record header from the stream. The payload is left unread.
pub fn read_record_header<R: Read>(reader: &mut R) -> io::Result<RecordHeader> {
    let mut len = [0u8; 2];
    reader.read_exact(&mut len)?;
    let mut path = vec![0u8; u16::from_be_bytes(len) as usize];
    reader.read_exact(&mut path)?;

    let mut mtime = [0u8; 8];
    reader.read_exact(&mut mtime)?;
    let mut size = [0u8; 8];
    reader.read_exact(&mut size)?;
    let mtime_ms = i64::from_be_bytes(mtime);
    let size = i64::from_be_bytes(size);
    let size = u64::try_from(size)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "negative payload size"))?;

    // Senders using the modified-UTF-8 form only differ on NUL and astral
    // characters; neither survives normalize_under_root anyway.
    let path = match String::from_utf8(path) {
        Ok(s) => s,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    };

    Ok(RecordHeader {
        path,
        mtime_ms,
        size,
    })
}

/// Normalize a received path to be safely under a root directory.
/// Rejects absolute paths, parent directory components and NUL bytes.
pub fn normalize_under_root(root: &Path, p: &Path) -> io::Result<PathBuf> {
    if p.to_string_lossy().contains('\0') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "path contains NUL byte",
        ));
    }

    let mut safe = PathBuf::new();
    for component in p.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(s) => safe.push(s),
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("path contains disallowed component: {:?}", other),
                ))
            }
        }
    }
    if safe.as_os_str().is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty path"));
    }
    Ok(root.join(safe))
}

/// Create parent directory if needed
pub fn ensure_parent_exists(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// True for `.peer/action*.json`.
///
/// Only direct children of `.peer` count; manifests are always written there.
pub fn is_manifest_path(rel: &Path) -> bool {
    let mut components = rel.components();
    let in_peer_dir = matches!(
        components.next(),
        Some(Component::Normal(first)) if first == PEER_DIR
    );
    if !in_peer_dir {
        return false;
    }
    let name = match rel.file_name() {
        Some(n) => n.to_string_lossy(),
        None => return false,
    };
    components.count() == 1 && name.starts_with(ACTION_PREFIX) && name.ends_with(ACTION_SUFFIX)
}
