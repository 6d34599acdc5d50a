//! One TCP stream carrying length-prefixed file records in both directions.
//!
//! Send and receive halves are independent clones of the same socket, each
//! behind its own lock: two senders serialize, a sender and a receiver do not.

use crate::error::{PeerError, PeerResult};
use crate::protocol::{CHUNK_SIZE, PARTIAL_PREFIX};
use crate::protocol_core::{
    build_record_header, ensure_parent_exists, filetime_from_ms, mtime_ms, normalize_under_root,
    read_record_header, wire_path, RecordHeader,
};
use parking_lot::Mutex;
use std::fmt;
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::NamedTempFile;

pub struct Connection {
    endpoint: SocketAddr,
    send: Mutex<TcpStream>,
    recv: Mutex<TcpStream>,
    // Unlocked handle so close() never waits behind a blocked reader or writer
    control: TcpStream,
    closed: AtomicBool,
}

impl Connection {
    pub fn from_stream(stream: TcpStream) -> io::Result<Self> {
        let endpoint = stream.peer_addr()?;
        tune_socket(&stream);
        let recv = stream.try_clone()?;
        let control = stream.try_clone()?;
        Ok(Self {
            endpoint,
            send: Mutex::new(stream),
            recv: Mutex::new(recv),
            control,
            closed: AtomicBool::new(false),
        })
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Terminal: a closed connection is never reopened.
    pub fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.control.shutdown(Shutdown::Both)
    }

    fn mark_closed(&self) {
        let _ = self.close();
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("connection to {} is closed", self.endpoint),
            ));
        }
        Ok(())
    }

    /// Send `root/rel` as one record. Returns the payload size.
    ///
    /// Local read failures before the header is written leave the stream
    /// untouched and surface as `Filesystem`. Anything after that breaks the
    /// framing, so the connection is closed and `Io` is returned.
    pub fn send_file(&self, root: &Path, rel: &Path) -> PeerResult<u64> {
        self.ensure_open()?;
        let abs = root.join(rel);
        let mut file = File::open(&abs).map_err(|e| PeerError::filesystem(&abs, e))?;
        let meta = file.metadata().map_err(|e| PeerError::filesystem(&abs, e))?;
        let size = meta.len();
        let header = build_record_header(&wire_path(rel), mtime_ms(&meta), size)
            .map_err(|e| PeerError::filesystem(&abs, e))?;

        let mut stream = self.send.lock();
        let written = (|| -> io::Result<u64> {
            stream.write_all(&header)?;
            let mut limited = (&mut file).take(size);
            let copied = io::copy(&mut limited, &mut *stream)?;
            if copied < size {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("{} shrank while sending", abs.display()),
                ));
            }
            stream.flush()?;
            Ok(copied)
        })();

        written.map_err(|e| {
            self.mark_closed();
            PeerError::Io(e)
        })
    }

    /// Non-blocking check for the next record.
    ///
    /// `Ok(None)` when nothing is pending. Otherwise reads exactly one record
    /// into `dest_root` and returns its relative path.
    pub fn try_receive_file(&self, dest_root: &Path) -> PeerResult<Option<PathBuf>> {
        self.ensure_open()?;
        let mut stream = self.recv.lock();

        match self.has_pending_input(&stream) {
            Ok(false) => return Ok(None),
            Ok(true) => {}
            Err(e) => {
                self.mark_closed();
                return Err(PeerError::Io(e));
            }
        }

        let header = read_record_header(&mut *stream).map_err(|e| {
            self.mark_closed();
            PeerError::Io(e)
        })?;

        let result = match normalize_under_root(dest_root, Path::new(&header.path)) {
            Ok(target) => receive_payload(&mut stream, &target, &header),
            Err(e) => skip_payload(&mut stream, header.size)
                .and_then(|_| Err(PeerError::filesystem(&header.path, e))),
        };
        if let Err(PeerError::Io(_)) = &result {
            self.mark_closed();
        }
        result?;

        Ok(Some(PathBuf::from(&header.path)))
    }

    #[cfg(unix)]
    fn has_pending_input(&self, stream: &TcpStream) -> io::Result<bool> {
        use std::os::fd::AsRawFd;
        let fd = stream.as_raw_fd();
        let mut byte = 0u8;
        loop {
            // Peek without toggling O_NONBLOCK, which the send half shares
            let r = unsafe {
                libc::recv(
                    fd,
                    &mut byte as *mut u8 as *mut libc::c_void,
                    1,
                    libc::MSG_PEEK | libc::MSG_DONTWAIT,
                )
            };
            if r > 0 {
                return Ok(true);
            }
            if r == 0 {
                return Err(peer_closed());
            }
            let e = io::Error::last_os_error();
            match e.kind() {
                io::ErrorKind::WouldBlock => return Ok(false),
                io::ErrorKind::Interrupted => continue,
                _ => return Err(e),
            }
        }
    }

    #[cfg(not(unix))]
    fn has_pending_input(&self, stream: &TcpStream) -> io::Result<bool> {
        // Non-blocking mode is per socket here; hold the send lock so no
        // writer observes it.
        let _send = self.send.lock();
        stream.set_nonblocking(true)?;
        let mut byte = [0u8; 1];
        let r = stream.peek(&mut byte);
        stream.set_nonblocking(false)?;
        match r {
            Ok(0) => Err(peer_closed()),
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e),
        }
    }
}

fn peer_closed() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed the connection")
}

/// Stream the payload into a staging file beside `target` and move it into
/// place only once every byte arrived. `target` is never touched by a failed
/// record. A local write failure keeps draining the stream so the next record
/// stays aligned.
fn receive_payload(stream: &mut TcpStream, target: &Path, header: &RecordHeader) -> PeerResult<()> {
    let mut staged = stage_for(target);

    let mut remaining = header.size;
    let mut buf = vec![0u8; CHUNK_SIZE.min(header.size as usize).max(1)];
    while remaining > 0 {
        let to_read = remaining.min(buf.len() as u64) as usize;
        // Returning drops the staging file, which removes it
        let n = match stream.read(&mut buf[..to_read]) {
            Ok(0) => {
                return Err(PeerError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "unexpected EOF during file payload",
                )))
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(PeerError::Io(e)),
        };
        if let Ok(f) = staged.as_mut() {
            if let Err(e) = f.write_all(&buf[..n]) {
                staged = Err(e);
            }
        }
        remaining -= n as u64;
    }

    let staged = staged.map_err(|e| PeerError::filesystem(target, e))?;
    filetime::set_file_mtime(staged.path(), filetime_from_ms(header.mtime_ms))
        .map_err(|e| PeerError::filesystem(target, e))?;
    staged
        .persist(target)
        .map_err(|e| PeerError::filesystem(target, e.error))?;
    Ok(())
}

fn stage_for(target: &Path) -> io::Result<NamedTempFile> {
    ensure_parent_exists(target)?;
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    let mut builder = tempfile::Builder::new();
    builder.prefix(PARTIAL_PREFIX);
    // Same mode File::create would give, instead of tempfile's 0600
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        builder.permissions(std::fs::Permissions::from_mode(0o666));
    }
    builder.tempfile_in(dir)
}

fn skip_payload(stream: &mut TcpStream, size: u64) -> PeerResult<()> {
    let skipped = io::copy(&mut stream.take(size), &mut io::sink())?;
    if skipped < size {
        return Err(PeerError::Io(peer_closed()));
    }
    Ok(())
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.endpoint == other.endpoint
    }
}

impl Eq for Connection {}

impl Hash for Connection {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.endpoint.hash(state);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// Socket tuning: disable Nagle and detect dead idle peers via keepalive
fn tune_socket(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    #[cfg(unix)]
    {
        use std::os::fd::AsRawFd;
        let fd = stream.as_raw_fd();
        unsafe {
            let keepalive: libc::c_int = 1;
            let _ = libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_KEEPALIVE,
                &keepalive as *const _ as *const libc::c_void,
                std::mem::size_of_val(&keepalive) as libc::socklen_t,
            );

            #[cfg(target_os = "linux")]
            {
                let keepidle: libc::c_int = 60; // First keepalive after 60s idle
                let keepintvl: libc::c_int = 10; // 10s between keepalives
                let keepcnt: libc::c_int = 6; // 6 unanswered before failure
                for (opt, val) in [
                    (libc::TCP_KEEPIDLE, keepidle),
                    (libc::TCP_KEEPINTVL, keepintvl),
                    (libc::TCP_KEEPCNT, keepcnt),
                ] {
                    let _ = libc::setsockopt(
                        fd,
                        libc::IPPROTO_TCP,
                        opt,
                        &val as *const _ as *const libc::c_void,
                        std::mem::size_of_val(&val) as libc::socklen_t,
                    );
                }
            }
        }
    }
}
