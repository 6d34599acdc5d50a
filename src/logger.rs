use anyhow::Result;
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Mutex;

/// Diagnostic sink shared by every component of a peer.
pub trait Logger: Send + Sync {
    fn listening(&self, _port: u16) {}
    fn connected(&self, _endpoint: SocketAddr, _inbound: bool) {}
    fn disconnected(&self, _endpoint: SocketAddr) {}
    fn sent(&self, _endpoint: SocketAddr, _path: &Path, _bytes: u64) {}
    fn received(&self, _endpoint: SocketAddr, _path: &Path, _bytes: u64) {}
    fn action(&self, _endpoint: SocketAddr, _action: &str, _scope: &str) {}
    fn warn(&self, _context: &str, _msg: &str) {}
    fn error(&self, _context: &str, _msg: &str) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

fn format_event(event: &Event<'_>) -> String {
    match event {
        Event::Listening(port) => format!("LISTEN port={port}"),
        Event::Connected(ep, inbound) => format!(
            "CONNECT peer={} dir={}",
            ep,
            if *inbound { "in" } else { "out" }
        ),
        Event::Disconnected(ep) => format!("DISCONNECT peer={ep}"),
        Event::Sent(ep, p, b) => format!("SEND peer={} path={} bytes={}", ep, p.display(), b),
        Event::Received(ep, p, b) => format!("RECV peer={} path={} bytes={}", ep, p.display(), b),
        Event::Action(ep, a, s) => format!("ACTION peer={ep} action={a} scope={s:?}"),
        Event::Warn(ctx, msg) => format!("WARN ctx={ctx} msg={msg}"),
        Event::Error(ctx, msg) => format!("ERROR ctx={ctx} msg={msg}"),
    }
}

enum Event<'a> {
    Listening(u16),
    Connected(SocketAddr, bool),
    Disconnected(SocketAddr),
    Sent(SocketAddr, &'a Path, u64),
    Received(SocketAddr, &'a Path, u64),
    Action(SocketAddr, &'a str, &'a str),
    Warn(&'a str, &'a str),
    Error(&'a str, &'a str),
}

/// Line-oriented sink; implementors only decide where a finished line goes.
pub trait LineSink: Send + Sync {
    fn line(&self, s: &str);
}

impl<T: LineSink> Logger for T {
    fn listening(&self, port: u16) {
        self.line(&format_event(&Event::Listening(port)));
    }
    fn connected(&self, endpoint: SocketAddr, inbound: bool) {
        self.line(&format_event(&Event::Connected(endpoint, inbound)));
    }
    fn disconnected(&self, endpoint: SocketAddr) {
        self.line(&format_event(&Event::Disconnected(endpoint)));
    }
    fn sent(&self, endpoint: SocketAddr, path: &Path, bytes: u64) {
        self.line(&format_event(&Event::Sent(endpoint, path, bytes)));
    }
    fn received(&self, endpoint: SocketAddr, path: &Path, bytes: u64) {
        self.line(&format_event(&Event::Received(endpoint, path, bytes)));
    }
    fn action(&self, endpoint: SocketAddr, action: &str, scope: &str) {
        self.line(&format_event(&Event::Action(endpoint, action, scope)));
    }
    fn warn(&self, context: &str, msg: &str) {
        self.line(&format_event(&Event::Warn(context, msg)));
    }
    fn error(&self, context: &str, msg: &str) {
        self.line(&format_event(&Event::Error(context, msg)));
    }
}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }
}

impl LineSink for TextLogger {
    fn line(&self, s: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
        }
    }
}

/// Writes the same lines as `TextLogger` to stderr.
pub struct ConsoleLogger;

impl LineSink for ConsoleLogger {
    fn line(&self, s: &str) {
        eprintln!("[{}] {}", Utc::now().to_rfc3339(), s);
    }
}
