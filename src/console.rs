//! Line-oriented console driving a running peer.
//!
//! Indices given to `disconnect`, `sync` and `fetch` refer to the most recent
//! `list` output, so they stay stable while connections come and go.

use crate::action::ActionHandler;
use crate::connection::Connection;
use crate::peer::Peer;
use crate::tree::Action;
use anyhow::{anyhow, bail, Context, Result};
use std::io::{BufRead, Write};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Devices,
    /// Dial an address; without a port the peer's own port is used.
    Connect(IpAddr, Option<u16>),
    List,
    Disconnect(usize),
    Send {
        action: Action,
        index: usize,
        paths: Vec<String>,
    },
    Help,
    Exit,
}

pub const HELP: &str = "\
devices                  peers heard on the LAN
connect <ip>[:port]      open a connection
list                     connected peers, numbered
disconnect <n>           close connection n from the last list
sync <n> [path...]       two-way sync with connection n
fetch <n> [path...]      ask connection n for its newer files
help                     this text
exit                     quit";

/// Parse one console line. Blank lines yield `None`.
pub fn parse_command(line: &str) -> Result<Option<Command>> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let rest: Vec<&str> = words.collect();

    let cmd = match verb.to_ascii_lowercase().as_str() {
        "devices" => Command::Devices,
        "list" => Command::List,
        "help" | "?" => Command::Help,
        "exit" | "quit" => Command::Exit,
        "connect" => {
            let target = single_arg(verb, &rest)?;
            if let Ok(addr) = target.parse::<SocketAddr>() {
                Command::Connect(addr.ip(), Some(addr.port()))
            } else {
                let ip = target
                    .parse::<IpAddr>()
                    .with_context(|| format!("not an address: {target}"))?;
                Command::Connect(ip, None)
            }
        }
        "disconnect" => Command::Disconnect(parse_index(single_arg(verb, &rest)?)?),
        "sync" | "fetch" => {
            let (first, paths) = rest
                .split_first()
                .ok_or_else(|| anyhow!("usage: {verb} <n> [path...]"))?;
            Command::Send {
                action: if verb.eq_ignore_ascii_case("sync") {
                    Action::Sync
                } else {
                    Action::Fetch
                },
                index: parse_index(first)?,
                paths: paths.iter().map(|p| p.to_string()).collect(),
            }
        }
        other => bail!("unknown command '{other}', try 'help'"),
    };
    Ok(Some(cmd))
}

fn single_arg<'a>(verb: &str, rest: &[&'a str]) -> Result<&'a str> {
    match rest {
        [one] => Ok(*one),
        _ => bail!("usage: {verb} <argument>"),
    }
}

fn parse_index(s: &str) -> Result<usize> {
    s.parse().with_context(|| format!("not an index: {s}"))
}

pub struct Console {
    peer: Arc<Peer>,
    handler: Arc<ActionHandler>,
    listed: Vec<Arc<Connection>>,
}

impl Console {
    pub fn new(peer: Arc<Peer>, handler: Arc<ActionHandler>) -> Self {
        Self {
            peer,
            handler,
            listed: Vec::new(),
        }
    }

    /// Run one command. Returns false when the console should exit.
    pub fn execute<W: Write>(&mut self, cmd: Command, out: &mut W) -> Result<bool> {
        match cmd {
            Command::Devices => {
                let mut found: Vec<IpAddr> = self.peer.find_devices()?.into_iter().collect();
                found.sort();
                if found.is_empty() {
                    writeln!(out, "no peers heard yet")?;
                }
                for ip in found {
                    writeln!(out, "{ip}")?;
                }
            }
            Command::Connect(ip, port) => {
                let endpoint = SocketAddr::new(ip, port.unwrap_or_else(|| self.peer.port()));
                let conn = self.peer.connect_endpoint(endpoint)?;
                writeln!(out, "connected to {}", conn.endpoint())?;
            }
            Command::List => {
                self.listed = self.peer.connected_devices();
                if self.listed.is_empty() {
                    writeln!(out, "no connections")?;
                }
                for (i, conn) in self.listed.iter().enumerate() {
                    writeln!(out, "{i}: {}", conn.endpoint())?;
                }
            }
            Command::Disconnect(index) => {
                let conn = self.listed(index)?;
                self.peer.disconnect_device(&conn);
                writeln!(out, "disconnected {}", conn.endpoint())?;
            }
            Command::Send {
                action,
                index,
                paths,
            } => {
                let conn = self.listed(index)?;
                let sent = self.handler.send_action(&conn, action, paths.as_slice())?;
                writeln!(out, "{action} sent to {} ({sent} manifest(s))", conn.endpoint())?;
            }
            Command::Help => writeln!(out, "{HELP}")?,
            Command::Exit => return Ok(false),
        }
        Ok(true)
    }

    fn listed(&self, index: usize) -> Result<Arc<Connection>> {
        self.listed
            .get(index)
            .cloned()
            .ok_or_else(|| anyhow!("no connection {index}; run 'list' first"))
    }

    /// Read commands until `exit`, end of input or peer shutdown.
    /// Command failures are reported and the loop continues.
    pub fn run<R: BufRead, W: Write>(&mut self, input: R, mut out: W) -> Result<()> {
        write!(out, "> ")?;
        out.flush()?;
        for line in input.lines() {
            let line = line?;
            if self.peer.is_closed() {
                break;
            }
            let keep_going = match parse_command(&line) {
                Ok(Some(cmd)) => match self.execute(cmd, &mut out) {
                    Ok(keep_going) => keep_going,
                    Err(e) => {
                        writeln!(out, "error: {e:#}")?;
                        true
                    }
                },
                Ok(None) => true,
                Err(e) => {
                    writeln!(out, "error: {e:#}")?;
                    true
                }
            };
            if !keep_going {
                break;
            }
            write!(out, "> ")?;
            out.flush()?;
        }
        Ok(())
    }
}
