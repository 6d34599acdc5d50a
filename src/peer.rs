//! User-visible front of the transport: discovery, connection management and
//! a single blocking "next incoming file" primitive over all connections.

use crate::broadcast::{local_addresses, BroadcastAgent, BroadcastConfig};
use crate::config::PeerConfig;
use crate::connection::Connection;
use crate::error::{PeerError, PeerResult};
use crate::logger::Logger;
use crate::registry::Registry;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, UdpSocket};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Result of one successful scan.
///
/// `path` is `None` when `connection` failed mid-stream; the caller is
/// expected to disconnect it.
#[derive(Debug)]
pub struct Incoming {
    pub connection: Arc<Connection>,
    pub path: Option<PathBuf>,
}

pub struct Peer {
    port: u16,
    broadcast: BroadcastAgent,
    registry: Arc<Registry>,
    logger: Arc<dyn Logger>,
    discovery_window: Duration,
    scan_interval: Duration,
    connect_timeout: Duration,
    // One consumer scans at a time; holds the endpoint served last
    scan: Mutex<Option<SocketAddr>>,
    closed: AtomicBool,
}

/// Both the TCP and the UDP side of `port` must be bindable.
pub fn ensure_port_available(port: u16) -> PeerResult<()> {
    if port == 0 {
        return Err(PeerError::PortUnavailable {
            port,
            source: io::Error::new(
                io::ErrorKind::InvalidInput,
                "port 0 would give TCP and UDP different ports",
            ),
        });
    }
    let tcp = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
        .map_err(|source| PeerError::PortUnavailable { port, source })?;
    let udp = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))
        .map_err(|source| PeerError::PortUnavailable { port, source })?;
    drop(tcp);
    drop(udp);
    Ok(())
}

impl Peer {
    pub fn new(config: &PeerConfig, logger: Arc<dyn Logger>) -> PeerResult<Self> {
        ensure_port_available(config.port)?;

        let broadcast = BroadcastAgent::start(
            BroadcastConfig {
                port: config.port,
                period: config.beacon_period(),
                target: config.broadcast_addr,
            },
            local_addresses(),
            Arc::clone(&logger),
        )?;
        // On failure the agent is dropped, which stops its threads
        let registry = Registry::bind(config.port, Arc::clone(&logger))?;

        Ok(Self {
            port: config.port,
            broadcast,
            registry,
            logger,
            discovery_window: config.discovery_window(),
            scan_interval: config.scan_interval(),
            connect_timeout: config.connect_timeout(),
            scan: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Addresses of peers whose beacons arrived within the discovery window.
    pub fn find_devices(&self) -> PeerResult<HashSet<IpAddr>> {
        self.broadcast.addresses(self.discovery_window)
    }

    pub fn connected_devices(&self) -> Vec<Arc<Connection>> {
        self.registry.snapshot()
    }

    /// Connect to `ip` on this peer's own port.
    pub fn connect_device(&self, ip: IpAddr) -> PeerResult<Arc<Connection>> {
        self.connect_endpoint(SocketAddr::new(ip, self.port))
    }

    /// Connect to an arbitrary endpoint, e.g. a second peer on the same host.
    pub fn connect_endpoint(&self, endpoint: SocketAddr) -> PeerResult<Arc<Connection>> {
        self.registry.connect(endpoint, self.connect_timeout)
    }

    pub fn disconnect_device(&self, conn: &Arc<Connection>) {
        self.registry.disconnect(conn);
    }

    /// Block until some connection delivers a record into `dest_root`.
    ///
    /// Each scan starts after the connection served last, so one busy
    /// connection cannot starve the others. Returns `None` only once the
    /// peer is closed.
    pub fn next_incoming_file(&self, dest_root: &Path) -> Option<Incoming> {
        let mut last_served = self.scan.lock();
        while !self.is_closed() {
            let mut progressed = false;
            let mut snapshot = self.registry.snapshot();
            if let Some(prev) = *last_served {
                let start = snapshot
                    .iter()
                    .position(|c| c.endpoint() > prev)
                    .unwrap_or(0);
                snapshot.rotate_left(start);
            }
            for conn in snapshot {
                if conn.is_closed() {
                    self.disconnect_device(&conn);
                    continue;
                }
                match conn.try_receive_file(dest_root) {
                    Ok(Some(path)) => {
                        let bytes = std::fs::metadata(dest_root.join(&path))
                            .map(|m| m.len())
                            .unwrap_or(0);
                        self.logger.received(conn.endpoint(), &path, bytes);
                        *last_served = Some(conn.endpoint());
                        return Some(Incoming {
                            connection: conn,
                            path: Some(path),
                        });
                    }
                    Ok(None) => {}
                    Err(e) if e.is_connection_fatal() => {
                        self.logger.warn("receive", &format!("{}: {e}", conn.endpoint()));
                        *last_served = Some(conn.endpoint());
                        return Some(Incoming {
                            connection: conn,
                            path: None,
                        });
                    }
                    Err(e) => {
                        // Record skipped, stream still framed
                        self.logger.warn("receive", &format!("{}: {e}", conn.endpoint()));
                        progressed = true;
                    }
                }
            }
            if !progressed {
                self.registry.wait_for_change(self.scan_interval);
            }
        }
        None
    }

    /// Close the broadcast agent, then the registry. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.broadcast.close();
        self.registry.shutdown();
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.close();
    }
}
