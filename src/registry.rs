//! Live connections of one peer, keyed by remote endpoint.
//!
//! Every read or write of the map goes through one lock; the condition
//! variable paired with it is signalled on every mutation so the scanner in
//! `Peer::next_incoming_file` can sleep instead of polling.

use crate::connection::Connection;
use crate::error::{PeerError, PeerResult};
use crate::logger::Logger;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub struct Registry {
    port: u16,
    connections: Mutex<BTreeMap<SocketAddr, Arc<Connection>>>,
    changed: Condvar,
    stop: AtomicBool,
    acceptor: Mutex<Option<JoinHandle<()>>>,
    logger: Arc<dyn Logger>,
}

impl Registry {
    /// Bind the listening socket on `port` and start accepting.
    pub fn bind(port: u16, logger: Arc<dyn Logger>) -> PeerResult<Arc<Self>> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .map_err(|source| PeerError::PortUnavailable { port, source })?;
        let port = listener.local_addr()?.port();

        let registry = Arc::new(Self {
            port,
            connections: Mutex::new(BTreeMap::new()),
            changed: Condvar::new(),
            stop: AtomicBool::new(false),
            acceptor: Mutex::new(None),
            logger,
        });

        let worker = Arc::clone(&registry);
        let handle = thread::Builder::new()
            .name("lansync-accept".into())
            .spawn(move || worker.accept_loop(listener))?;
        *registry.acceptor.lock() = Some(handle);
        registry.logger.listening(port);
        Ok(registry)
    }

    pub fn local_port(&self) -> u16 {
        self.port
    }

    fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn accept_loop(&self, listener: TcpListener) {
        for conn in listener.incoming() {
            if self.is_stopped() {
                break;
            }
            match conn {
                Ok(stream) => match Connection::from_stream(stream) {
                    Ok(c) => {
                        self.insert(Arc::new(c), true);
                    }
                    Err(e) => self.logger.warn("accept", &e.to_string()),
                },
                Err(e) => {
                    self.logger.error("accept", &e.to_string());
                    // Persistent errors (EMFILE) would otherwise spin
                    thread::sleep(Duration::from_millis(100));
                }
            }
        }
    }

    /// Last writer wins: a newer connection to the same endpoint means the
    /// remote side considers the older one dead.
    ///
    /// Returns false and closes `conn` once shutdown has drained the map.
    fn insert(&self, conn: Arc<Connection>, inbound: bool) -> bool {
        let endpoint = conn.endpoint();
        let replaced = {
            let mut map = self.connections.lock();
            // Checked under the lock so nothing lands after the drain
            if self.is_stopped() {
                drop(map);
                let _ = conn.close();
                return false;
            }
            let old = map.insert(endpoint, conn);
            self.changed.notify_all();
            old
        };
        if let Some(old) = replaced {
            let _ = old.close();
            self.logger.disconnected(endpoint);
        }
        self.logger.connected(endpoint, inbound);
        true
    }

    /// Dial `endpoint` and register the connection, replacing any existing one.
    pub fn connect(&self, endpoint: SocketAddr, timeout: Duration) -> PeerResult<Arc<Connection>> {
        if self.is_stopped() {
            return Err(PeerError::Connect {
                endpoint,
                source: std::io::Error::new(std::io::ErrorKind::NotConnected, "registry is closed"),
            });
        }
        let stream = TcpStream::connect_timeout(&endpoint, timeout)
            .map_err(|source| PeerError::Connect { endpoint, source })?;
        let conn = Connection::from_stream(stream)
            .map(Arc::new)
            .map_err(|source| PeerError::Connect { endpoint, source })?;
        if !self.insert(Arc::clone(&conn), false) {
            return Err(PeerError::Connect {
                endpoint,
                source: std::io::Error::new(std::io::ErrorKind::NotConnected, "registry is closed"),
            });
        }
        Ok(conn)
    }

    /// Remove `conn` and close it. Close errors are swallowed.
    ///
    /// The entry is only removed when it is this very connection, so a stale
    /// handle cannot evict the connection that replaced it.
    pub fn disconnect(&self, conn: &Arc<Connection>) {
        let endpoint = conn.endpoint();
        let removed = {
            let mut map = self.connections.lock();
            let same = map
                .get(&endpoint)
                .map(|existing| Arc::ptr_eq(existing, conn))
                .unwrap_or(false);
            let removed = if same { map.remove(&endpoint) } else { None };
            if removed.is_some() {
                self.changed.notify_all();
            }
            removed
        };
        let _ = conn.close();
        if removed.is_some() {
            self.logger.disconnected(endpoint);
        }
    }

    /// Point-in-time copy for iteration; may be stale by the time it is used.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sleep until the map changes, the registry shuts down or `timeout`
    /// passes. Returns true when woken by a change.
    pub fn wait_for_change(&self, timeout: Duration) -> bool {
        let mut map = self.connections.lock();
        if self.is_stopped() {
            return false;
        }
        !self.changed.wait_for(&mut map, timeout).timed_out()
    }

    /// Stop accepting, close every connection and wake all waiters. Idempotent.
    pub fn shutdown(&self) {
        if self.stop.swap(true, Ordering::AcqRel) {
            return;
        }

        // accept() has no cancellation; a loopback dial gets it to re-check the flag
        let _ = TcpStream::connect_timeout(
            &SocketAddr::from((Ipv4Addr::LOCALHOST, self.port)),
            Duration::from_secs(1),
        );
        if let Some(handle) = self.acceptor.lock().take() {
            let _ = handle.join();
        }

        let drained: Vec<Arc<Connection>> = {
            let mut map = self.connections.lock();
            let drained = std::mem::take(&mut *map).into_values().collect();
            self.changed.notify_all();
            drained
        };
        for conn in drained {
            let _ = conn.close();
            self.logger.disconnected(conn.endpoint());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::NoopLogger;
    use std::time::Instant;

    fn registry() -> Arc<Registry> {
        Registry::bind(0, Arc::new(NoopLogger)).unwrap()
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_accepts_inbound_connections() {
        let reg = registry();
        let _client = TcpStream::connect(("127.0.0.1", reg.local_port())).unwrap();
        wait_until(|| reg.len() == 1);
        reg.shutdown();
    }

    #[test]
    fn test_connect_twice_keeps_one_entry() {
        let server = registry();
        let client = registry();
        let endpoint = SocketAddr::from((Ipv4Addr::LOCALHOST, server.local_port()));

        let first = client.connect(endpoint, Duration::from_secs(1)).unwrap();
        let second = client.connect(endpoint, Duration::from_secs(1)).unwrap();

        let snap = client.snapshot();
        assert_eq!(snap.len(), 1);
        assert!(Arc::ptr_eq(&snap[0], &second));
        assert!(first.is_closed());
        assert!(!second.is_closed());

        server.shutdown();
        client.shutdown();
    }

    #[test]
    fn test_stale_handle_does_not_evict_replacement() {
        let server = registry();
        let client = registry();
        let endpoint = SocketAddr::from((Ipv4Addr::LOCALHOST, server.local_port()));

        let first = client.connect(endpoint, Duration::from_secs(1)).unwrap();
        let second = client.connect(endpoint, Duration::from_secs(1)).unwrap();
        client.disconnect(&first);
        assert_eq!(client.len(), 1);

        client.disconnect(&second);
        assert!(client.is_empty());
        assert!(second.is_closed());

        server.shutdown();
        client.shutdown();
    }

    #[test]
    fn test_connect_failure_leaves_registry_unchanged() {
        let client = registry();
        // Bind then drop to get a port nobody listens on
        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let err = client
            .connect(SocketAddr::from((Ipv4Addr::LOCALHOST, port)), Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, PeerError::Connect { .. }));
        assert!(client.is_empty());
        client.shutdown();
    }

    #[test]
    fn test_wait_for_change_wakes_on_insert() {
        let reg = registry();
        let port = reg.local_port();
        let dialer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            TcpStream::connect(("127.0.0.1", port)).unwrap()
        });
        let started = Instant::now();
        let mut woke = false;
        while !woke && started.elapsed() < Duration::from_secs(5) {
            woke = reg.wait_for_change(Duration::from_secs(5)) || reg.len() == 1;
        }
        assert!(woke);
        assert!(started.elapsed() < Duration::from_secs(5));
        let _stream = dialer.join().unwrap();
        reg.shutdown();
    }

    #[test]
    fn test_shutdown_closes_everything_and_is_idempotent() {
        let server = registry();
        let client = registry();
        let conn = client
            .connect(
                SocketAddr::from((Ipv4Addr::LOCALHOST, server.local_port())),
                Duration::from_secs(1),
            )
            .unwrap();

        client.shutdown();
        client.shutdown();
        assert!(conn.is_closed());
        assert!(client.is_empty());
        assert!(!client.wait_for_change(Duration::from_secs(5)));
        assert!(client
            .connect(
                SocketAddr::from((Ipv4Addr::LOCALHOST, server.local_port())),
                Duration::from_secs(1)
            )
            .is_err());
        server.shutdown();
    }

    #[test]
    fn test_insert_after_shutdown_closes_connection() {
        let reg = registry();
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let conn = Arc::new(Connection::from_stream(stream).unwrap());

        // A dial that finished while shutdown was draining
        reg.shutdown();
        assert!(!reg.insert(Arc::clone(&conn), false));
        assert!(conn.is_closed());
        assert!(reg.is_empty());
    }
}
