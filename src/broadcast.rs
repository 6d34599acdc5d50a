//! UDP beacon emitter and listener used for LAN discovery.
//!
//! Beacons are empty datagrams; the sender is identified by the datagram's
//! source address. Both jobs run on their own threads and never block callers.

use crate::error::{PeerError, PeerResult};
use crate::logger::Logger;
use crate::protocol::timeouts;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Last time each source address was heard from.
#[derive(Default)]
pub struct BeaconCollector {
    seen: Mutex<HashMap<IpAddr, Instant>>,
}

impl BeaconCollector {
    pub fn record(&self, ip: IpAddr) {
        self.record_at(ip, Instant::now());
    }

    pub fn record_at(&self, ip: IpAddr, at: Instant) {
        let mut seen = self.seen.lock();
        let entry = seen.entry(ip).or_insert(at);
        if *entry < at {
            *entry = at;
        }
    }

    /// Distinct addresses heard within `window`, minus `exclude`.
    pub fn addresses(&self, window: Duration, exclude: &HashSet<IpAddr>) -> HashSet<IpAddr> {
        let now = Instant::now();
        self.seen
            .lock()
            .iter()
            .filter(|(ip, at)| now.saturating_duration_since(**at) <= window && !exclude.contains(*ip))
            .map(|(ip, _)| *ip)
            .collect()
    }
}

#[derive(Clone, Debug)]
pub struct BroadcastConfig {
    pub port: u16,
    pub period: Duration,
    /// Where beacons go; the subnet broadcast address outside of tests.
    pub target: IpAddr,
}

/// This host's interface addresses, always including loopback.
pub fn local_addresses() -> HashSet<IpAddr> {
    let mut set: HashSet<IpAddr> = local_ip_address::list_afinet_netifas()
        .map(|ifaces| ifaces.into_iter().map(|(_, ip)| ip).collect())
        .unwrap_or_default();
    set.insert(IpAddr::V4(Ipv4Addr::LOCALHOST));
    set.insert(IpAddr::V6(Ipv6Addr::LOCALHOST));
    set
}

pub struct BroadcastAgent {
    port: u16,
    collector: Arc<BeaconCollector>,
    local: HashSet<IpAddr>,
    stop: Arc<AtomicBool>,
    failure: Arc<Mutex<Option<String>>>,
    emitter: Mutex<Option<JoinHandle<()>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl BroadcastAgent {
    /// Bind the beacon socket and start the emitter and listener.
    /// Addresses in `local` never show up in `addresses`.
    pub fn start(
        config: BroadcastConfig,
        local: HashSet<IpAddr>,
        logger: Arc<dyn Logger>,
    ) -> PeerResult<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, config.port)).map_err(|source| {
            PeerError::PortUnavailable {
                port: config.port,
                source,
            }
        })?;
        let port = socket.local_addr()?.port();
        socket
            .set_broadcast(true)
            .map_err(|e| PeerError::BroadcastFailed(format!("SO_BROADCAST: {e}")))?;
        // UDP carries no framing, so a short timeout only bounds how long close() waits
        socket.set_read_timeout(Some(Duration::from_millis(timeouts::BEACON_POLL_MS)))?;
        let socket = Arc::new(socket);

        let collector = Arc::new(BeaconCollector::default());
        let stop = Arc::new(AtomicBool::new(false));
        let failure = Arc::new(Mutex::new(None));

        let emitter = {
            let socket = Arc::clone(&socket);
            let stop = Arc::clone(&stop);
            let logger = Arc::clone(&logger);
            let target = SocketAddr::new(config.target, port);
            let period = config.period;
            thread::Builder::new()
                .name("lansync-beacon-tx".into())
                .spawn(move || emit_loop(&socket, target, period, &stop, logger.as_ref()))?
        };

        let listener = {
            let collector = Arc::clone(&collector);
            let stop = Arc::clone(&stop);
            let failure = Arc::clone(&failure);
            thread::Builder::new()
                .name("lansync-beacon-rx".into())
                .spawn(move || {
                    if let Err(e) = listen_loop(&socket, &collector, &stop) {
                        logger.error("broadcast", &e.to_string());
                        *failure.lock() = Some(e.to_string());
                    }
                })?
        };

        Ok(Self {
            port,
            collector,
            local,
            stop,
            failure,
            emitter: Mutex::new(Some(emitter)),
            listener: Mutex::new(Some(listener)),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Peers heard from within `window`, excluding this host.
    pub fn addresses(&self, window: Duration) -> PeerResult<HashSet<IpAddr>> {
        if self.stop.load(Ordering::Acquire) {
            return Err(PeerError::BroadcastFailed("broadcast agent is closed".into()));
        }
        if let Some(reason) = self.failure.lock().as_ref() {
            return Err(PeerError::BroadcastFailed(reason.clone()));
        }
        Ok(self.collector.addresses(window, &self.local))
    }

    /// Stop both threads. Idempotent.
    pub fn close(&self) {
        if self.stop.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.emitter.lock().take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
        if let Some(handle) = self.listener.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for BroadcastAgent {
    fn drop(&mut self) {
        self.close();
    }
}

fn emit_loop(
    socket: &UdpSocket,
    target: SocketAddr,
    period: Duration,
    stop: &AtomicBool,
    logger: &dyn Logger,
) {
    let mut next = Instant::now();
    while !stop.load(Ordering::Acquire) {
        let now = Instant::now();
        if now >= next {
            if let Err(e) = socket.send_to(&[], target) {
                logger.warn("beacon", &format!("send to {target} failed: {e}"));
            }
            next = now + period;
        }
        // close() unparks; spurious wakeups just loop
        thread::park_timeout(next.saturating_duration_since(Instant::now()));
    }
}

fn listen_loop(socket: &UdpSocket, collector: &BeaconCollector, stop: &AtomicBool) -> io::Result<()> {
    let mut buf = [0u8; 512];
    while !stop.load(Ordering::Acquire) {
        match socket.recv_from(&mut buf) {
            Ok((_, src)) => collector.record(src.ip()),
            Err(e) => match e.kind() {
                io::ErrorKind::WouldBlock
                | io::ErrorKind::TimedOut
                | io::ErrorKind::Interrupted
                // ICMP port-unreachable echoes on some platforms
                | io::ErrorKind::ConnectionReset => continue,
                _ => return Err(e),
            },
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::NoopLogger;

    fn loopback_agent(local: HashSet<IpAddr>) -> BroadcastAgent {
        BroadcastAgent::start(
            BroadcastConfig {
                port: 0,
                period: Duration::from_millis(50),
                target: IpAddr::V4(Ipv4Addr::LOCALHOST),
            },
            local,
            Arc::new(NoopLogger),
        )
        .unwrap()
    }

    fn wait_for(agent: &BroadcastAgent, ip: IpAddr) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if agent.addresses(Duration::from_secs(5)).unwrap().contains(&ip) {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn test_collector_window_and_exclusions() {
        let c = BeaconCollector::default();
        let a: IpAddr = "192.168.1.11".parse().unwrap();
        let b: IpAddr = "192.168.1.12".parse().unwrap();
        let me: IpAddr = "192.168.1.10".parse().unwrap();
        c.record(a);
        c.record(me);
        if let Some(old) = Instant::now().checked_sub(Duration::from_secs(30)) {
            c.record_at(b, old);
        }

        let exclude: HashSet<IpAddr> = [me].into_iter().collect();
        let found = c.addresses(Duration::from_secs(5), &exclude);
        assert_eq!(found, [a].into_iter().collect());
    }

    #[test]
    fn test_collector_keeps_latest_sighting() {
        let c = BeaconCollector::default();
        let a: IpAddr = "10.0.0.7".parse().unwrap();
        c.record(a);
        if let Some(old) = Instant::now().checked_sub(Duration::from_secs(30)) {
            c.record_at(a, old);
        }
        assert!(c.addresses(Duration::from_secs(5), &HashSet::new()).contains(&a));
    }

    #[test]
    fn test_agent_hears_beacons() {
        let agent = loopback_agent(HashSet::new());
        assert!(wait_for(&agent, IpAddr::V4(Ipv4Addr::LOCALHOST)));
        agent.close();
    }

    #[test]
    fn test_agent_never_lists_itself() {
        let agent = loopback_agent(local_addresses());
        thread::sleep(Duration::from_millis(300));
        let found = agent.addresses(Duration::from_secs(5)).unwrap();
        assert!(!found.contains(&IpAddr::V4(Ipv4Addr::LOCALHOST)));
        agent.close();
    }

    #[test]
    fn test_closed_agent_reports_failure() {
        let agent = loopback_agent(HashSet::new());
        agent.close();
        agent.close();
        assert!(matches!(
            agent.addresses(Duration::from_secs(5)),
            Err(PeerError::BroadcastFailed(_))
        ));
    }
}
