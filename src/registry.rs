//! `PeerRegistry` -- admission, dedup and resurrection (§4.1), plus the
//! derived counters named in the data model (§3).
//!
//! Grounded on `bip_peer::manager::PeerManagerSink`'s use of a
//! `HashMap<PeerInfo, _>` as the live-peer collection (Design Note 9
//! explicitly endorses "a map keyed by address" over the original's
//! intrusive linked list); we extend the same idea to the dead set.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use mio::net::TcpStream;

use crate::collab::Tracker;
use crate::config::Config;
use crate::error::{AdmissionRefusal, ErrorKind, Result};
use crate::peer::state::ConnectionState;
use crate::peer::Peer;

/// Stats retained for a FAILED peer that still had nonzero lifetime
/// traffic, kept around so a later reconnect can "resurrect" them.
#[derive(Clone, Copy, Debug)]
pub struct DeadStats {
    pub total_sent: u64,
    pub total_recv: u64,
    pub last_activity: Instant,
}

#[derive(Default, Clone, Copy, Debug)]
pub struct Counters {
    pub peer_count: usize,
    pub seed_count: usize,
    pub handshaking_count: usize,
    pub downloads: usize,
    pub interested_count: usize,
}

pub struct PeerRegistry {
    live: HashMap<SocketAddr, Peer>,
    dead: HashMap<SocketAddr, DeadStats>,
    self_addr: Option<SocketAddr>,
    max_peers: usize,
    req_slice_size: usize,
    counters: Counters,
}

impl PeerRegistry {
    pub fn new(config: &Config, self_addr: Option<SocketAddr>) -> PeerRegistry {
        PeerRegistry {
            live: HashMap::new(),
            dead: HashMap::new(),
            self_addr,
            max_peers: config.max_peers,
            req_slice_size: config.req_slice_size,
            counters: Counters::default(),
        }
    }

    pub fn live(&self) -> &HashMap<SocketAddr, Peer> {
        &self.live
    }

    pub fn live_mut(&mut self) -> &mut HashMap<SocketAddr, Peer> {
        &mut self.live
    }

    pub fn get_mut(&mut self, addr: &SocketAddr) -> Option<&mut Peer> {
        self.live.get_mut(addr)
    }

    pub fn peer_count(&self) -> usize {
        self.live.len()
    }

    pub fn is_full(&self) -> bool {
        self.peer_count() >= self.max_peers
    }

    pub fn counters(&self) -> Counters {
        self.counters
    }

    /// Admit a new outbound peer at `addr`. Invariant 2: no two live
    /// peers may share an address.
    pub fn new_outbound_peer(&mut self, addr: SocketAddr, announce_interval: Duration, is_seeding: bool) -> Result<()> {
        self.check_full(addr, false)?;
        self.check_duplicate(addr)?;
        self.evict_stale_dead(announce_interval);

        let socket = TcpStream::connect(addr).map_err(|e| {
            warn!("bip_swarm: failed to create outbound socket to {}: {}", addr, e);
            ErrorKind::AdmissionRefused(addr, AdmissionRefusal::SocketCreate)
        })?;

        // mio's non-blocking connect is always "in progress"; a
        // completed connect (rare, e.g. loopback) still surfaces as
        // writable on the next readiness pass, which our FSM treats
        // identically to "in progress".
        let buf_capacity = self.buffer_capacity(is_seeding);
        let mut peer = Peer::new_outbound(addr, socket, true, buf_capacity);

        self.resurrect_if_dead(addr, &mut peer);
        self.live.insert(addr, peer);
        info!("bip_swarm: admitted outbound peer {}", addr);
        Ok(())
    }

    /// Admit an inbound peer from an already-accepted socket. Check order
    /// (full registry, then self-connect, then duplicate) matches
    /// `PeerList::NewPeer`: the full check is a hard capacity limit that
    /// must reject before anything else is even considered, and the
    /// self-connect check -- which also corrects the tracker's peer-count
    /// estimate -- runs before the duplicate check since a self-connect is
    /// never a legitimate duplicate to begin with.
    pub fn new_inbound_peer(
        &mut self,
        addr: SocketAddr,
        socket: TcpStream,
        announce_interval: Duration,
        is_seeding: bool,
        tracker: &mut dyn Tracker,
    ) -> Result<()> {
        self.check_full(addr, true)?;
        if self.self_addr == Some(addr) {
            warn!("bip_swarm: rejected self-connect from {}", addr);
            tracker.adjust_peer_count(-1);
            return Err(ErrorKind::AdmissionRefused(addr, AdmissionRefusal::SelfConnect).into());
        }
        self.check_duplicate(addr)?;
        self.evict_stale_dead(announce_interval);

        let buf_capacity = self.buffer_capacity(is_seeding);
        let mut peer = Peer::new_inbound(addr, socket, buf_capacity);
        peer.send(crate::message::Message::KeepAlive).ok();

        self.resurrect_if_dead(addr, &mut peer);
        self.live.insert(addr, peer);
        info!("bip_swarm: admitted inbound peer {}", addr);
        Ok(())
    }

    fn buffer_capacity(&self, is_seeding: bool) -> usize {
        if is_seeding {
            self.req_slice_size
        } else {
            self.req_slice_size + crate::config::DEF_BUFFER_PAD
        }
    }

    fn check_full(&self, addr: SocketAddr, inbound: bool) -> Result<()> {
        if self.is_full() {
            debug!("bip_swarm: rejected {} ({:?}): registry full", addr, if inbound { "inbound" } else { "outbound" });
            return Err(ErrorKind::AdmissionRefused(addr, AdmissionRefusal::Full).into());
        }
        Ok(())
    }

    fn check_duplicate(&self, addr: SocketAddr) -> Result<()> {
        if self.live.contains_key(&addr) {
            debug!("bip_swarm: rejected duplicate admission for {}", addr);
            return Err(ErrorKind::AdmissionRefused(addr, AdmissionRefusal::Duplicate).into());
        }
        Ok(())
    }

    /// Invariant 5 target: evict dead entries whose
    /// `last_activity + 2 * announce_interval < now`.
    fn evict_stale_dead(&mut self, announce_interval: Duration) {
        let now = Instant::now();
        let cutoff = announce_interval.saturating_mul(2);
        self.dead.retain(|addr, stats| {
            let keep = now.saturating_duration_since(stats.last_activity) < cutoff;
            if !keep {
                debug!("bip_swarm: evicted dead peer {} (stale)", addr);
            }
            keep
        });
    }

    fn resurrect_if_dead(&mut self, addr: SocketAddr, peer: &mut Peer) {
        if let Some(stats) = self.dead.remove(&addr) {
            peer.total_sent = stats.total_sent;
            peer.total_recv = stats.total_recv;
            info!("bip_swarm: resurrected peer {} (UL {} DL {})", addr, stats.total_sent, stats.total_recv);
        }
    }

    /// Move a FAILED peer out of the live set and into either the dead
    /// set (had stats) or nowhere (destroyed). Returns the address that
    /// should be requeued onto the tracker address queue if the caller
    /// wants a reconnect attempt, which is a policy decision left to the
    /// `ReadinessLoop` (some closes, e.g. `dont_want_again`, should not
    /// reconnect).
    pub fn retire(&mut self, addr: SocketAddr) -> Option<DeadStats> {
        let peer = self.live.remove(&addr)?;
        debug_assert!(peer.state.is_terminal());

        if peer.total_sent == 0 && peer.total_recv == 0 {
            debug!("bip_swarm: destroyed peer {} (no stats to retain)", addr);
            return None;
        }

        let stats = DeadStats {
            total_sent: peer.total_sent,
            total_recv: peer.total_recv,
            last_activity: Instant::now(),
        };
        self.dead.insert(addr, stats);
        debug!("bip_swarm: moved peer {} to dead set", addr);
        Some(stats)
    }

    /// Recompute the derived, per-tick counters (invariant 4). Must be
    /// called once per tick before anything reads `counters()`.
    pub fn recompute_counters(&mut self) {
        let mut seed_count = 0;
        let mut handshaking_count = 0;
        let mut downloads = 0;
        let mut interested_count = 0;

        for peer in self.live.values() {
            match peer.state {
                ConnectionState::Connecting | ConnectionState::Handshake => handshaking_count += 1,
                ConnectionState::Success => {
                    if peer.is_seed() {
                        seed_count += 1;
                    }
                    if peer.local_interested && !peer.remote_choked {
                        downloads += 1;
                    }
                    if peer.remote_interested {
                        interested_count += 1;
                    }
                }
                ConnectionState::Failed => {}
            }
        }

        self.counters = Counters {
            peer_count: self.live.len(),
            seed_count,
            handshaking_count,
            downloads,
            interested_count,
        };
    }

    pub fn dead_len(&self) -> usize {
        self.dead.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn cfg() -> Config {
        Config::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 6881).with_max_peers(2)
    }

    #[derive(Default)]
    struct MockTracker {
        delta: i64,
        calls: usize,
    }

    impl Tracker for MockTracker {
        fn next_address(&mut self) -> Option<SocketAddr> {
            None
        }

        fn requeue_address(&mut self, _addr: SocketAddr) {}

        fn announce_interval(&self) -> Duration {
            Duration::from_secs(1800)
        }

        fn is_quitting(&self) -> bool {
            false
        }

        fn adjust_peer_count(&mut self, delta: i64) {
            self.delta += delta;
            self.calls += 1;
        }
    }

    #[test]
    fn rejects_when_full() {
        let mut reg = PeerRegistry::new(&cfg(), None);
        let a1: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let a2: SocketAddr = "127.0.0.1:2".parse().unwrap();
        let a3: SocketAddr = "127.0.0.1:3".parse().unwrap();
        reg.new_outbound_peer(a1, Duration::from_secs(1800), false).unwrap();
        reg.new_outbound_peer(a2, Duration::from_secs(1800), false).unwrap();
        let err = reg.new_outbound_peer(a3, Duration::from_secs(1800), false).unwrap_err();
        match err.0 {
            ErrorKind::AdmissionRefused(_, AdmissionRefusal::Full) => {}
            other => panic!("expected Full, got {:?}", other),
        }
    }

    #[test]
    fn rejects_duplicate_address() {
        let mut reg = PeerRegistry::new(&cfg(), None);
        let a1: SocketAddr = "127.0.0.1:1".parse().unwrap();
        reg.new_outbound_peer(a1, Duration::from_secs(1800), false).unwrap();
        let err = reg.new_outbound_peer(a1, Duration::from_secs(1800), false).unwrap_err();
        match err.0 {
            ErrorKind::AdmissionRefused(_, AdmissionRefusal::Duplicate) => {}
            other => panic!("expected Duplicate, got {:?}", other),
        }
    }

    #[test]
    fn self_connect_rejected_and_adjusts_tracker_count() {
        let self_addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let mut reg = PeerRegistry::new(&cfg(), Some(self_addr));
        let mut tracker = MockTracker::default();

        let socket = TcpStream::connect(self_addr).unwrap();
        let err = reg.new_inbound_peer(self_addr, socket, Duration::from_secs(1800), false, &mut tracker).unwrap_err();
        match err.0 {
            ErrorKind::AdmissionRefused(_, AdmissionRefusal::SelfConnect) => {}
            other => panic!("expected SelfConnect, got {:?}", other),
        }
        assert_eq!(tracker.calls, 1);
        assert_eq!(tracker.delta, -1);
    }

    #[test]
    fn full_check_precedes_self_connect_check() {
        let self_addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let mut reg = PeerRegistry::new(&cfg(), Some(self_addr));
        let a1: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let a2: SocketAddr = "127.0.0.1:2".parse().unwrap();
        reg.new_outbound_peer(a1, Duration::from_secs(1800), false).unwrap();
        reg.new_outbound_peer(a2, Duration::from_secs(1800), false).unwrap();

        let mut tracker = MockTracker::default();
        let socket = TcpStream::connect(self_addr).unwrap();
        let err = reg.new_inbound_peer(self_addr, socket, Duration::from_secs(1800), false, &mut tracker).unwrap_err();
        match err.0 {
            ErrorKind::AdmissionRefused(_, AdmissionRefusal::Full) => {}
            other => panic!("expected Full (checked before self-connect), got {:?}", other),
        }
        assert_eq!(tracker.calls, 0, "tracker count must not be adjusted when rejected for being full");
    }

    #[test]
    fn resurrects_stats_from_dead_set() {
        let mut reg = PeerRegistry::new(&cfg(), None);
        let a1: SocketAddr = "127.0.0.1:1".parse().unwrap();
        reg.new_outbound_peer(a1, Duration::from_secs(1800), false).unwrap();
        reg.live_mut().get_mut(&a1).unwrap().total_sent = 500;
        reg.live_mut().get_mut(&a1).unwrap().total_recv = 900;
        reg.live_mut().get_mut(&a1).unwrap().state = ConnectionState::Failed;
        reg.retire(a1);
        assert_eq!(reg.dead_len(), 1);

        reg.new_outbound_peer(a1, Duration::from_secs(1800), false).unwrap();
        let peer = reg.live().get(&a1).unwrap();
        assert_eq!(peer.total_sent, 500);
        assert_eq!(peer.total_recv, 900);
        assert_eq!(reg.dead_len(), 0);
    }
}
