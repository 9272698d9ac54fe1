//! S1 -- self-connect: an inbound connection from our own listen address
//! is refused, ordered after the full-registry check, and adjusts the
//! tracker's peer-count estimate back down by one.

use std::net::SocketAddr;
use std::time::Duration;

use bip_swarm::{AdmissionRefusal, Config, ErrorKind, PeerRegistry, Tracker};
use mio::net::TcpStream;

fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{}", port).parse().unwrap()
}

struct CountingTracker {
    delta: i64,
}

impl Tracker for CountingTracker {
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
    }
}

#[test]
fn inbound_connection_from_self_is_refused_and_tracker_count_corrected() {
    let self_addr = addr(6881);
    let config = Config::new(self_addr.ip(), self_addr.port());
    let mut registry = PeerRegistry::new(&config, Some(self_addr));
    let mut tracker = CountingTracker { delta: 0 };

    let socket = TcpStream::connect(self_addr).unwrap();
    let err = registry
        .new_inbound_peer(self_addr, socket, Duration::from_secs(1800), false, &mut tracker)
        .unwrap_err();

    match err.0 {
        ErrorKind::AdmissionRefused(a, AdmissionRefusal::SelfConnect) => assert_eq!(a, self_addr),
        other => panic!("expected SelfConnect, got {:?}", other),
    }
    assert_eq!(tracker.delta, -1);
    assert_eq!(registry.peer_count(), 0);
}
