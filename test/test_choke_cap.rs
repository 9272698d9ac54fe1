//! S4 -- choke cap with `up_cap = 0`: three interested peers present,
//! after one unchoke scan exactly 3 are unchoked, and the interval
//! policy matches the no-cap boundary case.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bip_swarm::{ChokeScheduler, PeerSnapshot};

fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{}", port).parse().unwrap()
}

fn snap(dl: u64) -> PeerSnapshot {
    PeerSnapshot {
        dl_rate: dl,
        ul_rate: 0,
        total_ul: 0,
        total_dl: 0,
        piece_count: 0,
        piece_length: 16384,
        total_pieces: 10,
        local_choked: true,
        is_empty: false,
        wait_started: Instant::now(),
        unchoked_since: None,
    }
}

#[test]
fn three_interested_peers_all_unchoked_with_no_upload_cap() {
    let mut sched = ChokeScheduler::new(3);
    sched.set_unchoke_intervals(false, 0, 16384);
    assert_eq!(sched.unchoke_interval, Duration::from_secs(10));
    assert_eq!(sched.opt_interval, Duration::from_secs(30));

    let peers = [addr(1), addr(2), addr(3)];
    let rates = [(peers[0], snap(300)), (peers[1], snap(200)), (peers[2], snap(100))];
    let lookup = |a: SocketAddr| rates.iter().find(|(x, _)| *x == a).unwrap().1;
    let mut rng = rand::thread_rng();

    let mut choked = Vec::new();
    for &p in &peers {
        if let Some(loser) = sched.consider(p, &lookup, false, Instant::now(), &mut rng) {
            choked.push(loser);
        }
    }

    assert_eq!(sched.chosen().len(), 3);
    assert!(choked.is_empty(), "three candidates against three top slots should all land, got choked: {:?}", choked);
}
