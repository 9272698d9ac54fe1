//! `ChokeScheduler` (§4.4): periodic unchoke selection, optimistic-slot
//! rotation and choke enforcement.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::config::{MIN_OPT_CYCLE, MIN_UNCHOKES, MIN_UNCHOKE_INTERVAL_SECS};
use crate::peer::Peer;

/// One top slot or the optimistic slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Occupant {
    addr: SocketAddr,
}

pub struct ChokeScheduler {
    max_unchoke: usize,
    top_slots: Vec<Option<Occupant>>,
    optimistic_slot: Option<Occupant>,
    /// Nonzero while an optimistic tenure is still in effect; `0` means
    /// no optimistic slot is currently active (Open Question, §9: we
    /// also treat `opt_interval == 0` below as "never re-enter optimism").
    opt_timestamp: Option<Instant>,

    pub unchoke_interval: Duration,
    pub opt_interval: Duration,

    missed_sends: u64,
    completed_uploads: u64,
    deferred_uploads: u64,
    total_uploads: u64,
}

impl ChokeScheduler {
    pub fn new(max_unchoke: usize) -> ChokeScheduler {
        ChokeScheduler {
            max_unchoke: max_unchoke.max(MIN_UNCHOKES),
            top_slots: vec![None; max_unchoke.max(MIN_UNCHOKES)],
            optimistic_slot: None,
            opt_timestamp: None,
            unchoke_interval: Duration::from_secs(MIN_UNCHOKE_INTERVAL_SECS),
            opt_interval: Duration::from_secs(30),
            missed_sends: 0,
            completed_uploads: 0,
            deferred_uploads: 0,
            total_uploads: 0,
        }
    }

    pub fn max_unchoke(&self) -> usize {
        self.max_unchoke
    }

    /// `SetUnchokeIntervals` (§4.4).
    pub fn set_unchoke_intervals(&mut self, is_seeding: bool, up_cap: u64, slice_size: u64) {
        if up_cap == 0 {
            self.unchoke_interval = Duration::from_secs(MIN_UNCHOKE_INTERVAL_SECS);
            self.opt_interval = Duration::from_secs(30);
            return;
        }

        if is_seeding {
            let min_interval = MIN_UNCHOKE_INTERVAL_SECS as f64;
            let optx_denominator = 1.0 - (min_interval * up_cap as f64 / slice_size as f64);
            let optx = if optx_denominator > 0.0 { 1.0 / optx_denominator } else { f64::INFINITY };

            if optx < MIN_OPT_CYCLE as f64 {
                // widen the unchoke interval so a slice fits within it
                let widened = (slice_size as f64 / up_cap as f64).ceil() as u64;
                self.unchoke_interval = Duration::from_secs(widened.max(MIN_UNCHOKE_INTERVAL_SECS));
                self.opt_interval = self.unchoke_interval * (MIN_OPT_CYCLE as u32);
            } else {
                let base = (slice_size as f64 / up_cap as f64).ceil() as u64;
                self.unchoke_interval = Duration::from_secs(base.max(MIN_UNCHOKE_INTERVAL_SECS));
                // bound optx so every peer gets >= 60s unchoked when feasible
                let bounded_optx = optx.max(60.0 / self.unchoke_interval.as_secs_f64());
                self.opt_interval = Duration::from_secs_f64(self.unchoke_interval.as_secs_f64() * bounded_optx);
            }
        } else {
            let base = (slice_size as f64 / up_cap as f64).ceil() as u64;
            self.unchoke_interval = Duration::from_secs(base.max(MIN_UNCHOKE_INTERVAL_SECS));
            self.opt_interval = self.unchoke_interval * 3;
        }
    }

    fn optimistic_enabled(&self) -> bool {
        !self.opt_interval.is_zero()
    }

    /// `Consider(candidate)` (§4.4): called for every eligible SUCCESS
    /// peer during an unchoke scan. Returns the address of any peer that
    /// ended up displaced from a slot without a new one (needs CHOKE).
    pub fn consider(&mut self, candidate: SocketAddr, peers: &impl Fn(SocketAddr) -> PeerSnapshot, is_seeding: bool, now: Instant, rng: &mut impl Rng) -> Option<SocketAddr> {
        let cand_snap = peers(candidate);

        // Find the least-favored occupied top slot, or an empty one.
        let mut worst_slot: Option<usize> = None;
        for (i, slot) in self.top_slots.iter().enumerate() {
            match slot {
                None => {
                    worst_slot = Some(i);
                    break;
                }
                Some(occ) => {
                    let occ_snap = peers(occ.addr);
                    let is_worse = match worst_slot {
                        None => true,
                        Some(w) => {
                            if let Some(w_occ) = self.top_slots[w] {
                                let w_snap = peers(w_occ.addr);
                                select_unchoke(&(occ.addr, occ_snap), &(w_occ.addr, w_snap), is_seeding) == occ.addr
                            } else {
                                true
                            }
                        }
                    };
                    if is_worse {
                        worst_slot = Some(i);
                    }
                }
            }
        }

        let worst_idx = worst_slot.expect("top_slots is never empty");
        let loser = match self.top_slots[worst_idx] {
            None => {
                self.top_slots[worst_idx] = Some(Occupant { addr: candidate });
                return None;
            }
            Some(occupant) => {
                let occ_snap = peers(occupant.addr);
                let winner_is_candidate =
                    select_unchoke(&(candidate, cand_snap), &(occupant.addr, occ_snap), is_seeding) == candidate;
                if winner_is_candidate {
                    self.top_slots[worst_idx] = Some(Occupant { addr: candidate });
                    occupant.addr
                } else {
                    candidate
                }
            }
        };

        if is_seeding || !self.optimistic_enabled() || self.opt_timestamp.is_some() {
            return Some(loser);
        }

        self.contest_optimistic(loser, &peers, now, rng)
    }

    fn contest_optimistic(&mut self, loser: SocketAddr, peers: &impl Fn(SocketAddr) -> PeerSnapshot, now: Instant, rng: &mut impl Rng) -> Option<SocketAddr> {
        let loser_snap = peers(loser);

        let displaced = match self.optimistic_slot {
            None => true,
            Some(incumbent) => {
                let inc_snap = peers(incumbent.addr);
                if loser_snap.is_empty && !inc_snap.is_empty {
                    rng.gen_bool(0.75)
                } else if inc_snap.is_empty && !loser_snap.is_empty {
                    true
                } else if !inc_snap.is_empty && loser_snap.is_empty {
                    rng.gen_bool(0.25)
                } else {
                    (loser_snap.local_choked && !inc_snap.local_choked)
                        || (loser_snap.local_choked && inc_snap.local_choked && loser_snap.wait_started < inc_snap.wait_started)
                        || (!loser_snap.local_choked && !inc_snap.local_choked && loser_snap.unchoke_tenure(now) > inc_snap.unchoke_tenure(now))
                }
            }
        };

        if displaced {
            let evicted = self.optimistic_slot.map(|o| o.addr);
            self.optimistic_slot = Some(Occupant { addr: loser });
            self.opt_timestamp = Some(now);
            evicted
        } else {
            Some(loser)
        }
    }

    /// Rotate out the optimistic slot once its tenure (`opt_interval`)
    /// has elapsed. Returns the vacated address, if any.
    pub fn maybe_rotate_optimistic(&mut self, now: Instant) -> Option<SocketAddr> {
        if !self.optimistic_enabled() {
            self.optimistic_slot = None;
            self.opt_timestamp = None;
            return None;
        }
        match self.opt_timestamp {
            Some(started) if now.saturating_duration_since(started) >= self.opt_interval => {
                self.opt_timestamp = None;
                self.optimistic_slot.take().map(|o| o.addr)
            }
            _ => None,
        }
    }

    pub fn chosen(&self) -> Vec<SocketAddr> {
        let mut out: Vec<SocketAddr> = self.top_slots.iter().filter_map(|s| s.map(|o| o.addr)).collect();
        if let Some(opt) = self.optimistic_slot {
            out.push(opt.addr);
        }
        out
    }

    pub fn reset_scan(&mut self) {
        self.top_slots = vec![None; self.max_unchoke];
    }

    pub fn note_missed_send(&mut self) {
        self.missed_sends += 1;
    }

    pub fn note_completed_upload(&mut self) {
        self.completed_uploads += 1;
        self.total_uploads += 1;
    }

    pub fn note_deferred_upload(&mut self) {
        self.deferred_uploads += 1;
        self.total_uploads += 1;
    }

    /// Adaptive `max_unchoke` (§4.4): grow if missed sends exceed
    /// completed uploads; shrink (floor `MIN_UNCHOKES`) if deferred
    /// uploads exceed total after an optimistic-rotation period. Resets
    /// the interval counters.
    pub fn adapt_max_unchoke(&mut self, currently_unchoked: usize) {
        if self.missed_sends > self.completed_uploads {
            self.max_unchoke = self.max_unchoke.max(currently_unchoked);
            self.top_slots.resize(self.max_unchoke, None);
        } else if self.deferred_uploads > self.total_uploads.saturating_sub(self.deferred_uploads) {
            self.max_unchoke = self.max_unchoke.saturating_sub(1).max(MIN_UNCHOKES);
            self.top_slots.truncate(self.max_unchoke);
            while self.top_slots.len() < self.max_unchoke {
                self.top_slots.push(None);
            }
        }
        self.missed_sends = 0;
        self.completed_uploads = 0;
        self.deferred_uploads = 0;
        self.total_uploads = 0;
    }
}

/// Everything `SelectUnchoke`/optimistic contest rules need to know
/// about one candidate, read out of `Peer` by the caller (kept decoupled
/// from `Peer` itself so the comparison logic is unit-testable without
/// a live socket).
#[derive(Clone, Copy, Debug)]
pub struct PeerSnapshot {
    pub dl_rate: u64,
    pub ul_rate: u64,
    pub total_ul: u64,
    pub total_dl: u64,
    pub piece_count: usize,
    pub piece_length: usize,
    pub total_pieces: usize,
    pub local_choked: bool,
    pub is_empty: bool,
    pub wait_started: Instant,
    pub unchoked_since: Option<Instant>,
}

impl PeerSnapshot {
    pub fn from_peer(peer: &Peer, piece_length: usize, total_pieces: usize, wait_started: Instant) -> PeerSnapshot {
        PeerSnapshot {
            dl_rate: peer.dl_rate.rate(),
            ul_rate: peer.ul_rate.rate(),
            total_ul: peer.total_sent,
            total_dl: peer.total_recv,
            piece_count: peer.remote_bitfield.count(),
            piece_length,
            total_pieces,
            local_choked: peer.local_choked,
            is_empty: peer.total_sent == 0 && peer.total_recv == 0,
            wait_started,
            unchoked_since: peer.unchoked_since,
        }
    }

    fn unchoke_tenure(&self, now: Instant) -> Duration {
        self.unchoked_since.map(|t| now.saturating_duration_since(t)).unwrap_or(Duration::ZERO)
    }
}

/// `SelectUnchoke(a, b)` (§4.4): pairwise comparison, returns whichever
/// of the two snapshots should hold the slot. Three-step priority:
/// download rate while leeching, then upload/download reciprocation
/// ratio, then a Chow-Golubchik-Misra style progress tiebreak (more
/// complete peers make slower, steadier partners as a swarm matures).
fn select_unchoke(a: &(SocketAddr, PeerSnapshot), b: &(SocketAddr, PeerSnapshot), is_seeding: bool) -> SocketAddr {
    let (a_addr, a_snap) = a;
    let (b_addr, b_snap) = b;

    if !is_seeding && a_snap.dl_rate != b_snap.dl_rate {
        return if a_snap.dl_rate > b_snap.dl_rate { *a_addr } else { *b_addr };
    }

    let a_ratio = reciprocation_ratio(a_snap, is_seeding);
    let b_ratio = reciprocation_ratio(b_snap, is_seeding);
    if (a_ratio - b_ratio).abs() > f64::EPSILON {
        return if a_ratio > b_ratio { *a_addr } else { *b_addr };
    }

    let a_progress = progress_fraction(a_snap);
    let b_progress = progress_fraction(b_snap);
    if a_progress >= b_progress { *a_addr } else { *b_addr }
}

/// Bytes returned to us per byte we gave, clamped away from divide-by-zero.
/// While seeding, a peer that has given us no more than we've given it
/// (`total_dl <= total_ul`) isn't reciprocating at all and is excluded
/// from this preference entirely (value `-1.0`, always loses to any
/// non-excluded ratio, falls through to the progress tiebreak against
/// another excluded peer).
fn reciprocation_ratio(snap: &PeerSnapshot, is_seeding: bool) -> f64 {
    if is_seeding && snap.total_dl <= snap.total_ul {
        return -1.0;
    }
    if snap.total_ul == 0 {
        if snap.total_dl == 0 { 0.0 } else { f64::INFINITY }
    } else {
        snap.total_dl as f64 / snap.total_ul as f64
    }
}

fn progress_fraction(snap: &PeerSnapshot) -> f64 {
    if snap.total_pieces == 0 {
        0.0
    } else {
        snap.piece_count as f64 / snap.total_pieces as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn snap(dl: u64, ul: u64, total_dl: u64, total_ul: u64) -> PeerSnapshot {
        PeerSnapshot {
            dl_rate: dl,
            ul_rate: ul,
            total_ul,
            total_dl,
            piece_count: 0,
            piece_length: 0,
            total_pieces: 1,
            local_choked: true,
            is_empty: total_ul == 0 && total_dl == 0,
            wait_started: Instant::now(),
            unchoked_since: None,
        }
    }

    #[test]
    fn select_unchoke_prefers_higher_download_rate_while_leeching() {
        let a: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:2".parse().unwrap();
        let winner = select_unchoke(&(a, snap(100, 0, 0, 0)), &(b, snap(10, 0, 0, 0)), false);
        assert_eq!(winner, a);
    }

    #[test]
    fn select_unchoke_excludes_ungiving_peers_while_seeding() {
        let a: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:2".parse().unwrap();
        // a: total_dl=50 > total_ul=10 -> still reciprocates, ratio 5.0.
        // b: total_dl=0 <= total_ul=100 -> excluded while seeding (-1).
        let winner = select_unchoke(&(a, snap(0, 0, 50, 10)), &(b, snap(0, 0, 0, 100)), true);
        assert_eq!(winner, a);
    }

    #[test]
    fn select_unchoke_falls_back_to_progress_when_both_excluded_while_seeding() {
        let a: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:2".parse().unwrap();
        // both total_dl <= total_ul -> both excluded (-1 == -1), falls
        // through to the progress tiebreak, which favors `a` on a tie.
        let winner = select_unchoke(&(a, snap(0, 0, 0, 100)), &(b, snap(0, 0, 0, 10)), true);
        assert_eq!(winner, a);
    }

    #[test]
    fn consider_fills_empty_slot_without_a_loser() {
        let mut sched = ChokeScheduler::new(3);
        let a: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let snaps: HashMap<SocketAddr, PeerSnapshot> = [(a, snap(50, 0, 0, 0))].into_iter().collect();
        let lookup = |addr: SocketAddr| snaps[&addr];
        let mut rng = rand::thread_rng();

        let loser = sched.consider(a, &lookup, false, Instant::now(), &mut rng);
        assert!(loser.is_none());
        assert_eq!(sched.chosen(), vec![a]);
    }

    #[test]
    fn consider_evicts_worst_slot_into_the_optimistic_seat() {
        // With the optimistic slot empty, the first displaced peer is
        // granted optimism rather than choked outright.
        let mut sched = ChokeScheduler::new(1);
        let a: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:2".parse().unwrap();
        let snaps: HashMap<SocketAddr, PeerSnapshot> =
            [(a, snap(10, 0, 0, 0)), (b, snap(100, 0, 0, 0))].into_iter().collect();
        let lookup = |addr: SocketAddr| snaps[&addr];
        let mut rng = rand::thread_rng();

        sched.consider(a, &lookup, false, Instant::now(), &mut rng);
        let loser = sched.consider(b, &lookup, false, Instant::now(), &mut rng);
        assert!(loser.is_none());
        let mut chosen = sched.chosen();
        chosen.sort_by_key(|a| a.port());
        assert_eq!(chosen, vec![a, b]);
    }
}
