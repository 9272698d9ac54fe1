//! `PieceSelector` (§4.5): duplicate-request selection, valued-piece
//! heuristic, abandonment and cancellation. Grounded on `bip_peer`'s
//! `piece/selectors` module -- we keep its shape of small, independently
//! testable free functions operating on borrowed snapshots rather than a
//! stateful object holding peer references, since the original intrusive
//! peer list isn't something a safe Rust port should reproduce (Design
//! Note 9).

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::bitfield::Bitfield;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DupMode {
    Initial,
    Endgame,
}

/// `Who_Can_Abandon(proposer)` (§4.5). `candidates` yields, per SUCCESS
/// peer other than the proposer, `(addr, nominal_dl_rate, queue_intersects)`
/// where `queue_intersects` says whether that peer's request queue holds
/// something the proposer could instead request.
///
/// Open Question resolution: the `proposer_rate > 1.5 * candidate_rate`
/// guard is a precondition applied only while no candidate has yet been
/// accepted -- once a candidate is accepted, later candidates compete on
/// rate alone.
pub fn who_can_abandon(proposer_rate: u64, candidates: impl Iterator<Item = (SocketAddr, u64, bool)>) -> Option<SocketAddr> {
    let mut best: Option<(SocketAddr, u64)> = None;
    for (addr, rate, intersects) in candidates {
        if !intersects {
            continue;
        }
        match best {
            None => {
                if proposer_rate as f64 > 1.5 * rate as f64 {
                    best = Some((addr, rate));
                }
            }
            Some((_, best_rate)) if rate < best_rate => best = Some((addr, rate)),
            Some(_) => {}
        }
    }
    best.map(|(addr, _)| addr)
}

/// `FindValuedPieces` (§4.5): narrows `local_bitfield` down to the
/// pieces worth hunting for duplicate requests on.
///
/// - `all_have`: pieces every SUCCESS peer has.
/// - `int_have`: pieces every "interesting" peer has.
/// - `any_interesting_lacks`: true if some interesting peer is missing a
///   piece that `all_have` would otherwise have counted -- in that case
///   `int_have` is used as the base instead of `all_have`.
/// - `shared_not_all`: pieces more than one peer has but not all (used
///   in `Initial` mode).
/// - `only_proposer_among_nonseed`: pieces only the proposer has among
///   non-seeding peers (used in `Endgame` mode).
pub fn find_valued_pieces(
    local_bitfield: &Bitfield,
    all_have: &Bitfield,
    int_have: &Bitfield,
    any_interesting_lacks: bool,
    mode: DupMode,
    shared_not_all: &Bitfield,
    only_proposer_among_nonseed: &Bitfield,
) -> Bitfield {
    let base = if any_interesting_lacks { int_have } else { all_have };
    let not_everyone_has = base.inverted();
    let pertinent = not_everyone_has.intersection(local_bitfield);

    let narrowed = match mode {
        DupMode::Initial => pertinent.intersection(shared_not_all),
        DupMode::Endgame => pertinent.intersection(only_proposer_among_nonseed),
    };

    if narrowed.is_empty() { pertinent } else { narrowed }
}

/// One hash-table entry accumulated by `what_can_duplicate`: a candidate
/// piece index, the length of the shortest queue it was seen in, and how
/// many distinct peers have it queued.
#[derive(Copy, Clone, Debug)]
struct DupEntry {
    index: usize,
    qlen: usize,
    count: usize,
}

/// `What_Can_Duplicate(bitfield, proposer, mode)` (§4.5). `peer_queues`
/// gives, for every SUCCESS peer excluding the proposer with a non-empty
/// request queue, the distinct piece indices in that queue and the
/// queue's length. `proposer_queue_has` reports whether the proposer
/// already has a given index queued. Returns the chosen piece index,
/// and whether `dup_req_pieces` should be incremented (true iff the
/// winning entry was seen at exactly one peer).
pub fn what_can_duplicate(
    valued: &Bitfield,
    mode: DupMode,
    piece_length: usize,
    slice_size: usize,
    peer_queues: impl Iterator<Item = (Vec<usize>, usize)>,
    proposer_queue_has: impl Fn(usize) -> bool,
) -> Option<(usize, bool)> {
    let mut table: HashMap<usize, DupEntry> = HashMap::new();

    for (pieces, qlen) in peer_queues {
        for idx in pieces {
            if !valued.has(idx) || proposer_queue_has(idx) {
                continue;
            }
            table
                .entry(idx)
                .and_modify(|e| {
                    e.qlen = e.qlen.min(qlen);
                    e.count += 1;
                })
                .or_insert(DupEntry { index: idx, qlen, count: 1 });
        }
    }

    let initial_bar = (piece_length as f64 / slice_size as f64).ceil() as usize + 2;

    let mut best: Option<(DupEntry, f64)> = None;
    for entry in table.values() {
        let work = entry.qlen as f64 / entry.count as f64;
        if work <= 1.0 {
            continue;
        }
        let eligible = match mode {
            DupMode::Endgame => true,
            DupMode::Initial => work < initial_bar as f64,
        };
        if !eligible {
            continue;
        }
        let better = match (&best, mode) {
            (None, _) => true,
            (Some((_, best_work)), DupMode::Endgame) => work > *best_work,
            (Some((_, best_work)), DupMode::Initial) => work < *best_work,
        };
        if better {
            best = Some((*entry, work));
        }
    }

    best.map(|(entry, _)| (entry.index, entry.count == 1))
}

/// `CancelOneRequest(idx)` (§4.5). `holders` lists, per live peer
/// holding `idx` in its queue (slowest-rate last is not assumed --
/// caller supplies unordered), `(addr, nominal_rate, queue_len_for_piece)`.
/// `pending_has_piece` reports whether the pending-piece registry also
/// holds `idx`. Returns the action to take, or `None` if the duplicate
/// count does not exceed the chosen peer's per-piece queue length.
#[derive(Debug, PartialEq, Eq)]
pub enum CancelAction {
    ClosePending,
    CancelPieceOn(SocketAddr),
}

pub fn cancel_one_request(
    holders: &[(SocketAddr, u64, usize)],
    pending_has_piece: bool,
) -> Option<CancelAction> {
    let dup_count = holders.len() + if pending_has_piece { 1 } else { 0 };
    if dup_count < 2 {
        return None;
    }

    if pending_has_piece {
        return Some(CancelAction::ClosePending);
    }

    // Slowest peer with the most later-queued slices: minimize rate,
    // then maximize queue length.
    let slowest = holders
        .iter()
        .min_by(|a, b| a.1.cmp(&b.1).then(b.2.cmp(&a.2)))?;

    if dup_count > slowest.2 {
        Some(CancelAction::CancelPieceOn(slowest.0))
    } else {
        None
    }
}

/// Endgame trigger (§4.5): entered when the number of still-needed
/// wanted pieces is strictly less than `peer_count - conn_count`.
pub fn should_enter_endgame(needed_wanted: usize, peer_count: usize, conn_count: usize) -> bool {
    needed_wanted < peer_count.saturating_sub(conn_count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn who_can_abandon_requires_ratio_bar_on_first_candidate() {
        let a: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:2".parse().unwrap();
        // proposer_rate=100, a's rate=90 -> 100 <= 1.5*90, fails bar, skipped.
        // b's rate=10 would have passed, but since `best` is still None we
        // apply the bar to every candidate in order until one is accepted.
        let winner = who_can_abandon(100, vec![(a, 90, true), (b, 10, true)].into_iter());
        assert_eq!(winner, Some(b));
    }

    #[test]
    fn who_can_abandon_ignores_non_intersecting() {
        let a: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let winner = who_can_abandon(100, vec![(a, 1, false)].into_iter());
        assert_eq!(winner, None);
    }

    #[test]
    fn find_valued_pieces_falls_back_to_broad_set_when_narrow_is_empty() {
        let mut local = Bitfield::new(4);
        local.set(0);
        local.set(1);
        let all_have = Bitfield::new(4); // nobody has anything
        let int_have = Bitfield::new(4);
        let shared_not_all = Bitfield::new(4); // empty -> narrowed empty -> fall back

        let valued = find_valued_pieces(&local, &all_have, &int_have, false, DupMode::Initial, &shared_not_all, &Bitfield::new(4));
        assert!(valued.has(0));
        assert!(valued.has(1));
    }

    #[test]
    fn what_can_duplicate_picks_longest_wait_in_endgame() {
        let mut valued = Bitfield::new(4);
        valued.set(0);
        valued.set(1);

        // piece 0: one peer, qlen 5 -> work=5
        // piece 1: one peer, qlen 2 -> work=2
        let queues = vec![(vec![0usize], 5usize), (vec![1usize], 2usize)];
        let chosen = what_can_duplicate(&valued, DupMode::Endgame, 16384, 16384, queues.into_iter(), |_| false);
        assert_eq!(chosen, Some((0, true)));
    }

    #[test]
    fn what_can_duplicate_excludes_already_queued_by_proposer() {
        let mut valued = Bitfield::new(2);
        valued.set(0);
        let queues = vec![(vec![0usize], 5usize)];
        let chosen = what_can_duplicate(&valued, DupMode::Endgame, 16384, 16384, queues.into_iter(), |idx| idx == 0);
        assert_eq!(chosen, None);
    }

    #[test]
    fn cancel_one_request_prefers_pending_over_peer_close() {
        let a: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let action = cancel_one_request(&[(a, 10, 3)], true);
        assert_eq!(action, Some(CancelAction::ClosePending));
    }

    #[test]
    fn cancel_one_request_needs_count_above_queue_length() {
        let a: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:2".parse().unwrap();
        // 2 holders, slowest (a) has queue len 2 -> dup_count(2) is not > 2
        let action = cancel_one_request(&[(a, 10, 2), (b, 20, 1)], false);
        assert_eq!(action, None);
    }

    #[test]
    fn cancel_one_request_cancels_slowest_when_over_threshold() {
        let a: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:2".parse().unwrap();
        let action = cancel_one_request(&[(a, 10, 1), (b, 20, 5)], false);
        assert_eq!(action, Some(CancelAction::CancelPieceOn(a)));
    }

    #[test]
    fn endgame_trigger_matches_spec_inequality() {
        assert!(should_enter_endgame(2, 7, 2));
        assert!(!should_enter_endgame(5, 7, 2));
    }
}
