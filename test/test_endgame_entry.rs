//! S5 -- endgame entry: `pieces_remaining = 2`, `peer_count - conn_count
//! = 5` ⇒ endgame triggers.

use bip_swarm::piece_selector::should_enter_endgame;

#[test]
fn triggers_when_needed_wanted_is_smaller_than_free_peer_slots() {
    assert!(should_enter_endgame(2, 7, 2));
}

#[test]
fn does_not_trigger_when_still_far_from_done() {
    assert!(!should_enter_endgame(5, 7, 2));
}

#[test]
fn boundary_is_strict_less_than() {
    // needed_wanted == peer_count - conn_count must NOT trigger.
    assert!(!should_enter_endgame(5, 7, 2));
}
