//! S6 -- duplicate-request cancel: piece `i` queued by two peers and
//! absent from pending ⇒ `CancelOneRequest(i)` cancels on the slower
//! peer and the caller's `dup_req_pieces` counter drops 2→1.

use std::net::SocketAddr;

use bip_swarm::piece_selector::{cancel_one_request, CancelAction};

fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{}", port).parse().unwrap()
}

#[test]
fn duplicate_across_two_peers_cancels_slower_one() {
    let fast = addr(1);
    let slow = addr(2);

    // fast: higher nominal rate, 4 other slices queued for this piece.
    // slow: lower rate, only this one slice queued.
    let holders = [(fast, 500u64, 4usize), (slow, 50u64, 1usize)];

    let action = cancel_one_request(&holders, false).expect("duplicate count exceeds slowest peer's queue length");
    assert_eq!(action, CancelAction::CancelPieceOn(slow));

    let mut dup_req_pieces = 2usize;
    if matches!(action, CancelAction::CancelPieceOn(_)) {
        dup_req_pieces -= 1;
    }
    assert_eq!(dup_req_pieces, 1);
}

#[test]
fn pending_registry_holding_the_piece_is_cleared_instead_of_closing_a_peer() {
    let peer = addr(1);
    let action = cancel_one_request(&[(peer, 100, 1)], true);
    assert_eq!(action, Some(CancelAction::ClosePending));
}
