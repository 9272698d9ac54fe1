//! Narrow interfaces to the collaborators named in the original spec's
//! External Interfaces section (§6). These are out of scope for this
//! crate to implement (tracker protocol, on-disk piece storage, process
//! accounting) -- the core only depends on these traits, never on
//! process-wide singletons, per the Design Notes' mandate to replace
//! `WORLD`/`TRACKER`/`BTCONTENT`/`Self`/`CONSOLE`/`IPQUEUE`/`PENDING`
//! with an explicit owning context.

use std::net::SocketAddr;
use std::time::Duration;

use crate::bitfield::Bitfield;

/// The active torrent's piece store.
pub trait Content {
    fn piece_count(&self) -> usize;
    fn piece_length(&self) -> usize;
    fn local_bitfield(&self) -> &Bitfield;
    /// Pieces we still want, independent of whether we have them (a
    /// partial-download filter, e.g. "only these files").
    fn want_filter(&self) -> &Bitfield;
    fn is_seeding(&self) -> bool;
    fn is_full(&self) -> bool;
    /// Seconds to tolerate a seed<->seed connection before closing it.
    fn seed_time(&self) -> Duration;
    /// Whether the disk layer is busy enough that prefetching would
    /// contend with it.
    fn disk_active(&self) -> bool;
}

/// Supplies a live stream of candidate peer addresses and tracker state.
pub trait Tracker {
    /// Pop the next queued peer address, if any.
    fn next_address(&mut self) -> Option<SocketAddr>;
    /// Push an address back onto the queue (used for reconnect).
    fn requeue_address(&mut self, addr: SocketAddr);
    fn announce_interval(&self) -> Duration;
    fn is_quitting(&self) -> bool;
    /// Adjust the tracker's notion of our peer count by `delta`.
    fn adjust_peer_count(&mut self, delta: i64);
}

/// Aggregate I/O accounting external to any one peer.
pub trait SelfStats {
    fn last_send_time(&self) -> Duration;
    fn last_send_size(&self) -> u64;
    fn last_recv_time(&self) -> Duration;
    fn last_recv_size(&self) -> u64;
    fn nominal_up_rate(&self) -> u64;
    fn nominal_down_rate(&self) -> u64;
    fn late_ul_budget(&self) -> Duration;
    fn late_dl_budget(&self) -> Duration;
    fn stop_dl_timer(&mut self);
    fn stop_ul_timer(&mut self);
    fn ontime_dl(&mut self, ontime: bool);
    fn ontime_ul(&mut self, ontime: bool);
}

/// Store of pieces whose completion is awaiting disk write -- the
/// "pending registry" named in the GLOSSARY.
pub trait PendingPieces {
    fn contains(&self, piece_index: usize) -> bool;
    fn clear(&mut self, piece_index: usize);
}

/// The per-peer wire codec/handshake negotiator. Named `Stream` in the
/// original collaborator list and treated there as wholly out of scope
/// (it lives in the wider workspace as its own handshake subsystem) --
/// the core only needs to know whether a HANDSHAKE-state peer has
/// finished negotiating, never the bytes involved.
pub trait Handshake {
    /// Drive the handshake forward using currently-available socket
    /// readiness. `Ok(true)` once complete (caller transitions the peer
    /// to SUCCESS), `Ok(false)` if still in progress, `Err` on a
    /// malformed or failed handshake (caller transitions to FAILED).
    fn drive(&mut self, peer: &mut crate::peer::Peer) -> std::io::Result<bool>;
}

/// Trivial in-memory pending registry, useful for tests and for
/// embedders that have no pending-write concept.
#[derive(Default)]
pub struct NoPendingPieces;

impl PendingPieces for NoPendingPieces {
    fn contains(&self, _piece_index: usize) -> bool {
        false
    }

    fn clear(&mut self, _piece_index: usize) {}
}
