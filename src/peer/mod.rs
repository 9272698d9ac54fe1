//! The `Peer` type: a logical counterpart identified by address, and the
//! per-peer state the data model (§3) requires.

pub mod request_queue;
pub mod state;

use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use mio::net::TcpStream;

use crate::bitfield::Bitfield;
use crate::config::KEEPALIVE_INTERVAL_SECS;
use crate::message::Message;
use request_queue::RequestQueue;
use state::ConnectionState;

/// Exponential decay constant for the instantaneous-rate EWMA. A
/// supplement over the original spec (§11 of SPEC_FULL.md): the window
/// the EWMA operates over, chosen to match the cadence of an unchoke
/// scan (10s minimum interval) without being so short that a single
/// slow block spikes the rate comparison used by `SelectUnchoke`.
const RATE_WINDOW_SECS: f64 = 20.0;

/// Smoothed + instantaneous transfer rate tracker for one direction.
#[derive(Clone, Debug, Default)]
pub struct RateTracker {
    ewma_bytes_per_sec: f64,
    last_sample: Option<Instant>,
}

impl RateTracker {
    pub fn observe(&mut self, bytes: u64, now: Instant) {
        let instant_rate = if let Some(last) = self.last_sample {
            let dt = (now - last).as_secs_f64().max(1e-3);
            bytes as f64 / dt
        } else {
            bytes as f64
        };
        let alpha = 1.0 / RATE_WINDOW_SECS;
        self.ewma_bytes_per_sec = self.ewma_bytes_per_sec * (1.0 - alpha) + instant_rate * alpha;
        self.last_sample = Some(now);
    }

    pub fn rate(&self) -> u64 {
        self.ewma_bytes_per_sec as u64
    }
}

/// A logical counterpart identified by address (§3 "Peer").
pub struct Peer {
    pub addr: SocketAddr,
    pub socket: Option<TcpStream>,
    pub state: ConnectionState,
    pub outbound: bool,

    pub remote_bitfield: Bitfield,
    pub out_queue: RequestQueue,
    pub in_queue: RequestQueue,

    pub total_sent: u64,
    pub total_recv: u64,
    pub ul_rate: RateTracker,
    pub dl_rate: RateTracker,

    pub last_message: Instant,
    pub last_unchoke: Option<Instant>,
    pub unchoked_since: Option<Instant>,

    pub local_choked: bool,
    pub local_interested: bool,
    pub remote_choked: bool,
    pub remote_interested: bool,

    pub queued_haves: Vec<u32>,

    /// Set when this connection was admitted while we were already a
    /// seed and the peer is also a seed -- a §4.3 seed<->seed close
    /// candidate once `seed_time` elapses.
    pub connected_while_seeding: bool,
    /// "Don't bother reconnecting" marker, set on policy closes that are
    /// not expected to be transient (e.g. protocol violation).
    pub dont_want_again: bool,

    /// Monotonic fairness tag bumped whenever this peer services a
    /// read/write, used by the dispatch walk to promote busy peers to
    /// the head and bound starvation of late peers (§5).
    pub ready_count: u64,

    /// Cleared on endgame entry ("un-standby"); set when the piece
    /// selector could find nothing requestable for this peer.
    pub standby: bool,

    pub in_buf: BytesMut,
    pub out_buf: BytesMut,
}

impl Peer {
    pub fn new_outbound(addr: SocketAddr, socket: TcpStream, connecting: bool, buf_capacity: usize) -> Peer {
        let now = Instant::now();
        Peer {
            addr,
            socket: Some(socket),
            state: if connecting { ConnectionState::Connecting } else { ConnectionState::Handshake },
            outbound: true,
            remote_bitfield: Bitfield::new(0),
            out_queue: RequestQueue::new(),
            in_queue: RequestQueue::new(),
            total_sent: 0,
            total_recv: 0,
            ul_rate: RateTracker::default(),
            dl_rate: RateTracker::default(),
            last_message: now,
            last_unchoke: None,
            unchoked_since: None,
            local_choked: true,
            local_interested: false,
            remote_choked: true,
            remote_interested: false,
            queued_haves: Vec::new(),
            connected_while_seeding: false,
            dont_want_again: false,
            ready_count: 0,
            standby: false,
            in_buf: BytesMut::with_capacity(buf_capacity),
            out_buf: BytesMut::with_capacity(buf_capacity),
        }
    }

    pub fn new_inbound(addr: SocketAddr, socket: TcpStream, buf_capacity: usize) -> Peer {
        let mut peer = Peer::new_outbound(addr, socket, false, buf_capacity);
        peer.outbound = false;
        peer.state = ConnectionState::Handshake;
        peer
    }

    /// §4.7: liveness probe. A protocol ping whose failure (write error)
    /// kills the peer; here we just report whether we *could* send one.
    pub fn are_you_ok(&mut self) -> io::Result<()> {
        self.send(Message::KeepAlive)
    }

    pub fn send(&mut self, message: Message) -> io::Result<()> {
        message.encode(&mut self.out_buf)
    }

    pub fn touch_activity(&mut self, now: Instant) {
        self.last_message = now;
    }

    pub fn silent_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_message)
    }

    pub fn is_seed(&self) -> bool {
        self.remote_bitfield.is_full()
    }

    /// Whether we need a read-readiness interest armed this tick, given
    /// whether download is currently bandwidth-limited.
    pub fn need_read(&self, limited_down: bool) -> bool {
        !limited_down && self.state != ConnectionState::Failed
    }

    /// Whether we need a write-readiness interest armed this tick.
    pub fn need_write(&self, limited_up: bool) -> bool {
        if self.state == ConnectionState::Failed {
            return false;
        }
        if self.state == ConnectionState::Connecting {
            return true;
        }
        !self.out_buf.is_empty() || (!limited_up && !self.out_queue.is_empty())
    }

    /// Keepalive eviction check (§4.7): silence `>= 3 * KEEPALIVE_INTERVAL`.
    pub fn is_hard_dead(&self, now: Instant) -> bool {
        self.silent_for(now).as_secs() >= 3 * KEEPALIVE_INTERVAL_SECS
    }

    /// Whether a keepalive scan should probe this peer: silence
    /// `>= KEEPALIVE_INTERVAL` while connected.
    pub fn needs_keepalive_probe(&self, now: Instant) -> bool {
        self.state.is_success() && self.silent_for(now).as_secs() >= KEEPALIVE_INTERVAL_SECS
    }

    /// Supplement (§11 of SPEC_FULL.md): a peer is "snubbing" us if we
    /// are interested in it but it has sent nothing for two keepalive
    /// intervals. Used only to de-prioritize in comparisons, never to
    /// evict -- eviction stays governed by `is_hard_dead`.
    pub fn is_snubbing(&self, now: Instant) -> bool {
        self.local_interested && self.silent_for(now).as_secs() >= 2 * KEEPALIVE_INTERVAL_SECS
    }
}
