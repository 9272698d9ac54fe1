//! `ReadinessLoop` (§4.3, §5): the single-threaded, cooperative,
//! readiness-driven tick that ties every other component together.
//!
//! Grounded on `bip_peer::manager::PeerManager`'s tick/poll shape, but
//! rebuilt on `mio` 0.8's `Poll`/`Events`/`Token` -- the teacher's own
//! event-loop code (`bip_dht`'s worker, `bip_peer`'s piece module) still
//! reaches for `mio`, just an older 0.5-era API built around
//! `EventLoop::Handler` callbacks. We keep the dependency, not the
//! callback style: the ordering this spec requires (interval check,
//! then a single synchronous walk, then one external wait) reads far
//! more plainly as a loop over `Poll::poll`'s `Events` than as handler
//! callbacks threaded through a registration table.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use log::{debug, warn};
use mio::{Events, Interest, Token};
use rand::rngs::ThreadRng;

use crate::bandwidth::BandwidthGovernor;
use crate::bitfield::Bitfield;
use crate::choke::{ChokeScheduler, PeerSnapshot};
use crate::collab::{Content, Handshake, PendingPieces, SelfStats, Tracker};
use crate::config::{Config, KEEPALIVE_INTERVAL_SECS, SEED_TIME_SECS};
use crate::listen::ListenAcceptor;
use crate::message::Message;
use crate::peer::state::ConnectionState;
use crate::peer::Peer;
use crate::piece_selector::{self, CancelAction, DupMode};
use crate::registry::PeerRegistry;

const LISTEN_TOKEN: Token = Token(0);

/// Flags computed by `interval_check` and consumed by `fill_fd_set`.
#[derive(Default, Debug, Clone, Copy)]
pub struct IntervalFlags {
    pub keepalive_scan: bool,
    pub unchoke_scan: bool,
    pub upload_limited: bool,
    pub download_limited: bool,
}

pub struct ReadinessLoop {
    registry: PeerRegistry,
    choke: ChokeScheduler,
    bandwidth: BandwidthGovernor,
    listen: ListenAcceptor,
    config: Config,

    poll: mio::Poll,
    events: Events,
    tokens: HashMap<Token, SocketAddr>,
    addrs: HashMap<SocketAddr, Token>,
    next_token: usize,

    last_keepalive_scan: Instant,
    last_unchoke_scan: Instant,
    last_seed_close_scan: Instant,

    /// Whether the piece selector is currently in endgame mode (§4.5).
    endgame: bool,

    rng: ThreadRng,
}

impl ReadinessLoop {
    pub fn new(config: Config, mut listen: ListenAcceptor) -> io::Result<ReadinessLoop> {
        let poll = mio::Poll::new()?;
        poll.registry().register(listen.listener_mut(), LISTEN_TOKEN, Interest::READABLE)?;

        let registry = PeerRegistry::new(&config, None);
        let choke = ChokeScheduler::new(config.max_peers.max(3) / 4 + 3);
        let bandwidth = BandwidthGovernor::new(config.max_bandwidth_up, config.max_bandwidth_down);

        Ok(ReadinessLoop {
            registry,
            choke,
            bandwidth,
            listen,
            config,
            poll,
            events: Events::with_capacity(1024),
            tokens: HashMap::new(),
            addrs: HashMap::new(),
            next_token: 1,
            last_keepalive_scan: Instant::now(),
            last_unchoke_scan: Instant::now(),
            last_seed_close_scan: Instant::now(),
            endgame: false,
            rng: rand::thread_rng(),
        })
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Run one full tick: `IntervalCheck`, `FillFDSet`, the external
    /// readiness wait (bounded by `WaitBW`'s deadline when bandwidth is
    /// capped), then dispatch. This is the method an embedder calls in
    /// its own outer loop; everything above it is exposed separately so
    /// tests can drive each phase independently.
    #[allow(clippy::too_many_arguments)]
    pub fn tick(
        &mut self,
        tracker: &mut dyn Tracker,
        content: &dyn Content,
        stats: &dyn SelfStats,
        handshake: &mut dyn Handshake,
        pending: &mut dyn PendingPieces,
        now: Instant,
    ) -> io::Result<()> {
        let flags = self.interval_check(tracker, content, stats, now);
        self.fill_fd_set(tracker, content, pending, flags, now);

        let budget = match self.bandwidth.wait_bw(
            stats.last_send_time(),
            stats.last_send_size(),
            stats.last_recv_time(),
            stats.last_recv_size(),
            now,
            flags.upload_limited,
            flags.download_limited,
        ) {
            Some((deadline, _, _)) => deadline,
            None => Duration::from_millis(1),
        };

        self.poll_and_dispatch(budget, tracker, handshake, content, pending, now)
    }

    fn alloc_token(&mut self, addr: SocketAddr) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        self.tokens.insert(token, addr);
        self.addrs.insert(addr, token);
        token
    }

    fn drop_token(&mut self, addr: SocketAddr) {
        if let Some(token) = self.addrs.remove(&addr) {
            self.tokens.remove(&token);
        }
    }

    /// `IntervalCheck` (§4.3).
    pub fn interval_check(&mut self, tracker: &mut dyn Tracker, content: &dyn Content, stats: &dyn SelfStats, now: Instant) -> IntervalFlags {
        while !self.registry.is_full() && !tracker.is_quitting() {
            match tracker.next_address() {
                Some(addr) => {
                    let announce = tracker.announce_interval();
                    match self.registry.new_outbound_peer(addr, announce, content.is_seeding()) {
                        Ok(()) => {
                            self.alloc_token(addr);
                        }
                        Err(e) => debug!("bip_swarm: NewPeer({}) refused: {}", addr, e),
                    }
                }
                None => break,
            }
        }

        self.bandwidth.sync_late_budgets(stats);
        let upload_limited = self.bandwidth.up_limited(stats.last_send_time(), stats.last_send_size(), now);
        let download_limited = self.bandwidth.down_limited(stats.last_recv_time(), stats.last_recv_size(), now);

        if now.saturating_duration_since(self.last_seed_close_scan) >= Duration::from_secs(SEED_TIME_SECS) {
            self.last_seed_close_scan = now;
            self.close_seed_to_seed(content.is_seeding());
        }

        let keepalive_scan = now.saturating_duration_since(self.last_keepalive_scan).as_secs() >= KEEPALIVE_INTERVAL_SECS;
        if keepalive_scan {
            self.last_keepalive_scan = now;
        }

        let unchoke_scan = !self.config.is_paused() && now.saturating_duration_since(self.last_unchoke_scan) >= self.choke.unchoke_interval;
        if unchoke_scan {
            self.last_unchoke_scan = now;
        }

        IntervalFlags {
            keepalive_scan,
            unchoke_scan,
            upload_limited,
            download_limited,
        }
    }

    fn close_seed_to_seed(&mut self, we_are_seeding: bool) {
        if !we_are_seeding {
            return;
        }
        for peer in self.registry.live_mut().values_mut() {
            if peer.connected_while_seeding && peer.is_seed() && peer.state == ConnectionState::Success {
                debug!("bip_swarm: closing seed<->seed connection to {}", peer.addr);
                peer.state = ConnectionState::Failed;
                peer.dont_want_again = true;
            }
        }
    }

    /// `FillFDSet` (§4.3). Reaps terminal peers (requeuing the
    /// reconnect-eligible ones onto `tracker`'s address queue), runs the
    /// keepalive/unchoke scans, re-derives endgame and duplicate-request
    /// state, then arms read/write interests.
    pub fn fill_fd_set(&mut self, tracker: &mut dyn Tracker, content: &dyn Content, pending: &mut dyn PendingPieces, flags: IntervalFlags, now: Instant) {
        self.reap_failed(tracker);
        self.registry.recompute_counters();

        if flags.keepalive_scan {
            self.run_keepalive_scan(now);
        }

        if flags.unchoke_scan {
            self.run_unchoke_scan(content, now);
        }

        self.reap_failed(tracker);
        self.registry.recompute_counters();

        self.endgame_check(content);
        self.prune_duplicate_requests(pending);
        self.flush_queued_haves();

        self.arm_interests(flags);

        let listen_should_read = !self.registry.is_full();
        let registry = self.poll.registry();
        if listen_should_read {
            let _ = registry.reregister(self.listen.listener_mut(), LISTEN_TOKEN, Interest::READABLE);
        }
    }

    /// `Endgame()` (§4.5): two-stage trigger. First against the full set
    /// of still-wanted pieces; if that's not small enough, narrowed to
    /// pieces actually obtainable from a live peer (`Pieces_I_Can_Get`)
    /// before testing again. Entering endgame un-standbys every peer so
    /// the next `request_next` call considers them all again.
    fn endgame_check(&mut self, content: &dyn Content) {
        let counters = self.registry.counters();
        let peer_count = counters.peer_count;
        let conn_count = peer_count.saturating_sub(counters.handshaking_count);

        let still_wanted = content.local_bitfield().inverted().intersection(content.want_filter());

        let mut enter = piece_selector::should_enter_endgame(still_wanted.count(), peer_count, conn_count);
        if !enter {
            let mut obtainable = Bitfield::new(content.piece_count());
            for peer in self.registry.live().values() {
                if peer.state == ConnectionState::Success {
                    obtainable.union_with(&peer.remote_bitfield);
                }
            }
            let narrowed = still_wanted.intersection(&obtainable);
            enter = piece_selector::should_enter_endgame(narrowed.count(), peer_count, conn_count);
        }

        if enter && !self.endgame {
            debug!("bip_swarm: entering endgame");
            for peer in self.registry.live_mut().values_mut() {
                if peer.state == ConnectionState::Success {
                    peer.standby = false;
                }
            }
        }
        self.endgame = enter;
    }

    /// `CancelOneRequest` swept across every still-outstanding piece
    /// (§4.5): cancels the slowest duplicate holder, or clears the
    /// pending-write registry's entry, whenever a piece is over-requested.
    fn prune_duplicate_requests(&mut self, pending: &mut dyn PendingPieces) {
        let mut holders: HashMap<usize, Vec<(SocketAddr, u64, usize)>> = HashMap::new();
        for peer in self.registry.live().values() {
            if peer.state != ConnectionState::Success {
                continue;
            }
            for idx in peer.out_queue.pieces() {
                holders.entry(idx).or_default().push((peer.addr, peer.dl_rate.rate(), peer.out_queue.count_for_piece(idx)));
            }
        }

        let slice_size = self.config.req_slice_size as u32;
        for (index, entries) in holders {
            let pending_has = pending.contains(index);
            match piece_selector::cancel_one_request(&entries, pending_has) {
                Some(CancelAction::ClosePending) => pending.clear(index),
                Some(CancelAction::CancelPieceOn(addr)) => {
                    if let Some(peer) = self.registry.get_mut(&addr) {
                        let cancelled = peer.out_queue.cancel_piece(index);
                        if cancelled > 0 && peer.send(Message::Cancel { index: index as u32, begin: 0, length: slice_size }).is_err() {
                            peer.state = ConnectionState::Failed;
                        }
                    }
                }
                None => {}
            }
        }
    }

    /// Sends any HAVEs a prior `tell_world_i_have` call deferred for a
    /// peer, one FillFDSet pass later.
    fn flush_queued_haves(&mut self) {
        let addrs: Vec<SocketAddr> = self
            .registry
            .live()
            .iter()
            .filter(|(_, p)| p.state == ConnectionState::Success && !p.queued_haves.is_empty())
            .map(|(addr, _)| *addr)
            .collect();

        for addr in addrs {
            if let Some(peer) = self.registry.get_mut(&addr) {
                let haves = std::mem::take(&mut peer.queued_haves);
                for index in haves {
                    if peer.send(Message::Have { index }).is_err() {
                        peer.state = ConnectionState::Failed;
                        break;
                    }
                }
            }
        }
    }

    /// `Tell_World_I_Have(idx)` (§4.5 original): called by the embedder
    /// once a piece's hash verifies. Peers get the HAVE immediately if
    /// we're now seeding, this is our first piece, or the peer isn't
    /// interested and lacks it; otherwise it's queued (`queued_haves`,
    /// drained by `flush_queued_haves`). Becoming a seed also forces
    /// NOT_INTERESTED on every peer, matching the original's own
    /// `Tell_World_I_Have` seeding branch.
    pub fn tell_world_i_have(&mut self, index: usize, content: &dyn Content) {
        let we_seed = content.is_seeding();
        let is_first_piece = content.local_bitfield().count() == 1;

        let addrs: Vec<SocketAddr> = self
            .registry
            .live()
            .iter()
            .filter(|(_, p)| p.state == ConnectionState::Success)
            .map(|(addr, _)| *addr)
            .collect();

        for addr in addrs.iter().copied() {
            let peer = match self.registry.get_mut(&addr) {
                Some(p) => p,
                None => continue,
            };
            let send_now = we_seed || is_first_piece || (!peer.remote_interested && !peer.remote_bitfield.has(index));
            if send_now {
                if peer.send(Message::Have { index: index as u32 }).is_err() {
                    peer.state = ConnectionState::Failed;
                }
            } else {
                peer.queued_haves.push(index as u32);
            }
        }

        if we_seed {
            for addr in addrs {
                if let Some(peer) = self.registry.get_mut(&addr) {
                    peer.local_interested = false;
                    if peer.send(Message::NotInterested).is_err() {
                        peer.state = ConnectionState::Failed;
                    }
                }
            }
        }
    }

    /// `CancelSlice(index, begin, length)` (§4.5): cancel one exact
    /// queued slice on every SUCCESS peer holding it.
    pub fn cancel_slice(&mut self, index: usize, begin: u32, length: u32) {
        let addrs: Vec<SocketAddr> = self
            .registry
            .live()
            .iter()
            .filter(|(_, p)| p.state == ConnectionState::Success && p.out_queue.contains_piece(index))
            .map(|(addr, _)| *addr)
            .collect();

        for addr in addrs {
            if let Some(peer) = self.registry.get_mut(&addr) {
                if peer.out_queue.cancel_slice(index, begin, length) && peer.send(Message::Cancel { index: index as u32, begin, length }).is_err() {
                    peer.state = ConnectionState::Failed;
                }
            }
        }
    }

    /// `CancelPiece(index)` (§4.5): cancel every queued slice of `index`
    /// on every SUCCESS peer holding any part of it.
    pub fn cancel_piece(&mut self, index: usize) {
        let slice_size = self.config.req_slice_size as u32;
        let addrs: Vec<SocketAddr> = self
            .registry
            .live()
            .iter()
            .filter(|(_, p)| p.state == ConnectionState::Success && p.out_queue.contains_piece(index))
            .map(|(addr, _)| *addr)
            .collect();

        for addr in addrs {
            if let Some(peer) = self.registry.get_mut(&addr) {
                let cancelled = peer.out_queue.cancel_piece(index);
                if cancelled > 0 && peer.send(Message::Cancel { index: index as u32, begin: 0, length: slice_size }).is_err() {
                    peer.state = ConnectionState::Failed;
                }
            }
        }
    }

    /// `Need_Remote_Data` (§4.5 original): whether `peer` has at least
    /// one piece we still want (want-filtered, not-yet-had) and don't
    /// already have.
    fn peer_has_wanted_piece(content: &dyn Content, peer: &Peer) -> bool {
        let needed = content.local_bitfield().inverted().intersection(content.want_filter());
        needed.intersection_count(&peer.remote_bitfield) > 0
    }

    /// `CheckInterest` (§4.5 original) for one peer: un-standby if
    /// already interested, else become interested if the peer has
    /// something we need, else announce NOT_INTERESTED. Closes the peer
    /// on a failed send.
    fn check_interest_one(&mut self, addr: SocketAddr, content: &dyn Content) {
        let peer = match self.registry.get_mut(&addr) {
            Some(p) => p,
            None => return,
        };

        if peer.local_interested {
            peer.standby = false;
            return;
        }

        if Self::peer_has_wanted_piece(content, peer) {
            peer.local_interested = true;
            if peer.send(Message::Interested).is_err() {
                peer.state = ConnectionState::Failed;
            }
        } else if peer.send(Message::NotInterested).is_err() {
            peer.state = ConnectionState::Failed;
        }
    }

    /// `CheckInterest` broadcast across every SUCCESS peer; used by
    /// `resume` since `pause` forces every peer NOT_INTERESTED and that
    /// state must be re-derived once play resumes.
    pub fn check_interest(&mut self, content: &dyn Content) {
        let addrs: Vec<SocketAddr> = self
            .registry
            .live()
            .iter()
            .filter(|(_, p)| p.state == ConnectionState::Success)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in addrs {
            self.check_interest_one(addr, content);
        }
    }

    /// `StopDownload()` (§5 original): NOT_INTERESTED on every peer. The
    /// original also queues outstanding requests into the pending-write
    /// registry (`PutPending`) here; `PendingPieces` exposes no `put`
    /// method in this crate's collaborator boundary, so that part is
    /// deliberately not replicated (see DESIGN.md).
    fn stop_download(&mut self) {
        let addrs: Vec<SocketAddr> = self
            .registry
            .live()
            .iter()
            .filter(|(_, p)| p.state == ConnectionState::Success)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in addrs {
            if let Some(peer) = self.registry.get_mut(&addr) {
                peer.local_interested = false;
                if peer.send(Message::NotInterested).is_err() {
                    peer.state = ConnectionState::Failed;
                }
            }
        }
    }

    /// `Pause()` (§5): force NOT_INTERESTED on everyone via
    /// `stop_download`, then CHOKE on every still-unchoked peer. Also
    /// disables the unchoke scan (`interval_check` gates it on
    /// `!config.is_paused()`).
    pub fn pause(&mut self) {
        self.config.set_paused(true);
        self.stop_download();

        let addrs: Vec<SocketAddr> = self
            .registry
            .live()
            .iter()
            .filter(|(_, p)| p.state == ConnectionState::Success && !p.local_choked)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in addrs {
            if let Some(peer) = self.registry.get_mut(&addr) {
                peer.local_choked = true;
                peer.unchoked_since = None;
                if peer.send(Message::Choke).is_err() {
                    peer.state = ConnectionState::Failed;
                }
            }
        }
    }

    /// `Resume()` (§5): clear the pause flag and re-derive interest.
    pub fn resume(&mut self, content: &dyn Content) {
        self.config.set_paused(false);
        self.check_interest(content);
    }

    /// `Who_Can_Abandon` fallback (§4.5): when `What_Can_Duplicate` finds
    /// nothing, look for a slower peer already holding a wanted piece
    /// `addr` doesn't, cancel it there, and return it so the caller can
    /// take over the request.
    fn try_abandon(&mut self, addr: SocketAddr) -> Option<(SocketAddr, usize)> {
        let proposer = self.registry.live().get(&addr)?;
        let proposer_rate = proposer.dl_rate.rate();
        let proposer_has: std::collections::HashSet<usize> = proposer.out_queue.pieces().collect();

        let candidates: Vec<(SocketAddr, u64, bool)> = self
            .registry
            .live()
            .values()
            .filter(|p| p.addr != addr && p.state == ConnectionState::Success && !p.out_queue.is_empty())
            .map(|p| {
                let intersects = p.out_queue.pieces().any(|idx| !proposer_has.contains(&idx));
                (p.addr, p.dl_rate.rate(), intersects)
            })
            .collect();

        let victim_addr = piece_selector::who_can_abandon(proposer_rate, candidates.into_iter())?;
        let piece_index = self.registry.live().get(&victim_addr)?.out_queue.pieces().find(|idx| !proposer_has.contains(idx))?;

        let slice_size = self.config.req_slice_size as u32;
        if let Some(victim) = self.registry.get_mut(&victim_addr) {
            victim.out_queue.cancel_piece(piece_index);
            if victim.send(Message::Cancel { index: piece_index as u32, begin: 0, length: slice_size }).is_err() {
                victim.state = ConnectionState::Failed;
            }
        }

        Some((victim_addr, piece_index))
    }

    /// Move terminal peers out of the live set, requeuing the
    /// reconnect-eligible ones (`!dont_want_again`) onto `tracker`'s
    /// address queue per invariant 5.
    fn reap_failed(&mut self, tracker: &mut dyn Tracker) {
        let failed: Vec<SocketAddr> = self
            .registry
            .live()
            .iter()
            .filter(|(_, p)| p.state == ConnectionState::Failed)
            .map(|(addr, _)| *addr)
            .collect();

        for addr in failed {
            let dont_want_again = self.registry.live().get(&addr).map(|p| p.dont_want_again).unwrap_or(true);
            self.drop_token(addr);
            self.registry.retire(addr);
            if !dont_want_again {
                tracker.requeue_address(addr);
            }
        }
    }

    fn run_keepalive_scan(&mut self, now: Instant) {
        for peer in self.registry.live_mut().values_mut() {
            if peer.is_hard_dead(now) {
                debug!("bip_swarm: {} hard-dead, closing", peer.addr);
                peer.state = ConnectionState::Failed;
            } else if peer.needs_keepalive_probe(now) {
                if peer.are_you_ok().is_err() {
                    debug!("bip_swarm: {} failed keepalive probe, closing", peer.addr);
                    peer.state = ConnectionState::Failed;
                }
            }
        }
    }

    fn run_unchoke_scan(&mut self, content: &dyn Content, now: Instant) {
        self.choke.reset_scan();

        let piece_length = content.piece_length();
        let total_pieces = content.piece_count();

        let snapshots: HashMap<SocketAddr, PeerSnapshot> = self
            .registry
            .live()
            .values()
            .filter(|p| p.state == ConnectionState::Success)
            .map(|p| (p.addr, PeerSnapshot::from_peer(p, piece_length, total_pieces, p.last_message)))
            .collect();

        let mut to_choke: Vec<SocketAddr> = Vec::new();

        for (&addr, _) in snapshots.iter() {
            let peer = match self.registry.live().get(&addr) {
                Some(p) => p,
                None => continue,
            };
            let we_have_something_they_need = content.local_bitfield().difference(&peer.remote_bitfield).count() > 0;

            if peer.remote_interested && we_have_something_they_need {
                let lookup = |a: SocketAddr| snapshots[&a];
                if let Some(loser) = self.choke.consider(addr, &lookup, content.is_seeding(), now, &mut self.rng) {
                    to_choke.push(loser);
                }
            } else {
                to_choke.push(addr);
            }
        }

        if let Some(evicted) = self.choke.maybe_rotate_optimistic(now) {
            to_choke.push(evicted);
        }

        let chosen = self.choke.chosen();
        let currently_unchoked = chosen.len();

        for addr in chosen {
            if let Some(peer) = self.registry.get_mut(&addr) {
                if peer.local_choked {
                    peer.local_choked = false;
                    peer.unchoked_since = Some(now);
                    peer.last_unchoke = Some(now);
                    if peer.send(Message::Unchoke).is_err() {
                        peer.state = ConnectionState::Failed;
                        self.choke.note_missed_send();
                    }
                }
            }
        }

        for addr in to_choke {
            if let Some(peer) = self.registry.get_mut(&addr) {
                if !peer.local_choked {
                    peer.local_choked = true;
                    peer.unchoked_since = None;
                    if peer.send(Message::Choke).is_err() {
                        peer.state = ConnectionState::Failed;
                    }
                }
            }
        }

        self.choke.adapt_max_unchoke(currently_unchoked);
    }

    fn arm_interests(&mut self, flags: IntervalFlags) {
        let addrs: Vec<SocketAddr> = self.registry.live().keys().copied().collect();
        for addr in addrs {
            let (need_read, need_write) = match self.registry.live().get(&addr) {
                Some(peer) => (peer.need_read(flags.download_limited), peer.need_write(flags.upload_limited)),
                None => continue,
            };

            let token = match self.addrs.get(&addr) {
                Some(t) => *t,
                None => continue,
            };

            let interest = match (need_read, need_write) {
                (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
                (true, false) => Some(Interest::READABLE),
                (false, true) => Some(Interest::WRITABLE),
                (false, false) => None,
            };

            if let (Some(interest), Some(peer)) = (interest, self.registry.get_mut(&addr)) {
                if let Some(socket) = peer.socket.as_mut() {
                    let _ = self.poll.registry().reregister(socket, token, interest);
                }
            }
        }
    }

    /// Wait on external readiness for up to `budget`, then dispatch
    /// every ready event. `budget` should already account for
    /// `BandwidthGovernor::wait_bw`'s deadline -- this method performs no
    /// bandwidth math itself.
    pub fn poll_and_dispatch(
        &mut self,
        budget: Duration,
        tracker: &mut dyn Tracker,
        handshake: &mut dyn Handshake,
        content: &dyn Content,
        pending: &mut dyn PendingPieces,
        now: Instant,
    ) -> io::Result<()> {
        self.poll.poll(&mut self.events, Some(budget))?;

        let mut ready: Vec<(Token, bool, bool)> = Vec::new();
        for event in self.events.iter() {
            ready.push((event.token(), event.is_readable(), event.is_writable()));
        }

        for (token, readable, writable) in ready {
            if token == LISTEN_TOKEN {
                self.accept_inbound(tracker, content, now);
                continue;
            }

            let addr = match self.tokens.get(&token) {
                Some(a) => *a,
                None => continue,
            };

            if writable {
                self.dispatch_writable(addr, handshake);
            }
            if readable {
                self.dispatch_readable(addr, handshake, content, pending, now);
            }
        }

        Ok(())
    }

    fn accept_inbound(&mut self, tracker: &mut dyn Tracker, content: &dyn Content, now: Instant) {
        loop {
            match self.listen.accept(tracker.is_quitting()) {
                Ok(Some((socket, addr))) => {
                    let announce = tracker.announce_interval();
                    match self.registry.new_inbound_peer(addr, socket, announce, content.is_seeding(), tracker) {
                        Ok(()) => {
                            let token = self.alloc_token(addr);
                            if let Some(peer) = self.registry.get_mut(&addr) {
                                peer.touch_activity(now);
                                if let Some(socket) = peer.socket.as_mut() {
                                    let _ = self.poll.registry().register(socket, token, Interest::READABLE | Interest::WRITABLE);
                                }
                            }
                        }
                        Err(e) => debug!("bip_swarm: inbound admission refused: {}", e),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("bip_swarm: accept() error: {}", e);
                    break;
                }
            }
        }
    }

    fn dispatch_writable(&mut self, addr: SocketAddr, handshake: &mut dyn Handshake) {
        let peer = match self.registry.get_mut(&addr) {
            Some(p) => p,
            None => return,
        };

        if peer.state == ConnectionState::Connecting {
            let so_error = peer.socket.as_ref().map(|s| s.take_error());
            match so_error {
                Some(Ok(Some(e))) | Some(Err(e)) => {
                    debug!("bip_swarm: connect to {} failed: {}", addr, e);
                    peer.state = ConnectionState::Failed;
                    return;
                }
                _ => peer.state = ConnectionState::Handshake,
            }
        }

        if peer.state == ConnectionState::Handshake {
            match handshake.drive(peer) {
                Ok(true) => peer.state = ConnectionState::Success,
                Ok(false) => {}
                Err(e) => {
                    debug!("bip_swarm: handshake with {} failed: {}", addr, e);
                    peer.state = ConnectionState::Failed;
                }
            }
            return;
        }

        if peer.state != ConnectionState::Success {
            return;
        }

        let socket = match peer.socket.as_mut() {
            Some(s) => s,
            None => return,
        };

        while !peer.out_buf.is_empty() {
            match socket.write(&peer.out_buf) {
                Ok(0) => {
                    peer.state = ConnectionState::Failed;
                    return;
                }
                Ok(n) => {
                    let _ = peer.out_buf.split_to(n);
                    peer.total_sent += n as u64;
                    peer.ul_rate.observe(n as u64, Instant::now());
                    peer.touch_activity(Instant::now());
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => {
                    peer.state = ConnectionState::Failed;
                    return;
                }
            }
        }
    }

    fn dispatch_readable(
        &mut self,
        addr: SocketAddr,
        handshake: &mut dyn Handshake,
        content: &dyn Content,
        pending: &mut dyn PendingPieces,
        now: Instant,
    ) {
        let peer = match self.registry.get_mut(&addr) {
            Some(p) => p,
            None => return,
        };

        if peer.state == ConnectionState::Connecting {
            peer.state = ConnectionState::Failed;
            return;
        }

        if peer.state == ConnectionState::Handshake {
            match handshake.drive(peer) {
                Ok(true) => peer.state = ConnectionState::Success,
                Ok(false) => {}
                Err(_) => peer.state = ConnectionState::Failed,
            }
            return;
        }

        if peer.state != ConnectionState::Success {
            return;
        }

        let mut buf = [0u8; 16 * 1024];
        loop {
            let socket = match peer.socket.as_mut() {
                Some(s) => s,
                None => return,
            };
            match socket.read(&mut buf) {
                Ok(0) => {
                    peer.state = ConnectionState::Failed;
                    return;
                }
                Ok(n) => {
                    peer.in_buf.extend_from_slice(&buf[..n]);
                    peer.total_recv += n as u64;
                    peer.dl_rate.observe(n as u64, now);
                    peer.touch_activity(now);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => {
                    peer.state = ConnectionState::Failed;
                    return;
                }
            }
        }

        let mut decoded = Vec::new();
        let mut malformed = false;
        loop {
            match Message::decode(&mut peer.in_buf) {
                Ok(Some(message)) => decoded.push(message),
                Ok(None) => break,
                Err(_) => {
                    malformed = true;
                    break;
                }
            }
        }

        if malformed {
            if let Some(peer) = self.registry.get_mut(&addr) {
                peer.state = ConnectionState::Failed;
            }
            return;
        }

        // `peer`'s borrow ends here; `apply_message` re-borrows the
        // registry per message since it also needs `&mut self` for the
        // on-demand piece-selector hook.
        for message in decoded {
            if self.apply_message(addr, message, content, pending).is_err() {
                if let Some(peer) = self.registry.get_mut(&addr) {
                    peer.state = ConnectionState::Failed;
                }
                return;
            }
        }
    }

    fn apply_message(&mut self, addr: SocketAddr, message: Message, content: &dyn Content, pending: &mut dyn PendingPieces) -> io::Result<()> {
        let mut bitfield_changed = false;
        {
            let peer = match self.registry.get_mut(&addr) {
                Some(p) => p,
                None => return Ok(()),
            };

            match message {
                Message::KeepAlive => {}
                Message::Choke => peer.remote_choked = true,
                Message::Unchoke => peer.remote_choked = false,
                Message::Interested => peer.remote_interested = true,
                Message::NotInterested => peer.remote_interested = false,
                Message::Have { index } => {
                    peer.remote_bitfield.set(index as usize);
                    bitfield_changed = true;
                }
                Message::Bitfield { ref bytes } => {
                    for (byte_idx, byte) in bytes.iter().enumerate() {
                        for bit in 0..8 {
                            if byte & (0x80 >> bit) != 0 {
                                peer.remote_bitfield.set(byte_idx * 8 + bit);
                            }
                        }
                    }
                    bitfield_changed = true;
                }
                Message::Request { index, begin, length } => {
                    if !peer.local_choked {
                        peer.in_queue.push_back(crate::peer::request_queue::Slice { index: index as usize, begin, length });
                    }
                }
                Message::Piece { index, begin, block } => {
                    peer.out_queue.cancel_slice(index as usize, begin, block.len() as u32);
                    pending.clear(index as usize);
                }
                Message::Cancel { index, begin, length } => {
                    peer.in_queue.cancel_slice(index as usize, begin, length);
                }
            }
        }

        let is_success = self.registry.live().get(&addr).map(|p| p.state == ConnectionState::Success).unwrap_or(false);
        if is_success && bitfield_changed {
            self.check_interest_one(addr, content);
        }

        let peer = match self.registry.get_mut(&addr) {
            Some(p) => p,
            None => return Ok(()),
        };
        if peer.state == ConnectionState::Success && !peer.remote_choked && peer.local_interested && peer.out_queue.is_empty() {
            self.request_next(addr, content);
        }

        Ok(())
    }

    /// Invoked on demand when a peer's outbound request queue has run
    /// dry: asks `PieceSelector::What_Can_Duplicate` for a target among
    /// what other peers already have queued (§4.5), in endgame mode once
    /// `endgame_check` has flipped `self.endgame`. When duplication finds
    /// nothing, falls back to `Who_Can_Abandon` before giving up and
    /// marking the peer standby (no work left for it right now).
    fn request_next(&mut self, addr: SocketAddr, content: &dyn Content) {
        let valued = content.local_bitfield().clone();
        let piece_length = content.piece_length();
        let slice_size = self.config.req_slice_size;
        let mode = if self.endgame { DupMode::Endgame } else { DupMode::Initial };

        let queues: Vec<(Vec<usize>, usize)> = self
            .registry
            .live()
            .values()
            .filter(|p| p.addr != addr && p.state == ConnectionState::Success && !p.out_queue.is_empty())
            .map(|p| (p.out_queue.pieces().collect(), p.out_queue.len()))
            .collect();

        let has = match self.registry.live().get(&addr) {
            Some(p) => p.out_queue.clone(),
            None => return,
        };

        let duplicated = piece_selector::what_can_duplicate(&valued, mode, piece_length, slice_size, queues.into_iter(), |idx| has.contains_piece(idx));

        if let Some((index, is_sole)) = duplicated {
            if is_sole {
                debug!("bip_swarm: duplicating request for piece {} onto {}", index, addr);
            }
            if let Some(peer) = self.registry.get_mut(&addr) {
                peer.standby = false;
                peer.out_queue.push_back(crate::peer::request_queue::Slice {
                    index,
                    begin: 0,
                    length: slice_size as u32,
                });
                if peer.send(Message::Request { index: index as u32, begin: 0, length: slice_size as u32 }).is_err() {
                    peer.state = ConnectionState::Failed;
                }
            }
            return;
        }

        if let Some((_, index)) = self.try_abandon(addr) {
            if let Some(peer) = self.registry.get_mut(&addr) {
                peer.standby = false;
                peer.out_queue.push_back(crate::peer::request_queue::Slice {
                    index,
                    begin: 0,
                    length: slice_size as u32,
                });
                if peer.send(Message::Request { index: index as u32, begin: 0, length: slice_size as u32 }).is_err() {
                    peer.state = ConnectionState::Failed;
                }
            }
            return;
        }

        if let Some(peer) = self.registry.get_mut(&addr) {
            peer.standby = true;
        }
    }
}
