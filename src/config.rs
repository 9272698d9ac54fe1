//! Read-only (mostly) config surface consumed by the core.
//!
//! Construction is purely programmatic, mirroring
//! `bip_peer::manager::builder::PeerManagerBuilder` -- no argv/file
//! parsing happens here, that is explicitly out of scope.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Smallest number of unchoke slots the scheduler will ever shrink to.
pub const MIN_UNCHOKES: usize = 3;
/// Smallest unchoke interval, in seconds, regardless of bandwidth cap.
pub const MIN_UNCHOKE_INTERVAL_SECS: u64 = 10;
/// Smallest number of optimistic-unchoke cycles we'll tolerate before
/// widening the unchoke interval to make room for one.
pub const MIN_OPT_CYCLE: u64 = 3;
/// Liveness probe cadence.
pub const KEEPALIVE_INTERVAL_SECS: u64 = 117;
/// Silence beyond which a peer is evicted outright.
pub const HARD_DEAD_MULTIPLE: u64 = 3;
/// How long a seed is tolerated connected to another seed before closing.
pub const SEED_TIME_SECS: u64 = 300;
/// Default per-peer input buffer padding above the slice size.
pub const DEF_BUFFER_PAD: usize = 1 << 14;
/// Port range swept (downward) when the configured listen port is taken.
pub const LISTEN_PORT_FALLBACK_SPAN: u16 = 600;
pub const LISTEN_PORT_FLOOR: u16 = 1025;
pub const LISTEN_BACKLOG: i32 = 5;

#[derive(Clone, Debug)]
pub struct Config {
    pub max_peers: usize,
    pub max_bandwidth_up: u64,
    pub max_bandwidth_down: u64,
    pub req_slice_size: usize,
    pub cache_size: usize,
    pub default_port: u16,
    pub listen_ip: IpAddr,
    pub listen_port: Option<u16>,
    pub verbose: bool,
    pause: Arc<AtomicBool>,
}

impl Config {
    pub fn new(listen_ip: IpAddr, default_port: u16) -> Config {
        Config {
            max_peers: 80,
            max_bandwidth_up: 0,
            max_bandwidth_down: 0,
            req_slice_size: 16 * 1024,
            cache_size: 0,
            default_port,
            listen_ip,
            listen_port: None,
            verbose: false,
            pause: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_max_peers(mut self, n: usize) -> Config {
        self.max_peers = n;
        self
    }

    pub fn with_bandwidth_caps(mut self, up: u64, down: u64) -> Config {
        self.max_bandwidth_up = up;
        self.max_bandwidth_down = down;
        self
    }

    pub fn with_req_slice_size(mut self, n: usize) -> Config {
        self.req_slice_size = n;
        self
    }

    /// A cloneable handle to the bidirectionally-overridable pause flag.
    pub fn pause_handle(&self) -> PauseFlag {
        PauseFlag(self.pause.clone())
    }

    pub fn is_paused(&self) -> bool {
        self.pause.load(Ordering::Relaxed)
    }

    pub fn set_paused(&self, paused: bool) {
        self.pause.store(paused, Ordering::Relaxed);
    }
}

/// Shared, cheaply-cloned handle to the pause flag; the UI layer and the
/// core both hold one, either side may flip it.
#[derive(Clone)]
pub struct PauseFlag(Arc<AtomicBool>);

impl PauseFlag {
    pub fn get(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, value: bool) {
        self.0.store(value, Ordering::Relaxed);
    }
}
