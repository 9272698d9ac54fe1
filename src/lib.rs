//! `bip_swarm`: the peer-swarm coordination core of a bittorrent client.
//!
//! Owns connection lifecycle (admission, the per-peer protocol state
//! machine), choking/unchoking policy, piece-request selection and
//! bandwidth governance. Everything outside that boundary -- the piece
//! store, tracker communication, the handshake codec -- is taken as a
//! narrow collaborator trait (see [`collab`]) rather than a global
//! singleton, so the core can be driven from a single-threaded,
//! non-blocking event loop with no shared mutable state across threads.

pub mod bandwidth;
pub mod bitfield;
pub mod choke;
pub mod collab;
pub mod config;
pub mod error;
pub mod listen;
pub mod message;
pub mod peer;
pub mod piece_selector;
pub mod readiness;
pub mod registry;

pub use bandwidth::{BandwidthGovernor, BwWaitQueue, IdleState};
pub use bitfield::Bitfield;
pub use choke::{ChokeScheduler, PeerSnapshot};
pub use collab::{Content, Handshake, NoPendingPieces, PendingPieces, SelfStats, Tracker};
pub use config::{Config, PauseFlag};
pub use error::{AdmissionRefusal, Error, ErrorKind, Result};
pub use listen::ListenAcceptor;
pub use message::Message;
pub use peer::Peer;
pub use piece_selector::{CancelAction, DupMode};
pub use readiness::{IntervalFlags, ReadinessLoop};
pub use registry::{Counters, DeadStats, PeerRegistry};
