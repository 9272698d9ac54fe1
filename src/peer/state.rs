//! `ConnectionFSM` -- the per-peer protocol state machine described in
//! §4.2. Transitions are driven by the `ReadinessLoop`, not owned here;
//! this module just models the states and the terminal-state marker.

/// A peer's place in the connection lifecycle.
///
/// `Failed` is observable for exactly one tick (§4.2): the tick that
/// sets it is also the tick in which `PeerRegistry` decides whether to
/// requeue the address for reconnect, move the peer to the dead set, or
/// free it outright.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Outbound TCP connect is in flight.
    Connecting,
    /// Handshake bytes are being exchanged (either direction).
    Handshake,
    /// Handshake completed; normal wire-protocol traffic flows.
    Success,
    /// Terminal. Socket has already been closed.
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Failed)
    }

    pub fn is_success(self) -> bool {
        matches!(self, ConnectionState::Success)
    }
}
