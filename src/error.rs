//! Error kinds for the swarm core.
//!
//! Per the error handling design, socket-facing operations never unwind;
//! they return a `SwarmResult` and a negative/`Err` result triggers
//! `CloseConnection` on the one peer involved. The only error that is
//! allowed to propagate out of the core entirely is a bind failure on an
//! explicitly configured listen port.

use std::net::SocketAddr;

use error_chain::error_chain;

error_chain! {
    foreign_links {
        Io(::std::io::Error);
    }

    errors {
        /// `NewPeer` refused to admit a peer; the socket (if any) has
        /// already been closed by the time this is returned.
        AdmissionRefused(addr: SocketAddr, reason: AdmissionRefusal) {
            description("peer admission refused")
            display("refused to admit peer {}: {:?}", addr, reason)
        }

        /// The listen socket could not be bound to any port in its
        /// fallback range. Fatal to the core's initialization path.
        BindFailed(low: u16, high: u16) {
            description("failed to bind listen socket")
            display("could not bind listen socket in range [{}, {}]", low, high)
        }

        /// A peer sent bytes that do not parse as the peer wire protocol.
        ProtocolViolation(what: String) {
            description("peer protocol violation")
            display("protocol violation: {}", what)
        }
    }
}

/// Reason a peer was not admitted into the registry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AdmissionRefusal {
    /// `peer_count >= max_peers`.
    Full,
    /// Inbound connection from our own listen address.
    SelfConnect,
    /// A live peer already exists at this address.
    Duplicate,
    /// Socket creation/connect setup failed.
    SocketCreate,
}
