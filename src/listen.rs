//! `ListenAcceptor` (§4.7): inbound socket bind with downward port
//! fallback, and gated accept.
//!
//! Grounded on `bip_handshake`'s `TryBind` trait
//! (`bip_handshake/src/try_bind.rs`), which wraps `TcpListener::bind` as
//! a retryable operation; we generalize the single attempt into the
//! fallback sweep §4.7 calls for.

use std::io;
use std::net::{IpAddr, SocketAddr};

use log::{info, warn};
use mio::net::TcpListener;

use crate::config::{LISTEN_BACKLOG, LISTEN_PORT_FALLBACK_SPAN, LISTEN_PORT_FLOOR};

/// `backlog` is accepted for documentation purposes only: mio/the OS's
/// `listen()` backlog isn't independently tunable through
/// `mio::net::TcpListener::bind`, which always requests a
/// platform-chosen default. We still surface the constant so a future
/// swap to `socket2` can wire it through.
pub struct ListenAcceptor {
    listener: TcpListener,
    port: u16,
}

impl ListenAcceptor {
    /// Binds `ip:preferred_port`; on failure, sweeps downward through
    /// `[preferred_port - LISTEN_PORT_FALLBACK_SPAN, preferred_port]`,
    /// floored at `LISTEN_PORT_FLOOR`, returning the first successful
    /// bind.
    pub fn bind(ip: IpAddr, preferred_port: u16) -> io::Result<ListenAcceptor> {
        let low = preferred_port.saturating_sub(LISTEN_PORT_FALLBACK_SPAN).max(LISTEN_PORT_FLOOR);

        let mut last_err = None;
        for port in (low..=preferred_port).rev() {
            match TcpListener::bind(SocketAddr::new(ip, port)) {
                Ok(listener) => {
                    info!("bip_swarm: listening on {}:{} (backlog {})", ip, port, LISTEN_BACKLOG);
                    return Ok(ListenAcceptor { listener, port });
                }
                Err(e) => {
                    warn!("bip_swarm: bind {}:{} failed: {}", ip, port, e);
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no port in fallback span available")))
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn listener(&self) -> &TcpListener {
        &self.listener
    }

    pub fn listener_mut(&mut self) -> &mut TcpListener {
        &mut self.listener
    }

    /// Accept a pending inbound connection, refusing while the tracker
    /// collaborator reports it is quitting.
    pub fn accept(&mut self, tracker_quitting: bool) -> io::Result<Option<(mio::net::TcpStream, SocketAddr)>> {
        if tracker_quitting {
            return Ok(None);
        }
        match self.listener.accept() {
            Ok((stream, addr)) => Ok(Some((stream, addr))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn binds_preferred_port_when_free() {
        let ip = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        let acceptor = ListenAcceptor::bind(ip, 58_731).unwrap();
        assert_eq!(acceptor.port(), 58_731);
    }

    #[test]
    fn falls_back_when_preferred_port_taken() {
        let ip = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        let preferred = 58_732;
        let held = std::net::TcpListener::bind(SocketAddr::new(ip, preferred)).unwrap();

        // Bind sweeps past the already-held port to one beneath it.
        let acceptor = ListenAcceptor::bind(ip, preferred).unwrap();
        assert_ne!(acceptor.port(), preferred);
        drop(held);
    }
}
