/// The remote device's endpoint, shared between the realtime loop (reader)
/// and the discovery task / UI (writers).
///
/// Reads are a lock-free snapshot load; writes swap the whole endpoint, so a
/// reader sees either the old or the new address, never a mix.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerEndpoint {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl PeerEndpoint {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }

    /// Parse a dotted-quad address typed by the user (surrounding whitespace ignored).
    pub fn parse(ip: &str, port: u16) -> Result<Self, TransportError> {
        let trimmed = ip.trim();
        trimmed
            .parse::<Ipv4Addr>()
            .map(|ip| Self::new(ip, port))
            .map_err(|_| TransportError::InvalidPeer(trimmed.to_string()))
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }
}

impl fmt::Display for PeerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Clonable handle to the single active peer endpoint.
#[derive(Clone)]
pub struct SharedPeer {
    inner: Arc<ArcSwap<PeerEndpoint>>,
}

impl SharedPeer {
    pub fn new(endpoint: PeerEndpoint) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(endpoint)),
        }
    }

    /// Current endpoint. Never blocks.
    #[inline]
    pub fn load(&self) -> PeerEndpoint {
        **self.inner.load()
    }

    pub fn store(&self, endpoint: PeerEndpoint) {
        self.inner.store(Arc::new(endpoint));
    }
}
