/// UDP transport: two independent datagram endpoints.
///
/// The receiver listens on the well-known port the peer targets. The sender
/// binds any local port and targets the peer's well-known port. Both sockets
/// are non-blocking so the realtime caller never waits on the network.
///
/// Sockets are built with socket2 and kept as `std::net::UdpSocket`: the
/// bridge loop is a plain synchronous callback. Only the sender shares its
/// address; the receiver owns its port exclusively, so a second instance on
/// the same port fails to bind instead of silently taking the traffic.

use std::io;
use std::net::{SocketAddr, SocketAddrV4, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, trace, warn};

use ncmidi_protocol::log_queue::LogQueue;

use crate::config::NetworkSection;
use crate::error::{Result, SocketRole, TransportError};

/// Create a non-blocking UDP socket bound to `addr`.
pub(crate) fn bind_udp(
    addr: SocketAddrV4,
    reuse: bool,
    broadcast: bool,
) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    if reuse {
        socket.set_reuse_address(true)?;
    }
    if broadcast {
        socket.set_broadcast(true)?;
    }
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Outbound half. Best effort, unacknowledged, never retried.
pub struct UdpSender {
    socket: UdpSocket,
}

impl UdpSender {
    pub fn bind(addr: SocketAddrV4) -> Result<Self> {
        let socket = bind_udp(addr, true, false).map_err(|source| TransportError::Bind {
            role: SocketRole::Sender,
            addr: addr.into(),
            source,
        })?;
        Ok(Self { socket })
    }

    /// Send one datagram. A full OS buffer surfaces as `WouldBlock`, not a wait.
    #[inline]
    pub fn send(&self, peer: SocketAddr, bytes: &[u8]) -> io::Result<usize> {
        self.socket.send_to(bytes, peer)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

/// Inbound half, polled once per block.
pub struct UdpReceiver {
    socket: UdpSocket,
}

impl UdpReceiver {
    pub fn bind(addr: SocketAddrV4) -> Result<Self> {
        let socket = bind_udp(addr, false, false).map_err(|source| TransportError::Bind {
            role: SocketRole::Receiver,
            addr: addr.into(),
            source,
        })?;
        Ok(Self { socket })
    }

    /// Take one pending datagram, if any. Never blocks.
    /// Datagrams larger than `buf` are truncated by the OS.
    #[inline]
    pub fn try_receive(&self, buf: &mut [u8]) -> Option<(usize, SocketAddr)> {
        match self.socket.recv_from(buf) {
            Ok(r) => Some(r),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => None,
            Err(e) => {
                // e.g. ICMP port unreachable surfacing as ConnectionReset on Windows
                trace!(error = %e, "UDP receive error");
                None
            }
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

/// Both endpoints. Either may be missing when its bind failed, leaving the
/// bridge send-only or receive-only.
pub struct Transport {
    pub sender: Option<UdpSender>,
    pub receiver: Option<UdpReceiver>,
}

impl Transport {
    /// Open both sockets independently. Bind failures are reported once,
    /// to tracing and to the message log, and are not fatal.
    pub fn open(network: &NetworkSection, log: &LogQueue) -> Self {
        let sender = match UdpSender::bind(network.send_addr()) {
            Ok(s) => {
                if let Ok(addr) = s.local_addr() {
                    debug!(local = %addr, "UDP sender bound");
                }
                Some(s)
            }
            Err(e) => {
                warn!(error = %e, "Sender unavailable, bridge is receive-only");
                log.push(format!("Failed to open UDP sender: {}", e));
                None
            }
        };

        let receiver = match UdpReceiver::bind(network.listen_addr()) {
            Ok(r) => {
                info!(port = network.listen_port, "UDP receiver listening");
                Some(r)
            }
            Err(e) => {
                warn!(error = %e, "Receiver unavailable, bridge is send-only");
                log.push(format!(
                    "Failed to bind UDP socket to port {}",
                    network.listen_port
                ));
                None
            }
        };

        Self { sender, receiver }
    }

    pub fn can_send(&self) -> bool {
        self.sender.is_some()
    }

    pub fn can_receive(&self) -> bool {
        self.receiver.is_some()
    }
}
