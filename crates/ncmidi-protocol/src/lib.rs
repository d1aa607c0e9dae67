pub mod log_queue;
pub mod midi;

/// Default ports
pub const DEFAULT_LISTEN_PORT: u16 = 9000;
pub const DEFAULT_PEER_PORT: u16 = 9001;
pub const DEFAULT_DISCOVERY_PORT: u16 = 5005;

/// Discovery payloads. The peer broadcasts a datagram containing the marker,
/// we answer with the acknowledgment (no terminator).
pub const HELLO_MARKER: &str = "HELLO_PC";
pub const HELLO_ACK: &[u8] = b"HELLO_3DS";

/// Receive buffer sizes
pub const MAX_DATAGRAM_SIZE: usize = 1024;
pub const DISCOVERY_BUFFER_SIZE: usize = 64;

/// Placeholder peer address shown until discovery or manual entry succeeds
pub const DEFAULT_PEER_IP: &str = "192.168.1.0";

/// Log queue defaults
pub const DEFAULT_LOG_CAPACITY: usize = 1000;

/// Whether a discovery payload carries the hello marker.
/// The payload is not required to be valid UTF-8; invalid sequences are replaced.
pub fn is_hello(payload: &[u8]) -> bool {
    String::from_utf8_lossy(payload).contains(HELLO_MARKER)
}
