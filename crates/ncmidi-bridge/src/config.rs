use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use ncmidi_protocol::{
    DEFAULT_DISCOVERY_PORT, DEFAULT_LISTEN_PORT, DEFAULT_LOG_CAPACITY, DEFAULT_PEER_IP,
    DEFAULT_PEER_PORT,
};

/// Bridge configuration, loaded from TOML.
/// Every field has a default so an empty or missing file is valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub discovery: DiscoverySection,
    #[serde(default)]
    pub log: LogSection,
    #[serde(default)]
    pub peer: PeerSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSection {
    /// Local address all sockets bind to
    #[serde(default = "default_bind_address")]
    pub bind_address: Ipv4Addr,
    /// Well-known port the receiver listens on (the peer sends here)
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Port on the peer that outbound MIDI targets
    #[serde(default = "default_peer_port")]
    pub peer_port: u16,
    /// Local port of the sender socket (0 = ephemeral)
    #[serde(default)]
    pub send_bind_port: u16,
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Port on the peer the discovery acknowledgment is sent to
    #[serde(default = "default_discovery_port")]
    pub discovery_reply_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySection {
    /// How long one handshake waits for a hello (0 = wait forever)
    #[serde(default = "default_discovery_timeout")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSection {
    /// Lines retained by the message log queue
    #[serde(default = "default_log_capacity")]
    pub capacity: usize,
    /// Scrollback of the log view
    #[serde(default = "default_max_lines")]
    pub max_lines: usize,
    /// Lines appended to the view per UI tick
    #[serde(default = "default_max_per_tick")]
    pub max_per_tick: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSection {
    /// Used when the settings store has no peer address yet
    #[serde(default = "default_peer_ip")]
    pub default_ip: String,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            listen_port: default_listen_port(),
            peer_port: default_peer_port(),
            send_bind_port: 0,
            discovery_port: default_discovery_port(),
            discovery_reply_port: default_discovery_port(),
        }
    }
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            timeout_ms: default_discovery_timeout(),
        }
    }
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            capacity: default_log_capacity(),
            max_lines: default_max_lines(),
            max_per_tick: default_max_per_tick(),
        }
    }
}

impl Default for PeerSection {
    fn default() -> Self {
        Self {
            default_ip: default_peer_ip(),
        }
    }
}

// Default value functions
fn default_bind_address() -> Ipv4Addr { Ipv4Addr::UNSPECIFIED }
fn default_listen_port() -> u16 { DEFAULT_LISTEN_PORT }
fn default_peer_port() -> u16 { DEFAULT_PEER_PORT }
fn default_discovery_port() -> u16 { DEFAULT_DISCOVERY_PORT }
fn default_discovery_timeout() -> u64 { 60_000 }
fn default_log_capacity() -> usize { DEFAULT_LOG_CAPACITY }
fn default_max_lines() -> usize { 30 }
fn default_max_per_tick() -> usize { 50 }
fn default_peer_ip() -> String { DEFAULT_PEER_IP.to_string() }

impl NetworkSection {
    pub fn listen_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.bind_address, self.listen_port)
    }

    pub fn send_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.bind_address, self.send_bind_port)
    }

    pub fn discovery_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.bind_address, self.discovery_port)
    }
}

impl BridgeConfig {
    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Load from disk; a missing file yields the defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "No config file found, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }
}
