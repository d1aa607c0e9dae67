pub mod bridge;
pub mod config;
pub mod discovery;
pub mod error;
pub mod log_view;
pub mod peer;
pub mod session;
pub mod settings;
pub mod transport;

pub use bridge::{MidiBridge, MidiBuffer, ProcessBlock};
pub use config::BridgeConfig;
pub use discovery::{DiscoveryHandle, DiscoveryOutcome, DiscoveryState};
pub use log_view::LogView;
pub use peer::{PeerEndpoint, SharedPeer};
pub use session::BridgeSession;
pub use settings::{MemorySettings, SettingsStore, TomlSettings};
