/// Non-realtime owner of a bridge instance.
///
/// Holds everything that outlives a single audio block: configuration, the
/// settings store, the message log, the shared peer endpoint, and the
/// discovery machinery with its own small runtime. The realtime half is
/// handed out by `processor()`.

use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::Arc;

use anyhow::Context;
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

use ncmidi_protocol::log_queue::LogQueue;
use ncmidi_protocol::midi::{self, MidiEvent};
use ncmidi_protocol::DEFAULT_PEER_IP;

use crate::bridge::MidiBridge;
use crate::config::BridgeConfig;
use crate::discovery::{Discovery, DiscoveryContext, DiscoveryHandle, DiscoveryState};
use crate::log_view::LogView;
use crate::peer::{PeerEndpoint, SharedPeer};
use crate::settings::{SettingsStore, KEY_LOGGING_ENABLED, KEY_PEER_IP};
use crate::transport::{Transport, UdpSender};

pub struct BridgeSession {
    config: BridgeConfig,
    settings: Arc<dyn SettingsStore>,
    log: Arc<LogQueue>,
    peer: SharedPeer,
    discovery: Discovery,
    runtime: Runtime,
}

impl BridgeSession {
    /// Restore persisted state and prepare discovery. Sockets are not opened
    /// until `processor()`.
    pub fn open(config: BridgeConfig, settings: Arc<dyn SettingsStore>) -> anyhow::Result<Self> {
        let log = Arc::new(LogQueue::new(config.log.capacity));
        log.set_enabled(settings.get_bool(KEY_LOGGING_ENABLED).unwrap_or(true));

        let ip = initial_peer_ip(&config, &*settings);
        let endpoint = PeerEndpoint::new(ip, config.network.peer_port);
        info!(peer = %endpoint, logging = log.is_enabled(), "Session opened");
        let peer = SharedPeer::new(endpoint);

        let discovery = Discovery::new(DiscoveryContext::from_config(
            &config,
            peer.clone(),
            Arc::clone(&settings),
            Arc::clone(&log),
        ));

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("ncmidi-discovery")
            .enable_all()
            .build()
            .context("Failed to start discovery runtime")?;

        Ok(Self {
            config,
            settings,
            log,
            peer,
            discovery,
            runtime,
        })
    }

    /// Open the UDP endpoints and return the realtime half.
    /// Bind failures leave the bridge send-only or receive-only.
    pub fn processor(&self) -> MidiBridge {
        let transport = Transport::open(&self.config.network, &self.log);
        MidiBridge::new(transport, self.peer.clone(), Arc::clone(&self.log))
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn peer(&self) -> PeerEndpoint {
        self.peer.load()
    }

    /// Manual peer entry. Invalid text is rejected and the peer left unchanged.
    ///
    /// A valid address takes effect immediately. Failing to write it to the
    /// settings file is logged and does not undo the change.
    pub fn set_peer_ip(&self, text: &str) -> anyhow::Result<PeerEndpoint> {
        let endpoint = PeerEndpoint::parse(text, self.config.network.peer_port)?;
        self.peer.store(endpoint);
        info!(peer = %endpoint, "Peer address set");
        self.log.push(format!("Peer IP-Address set to {}", endpoint.ip));

        self.settings.set_string(KEY_PEER_IP, &endpoint.ip.to_string());
        self.persist("peer address");
        Ok(endpoint)
    }

    /// Send one event to the current peer from a throwaway sender socket.
    /// The receive port is left alone.
    pub fn send_once(&self, event: &MidiEvent) -> anyhow::Result<usize> {
        let sender = UdpSender::bind(self.config.network.send_addr())?;
        let peer = self.peer.load();
        if self.log.is_enabled() {
            self.log.push(format!("Out: {}", event));
        }
        let sent = sender
            .send(peer.socket_addr(), midi::encode(event))
            .with_context(|| format!("Failed to send to {}", peer))?;
        debug!(to = %peer, len = sent, "Sent one-shot MIDI message");
        Ok(sent)
    }

    /// Start a discovery handshake. None if one is already listening.
    pub fn start_discovery(&self) -> Option<DiscoveryHandle> {
        self.discovery.start(self.runtime.handle())
    }

    pub fn cancel_discovery(&self) {
        self.discovery.cancel();
    }

    pub fn discovery_state(&self) -> DiscoveryState {
        self.discovery.state()
    }

    /// Drive a future (e.g. `DiscoveryHandle::wait`) to completion on the
    /// session's runtime. Must not be called from the realtime thread.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    /// Takes effect immediately; a failed settings write is only logged.
    pub fn set_logging_enabled(&self, enabled: bool) {
        self.log.set_enabled(enabled);
        info!(enabled, "Message logging toggled");
        self.settings.set_bool(KEY_LOGGING_ENABLED, enabled);
        self.persist("logging switch");
    }

    fn persist(&self, what: &str) {
        if let Err(e) = self.settings.save() {
            warn!(error = %e, "Failed to persist {}", what);
        }
    }

    pub fn logging_enabled(&self) -> bool {
        self.log.is_enabled()
    }

    pub fn log(&self) -> &Arc<LogQueue> {
        &self.log
    }

    /// A fresh scrollback sized from the `[log]` config section.
    pub fn log_view(&self) -> LogView {
        LogView::from_config(&self.config.log)
    }
}

impl Drop for BridgeSession {
    fn drop(&mut self) {
        self.discovery.cancel();
    }
}

/// Stored address, then the configured default, then the built-in placeholder.
fn initial_peer_ip(config: &BridgeConfig, settings: &dyn SettingsStore) -> Ipv4Addr {
    if let Some(stored) = settings.get_string(KEY_PEER_IP) {
        match stored.trim().parse() {
            Ok(ip) => return ip,
            Err(_) => warn!(value = %stored, "Ignoring invalid stored peer address"),
        }
    }
    config
        .peer
        .default_ip
        .trim()
        .parse()
        .or_else(|_| DEFAULT_PEER_IP.parse())
        .unwrap_or(Ipv4Addr::UNSPECIFIED)
}
