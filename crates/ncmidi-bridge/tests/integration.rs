//! Integration tests for the ncmidi-bridge crate.
//!
//! Real loopback sockets on ephemeral ports: two bridges talking to each
//! other, a simulated handheld running the discovery handshake against a
//! session, and settings persisted across sessions.

use std::net::{Ipv4Addr, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ncmidi_bridge::bridge::{MidiBridge, MidiBuffer, ProcessBlock};
use ncmidi_bridge::config::BridgeConfig;
use ncmidi_bridge::discovery::{DiscoveryOutcome, DiscoveryState};
use ncmidi_bridge::peer::{PeerEndpoint, SharedPeer};
use ncmidi_bridge::session::BridgeSession;
use ncmidi_bridge::settings::{MemorySettings, SettingsStore, TomlSettings, KEY_PEER_IP};
use ncmidi_bridge::transport::Transport;
use ncmidi_protocol::log_queue::LogQueue;
use ncmidi_protocol::midi::{MessageKind, MidiEvent};

fn loopback_config() -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.network.bind_address = Ipv4Addr::LOCALHOST;
    config.network.listen_port = 0;
    config.network.discovery_port = 0;
    config.discovery.timeout_ms = 5_000;
    config
}

fn run_block(bridge: &mut MidiBridge, midi: &mut MidiBuffer) {
    let mut audio: Vec<&mut [f32]> = Vec::new();
    bridge.process(&mut audio, midi);
}

/// Call `process` until an event shows up or the deadline passes.
fn poll_until_event(bridge: &mut MidiBridge, deadline: Duration) -> MidiBuffer {
    let start = Instant::now();
    loop {
        let mut midi = MidiBuffer::new();
        run_block(bridge, &mut midi);
        if !midi.is_empty() || start.elapsed() > deadline {
            return midi;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

// ---------------------------------------------------------------------------
// 1. Bridge to bridge over loopback
// ---------------------------------------------------------------------------

#[test]
fn note_travels_between_two_bridges() {
    let network = loopback_config().network;

    let log_b = Arc::new(LogQueue::new(64));
    let transport_b = Transport::open(&network, &log_b);
    let b_port = transport_b.receiver.as_ref().unwrap().local_addr().unwrap().port();
    let mut bridge_b = MidiBridge::new(
        transport_b,
        SharedPeer::new(PeerEndpoint::new(Ipv4Addr::LOCALHOST, 9)),
        Arc::clone(&log_b),
    );

    let log_a = Arc::new(LogQueue::new(64));
    let mut bridge_a = MidiBridge::new(
        Transport::open(&network, &log_a),
        SharedPeer::new(PeerEndpoint::new(Ipv4Addr::LOCALHOST, b_port)),
        Arc::clone(&log_a),
    );

    let mut out = MidiBuffer::new();
    out.add_event(MidiEvent::new(64, &[0x90, 0x3C, 0x7F]).unwrap());
    run_block(&mut bridge_a, &mut out);
    assert_eq!(bridge_a.stats().snapshot().sent, 1);

    let received = poll_until_event(&mut bridge_b, Duration::from_secs(2));
    assert_eq!(received.len(), 1);
    let event = &received.events()[0];
    assert_eq!(event.timestamp(), 0);
    assert_eq!(event.kind(), MessageKind::NoteOn);
    assert_eq!(event.bytes(), &[0x90, 0x3C, 0x7F]);

    assert!(log_a.drain().contains(&"Out: Note on C3 Velocity 127 Channel 1".to_string()));
    assert!(log_b.drain().contains(&"In: Note on C3 Velocity 127 Channel 1".to_string()));
}

#[test]
fn inbound_burst_is_consumed_one_datagram_per_block() {
    let network = loopback_config().network;
    let log = Arc::new(LogQueue::new(64));
    let transport = Transport::open(&network, &log);
    let port = transport.receiver.as_ref().unwrap().local_addr().unwrap().port();
    let mut bridge = MidiBridge::new(
        transport,
        SharedPeer::new(PeerEndpoint::new(Ipv4Addr::LOCALHOST, 9)),
        log,
    );

    let device = UdpSocket::bind("127.0.0.1:0").unwrap();
    for note in [60u8, 62, 64] {
        device.send_to(&[0x90, note, 100], ("127.0.0.1", port)).unwrap();
    }

    let mut notes = Vec::new();
    let start = Instant::now();
    while notes.len() < 3 && start.elapsed() < Duration::from_secs(2) {
        let mut midi = MidiBuffer::new();
        run_block(&mut bridge, &mut midi);
        assert!(midi.len() <= 1);
        notes.extend(midi.iter().map(|e| e.bytes()[1]));
    }
    assert_eq!(notes, vec![60, 62, 64]);
}

// ---------------------------------------------------------------------------
// 2. Discovery retargets a running bridge
// ---------------------------------------------------------------------------

#[test]
fn discovered_peer_receives_subsequent_midi() {
    let device = UdpSocket::bind("127.0.0.1:0").unwrap();
    device.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let device_port = device.local_addr().unwrap().port();

    let mut config = loopback_config();
    config.network.peer_port = device_port;
    config.network.discovery_reply_port = device_port;
    config.peer.default_ip = "10.255.255.1".into();

    let settings = Arc::new(MemorySettings::new());
    let session = BridgeSession::open(config, settings.clone()).unwrap();
    let mut bridge = session.processor();

    let mut handle = session.start_discovery().unwrap();
    assert_eq!(session.discovery_state(), DiscoveryState::Listening);
    let listen = session.block_on(handle.listening_addr()).unwrap();

    device.send_to(b"xxHELLO_PCxx", listen).unwrap();
    let outcome = session.block_on(handle.wait());
    assert_eq!(outcome, DiscoveryOutcome::Completed(Ipv4Addr::LOCALHOST));
    assert_eq!(session.discovery_state(), DiscoveryState::Idle);

    let mut buf = [0u8; 64];
    let (len, _) = device.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..len], b"HELLO_3DS");

    assert_eq!(session.peer(), PeerEndpoint::new(Ipv4Addr::LOCALHOST, device_port));
    assert_eq!(settings.get_string(KEY_PEER_IP).as_deref(), Some("127.0.0.1"));

    let mut midi = MidiBuffer::new();
    midi.add_event(MidiEvent::new(0, &[0xB0, 0x07, 0x64]).unwrap());
    run_block(&mut bridge, &mut midi);

    let (len, _) = device.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..len], &[0xB0, 0x07, 0x64]);
}

#[test]
fn rejected_hello_keeps_previous_peer() {
    let device = UdpSocket::bind("127.0.0.1:0").unwrap();
    let session =
        BridgeSession::open(loopback_config(), Arc::new(MemorySettings::new())).unwrap();
    let before = session.peer();

    let mut handle = session.start_discovery().unwrap();
    let listen = session.block_on(handle.listening_addr()).unwrap();
    device.send_to(b"HELLO_MAC", listen).unwrap();

    assert_eq!(session.block_on(handle.wait()), DiscoveryOutcome::Mismatch);
    assert_eq!(session.peer(), before);

    // Idle again, so a new attempt is accepted
    let retry = session.start_discovery().unwrap();
    retry.cancel();
    assert_eq!(session.block_on(retry.wait()), DiscoveryOutcome::Cancelled);
}

// ---------------------------------------------------------------------------
// 3. Settings survive a restart
// ---------------------------------------------------------------------------

#[test]
fn peer_and_logging_switch_survive_restart() {
    let dir = std::env::temp_dir().join(format!("ncmidi-it-{}", std::process::id()));
    let path = dir.join("settings.toml");
    let _ = std::fs::remove_file(&path);

    {
        let settings = Arc::new(TomlSettings::open(&path).unwrap());
        let session = BridgeSession::open(loopback_config(), settings).unwrap();
        session.set_peer_ip("172.16.0.42").unwrap();
        session.set_logging_enabled(false);
    }

    let settings = Arc::new(TomlSettings::open(&path).unwrap());
    let session = BridgeSession::open(loopback_config(), settings).unwrap();
    assert_eq!(session.peer().ip, Ipv4Addr::new(172, 16, 0, 42));
    assert!(!session.logging_enabled());

    let _ = std::fs::remove_dir_all(&dir);
}
