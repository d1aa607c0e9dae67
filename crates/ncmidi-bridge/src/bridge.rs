/// Realtime MIDI <-> UDP bridge loop.
///
/// Called once per audio block by the host. Per call:
///   1. every input event is encoded and sent to the current peer, in buffer order
///   2. the inbound socket is polled exactly once; a valid frame of a forwarded
///      kind is appended to the host's buffer at timestamp 0
///
/// Nothing here blocks: both sockets are non-blocking, the peer is an atomic
/// snapshot, the receive buffer is owned by the bridge. Errors are counted and
/// dropped, never returned to the host.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, trace};

use ncmidi_protocol::log_queue::LogQueue;
use ncmidi_protocol::midi::{self, MidiEvent};
use ncmidi_protocol::MAX_DATAGRAM_SIZE;

use crate::peer::SharedPeer;
use crate::transport::Transport;

/// Events a host typically delivers per block; the buffer grows past this if needed.
pub const DEFAULT_BUFFER_CAPACITY: usize = 256;

/// The host's ordered sequence of timestamped events for one block.
#[derive(Debug, Clone, Default)]
pub struct MidiBuffer {
    events: Vec<MidiEvent>,
}

impl MidiBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Vec::with_capacity(capacity),
        }
    }

    /// Insert keeping timestamp order; lands after events with an equal timestamp.
    pub fn add_event(&mut self, event: MidiEvent) {
        let pos = self
            .events
            .partition_point(|e| e.timestamp() <= event.timestamp());
        self.events.insert(pos, event);
    }

    pub fn events(&self) -> &[MidiEvent] {
        &self.events
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MidiEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Empty the buffer, keeping its allocation.
    pub fn clear(&mut self) {
        self.events.clear();
    }
}

impl<'a> IntoIterator for &'a MidiBuffer {
    type Item = &'a MidiEvent;
    type IntoIter = std::slice::Iter<'a, MidiEvent>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.iter()
    }
}

/// Per-block callback contract offered to the host.
pub trait ProcessBlock: Send {
    /// `audio` holds one slice per channel. `midi` is both the block's input
    /// and the output handed back to the host.
    fn process(&mut self, audio: &mut [&mut [f32]], midi: &mut MidiBuffer);
}

/// Traffic counters, written on the realtime path and read anywhere.
#[derive(Debug, Default)]
pub struct BridgeStats {
    pub sent: AtomicU64,
    pub send_errors: AtomicU64,
    pub received: AtomicU64,
    pub injected: AtomicU64,
    pub malformed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub sent: u64,
    pub send_errors: u64,
    pub received: u64,
    pub injected: u64,
    pub malformed: u64,
}

impl BridgeStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            injected: self.injected.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }
}

/// The realtime half of the bridge. Owned by the host's audio thread.
pub struct MidiBridge {
    transport: Transport,
    peer: SharedPeer,
    log: Arc<LogQueue>,
    stats: Arc<BridgeStats>,
    recv_buf: [u8; MAX_DATAGRAM_SIZE],
}

impl MidiBridge {
    pub fn new(transport: Transport, peer: SharedPeer, log: Arc<LogQueue>) -> Self {
        Self {
            transport,
            peer,
            log,
            stats: Arc::new(BridgeStats::default()),
            recv_buf: [0u8; MAX_DATAGRAM_SIZE],
        }
    }

    pub fn stats(&self) -> Arc<BridgeStats> {
        Arc::clone(&self.stats)
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Step 1: host -> network.
    fn send_outgoing(&self, midi: &MidiBuffer) {
        let dest = self.peer.load().socket_addr();

        for event in midi {
            if self.log.is_enabled() {
                self.log.push(format!("Out: {}", event));
            }

            let Some(sender) = &self.transport.sender else {
                continue;
            };
            match sender.send(dest, midi::encode(event)) {
                Ok(_) => {
                    self.stats.sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                    debug!(to = %dest, error = %e, "MIDI send failed, dropped");
                }
            }
        }
    }

    /// Step 2: network -> host. At most one datagram per call.
    fn poll_incoming(&mut self, midi: &mut MidiBuffer) {
        let Some(receiver) = &self.transport.receiver else {
            return;
        };
        let Some((len, from)) = receiver.try_receive(&mut self.recv_buf) else {
            return;
        };
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        let Some(event) = midi::decode(&self.recv_buf[..len]) else {
            self.stats.malformed.fetch_add(1, Ordering::Relaxed);
            trace!(from = %from, len, "Discarded malformed MIDI frame");
            return;
        };

        if self.log.is_enabled() {
            self.log.push(format!("In: {}", event));
        }

        if event.kind().is_forwarded() {
            midi.add_event(event.at(0));
            self.stats.injected.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl ProcessBlock for MidiBridge {
    fn process(&mut self, audio: &mut [&mut [f32]], midi: &mut MidiBuffer) {
        // This bridge produces no audio
        for channel in audio.iter_mut() {
            channel.fill(0.0);
        }

        self.send_outgoing(midi);
        self.poll_incoming(midi);
    }
}
