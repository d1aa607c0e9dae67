/// MIDI wire codec.
///
/// A datagram carries exactly one MIDI message, unframed: the datagram length
/// is the message length. Encoding is therefore the identity on the raw bytes;
/// decoding only validates the frame and classifies the status byte.
///
/// Channel messages (up to 4 bytes) are stored inline so that building an
/// event on the realtime path does not touch the heap. Longer SysEx spills.

use std::fmt;

use smallvec::SmallVec;

/// Inline capacity of a `MidiEvent` before it spills to the heap.
pub const INLINE_BYTES: usize = 4;

/// Minimum frame length accepted by `decode`.
pub const MIN_FRAME_LEN: usize = 3;

/// Message type derived from the status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    NoteOn,
    /// Also covers note-on with velocity 0
    NoteOff,
    PolyAftertouch,
    ControlChange,
    ProgramChange,
    ChannelPressure,
    PitchBend,
    SysEx,
    /// 0xF1-0xF7 (MTC quarter frame, song position, tune request, ...)
    SystemCommon,
    Clock,
    Start,
    Continue,
    Stop,
    ActiveSensing,
    Reset,
    Other,
}

impl MessageKind {
    /// Classify a complete message. Velocity is needed to tell a note-on with
    /// velocity 0 apart from a real note-on.
    pub fn classify(bytes: &[u8]) -> Self {
        let Some(&status) = bytes.first() else {
            return Self::Other;
        };

        match status {
            0xF0 => return Self::SysEx,
            0xF1..=0xF7 => return Self::SystemCommon,
            0xF8 => return Self::Clock,
            0xFA => return Self::Start,
            0xFB => return Self::Continue,
            0xFC => return Self::Stop,
            0xFE => return Self::ActiveSensing,
            0xFF => return Self::Reset,
            0xF9 | 0xFD => return Self::Other,
            _ => {}
        }

        match status & 0xF0 {
            0x80 => Self::NoteOff,
            0x90 => {
                if bytes.get(2).copied().unwrap_or(0) == 0 {
                    Self::NoteOff
                } else {
                    Self::NoteOn
                }
            }
            0xA0 => Self::PolyAftertouch,
            0xB0 => Self::ControlChange,
            0xC0 => Self::ProgramChange,
            0xD0 => Self::ChannelPressure,
            0xE0 => Self::PitchBend,
            // Data byte in status position
            _ => Self::Other,
        }
    }

    /// Only these kinds are injected into the host's event buffer.
    pub fn is_forwarded(self) -> bool {
        matches!(
            self,
            Self::NoteOn | Self::NoteOff | Self::ControlChange | Self::SysEx
        )
    }

    pub fn is_channel_message(self) -> bool {
        matches!(
            self,
            Self::NoteOn
                | Self::NoteOff
                | Self::PolyAftertouch
                | Self::ControlChange
                | Self::ProgramChange
                | Self::ChannelPressure
                | Self::PitchBend
        )
    }
}

/// A timestamped, immutable MIDI message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidiEvent {
    /// Sample offset inside the current block
    timestamp: u32,
    bytes: SmallVec<[u8; INLINE_BYTES]>,
}

impl MidiEvent {
    /// Build an event from raw bytes.
    /// Returns None for an empty slice or a first byte without the status bit.
    pub fn new(timestamp: u32, bytes: &[u8]) -> Option<Self> {
        match bytes.first() {
            Some(&status) if status & 0x80 != 0 => Some(Self {
                timestamp,
                bytes: SmallVec::from_slice(bytes),
            }),
            _ => None,
        }
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    /// Same message, different position in the block.
    pub fn at(mut self, timestamp: u32) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn status(&self) -> u8 {
        self.bytes[0]
    }

    pub fn kind(&self) -> MessageKind {
        MessageKind::classify(&self.bytes)
    }

    /// 1-based channel for channel messages.
    pub fn channel(&self) -> Option<u8> {
        if self.kind().is_channel_message() {
            Some((self.status() & 0x0F) + 1)
        } else {
            None
        }
    }

    fn data(&self, index: usize) -> u8 {
        self.bytes.get(index).copied().unwrap_or(0)
    }

    /// Human-readable one-liner, as shown in the message log.
    pub fn description(&self) -> String {
        self.to_string()
    }
}

/// Raw wire bytes of an event. No framing is added.
pub fn encode(event: &MidiEvent) -> &[u8] {
    event.bytes()
}

/// Validate and wrap a received frame.
/// Frames shorter than 3 bytes or without a status byte are discarded.
pub fn decode(frame: &[u8]) -> Option<MidiEvent> {
    if frame.len() < MIN_FRAME_LEN {
        return None;
    }
    MidiEvent::new(0, frame)
}

const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// Note name with octave, middle C (60) = "C3".
pub fn note_name(note: u8) -> String {
    let octave = (note / 12) as i32 - 2;
    format!("{}{}", NOTE_NAMES[(note % 12) as usize], octave)
}

fn controller_name(cc: u8) -> Option<&'static str> {
    Some(match cc {
        0 => "Bank Select",
        1 => "Modulation Wheel",
        7 => "Channel Volume",
        10 => "Pan",
        11 => "Expression",
        64 => "Hold Pedal",
        120 => "All Sound Off",
        121 => "Reset All Controllers",
        123 => "All Notes Off",
        _ => return None,
    })
}

/// Longest SysEx dump printed before eliding.
const SYSEX_PREVIEW: usize = 16;

fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for (i, b) in bytes.iter().take(SYSEX_PREVIEW).enumerate() {
        if i > 0 {
            f.write_str(" ")?;
        }
        write!(f, "{:02X}", b)?;
    }
    if bytes.len() > SYSEX_PREVIEW {
        write!(f, " ... ({} bytes)", bytes.len())?;
    }
    Ok(())
}

impl fmt::Display for MidiEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ch = (self.status() & 0x0F) + 1;
        match self.kind() {
            MessageKind::NoteOn => write!(
                f,
                "Note on {} Velocity {} Channel {}",
                note_name(self.data(1)),
                self.data(2),
                ch
            ),
            MessageKind::NoteOff => write!(
                f,
                "Note off {} Velocity {} Channel {}",
                note_name(self.data(1)),
                self.data(2),
                ch
            ),
            MessageKind::PolyAftertouch => write!(
                f,
                "Aftertouch {}: {} Channel {}",
                note_name(self.data(1)),
                self.data(2),
                ch
            ),
            MessageKind::ControlChange => {
                let cc = self.data(1);
                match controller_name(cc) {
                    Some(name) => write!(f, "Controller {}: {} Channel {}", name, self.data(2), ch),
                    None => write!(f, "Controller {}: {} Channel {}", cc, self.data(2), ch),
                }
            }
            MessageKind::ProgramChange => {
                write!(f, "Program change {} Channel {}", self.data(1), ch)
            }
            MessageKind::ChannelPressure => {
                write!(f, "Channel pressure {} Channel {}", self.data(1), ch)
            }
            MessageKind::PitchBend => {
                let value = ((self.data(2) as u16) << 7) | self.data(1) as u16;
                write!(f, "Pitch wheel {} Channel {}", value, ch)
            }
            MessageKind::SysEx => {
                f.write_str("SysEx: ")?;
                write_hex(f, self.bytes())
            }
            MessageKind::SystemCommon => {
                f.write_str("System common: ")?;
                write_hex(f, self.bytes())
            }
            MessageKind::Clock => f.write_str("Clock"),
            MessageKind::Start => f.write_str("Start"),
            MessageKind::Continue => f.write_str("Continue"),
            MessageKind::Stop => f.write_str("Stop"),
            MessageKind::ActiveSensing => f.write_str("Active Sensing"),
            MessageKind::Reset => f.write_str("Reset"),
            MessageKind::Other => {
                f.write_str("Unknown: ")?;
                write_hex(f, self.bytes())
            }
        }
    }
}
