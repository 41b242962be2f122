//! Wire dialect codec
//!
//! The mixrack speaks a MIDI-shaped dialect over TCP. This module splits the
//! raw byte stream into MIDI messages ([`framing`]), assembles those into
//! typed [`Message`]s ([`decoder`]) and renders outgoing commands back into
//! bytes ([`encoder`]).

pub mod decoder;
pub mod encoder;
pub mod framing;

pub use decoder::{Decoder, DecoderShared};
pub use encoder::Encoder;
pub use framing::{MidiStream, RawMidi};

use crate::entity::{ChannelIdentifier, Color, Label, Level, Scene};

/// Vendor sysex header shared by every sysex-framed message.
pub const SYSEX_HEADER: [u8; 7] = [0x00, 0x00, 0x1A, 0x50, 0x10, 0x01, 0x00];

/// A decoded mixrack event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Scene recall notification
    Scene(Scene),
    /// Channel label report
    Label(ChannelIdentifier, Label),
    /// Channel color report
    Color(ChannelIdentifier, Color),
    /// Channel mute state
    Mute(ChannelIdentifier, bool),
    /// Channel fader level
    Level(ChannelIdentifier, Level),
    /// Send level from one channel to another
    SendLevel {
        /// Sending channel
        from: ChannelIdentifier,
        /// Destination bus
        to: ChannelIdentifier,
        /// New send level
        level: Level,
    },
    /// A sysex frame that could not be interpreted; carries the payload and
    /// a diagnostic reason. Never aborts the reader.
    UnknownSysex {
        /// Raw sysex payload (without `F0`/`F7` framing)
        data: Vec<u8>,
        /// Why the frame was not interpreted
        reason: String,
    },
}
