//! Raw MIDI stream framing
//!
//! Splits the TCP byte stream into the four MIDI message kinds the dialect
//! uses. The console relies on running status (the mute command is a NoteOn
//! followed by a second data-only NoteOn), so the framer keeps the last
//! channel status byte between messages. Parsing uses nom in streaming mode:
//! an `Incomplete` result simply leaves the bytes buffered until the socket
//! delivers more.

use nom::bytes::streaming::{tag, take_while};
use nom::combinator::verify;
use nom::number::streaming::u8 as any_byte;
use nom::sequence::pair;
use nom::IResult;

/// One framed MIDI message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawMidi {
    /// System-exclusive frame; payload without the `F0`/`F7` framing bytes
    Sysex(Vec<u8>),
    /// Control change
    ControlChange {
        /// MIDI channel (status low nibble)
        channel: u8,
        /// Controller number
        control: u8,
        /// Controller value
        value: u8,
    },
    /// Note on
    NoteOn {
        /// MIDI channel (status low nibble)
        channel: u8,
        /// Note number
        note: u8,
        /// Velocity
        velocity: u8,
    },
    /// Program change
    ProgramChange {
        /// MIDI channel (status low nibble)
        channel: u8,
        /// Program number
        program: u8,
    },
}

impl RawMidi {
    /// Whether this is a control change for the given controller.
    pub fn is_cc(&self, wanted: u8) -> bool {
        matches!(self, RawMidi::ControlChange { control, .. } if *control == wanted)
    }
}

fn data_byte(input: &[u8]) -> IResult<&[u8], u8> {
    verify(any_byte, |byte| *byte < 0x80)(input)
}

fn sysex(input: &[u8]) -> IResult<&[u8], RawMidi> {
    let (input, _) = tag(&[0xF0u8][..])(input)?;
    let (input, payload) = take_while(|byte| byte < 0x80)(input)?;
    let (input, _) = tag(&[0xF7u8][..])(input)?;

    Ok((input, RawMidi::Sysex(payload.to_vec())))
}

/// Parse the data bytes of a channel message whose status byte is already
/// known (either just consumed or carried as running status).
fn channel_message(status: u8) -> impl Fn(&[u8]) -> IResult<&[u8], RawMidi> {
    move |input| {
        let channel = status & 0x0F;

        match status & 0xF0 {
            0xB0 => {
                let (input, (control, value)) = pair(data_byte, data_byte)(input)?;
                Ok((
                    input,
                    RawMidi::ControlChange {
                        channel,
                        control,
                        value,
                    },
                ))
            }
            0x90 => {
                let (input, (note, velocity)) = pair(data_byte, data_byte)(input)?;
                Ok((
                    input,
                    RawMidi::NoteOn {
                        channel,
                        note,
                        velocity,
                    },
                ))
            }
            0xC0 => {
                let (input, program) = data_byte(input)?;
                Ok((input, RawMidi::ProgramChange { channel, program }))
            }
            _ => Err(nom::Err::Error(nom::error::Error::new(
                input,
                nom::error::ErrorKind::Tag,
            ))),
        }
    }
}

/// Incremental MIDI framer over a raw byte stream.
///
/// Feed socket reads in as they arrive; complete messages come out in wire
/// order. Unknown status bytes and malformed frames are skipped one byte at
/// a time until the stream resynchronizes on the next status byte.
#[derive(Debug, Default)]
pub struct MidiStream {
    buffer: Vec<u8>,
    running_status: Option<u8>,
}

enum Step {
    Emit(RawMidi, usize, Option<u8>),
    Incomplete,
    Skip,
}

impl MidiStream {
    /// Create an empty framer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes and drain every message that completed.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<RawMidi> {
        self.buffer.extend_from_slice(bytes);

        let mut messages = Vec::new();

        loop {
            match self.step() {
                Step::Emit(message, consumed, running) => {
                    self.buffer.drain(..consumed);
                    self.running_status = running;
                    messages.push(message);
                }
                Step::Incomplete => break,
                Step::Skip => {
                    self.buffer.drain(..1);
                    self.running_status = None;
                }
            }
        }

        messages
    }

    fn step(&self) -> Step {
        let buffer = self.buffer.as_slice();

        let Some(&first) = buffer.first() else {
            return Step::Incomplete;
        };

        if first == 0xF0 {
            return match sysex(buffer) {
                // sysex cancels running status
                Ok((rest, message)) => Step::Emit(message, buffer.len() - rest.len(), None),
                Err(nom::Err::Incomplete(_)) => Step::Incomplete,
                Err(_) => Step::Skip,
            };
        }

        let (status, data, consumed_status) = if first >= 0x80 {
            (first, &buffer[1..], 1)
        } else if let Some(status) = self.running_status {
            (status, buffer, 0)
        } else {
            // orphan data byte with no status context
            return Step::Skip;
        };

        match channel_message(status)(data) {
            Ok((rest, message)) => Step::Emit(
                message,
                consumed_status + (data.len() - rest.len()),
                Some(status),
            ),
            Err(nom::Err::Incomplete(_)) => Step::Incomplete,
            Err(_) => Step::Skip,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn frames_a_control_change() {
        let mut stream = MidiStream::new();
        let messages = stream.feed(&[0xB0, 0x63, 0x05]);
        assert_eq!(
            messages,
            vec![RawMidi::ControlChange {
                channel: 0,
                control: 0x63,
                value: 0x05
            }]
        );
    }

    #[test]
    fn buffers_partial_input() {
        let mut stream = MidiStream::new();
        assert!(stream.feed(&[0xB0, 0x63]).is_empty());
        let messages = stream.feed(&[0x05]);
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn running_status_yields_second_note_on() {
        // the wire form of a mute command
        let mut stream = MidiStream::new();
        let messages = stream.feed(&[0x90, 0x00, 0x7F, 0x00, 0x00]);
        assert_eq!(
            messages,
            vec![
                RawMidi::NoteOn {
                    channel: 0,
                    note: 0x00,
                    velocity: 0x7F
                },
                RawMidi::NoteOn {
                    channel: 0,
                    note: 0x00,
                    velocity: 0x00
                },
            ]
        );
    }

    #[test]
    fn sysex_payload_is_unframed() {
        let mut stream = MidiStream::new();
        let messages = stream.feed(&[0xF0, 0x00, 0x01, 0x02, 0xF7]);
        assert_eq!(messages, vec![RawMidi::Sysex(vec![0x00, 0x01, 0x02])]);
    }

    #[test]
    fn sysex_waits_for_terminator() {
        let mut stream = MidiStream::new();
        assert!(stream.feed(&[0xF0, 0x00, 0x01]).is_empty());
        let messages = stream.feed(&[0x02, 0xF7, 0xC0, 0x10]);
        assert_eq!(
            messages,
            vec![
                RawMidi::Sysex(vec![0x00, 0x01, 0x02]),
                RawMidi::ProgramChange {
                    channel: 0,
                    program: 0x10
                },
            ]
        );
    }

    #[test]
    fn resyncs_after_garbage() {
        let mut stream = MidiStream::new();
        // an unknown status byte, then a valid program change
        let messages = stream.feed(&[0xE3, 0x01, 0xC2, 0x07]);
        assert_eq!(
            messages,
            vec![RawMidi::ProgramChange {
                channel: 2,
                program: 0x07
            }]
        );
    }

    #[test]
    fn truncated_sysex_is_dropped_on_new_status() {
        let mut stream = MidiStream::new();
        // a status byte inside a sysex aborts the frame
        let messages = stream.feed(&[0xF0, 0x00, 0xB0, 0x63, 0x05]);
        assert_eq!(
            messages,
            vec![RawMidi::ControlChange {
                channel: 0,
                control: 0x63,
                value: 0x05
            }]
        );
    }

    #[test]
    fn scene_recall_pair_frames_in_order() {
        let mut stream = MidiStream::new();
        let messages = stream.feed(&[0xB0, 0x00, 0x00, 0xC0, 0x64]);
        assert_eq!(
            messages,
            vec![
                RawMidi::ControlChange {
                    channel: 0,
                    control: 0x00,
                    value: 0x00
                },
                RawMidi::ProgramChange {
                    channel: 0,
                    program: 0x64
                },
            ]
        );
    }
}
