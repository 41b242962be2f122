//! Sliding-window message decoder
//!
//! A single logical mixrack event spans up to three MIDI messages, so the
//! decoder keeps the last three framed messages (most recent first) and
//! matches the dialect's patterns in a fixed order, clearing the window on
//! every match.
//!
//! Two firmware quirks live here and must be preserved verbatim:
//!
//! - While the mute/colour quirks flag is set, a sysex with parameter `0x05`
//!   and a colour-range data byte is ambiguous: the mixrack mirrors
//!   mute *requests* back in exactly the shape of a colour report for
//!   channel 9. During the sync window these frames are surfaced as
//!   [`Message::UnknownSysex`] instead of being misrouted.
//! - Send-level reports sometimes arrive in a 5-byte short form missing the
//!   destination bank byte (seen when altering FX sends on the first input);
//!   the configured bank offset is inserted at payload position 3 before
//!   interpretation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::framing::RawMidi;
use super::{Message, SYSEX_HEADER};
use crate::entity::{ChannelIdentifier, Color, Label, Level, Scene};

/// Quiescence threshold: the stream counts as settled once the last inbound
/// event is older than this.
const SETTLE_AFTER: Duration = Duration::from_millis(800);

const WINDOW: usize = 3;

/// State shared between the per-port decoder windows: the quirks flag toggled
/// by the sync protocol and the quiescence clock it polls.
#[derive(Debug)]
pub struct DecoderShared {
    mute_color_quirks: AtomicBool,
    last_inbound: Mutex<Instant>,
}

impl DecoderShared {
    /// Create shared decoder state. The quiescence clock starts now, so the
    /// stream reads as settled [`SETTLE_AFTER`] after startup even if the
    /// console stays silent.
    pub fn new() -> Self {
        Self {
            mute_color_quirks: AtomicBool::new(false),
            last_inbound: Mutex::new(Instant::now()),
        }
    }

    /// Enter or leave mute/colour quirks mode.
    pub fn set_quirks_mode(&self, enabled: bool) {
        self.mute_color_quirks.store(enabled, Ordering::SeqCst);
    }

    /// Whether quirks mode is active.
    pub fn quirks_mode(&self) -> bool {
        self.mute_color_quirks.load(Ordering::SeqCst)
    }

    /// `true` once the last inbound event is more than 0.8 s in the past.
    pub fn settled(&self) -> bool {
        self.last_inbound.lock().elapsed() > SETTLE_AFTER
    }

    fn touch(&self) {
        *self.last_inbound.lock() = Instant::now();
    }
}

impl Default for DecoderShared {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-stream decoder.
///
/// Each transport port owns one decoder; interleaving two streams through a
/// single window would corrupt the multi-message patterns. The window itself
/// is mutex-guarded so a decoder can be shared with the thread that feeds it.
pub struct Decoder {
    bank_offset: u8,
    shared: Arc<DecoderShared>,
    window: Mutex<VecDeque<RawMidi>>,
}

impl Decoder {
    /// Create a decoder for a stream, with the configured MIDI bank offset.
    pub fn new(bank_offset: u8, shared: Arc<DecoderShared>) -> Self {
        Self {
            bank_offset,
            shared,
            window: Mutex::new(VecDeque::with_capacity(WINDOW)),
        }
    }

    /// Handle to the shared quirks flag and quiescence clock.
    pub fn shared(&self) -> Arc<DecoderShared> {
        Arc::clone(&self.shared)
    }

    /// Feed one framed MIDI message; returns a decoded event if the window
    /// now matches a pattern.
    pub fn feed(&self, message: RawMidi) -> Option<Message> {
        self.shared.touch();

        let mut window = self.window.lock();

        window.push_front(message);
        if window.len() > WINDOW {
            window.pop_back();
        }

        self.decode(&mut window)
    }

    fn decode(&self, window: &mut VecDeque<RawMidi>) -> Option<Message> {
        // 1: sysex always decodes alone
        if let Some(RawMidi::Sysex(data)) = window.front() {
            let result = self.decode_sysex(data);
            window.clear();
            return Some(result);
        }

        // 2: CC triple 0x63/0x62/0x06 carries a parameter update
        if window.len() >= 3
            && window[2].is_cc(0x63)
            && window[1].is_cc(0x62)
            && window[0].is_cc(0x06)
        {
            let result = self.decode_parameter(&window[2], &window[1], &window[0]);
            window.clear();
            return result;
        }

        if window.len() >= 2 {
            // 3: NoteOn pair carries a mute state
            if let (
                RawMidi::NoteOn {
                    channel,
                    note,
                    velocity,
                },
                RawMidi::NoteOn {
                    velocity: second, ..
                },
            ) = (&window[1], &window[0])
            {
                if matches!(*velocity, 0x7F | 0x3F) && *second == 0x00 {
                    let result = self
                        .channel_identifier(*channel, *note)
                        .map(|ch| Message::Mute(ch, *velocity == 0x7F));
                    window.clear();
                    return result;
                }
            }

            // 4: bank select + program change carries a scene recall
            if let (
                RawMidi::ControlChange {
                    control: 0x00,
                    value: bank,
                    ..
                },
                RawMidi::ProgramChange { program, .. },
            ) = (&window[1], &window[0])
            {
                let number = ((*bank as u16) << 7) | (*program as u16);
                let result = match Scene::checked(number) {
                    Ok(scene) => Some(Message::Scene(scene)),
                    Err(_) => {
                        tracing::debug!(number, "scene recall outside range, ignored");
                        None
                    }
                };
                window.clear();
                return result;
            }
        }

        // 5: wait for more messages
        None
    }

    fn decode_parameter(
        &self,
        first: &RawMidi,
        second: &RawMidi,
        third: &RawMidi,
    ) -> Option<Message> {
        let (RawMidi::ControlChange { channel, value: ch, .. },
             RawMidi::ControlChange { value: parameter, .. },
             RawMidi::ControlChange { value, .. }) = (first, second, third)
        else {
            return None;
        };

        match *parameter {
            0x17 => self
                .channel_identifier(*channel, *ch)
                .map(|identifier| Message::Level(identifier, Level::new(*value))),
            _ => {
                // unknown parameter id, ignore
                None
            }
        }
    }

    fn decode_sysex(&self, data: &[u8]) -> Message {
        const MIN_PAYLOAD: usize = 4;

        if data.len() < SYSEX_HEADER.len() + MIN_PAYLOAD || data[..SYSEX_HEADER.len()] != SYSEX_HEADER
        {
            return Message::UnknownSysex {
                data: data.to_vec(),
                reason: "invalid or truncated sysex header".into(),
            };
        }

        let d = &data[SYSEX_HEADER.len()..];
        let parameter = d[1];

        match parameter {
            // channel label report
            0x02 => match self.sysex_identifier(d[0], d[2], data) {
                Ok(ch) => Message::Label(ch, Label::from_wire(&d[3..])),
                Err(unknown) => unknown,
            },
            // colour report, unless the sync window makes it ambiguous
            0x05 if d[3] <= 0x07 => {
                if self.shared.quirks_mode() {
                    return Message::UnknownSysex {
                        data: data.to_vec(),
                        reason: "ambiguous colour vs mirrored mute-request".into(),
                    };
                }

                match self.sysex_identifier(d[0], d[2], data) {
                    Ok(ch) => match Color::from_wire(d[3]) {
                        Some(color) => Message::Color(ch, color),
                        None => Message::UnknownSysex {
                            data: data.to_vec(),
                            reason: format!("colour byte {:#04x} out of range", d[3]),
                        },
                    },
                    Err(unknown) => unknown,
                }
            }
            // send level report, possibly in the short form
            0x0D if d.len() == 5 || d.len() == 6 => {
                let mut d = d.to_vec();
                if d.len() == 5 {
                    // firmware bug: the destination bank byte is missing
                    d.insert(3, self.bank_offset);
                }

                let from = self.sysex_identifier(d[0], d[2], data);
                let to = self.sysex_identifier(d[3], d[4], data);

                match (from, to) {
                    (Ok(from), Ok(to)) => Message::SendLevel {
                        from,
                        to,
                        level: Level::new(d[5]),
                    },
                    (Err(unknown), _) | (_, Err(unknown)) => unknown,
                }
            }
            _ => Message::UnknownSysex {
                data: data.to_vec(),
                reason: format!("unsupported sysex parameter {parameter:#04x}"),
            },
        }
    }

    /// Identifier from wire bytes inside a sysex; failures become
    /// [`Message::UnknownSysex`] so the reader never aborts.
    fn sysex_identifier(
        &self,
        n: u8,
        ch: u8,
        frame: &[u8],
    ) -> std::result::Result<ChannelIdentifier, Message> {
        self.channel_identifier(n, ch).ok_or_else(|| Message::UnknownSysex {
            data: frame.to_vec(),
            reason: format!("unknown bank/channel offset pair ({n}, {ch:#04x})"),
        })
    }

    fn channel_identifier(&self, n: u8, ch: u8) -> Option<ChannelIdentifier> {
        let bank_offset = n.checked_sub(self.bank_offset)?;

        match ChannelIdentifier::from_raw(bank_offset, ch) {
            Ok(identifier) => Some(identifier),
            Err(error) => {
                tracing::debug!(%error, "unresolvable channel in inbound message");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::framing::MidiStream;
    use crate::entity::Bank;
    use pretty_assertions::assert_eq;

    fn decoder() -> Decoder {
        Decoder::new(0, Arc::new(DecoderShared::new()))
    }

    fn feed_bytes(decoder: &Decoder, bytes: &[u8]) -> Vec<Message> {
        let mut stream = MidiStream::new();
        stream
            .feed(bytes)
            .into_iter()
            .filter_map(|raw| decoder.feed(raw))
            .collect()
    }

    fn sysex(payload: &[u8]) -> Vec<u8> {
        let mut bytes = vec![0xF0];
        bytes.extend_from_slice(&SYSEX_HEADER);
        bytes.extend_from_slice(payload);
        bytes.push(0xF7);
        bytes
    }

    #[test]
    fn decodes_scene_recall() {
        let messages = feed_bytes(&decoder(), &[0xB0, 0x00, 0x00, 0xC0, 0x64]);
        assert_eq!(messages, vec![Message::Scene(Scene::checked(100).unwrap())]);
    }

    #[test]
    fn decodes_mute_pair() {
        let messages = feed_bytes(&decoder(), &[0x90, 0x00, 0x7F, 0x00, 0x00]);
        assert_eq!(
            messages,
            vec![Message::Mute(
                ChannelIdentifier::new(Bank::Input, 0),
                true
            )]
        );
    }

    #[test]
    fn decodes_unmute_pair() {
        let messages = feed_bytes(&decoder(), &[0x90, 0x05, 0x3F, 0x05, 0x00]);
        assert_eq!(
            messages,
            vec![Message::Mute(
                ChannelIdentifier::new(Bank::Input, 5),
                false
            )]
        );
    }

    #[test]
    fn decodes_level_triple() {
        let messages = feed_bytes(&decoder(), &[0xB0, 0x63, 0x04, 0x62, 0x17, 0x06, 0x58]);
        assert_eq!(
            messages,
            vec![Message::Level(
                ChannelIdentifier::new(Bank::Input, 4),
                Level::FADER_MIDPOINT
            )]
        );
    }

    #[test]
    fn ignores_unknown_parameter_triple() {
        let messages = feed_bytes(&decoder(), &[0xB0, 0x63, 0x04, 0x62, 0x20, 0x06, 0x58]);
        assert!(messages.is_empty());
    }

    #[test]
    fn decodes_label_sysex() {
        let messages = feed_bytes(&decoder(), &sysex(&[0x00, 0x02, 0x03, b'K', b'i', b'c', b'k']));
        assert_eq!(
            messages,
            vec![Message::Label(
                ChannelIdentifier::new(Bank::Input, 3),
                Label::new("Kick")
            )]
        );
    }

    #[test]
    fn colour_report_without_quirks() {
        let messages = feed_bytes(&decoder(), &sysex(&[0x00, 0x05, 0x09, 0x03]));
        assert_eq!(
            messages,
            vec![Message::Color(
                ChannelIdentifier::new(Bank::Input, 9),
                Color::Yellow
            )]
        );
    }

    #[test]
    fn colour_report_in_quirks_mode_is_ambiguous() {
        let decoder = decoder();
        decoder.shared().set_quirks_mode(true);

        let messages = feed_bytes(&decoder, &sysex(&[0x00, 0x05, 0x09, 0x03]));
        match &messages[..] {
            [Message::UnknownSysex { reason, .. }] => {
                assert!(reason.contains("ambiguous"), "reason: {reason}");
            }
            other => panic!("expected UnknownSysex, got {other:?}"),
        }
    }

    #[test]
    fn short_form_send_level_synthesizes_bank_byte() {
        let short = sysex(&[0x00, 0x0D, 0x00, 0x00, 0x6B]);
        let long = sysex(&[0x00, 0x0D, 0x00, 0x00, 0x00, 0x6B]);

        let expected = Message::SendLevel {
            from: ChannelIdentifier::new(Bank::Input, 0),
            to: ChannelIdentifier::new(Bank::Input, 0),
            level: Level::ZERO_DB,
        };

        assert_eq!(feed_bytes(&decoder(), &short), vec![expected.clone()]);
        assert_eq!(feed_bytes(&decoder(), &long), vec![expected]);
    }

    #[test]
    fn send_level_with_nonzero_bank_offset() {
        let decoder = Decoder::new(1, Arc::new(DecoderShared::new()));
        // from input 2 (row 0) to mono aux 1 (row 2), both offset by B=1
        let messages = feed_bytes(&decoder, &sysex(&[0x01, 0x0D, 0x02, 0x03, 0x01, 0x40]));
        assert_eq!(
            messages,
            vec![Message::SendLevel {
                from: ChannelIdentifier::new(Bank::Input, 2),
                to: ChannelIdentifier::new(Bank::MonoAux, 1),
                level: Level::new(0x40),
            }]
        );
    }

    #[test]
    fn bad_header_is_surfaced_not_dropped() {
        let mut bytes = vec![0xF0, 0x7F, 0x7F, 0x7F, 0x7F, 0x7F, 0x7F, 0x7F];
        bytes.extend_from_slice(&[0x00, 0x02, 0x03, 0x41]);
        bytes.push(0xF7);

        let messages = feed_bytes(&decoder(), &bytes);
        match &messages[..] {
            [Message::UnknownSysex { reason, .. }] => {
                assert!(reason.contains("header"), "reason: {reason}");
            }
            other => panic!("expected UnknownSysex, got {other:?}"),
        }
    }

    #[test]
    fn window_clears_after_match() {
        let decoder = decoder();

        // a mute pair followed by a second mute pair decodes twice
        let first = feed_bytes(&decoder, &[0x90, 0x00, 0x7F, 0x00, 0x00]);
        let second = feed_bytes(&decoder, &[0x90, 0x01, 0x3F, 0x01, 0x00]);
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn settles_after_quiet_period() {
        let shared = Arc::new(DecoderShared::new());
        let decoder = Decoder::new(0, Arc::clone(&shared));

        decoder.feed(RawMidi::ProgramChange {
            channel: 0,
            program: 1,
        });
        assert!(!shared.settled());
    }
}
