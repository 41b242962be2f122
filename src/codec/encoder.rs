//! Outgoing command encoders
//!
//! Every command and request is a fixed-layout byte vector. Channel
//! identifiers are converted through the fixed bank table and shifted by the
//! configured MIDI bank offset; the scene recall is the only non-sysex
//! command besides mute and level.

use super::SYSEX_HEADER;
use crate::entity::{ChannelIdentifier, Color, Label, Level, Scene};

/// Stateless encoder carrying the configured MIDI bank offset.
#[derive(Debug, Clone, Copy)]
pub struct Encoder {
    bank_offset: u8,
}

impl Encoder {
    /// Create an encoder for the given (zero-based) MIDI bank offset.
    pub fn new(bank_offset: u8) -> Self {
        Self { bank_offset }
    }

    fn sysex(&self, payload: &[u8]) -> Vec<u8> {
        let mut data = Vec::with_capacity(2 + SYSEX_HEADER.len() + payload.len());
        data.push(0xF0);
        data.extend_from_slice(&SYSEX_HEADER);
        data.extend_from_slice(payload);
        data.push(0xF7);
        data
    }

    fn n(&self, channel: ChannelIdentifier) -> u8 {
        self.bank_offset + channel.midi_bank_offset()
    }

    /// Recall a scene.
    pub fn recall_scene(&self, scene: Scene) -> Vec<u8> {
        let bank = (scene.value() >> 7) as u8;
        let offset = (scene.value() & 0x7F) as u8;

        vec![
            0xB0 + self.bank_offset,
            0x00,
            bank,
            0xC0 + self.bank_offset,
            offset,
        ]
    }

    /// Set a channel label.
    pub fn label(&self, channel: ChannelIdentifier, label: &Label) -> Vec<u8> {
        let mut payload = vec![self.n(channel), 0x03, channel.midi_channel_index()];
        payload.extend_from_slice(&label.wire_bytes());
        self.sysex(&payload)
    }

    /// Request a channel label report.
    pub fn request_label(&self, channel: ChannelIdentifier) -> Vec<u8> {
        self.sysex(&[self.n(channel), 0x01, channel.midi_channel_index()])
    }

    /// Set a channel color.
    pub fn color(&self, channel: ChannelIdentifier, color: Color) -> Vec<u8> {
        self.sysex(&[
            self.n(channel),
            0x06,
            channel.midi_channel_index(),
            color.value(),
        ])
    }

    /// Request a channel color report.
    pub fn request_color(&self, channel: ChannelIdentifier) -> Vec<u8> {
        self.sysex(&[self.n(channel), 0x04, channel.midi_channel_index()])
    }

    /// Set a channel mute state.
    pub fn mute(&self, channel: ChannelIdentifier, muted: bool) -> Vec<u8> {
        let velocity = if muted { 0x7F } else { 0x3F };
        let ch = channel.midi_channel_index();

        vec![0x90 + self.n(channel), ch, velocity, ch, 0x00]
    }

    /// Request a channel mute report.
    pub fn request_mute(&self, channel: ChannelIdentifier) -> Vec<u8> {
        self.sysex(&[self.n(channel), 0x05, 0x09, channel.midi_channel_index()])
    }

    /// Set a channel fader level.
    pub fn level(&self, channel: ChannelIdentifier, level: Level) -> Vec<u8> {
        vec![
            0xB0 + self.n(channel),
            0x63,
            channel.midi_channel_index(),
            0x62,
            0x17,
            0x06,
            level.value(),
        ]
    }

    /// Request a channel level report.
    pub fn request_level(&self, channel: ChannelIdentifier) -> Vec<u8> {
        self.sysex(&[
            self.n(channel),
            0x05,
            0x0B,
            0x17,
            channel.midi_channel_index(),
        ])
    }

    /// Set a send level from one channel to a destination bus.
    pub fn send_level(
        &self,
        from: ChannelIdentifier,
        to: ChannelIdentifier,
        level: Level,
    ) -> Vec<u8> {
        self.sysex(&[
            self.n(from),
            0x0D,
            from.midi_channel_index(),
            self.n(to),
            to.midi_channel_index(),
            level.value(),
        ])
    }

    /// Request a send level report.
    pub fn request_send_level(&self, from: ChannelIdentifier, to: ChannelIdentifier) -> Vec<u8> {
        self.sysex(&[
            self.n(from),
            0x05,
            0x0F,
            0x0D,
            from.midi_channel_index(),
            self.n(to),
            to.midi_channel_index(),
        ])
    }
}
