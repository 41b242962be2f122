//! Channel identity and value types
//!
//! Everything the wire dialect talks about: banks, channel identifiers with
//! their fixed MIDI offset table, fader levels, channel colors, labels and
//! scene numbers. All types are small, value-equal and cheap to copy around;
//! identifiers allocated at session construction live for the process.

use num_derive::FromPrimitive;

use crate::{Result, SurfaceError};

/// Channel bank
///
/// A family of channels on the console. The discriminant is stable and only
/// used internally; wire conversion goes through [`ChannelIdentifier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Bank {
    /// Input channels
    Input,
    /// Mono groups
    MonoGroup,
    /// Stereo groups
    StereoGroup,
    /// Mono aux buses
    MonoAux,
    /// Stereo aux buses
    StereoAux,
    /// Mono matrices
    MonoMatrix,
    /// Stereo matrices
    StereoMatrix,
    /// Mono FX sends
    MonoFxSend,
    /// Stereo FX sends
    StereoFxSend,
    /// FX returns
    FxReturn,
    /// Main mix
    Main,
    /// DCAs
    Dca,
    /// Mute groups
    MuteGroup,
}

/// Fixed wire offset table: (bank, bank_offset, channel_offset_start).
///
/// Within one bank row, banks are located by the start of their channel
/// offset range; parsing picks the greatest start that is <= the offset.
const BANK_TABLE: &[(Bank, u8, u8)] = &[
    (Bank::Input, 0, 0x00),
    (Bank::MonoGroup, 1, 0x00),
    (Bank::StereoGroup, 1, 0x40),
    (Bank::MonoAux, 2, 0x00),
    (Bank::StereoAux, 2, 0x40),
    (Bank::MonoMatrix, 3, 0x00),
    (Bank::StereoMatrix, 3, 0x40),
    (Bank::MonoFxSend, 4, 0x00),
    (Bank::StereoFxSend, 4, 0x10),
    (Bank::FxReturn, 4, 0x20),
    (Bank::Main, 4, 0x30),
    (Bank::Dca, 4, 0x36),
    (Bank::MuteGroup, 4, 0x4E),
];

impl Bank {
    /// Short name used in UI labels
    pub fn short_name(&self) -> &'static str {
        match self {
            Bank::Input => "Ip",
            Bank::MonoGroup => "Grp",
            Bank::StereoGroup => "StGrp",
            Bank::MonoAux => "Aux",
            Bank::StereoAux => "StAux",
            Bank::MonoMatrix => "Mtx",
            Bank::StereoMatrix => "StMtx",
            Bank::MonoFxSend => "FX",
            Bank::StereoFxSend => "StFX",
            Bank::FxReturn => "FXRet",
            Bank::Main => "Main",
            Bank::Dca => "DCA",
            Bank::MuteGroup => "MuteG",
        }
    }

    /// Whether channels of this bank carry a mono feed.
    ///
    /// `None` for banks where the distinction does not apply.
    pub fn is_mono_feed(&self) -> Option<bool> {
        match self {
            Bank::MonoGroup | Bank::MonoAux | Bank::MonoMatrix | Bank::MonoFxSend => Some(true),
            Bank::StereoGroup | Bank::StereoAux | Bank::StereoMatrix | Bank::StereoFxSend => {
                Some(false)
            }
            _ => None,
        }
    }

    fn table_entry(&self) -> (u8, u8) {
        // the table covers every variant
        BANK_TABLE
            .iter()
            .find(|(bank, _, _)| bank == self)
            .map(|&(_, n, start)| (n, start))
            .expect("bank missing from offset table")
    }
}

/// Bank and offset information uniquely describing a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelIdentifier {
    bank: Bank,
    canonical_index: u8,
}

impl ChannelIdentifier {
    /// Create an identifier from a bank and a zero-based canonical index.
    pub fn new(bank: Bank, canonical_index: u8) -> Self {
        Self {
            bank,
            canonical_index,
        }
    }

    /// The channel's bank
    pub fn bank(&self) -> Bank {
        self.bank
    }

    /// Zero-based index within the bank
    pub fn canonical_index(&self) -> u8 {
        self.canonical_index
    }

    /// Wire bank offset (the `N` byte before the configured MIDI offset is added)
    pub fn midi_bank_offset(&self) -> u8 {
        self.bank.table_entry().0
    }

    /// Wire channel index (`CH` byte)
    pub fn midi_channel_index(&self) -> u8 {
        let (_, start) = self.bank.table_entry();
        start + self.canonical_index
    }

    /// Parse a wire pair back into an identifier.
    ///
    /// The conversion is partial: `bank_offset` must be one of the five rows
    /// and `channel_offset` must fall into a known range within that row.
    pub fn from_raw(bank_offset: u8, channel_offset: u8) -> Result<Self> {
        let mut best: Option<(Bank, u8)> = None;

        for &(bank, n, start) in BANK_TABLE {
            if n == bank_offset && start <= channel_offset {
                match best {
                    Some((_, current)) if current >= start => {}
                    _ => best = Some((bank, start)),
                }
            }
        }

        match best {
            Some((bank, start)) => Ok(Self::new(bank, channel_offset - start)),
            None => Err(SurfaceError::Protocol(format!(
                "invalid wire channel pair ({bank_offset}, {channel_offset:#04x})"
            ))),
        }
    }

    /// Short human-readable label, e.g. `Aux 3` (one-based like the console UI)
    pub fn short_label(&self) -> String {
        format!("{} {}", self.bank.short_name(), self.canonical_index + 1)
    }
}

impl std::fmt::Display for ChannelIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?}#{} {{ N_base={}, CH={} }}",
            self.bank,
            self.canonical_index,
            self.midi_bank_offset(),
            self.midi_channel_index()
        )
    }
}

/// Channel or send level.
///
/// Values have a linear dependency to dBu values and a logarithmic dependency
/// to physical fader positions. Constructors clamp into `[0, 127]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Level(u8);

impl Level {
    /// Fader fully up
    pub const FULL: Level = Level(0x7F);
    /// Unity gain
    pub const ZERO_DB: Level = Level(0x6B);
    /// Fader fully down / send off
    pub const OFF: Level = Level(0x00);
    /// Physical fader midpoint
    pub const FADER_MIDPOINT: Level = Level(0x58);

    /// Create a level, clamping into the valid range.
    pub fn new(value: u8) -> Self {
        Level(value.min(0x7F))
    }

    /// Create a level from a wider computation, clamping into `[0, 127]`.
    pub fn from_i32(value: i32) -> Self {
        Level(value.clamp(0, 0x7F) as u8)
    }

    /// Raw wire value
    pub fn value(&self) -> u8 {
        self.0
    }
}

impl From<u8> for Level {
    fn from(value: u8) -> Self {
        Level::new(value)
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0 <= 1 {
            return write!(f, "-inf");
        }

        let dbu = ((self.0 as i32 - 17) * 55 / 110) - 45;
        write!(f, "{dbu:+}")
    }
}

/// Channel color
///
/// The RGB triples are a UI contract; the console itself only exchanges the
/// wire byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive)]
pub enum Color {
    /// Unlit
    Off = 0x00,
    /// Red
    Red = 0x01,
    /// Green
    Green = 0x02,
    /// Yellow
    Yellow = 0x03,
    /// Blue
    Blue = 0x04,
    /// Purple
    Purple = 0x05,
    /// Light blue
    LightBlue = 0x06,
    /// White
    White = 0x07,
}

impl Color {
    /// Wire byte
    pub fn value(&self) -> u8 {
        *self as u8
    }

    /// RGB triple for UI rendering
    pub fn rgb(&self) -> (u8, u8, u8) {
        match self {
            Color::Off => (0x20, 0x20, 0x20),
            Color::Red => (0xFF, 0x00, 0x00),
            Color::Green => (0x00, 0xFF, 0x00),
            Color::Yellow => (0xFF, 0xFF, 0x00),
            Color::Blue => (0x00, 0x00, 0xFF),
            Color::Purple => (0xAA, 0x00, 0xAA),
            Color::LightBlue => (0x00, 0xFF, 0xFF),
            Color::White => (0xFF, 0xFF, 0xFF),
        }
    }

    /// Parse a wire byte; bytes above 0x07 are not a color.
    pub fn from_wire(byte: u8) -> Option<Color> {
        num_traits::FromPrimitive::from_u8(byte)
    }
}

impl Default for Color {
    fn default() -> Self {
        Color::Off
    }
}

impl std::fmt::Display for Color {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Channel label: ASCII, at most 8 characters.
///
/// Construction strips NUL bytes and surrounding whitespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Label(String);

impl Label {
    const MAX_LEN: usize = 8;

    /// Create a label, truncating to 8 characters and stripping NUL bytes
    /// and surrounding whitespace.
    pub fn new(value: &str) -> Self {
        let cleaned: String = value.chars().filter(|&c| c != '\0').collect();
        let mut trimmed = cleaned.trim().to_string();
        trimmed.truncate(Self::MAX_LEN);
        Label(trimmed.trim_end().to_string())
    }

    /// Decode label bytes as received on the wire.
    pub fn from_wire(bytes: &[u8]) -> Self {
        let ascii: String = bytes
            .iter()
            .map(|&b| if b.is_ascii() { b as char } else { '?' })
            .collect();
        Label::new(&ascii)
    }

    /// The label text
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// ASCII bytes for the wire
    pub fn wire_bytes(&self) -> Vec<u8> {
        self.0.bytes().collect()
    }

    /// Whether the label carries an actual name (not blank, not digits only)
    pub fn has_name(&self) -> bool {
        self.0
            .chars()
            .any(|c| !c.is_ascii_digit() && !c.is_whitespace())
    }

    /// Labels starting with `!` are hidden from overview pages.
    pub fn is_suppressed_in_overview(&self) -> bool {
        self.0.starts_with('!')
    }

    /// Prefix this label, keeping the 8 character budget.
    pub fn with_prefix(&self, prefix: &str) -> Label {
        Label::new(&format!("{}{}", prefix, self.0))
    }

    /// Placeholder label for an unbound virtual strip
    pub fn unbound() -> Label {
        Label::new("[V-Ch]")
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scene number in `[0, 499]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Scene(u16);

impl Scene {
    /// Highest scene number the console knows
    pub const MAX: u16 = 499;

    /// Create a scene number, validating the range.
    pub fn checked(value: u16) -> Result<Self> {
        if value > Self::MAX {
            return Err(SurfaceError::Range(format!(
                "scene must be in the range [0..499], got {value}"
            )));
        }

        Ok(Scene(value))
    }

    /// Scene number
    pub fn value(&self) -> u16 {
        self.0
    }

    /// This scene shifted by `offset` slots.
    pub fn with_offset(&self, offset: u16) -> Scene {
        Scene(self.0 + offset)
    }
}

impl std::fmt::Display for Scene {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "S{}", self.0)
    }
}
