//! Protocol abstraction shared by every supported scale family
//!
//! Each family describes its wire format once, in a static [`ProtocolVariant`], and
//! implements [`ScaleProtocol`] to turn a notification into a [`Reading`].

use crate::scales::{chipsea::ChipseaProtocol, felicita::FelicitaProtocol};
use crate::types::Reading;
use embassy_time::Instant;
use serde::{Deserialize, Serialize};

// Commands a scale may accept over its write characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScaleCommand {
    Tare,
    ToggleUnit,
    StartTimer,
    StopTimer,
    ResetTimer,
    ToggleTimer,
    TogglePrecision,
}

impl ScaleCommand {
    pub const ALL: [ScaleCommand; 7] = [
        ScaleCommand::Tare,
        ScaleCommand::ToggleUnit,
        ScaleCommand::StartTimer,
        ScaleCommand::StopTimer,
        ScaleCommand::ResetTimer,
        ScaleCommand::ToggleTimer,
        ScaleCommand::TogglePrecision,
    ];

    pub const fn name(&self) -> &'static str {
        match self {
            ScaleCommand::Tare => "tare",
            ScaleCommand::ToggleUnit => "toggle unit",
            ScaleCommand::StartTimer => "start timer",
            ScaleCommand::StopTimer => "stop timer",
            ScaleCommand::ResetTimer => "reset timer",
            ScaleCommand::ToggleTimer => "toggle timer",
            ScaleCommand::TogglePrecision => "toggle precision",
        }
    }
}

// Packet decoding failures. The offending packet is dropped, nothing else happens.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeError {
    TooShort { len: usize, min: usize },
    BadLength { len: usize, expected: usize },
    BadHeader { found: u8, expected: u8 },
    OutOfRange { grams: f32, max: f32 },
    Malformed(&'static str),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            DecodeError::TooShort { len, min } => {
                write!(f, "Insufficient data length: {} bytes (minimum {} expected)", len, min)
            }
            DecodeError::BadLength { len, expected } => {
                write!(f, "Invalid packet length: {} bytes (expected {})", len, expected)
            }
            DecodeError::BadHeader { found, expected } => {
                write!(f, "Invalid packet header: {:02X} (expected {:02X})", found, expected)
            }
            DecodeError::OutOfRange { grams, max } => {
                write!(f, "Weight value out of range: {:.1}g (max: {}g)", grams, max)
            }
            DecodeError::Malformed(field) => write!(f, "Malformed {} field", field),
        }
    }
}

impl std::error::Error for DecodeError {}

/// How a family frames its packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketLength {
    /// At least `min` bytes; anything past `window` is ignored.
    AtLeast { min: usize, window: usize },
    Exactly(usize),
}

impl PacketLength {
    /// Validates the length and returns the slice the decoder should look at.
    pub fn frame<'a>(&self, packet: &'a [u8]) -> Result<&'a [u8], DecodeError> {
        match *self {
            PacketLength::AtLeast { min, window } => {
                if packet.len() < min {
                    return Err(DecodeError::TooShort { len: packet.len(), min });
                }
                Ok(&packet[..packet.len().min(window)])
            }
            PacketLength::Exactly(expected) => {
                if packet.len() != expected {
                    return Err(DecodeError::BadLength { len: packet.len(), expected });
                }
                Ok(packet)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpan {
    pub offset: usize,
    pub width: usize,
}

impl FieldSpan {
    pub const fn new(offset: usize, width: usize) -> Self {
        Self { offset, width }
    }

    pub const fn end(&self) -> usize {
        self.offset + self.width
    }

    pub fn slice<'a>(&self, packet: &'a [u8]) -> Option<&'a [u8]> {
        packet.get(self.offset..self.end())
    }
}

/// Bit layout of a status byte that packs sign, stability, unit and decimals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusLayout {
    pub index: usize,
    pub sign_mask: u8,
    pub stable_mask: u8,
    pub unit_decimal_mask: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitEncoding {
    /// Unit and decimal count packed into the status byte.
    StatusBits(StatusLayout),
    /// Unit spelled out as text; decimal count fixed per unit.
    AsciiText(FieldSpan),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StabilitySource {
    InPacket,
    /// Derived by the host from consecutive readings.
    Derived,
}

/// Static capability descriptor of one device family.
#[derive(Debug)]
pub struct ProtocolVariant {
    pub family: ScaleFamily,
    pub brand: &'static str,
    pub name_prefixes: &'static [&'static str],
    pub service_uuid: uuid::Uuid,
    /// Weight notifications, and command writes where the family accepts them.
    pub characteristic_uuid: uuid::Uuid,
    pub length: PacketLength,
    pub header: Option<u8>,
    pub weight_field: FieldSpan,
    pub unit_encoding: UnitEncoding,
    pub battery_index: Option<usize>,
    pub stability: StabilitySource,
    pub commands: &'static [ScaleCommand],
    pub max_weight_grams: f32,
    /// Decimals kept in the published gram value.
    pub display_precision: u8,
}

impl ProtocolVariant {
    pub fn accepts_commands(&self) -> bool {
        !self.commands.is_empty()
    }

    pub fn supports(&self, command: ScaleCommand) -> bool {
        self.commands.contains(&command)
    }

    /// Case-insensitive prefix match against the advertised local name.
    pub fn matches_name(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        self.name_prefixes
            .iter()
            .any(|prefix| name.starts_with(&prefix.to_lowercase()))
    }

    /// Gram value as exposed to consumers.
    pub fn display_weight(&self, grams: f32) -> f32 {
        let scale = 10f32.powi(self.display_precision as i32);
        (grams * scale).round() / scale
    }
}

/// Implemented by every family's decoder
pub trait ScaleProtocol: Send + Sync {
    fn variant(&self) -> &'static ProtocolVariant;

    fn decode_at(&self, packet: &[u8], captured_at: Instant) -> Result<Reading, DecodeError>;

    fn decode(&self, packet: &[u8]) -> Result<Reading, DecodeError> {
        self.decode_at(packet, Instant::now())
    }

    /// Single command byte, `None` for read-only families.
    fn encode_command(&self, _command: ScaleCommand) -> Option<u8> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScaleFamily {
    Chipsea,
    Felicita,
}

impl ScaleFamily {
    pub const ALL: [ScaleFamily; 2] = [ScaleFamily::Chipsea, ScaleFamily::Felicita];

    pub fn protocol(&self) -> &'static dyn ScaleProtocol {
        match self {
            ScaleFamily::Chipsea => &ChipseaProtocol,
            ScaleFamily::Felicita => &FelicitaProtocol,
        }
    }

    pub fn variant(&self) -> &'static ProtocolVariant {
        self.protocol().variant()
    }

    pub fn name(&self) -> &'static str {
        self.variant().brand
    }
}

impl std::fmt::Display for ScaleFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for ScaleFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "chipsea" | "okok" => Ok(ScaleFamily::Chipsea),
            "felicita" => Ok(ScaleFamily::Felicita),
            other => Err(format!("Unknown scale family: {}", other)),
        }
    }
}
