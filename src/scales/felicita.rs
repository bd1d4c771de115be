//! Felicita coffee scales (Arc, Parallel, Incline)
//!
//! 18-byte notifications carrying the weight as six ASCII digits, the unit as text and a
//! raw battery level. Commands are single bytes written to the same characteristic.

use crate::scales::traits::{
    DecodeError, FieldSpan, PacketLength, ProtocolVariant, ScaleCommand, ScaleFamily,
    ScaleProtocol, StabilitySource, UnitEncoding,
};
use crate::types::{Reading, WeightUnit, MAX_WEIGHT_GRAMS};
use bstr::ByteSlice;
use embassy_time::Instant;
use log::debug;

pub const PACKET_LENGTH: usize = 18;

const MIN_BATTERY_LEVEL: u8 = 129;
const MAX_BATTERY_LEVEL: u8 = 158;

pub const COMMAND_TARE: u8 = 0x54;
pub const COMMAND_TOGGLE_UNIT: u8 = 0x55;
pub const COMMAND_START_TIMER: u8 = 0x52;
pub const COMMAND_STOP_TIMER: u8 = 0x53;
pub const COMMAND_RESET_TIMER: u8 = 0x43;
pub const COMMAND_TOGGLE_TIMER: u8 = 0x42;
pub const COMMAND_TOGGLE_PRECISION: u8 = 0x44;

pub static FELICITA_VARIANT: ProtocolVariant = ProtocolVariant {
    family: ScaleFamily::Felicita,
    brand: "Felicita",
    name_prefixes: &["FELICITA"],
    service_uuid: uuid::Uuid::from_u128(0x0000_FFE0_0000_1000_8000_00805F9B34FB),
    characteristic_uuid: uuid::Uuid::from_u128(0x0000_FFE1_0000_1000_8000_00805F9B34FB),
    length: PacketLength::Exactly(PACKET_LENGTH),
    header: None,
    weight_field: FieldSpan::new(3, 6),
    unit_encoding: UnitEncoding::AsciiText(FieldSpan::new(9, 2)),
    battery_index: Some(15),
    stability: StabilitySource::Derived,
    commands: &ScaleCommand::ALL,
    max_weight_grams: MAX_WEIGHT_GRAMS,
    display_precision: 1,
};

/// Command byte for every command; the match is exhaustive so a new command cannot be
/// added without a byte.
pub const fn command_byte(command: ScaleCommand) -> u8 {
    match command {
        ScaleCommand::Tare => COMMAND_TARE,
        ScaleCommand::ToggleUnit => COMMAND_TOGGLE_UNIT,
        ScaleCommand::StartTimer => COMMAND_START_TIMER,
        ScaleCommand::StopTimer => COMMAND_STOP_TIMER,
        ScaleCommand::ResetTimer => COMMAND_RESET_TIMER,
        ScaleCommand::ToggleTimer => COMMAND_TOGGLE_TIMER,
        ScaleCommand::TogglePrecision => COMMAND_TOGGLE_PRECISION,
    }
}

/// Linear map of the raw battery byte onto 0..=100.
pub fn battery_percentage(raw: u8) -> u8 {
    if raw <= MIN_BATTERY_LEVEL {
        return 0;
    }
    if raw >= MAX_BATTERY_LEVEL {
        return 100;
    }
    let span = (MAX_BATTERY_LEVEL - MIN_BATTERY_LEVEL) as f32;
    (((raw - MIN_BATTERY_LEVEL) as f32 / span) * 100.0).round() as u8
}

// Best effort: "g" anywhere wins, then "oz", anything else is grams
fn unit_from_text(text: &[u8]) -> WeightUnit {
    let unit = text.to_str_lossy().trim().to_lowercase();
    if unit.contains('g') {
        WeightUnit::Grams
    } else if unit.contains("oz") {
        WeightUnit::Ounces
    } else {
        WeightUnit::Grams
    }
}

/// Grams carry two implied decimals, ounces four.
fn implied_decimals(unit: WeightUnit) -> u8 {
    match unit {
        WeightUnit::Ounces => 4,
        _ => 2,
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FelicitaProtocol;

impl ScaleProtocol for FelicitaProtocol {
    fn variant(&self) -> &'static ProtocolVariant {
        &FELICITA_VARIANT
    }

    fn decode_at(&self, packet: &[u8], captured_at: Instant) -> Result<Reading, DecodeError> {
        let variant = self.variant();
        let data = variant.length.frame(packet)?;

        let weight_bytes = variant
            .weight_field
            .slice(data)
            .ok_or(DecodeError::Malformed("weight"))?;
        let digits: String = weight_bytes
            .iter()
            .filter(|b| b.is_ascii_digit())
            .map(|&b| b as char)
            .collect();

        let unit = match variant.unit_encoding {
            UnitEncoding::AsciiText(span) => span.slice(data).map(unit_from_text),
            UnitEncoding::StatusBits(_) => None,
        }
        .unwrap_or(WeightUnit::Grams);
        let decimals = implied_decimals(unit);

        let value = if digits.is_empty() {
            0.0
        } else {
            let raw: u32 = digits.parse().map_err(|_| DecodeError::Malformed("weight"))?;
            raw as f32 / 10f32.powi(decimals as i32)
        };

        let battery = variant
            .battery_index
            .and_then(|index| data.get(index))
            .map(|&raw| battery_percentage(raw));

        debug!(
            "Weight parsing: raw_bytes={:02X?} digits={:?} -> {:.4}{} (battery: {:?}%)",
            weight_bytes, digits, value, unit, battery
        );

        Reading::new(
            unit,
            value,
            decimals,
            false,
            battery,
            captured_at,
            variant.max_weight_grams,
        )
    }

    fn encode_command(&self, command: ScaleCommand) -> Option<u8> {
        self.variant()
            .supports(command)
            .then(|| command_byte(command))
    }
}
