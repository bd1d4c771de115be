//! Chipsea / OKOK kitchen scales (SmartChef, ProfiCook and friends)
//!
//! Packet: `CA ?? ?? SS ?? WW WW [??]`. The status byte `SS` packs sign, stability,
//! unit and decimal count. The layout was reverse-engineered from captures; a future
//! correction belongs in [`CHIPSEA_VARIANT`], not in the decoder.

use crate::scales::traits::{
    DecodeError, FieldSpan, PacketLength, ProtocolVariant, ScaleFamily, ScaleProtocol,
    StabilitySource, StatusLayout, UnitEncoding,
};
use crate::types::{Reading, WeightUnit, MAX_WEIGHT_GRAMS};
use embassy_time::Instant;
use log::debug;

pub const PACKET_HEADER: u8 = 0xCA;

const UNIT_GRAMS: u8 = 0x00;
const UNIT_OUNCES: u8 = 0x03;
const UNIT_POUNDS: u8 = 0x06;
const UNIT_KILOGRAMS: u8 = 0x08;

const STATUS: StatusLayout = StatusLayout {
    index: 3,
    sign_mask: 0x80,
    stable_mask: 0x01,
    unit_decimal_mask: 0x3F,
};

pub static CHIPSEA_VARIANT: ProtocolVariant = ProtocolVariant {
    family: ScaleFamily::Chipsea,
    brand: "Chipsea",
    name_prefixes: &["smartchef", "chipsea-ble", "proficook", "pc-kw"],
    service_uuid: uuid::Uuid::from_u128(0x0000_FFF0_0000_1000_8000_00805F9B34FB),
    characteristic_uuid: uuid::Uuid::from_u128(0x0000_FFF1_0000_1000_8000_00805F9B34FB),
    length: PacketLength::AtLeast { min: 7, window: 8 },
    header: Some(PACKET_HEADER),
    weight_field: FieldSpan::new(5, 2),
    unit_encoding: UnitEncoding::StatusBits(STATUS),
    battery_index: None,
    stability: StabilitySource::InPacket,
    commands: &[],
    max_weight_grams: MAX_WEIGHT_GRAMS,
    display_precision: 0,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct ChipseaProtocol;

/// Unit and decimal count packed in bits 1..=6 of the status byte.
fn unit_and_decimals(status: u8, layout: &StatusLayout) -> (WeightUnit, u8) {
    let middle = (status >> 1) & layout.unit_decimal_mask;
    let unit_bits = (middle >> 2) & 0x0F;
    let decimal_bits = middle & 0x03;

    let unit = match unit_bits {
        UNIT_KILOGRAMS => WeightUnit::Kilograms,
        UNIT_OUNCES => WeightUnit::Ounces,
        UNIT_POUNDS => WeightUnit::Pounds,
        UNIT_GRAMS => WeightUnit::Grams,
        _ => WeightUnit::Unknown,
    };

    (unit, decimal_bits)
}

impl ScaleProtocol for ChipseaProtocol {
    fn variant(&self) -> &'static ProtocolVariant {
        &CHIPSEA_VARIANT
    }

    fn decode_at(&self, packet: &[u8], captured_at: Instant) -> Result<Reading, DecodeError> {
        let variant = self.variant();
        let data = variant.length.frame(packet)?;

        if let Some(expected) = variant.header {
            if data[0] != expected {
                return Err(DecodeError::BadHeader { found: data[0], expected });
            }
        }

        let weight_bytes = variant
            .weight_field
            .slice(data)
            .ok_or(DecodeError::Malformed("weight"))?;
        let weight_raw = u16::from_be_bytes([weight_bytes[0], weight_bytes[1]]);

        let layout = match variant.unit_encoding {
            UnitEncoding::StatusBits(layout) => layout,
            UnitEncoding::AsciiText(_) => return Err(DecodeError::Malformed("status")),
        };
        let status = data.get(layout.index).copied().unwrap_or(0);
        let is_negative = status & layout.sign_mask != 0;
        let is_stable = status & layout.stable_mask != 0;
        let (unit, decimals) = unit_and_decimals(status, &layout);

        let value = if weight_raw == 0 {
            0.0
        } else {
            let magnitude = weight_raw as f32 / 10f32.powi(decimals as i32);
            if is_negative {
                -magnitude
            } else {
                magnitude
            }
        };

        debug!(
            "Status byte=0x{:02X}: raw=0x{:04X} negative={} stable={} unit={} decimals={}",
            status, weight_raw, is_negative, is_stable, unit, decimals
        );

        Reading::new(
            unit,
            value,
            decimals,
            is_stable,
            None,
            captured_at,
            variant.max_weight_grams,
        )
    }
}
