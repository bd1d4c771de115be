use embassy_time::Instant;
use serde::{Deserialize, Serialize};

/// Ceiling for readings in a known unit (5 kg-class scales).
pub const MAX_WEIGHT_GRAMS: f32 = 5000.0;

/// Ceiling for readings whose unit could not be decoded and pass through unconverted.
pub const UNBOUNDED_WEIGHT_GRAMS: f32 = 500_000.0;

/// Unit the scale itself is currently displaying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightUnit {
    #[serde(rename = "g")]
    Grams,
    #[serde(rename = "kg")]
    Kilograms,
    #[serde(rename = "lb")]
    Pounds,
    #[serde(rename = "oz")]
    Ounces,
    Unknown,
}

impl WeightUnit {
    /// Grams per native unit, `None` for [`WeightUnit::Unknown`].
    pub const fn grams_factor(&self) -> Option<f32> {
        match self {
            WeightUnit::Grams => Some(1.0),
            WeightUnit::Kilograms => Some(1000.0),
            WeightUnit::Pounds => Some(453.592),
            WeightUnit::Ounces => Some(28.3495),
            WeightUnit::Unknown => None,
        }
    }

    pub const fn symbol(&self) -> &'static str {
        match self {
            WeightUnit::Grams => "g",
            WeightUnit::Kilograms => "kg",
            WeightUnit::Pounds => "lb",
            WeightUnit::Ounces => "oz",
            WeightUnit::Unknown => "unknown",
        }
    }

    pub const fn is_known(&self) -> bool {
        !matches!(self, WeightUnit::Unknown)
    }

    /// Unknown units pass through unconverted.
    pub fn to_grams(&self, value: f32) -> f32 {
        match self.grams_factor() {
            Some(factor) => value * factor,
            None => value,
        }
    }
}

impl std::fmt::Display for WeightUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.symbol())
    }
}

/// One decoded weight measurement.
///
/// Only constructed through [`Reading::new`], which enforces the weight ceiling; a packet
/// that would violate it fails to decode instead.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    weight_grams: f32,
    native_unit: WeightUnit,
    raw_value: f32,
    decimal_places: u8,
    is_stable: bool,
    battery_percent: Option<u8>,
    captured_at: Instant,
}

impl Reading {
    pub fn new(
        native_unit: WeightUnit,
        raw_value: f32,
        decimal_places: u8,
        is_stable: bool,
        battery_percent: Option<u8>,
        captured_at: Instant,
        max_weight_grams: f32,
    ) -> Result<Self, crate::scales::DecodeError> {
        let weight_grams = native_unit.to_grams(raw_value);
        let ceiling = if native_unit.is_known() {
            max_weight_grams
        } else {
            UNBOUNDED_WEIGHT_GRAMS
        };

        if !weight_grams.is_finite() || weight_grams.abs() > ceiling {
            return Err(crate::scales::DecodeError::OutOfRange {
                grams: weight_grams,
                max: ceiling,
            });
        }

        Ok(Self {
            weight_grams,
            native_unit,
            raw_value,
            decimal_places,
            is_stable,
            battery_percent: battery_percent.map(|b| b.min(100)),
            captured_at,
        })
    }

    /// Same measurement with an externally derived stability verdict.
    pub fn with_stability(self, is_stable: bool) -> Self {
        Self { is_stable, ..self }
    }

    pub fn weight_grams(&self) -> f32 {
        self.weight_grams
    }

    pub fn native_unit(&self) -> WeightUnit {
        self.native_unit
    }

    pub fn raw_value(&self) -> f32 {
        self.raw_value
    }

    pub fn decimal_places(&self) -> u8 {
        self.decimal_places
    }

    pub fn is_stable(&self) -> bool {
        self.is_stable
    }

    pub fn battery_percent(&self) -> Option<u8> {
        self.battery_percent
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    Empty,
    Malformed(String),
}

impl std::fmt::Display for AddressError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            AddressError::Empty => write!(f, "Device address is empty"),
            AddressError::Malformed(raw) => {
                write!(f, "Not a 48-bit hardware address: {:?}", raw)
            }
        }
    }
}

impl std::error::Error for AddressError {}

/// Canonical `AA:BB:CC:DD:EE:FF` hardware address, the identity key of a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceAddress(String);

pub const REDACTED: &str = "**REDACTED**";

impl DeviceAddress {
    /// Accepts colon- or dash-delimited addresses and 12 bare hex digits, in any case.
    pub fn parse(raw: &str) -> Result<Self, AddressError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(AddressError::Empty);
        }

        let digits: String = trimmed
            .chars()
            .filter(|c| *c != ':' && *c != '-')
            .map(|c| c.to_ascii_uppercase())
            .collect();

        if digits.len() != 12 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(AddressError::Malformed(trimmed.to_string()));
        }

        let canonical = digits
            .as_bytes()
            .chunks(2)
            .map(|pair| std::str::from_utf8(pair).unwrap_or_default())
            .collect::<Vec<_>>()
            .join(":");

        Ok(Self(canonical))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Form used on every diagnostic or export surface.
    pub fn redacted(&self) -> &'static str {
        REDACTED
    }
}

impl std::fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for DeviceAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
