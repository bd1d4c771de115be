//! Serializable views of a session for hosts and diagnostics dumps
//!
//! The device address never appears here in cleartext.

use crate::link::{ConnectionState, LinkStats};
use crate::scales::{ProtocolVariant, ScaleFamily};
use crate::types::{DeviceAddress, Reading, WeightUnit};
use chrono::{DateTime, Utc};
use embassy_time::Instant;
use serde::Serialize;

/// Maps a monotonic instant onto wall-clock time, given a pair of "now" readings.
pub fn wall_clock_at(at: Instant, now: Instant, now_utc: DateTime<Utc>) -> DateTime<Utc> {
    match now.checked_duration_since(at) {
        Some(elapsed) => now_utc - chrono::Duration::milliseconds(elapsed.as_millis() as i64),
        None => now_utc,
    }
}

pub fn wall_clock(at: Instant) -> DateTime<Utc> {
    wall_clock_at(at, Instant::now(), Utc::now())
}

/// Latest measurement as published to consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScaleState {
    /// Rounded to the family's display precision.
    pub weight_grams: f32,
    pub native_unit: WeightUnit,
    pub raw_value: f32,
    pub decimal_places: u8,
    pub is_stable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_percent: Option<u8>,
    pub last_measurement: DateTime<Utc>,
}

impl ScaleState {
    pub fn from_reading(reading: &Reading, variant: &ProtocolVariant) -> Self {
        Self::from_reading_at(reading, variant, wall_clock(reading.captured_at()))
    }

    pub fn from_reading_at(
        reading: &Reading,
        variant: &ProtocolVariant,
        last_measurement: DateTime<Utc>,
    ) -> Self {
        Self {
            weight_grams: variant.display_weight(reading.weight_grams()),
            native_unit: reading.native_unit(),
            raw_value: reading.raw_value(),
            decimal_places: reading.decimal_places(),
            is_stable: reading.is_stable(),
            battery_percent: reading.battery_percent(),
            last_measurement,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStats {
    pub connection_attempts: u32,
    pub total_disconnections: u32,
    pub last_successful_connection: Option<DateTime<Utc>>,
    /// Seconds since the current link came up, `None` while disconnected.
    pub current_connection_duration: Option<f64>,
}

impl ConnectionStats {
    pub fn from_stats(stats: &LinkStats, now: Instant, now_utc: DateTime<Utc>) -> Self {
        Self {
            connection_attempts: stats.attempts,
            total_disconnections: stats.total_disconnections,
            last_successful_connection: stats
                .last_success
                .map(|at| wall_clock_at(at, now, now_utc)),
            current_connection_duration: stats
                .connected_since
                .and_then(|since| now.checked_duration_since(since))
                .map(|d| d.as_millis() as f64 / 1000.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostics {
    pub address: &'static str,
    pub family: ScaleFamily,
    pub brand: &'static str,
    pub connection_state: ConnectionState,
    pub notifying: bool,
    pub connection: ConnectionStats,
    pub data: Option<ScaleState>,
}

impl Diagnostics {
    pub fn new(
        address: &DeviceAddress,
        family: ScaleFamily,
        connection_state: ConnectionState,
        notifying: bool,
        connection: ConnectionStats,
        data: Option<ScaleState>,
    ) -> Self {
        Self {
            address: address.redacted(),
            family,
            brand: family.variant().brand,
            connection_state,
            notifying,
            connection,
            data,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
