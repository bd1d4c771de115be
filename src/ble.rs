//! Boundary to the host's BLE stack
//!
//! Scanning, GATT and connection-slot management belong to the host. The connection
//! manager only needs the handful of operations in [`BleTransport`].

use crate::types::DeviceAddress;
use embassy_time::Duration;
use uuid::Uuid;

/// Bounds handed to the transport for one connect call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    pub timeout: Duration,
    pub max_attempts: u8,
}

impl ConnectOptions {
    /// Upper bound for the whole call, every attempt included.
    pub fn deadline(&self) -> Duration {
        self.timeout * self.max_attempts.max(1) as u32
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    ConnectionFailed(String),
    Timeout,
    NotConnected,
    OperationFailed(String),
}

impl std::fmt::Display for BleError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            BleError::ConnectionFailed(msg) => write!(f, "Connection failed: {}", msg),
            BleError::Timeout => write!(f, "Connection attempt timed out"),
            BleError::NotConnected => write!(f, "Not connected"),
            BleError::OperationFailed(msg) => write!(f, "GATT operation failed: {}", msg),
        }
    }
}

impl std::error::Error for BleError {}

/// Whether a failure is part of a scale's normal life (sleeping, out of range, slots
/// exhausted) or something worth an error-level log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Expected,
    Unexpected,
}

/// Message fragments of transient transport failures, matched case-insensitively.
pub const EXPECTED_ERROR_PHRASES: &[&str] = &[
    "no backend with an available connection slot",
    "device is no longer reachable",
    "out of connection slots",
    "device disconnected",
    "not connected",
];

pub fn classify_message(message: &str) -> ErrorClass {
    let message = message.to_lowercase();
    if EXPECTED_ERROR_PHRASES
        .iter()
        .any(|phrase| message.contains(phrase))
    {
        ErrorClass::Expected
    } else {
        ErrorClass::Unexpected
    }
}

pub fn classify(error: &BleError) -> ErrorClass {
    classify_message(&error.to_string())
}

/// Operations the host BLE stack provides for one scale.
///
/// `Device` is the resolved handle for an address, `Link` an established connection.
/// None of the calls retry on their own beyond what `ConnectOptions` allows.
pub trait BleTransport {
    type Device: Clone;
    type Link: Clone;

    async fn resolve(&self, address: &DeviceAddress) -> Option<Self::Device>;

    async fn connect(
        &self,
        device: &Self::Device,
        options: &ConnectOptions,
    ) -> Result<Self::Link, BleError>;

    async fn start_notify(&self, link: &Self::Link, characteristic: Uuid) -> Result<(), BleError>;

    async fn stop_notify(&self, link: &Self::Link, characteristic: Uuid) -> Result<(), BleError>;

    async fn write(
        &self,
        link: &Self::Link,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), BleError>;

    async fn disconnect(&self, link: &Self::Link) -> Result<(), BleError>;

    /// Ask the host to deliver the next advertisement from `address` again, even if it
    /// looks identical to the last one.
    fn rearm_advertisements(&self, address: &DeviceAddress);
}
