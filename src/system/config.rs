//! Session configuration and per-family connection policy

use crate::scales::ScaleFamily;
use crate::types::{AddressError, DeviceAddress};
use embassy_time::Duration;
use serde::{Deserialize, Serialize};

/// How aggressively a session keeps its scale connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkPolicy {
    pub connect_timeout_ms: u64,
    pub max_connect_attempts: u8,
    /// Minimum spacing of advertisement-triggered attempts, 0 disables throttling.
    pub reconnect_interval_ms: u64,
    /// A new reconnect request cancels the attempt already in flight.
    pub supersede_in_flight: bool,
    /// The first reconnect waits until the host reports it is ready.
    pub readiness_gated: bool,
    pub rearm_on_disconnect: bool,
    pub reset_log_gate_on_disconnect: bool,
    pub clear_reading_on_disconnect: bool,
}

impl LinkPolicy {
    pub const CHIPSEA: LinkPolicy = LinkPolicy {
        connect_timeout_ms: 15_000,
        max_connect_attempts: 2,
        reconnect_interval_ms: 5_000,
        supersede_in_flight: false,
        readiness_gated: false,
        rearm_on_disconnect: false,
        reset_log_gate_on_disconnect: false,
        clear_reading_on_disconnect: false,
    };

    pub const FELICITA: LinkPolicy = LinkPolicy {
        connect_timeout_ms: 10_000,
        max_connect_attempts: 3,
        reconnect_interval_ms: 0,
        supersede_in_flight: true,
        readiness_gated: true,
        rearm_on_disconnect: true,
        reset_log_gate_on_disconnect: true,
        clear_reading_on_disconnect: true,
    };

    pub const fn for_family(family: ScaleFamily) -> Self {
        match family {
            ScaleFamily::Chipsea => Self::CHIPSEA,
            ScaleFamily::Felicita => Self::FELICITA,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_interval(&self) -> Option<Duration> {
        (self.reconnect_interval_ms > 0).then(|| Duration::from_millis(self.reconnect_interval_ms))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    Parse(String),
    Address(AddressError),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ConfigError::Parse(msg) => write!(f, "Invalid session configuration: {}", msg),
            ConfigError::Address(e) => write!(f, "Invalid session configuration: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<AddressError> for ConfigError {
    fn from(e: AddressError) -> Self {
        ConfigError::Address(e)
    }
}

/// One configured scale: which device, which protocol, and optionally a policy override.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub address: String,
    pub family: ScaleFamily,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<LinkPolicy>,
}

impl SessionConfig {
    pub fn new(address: impl Into<String>, family: ScaleFamily) -> Self {
        Self {
            address: address.into(),
            family,
            link: None,
        }
    }

    pub fn with_policy(mut self, policy: LinkPolicy) -> Self {
        self.link = Some(policy);
        self
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        // reject a bad address at load time rather than at setup
        config.device_address()?;
        Ok(config)
    }

    pub fn device_address(&self) -> Result<DeviceAddress, ConfigError> {
        Ok(DeviceAddress::parse(&self.address)?)
    }

    pub fn policy(&self) -> LinkPolicy {
        self.link.unwrap_or(LinkPolicy::for_family(self.family))
    }
}
