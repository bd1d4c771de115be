//! One configured scale, as seen by the host
//!
//! Wraps a [`ConnectionManager`] with setup, command helpers and the published views.

use crate::ble::BleTransport;
use crate::link::{ConnectionError, ConnectionManager};
use crate::scales::{ScaleCommand, ScaleFamily, ScaleProtocol};
use crate::system::config::{ConfigError, SessionConfig};
use crate::system::diagnostics::{ConnectionStats, Diagnostics, ScaleState};
use crate::system::events::{LinkEventChannel, UpdateSubscriber};
use crate::types::{Reading, WeightUnit};
use chrono::Utc;
use core::sync::atomic::{AtomicBool, Ordering};
use embassy_time::Instant;
use log::{error, info, warn};
use std::sync::Arc;

pub struct ScaleSession<T: BleTransport> {
    family: ScaleFamily,
    manager: ConnectionManager<T>,
    // last commanded switch positions
    precision_high: AtomicBool,
    timer_running: AtomicBool,
}

impl<T: BleTransport> ScaleSession<T> {
    pub fn new(config: &SessionConfig, transport: T) -> Result<Self, ConfigError> {
        let address = config.device_address()?;
        let manager = ConnectionManager::new(
            address,
            config.family.protocol(),
            config.policy(),
            transport,
        );

        Ok(Self {
            family: config.family,
            manager,
            precision_high: AtomicBool::new(false),
            timer_running: AtomicBool::new(false),
        })
    }

    pub fn family(&self) -> ScaleFamily {
        self.family
    }

    pub fn manager(&self) -> &ConnectionManager<T> {
        &self.manager
    }

    /// Resolves the device and makes a first connection attempt.
    ///
    /// Only an address that does not resolve fails setup; a failed first connection is
    /// logged and left to the advertisement-driven reconnects.
    pub async fn setup(&self) -> Result<(), ConnectionError> {
        info!("⚙️ Setting up {} scale {}", self.family, self.manager.address());

        if let Err(e) = self.manager.resolve_device().await {
            error!("❌ {} scale {}: {}", self.family, self.manager.address(), e);
            return Err(e);
        }

        if let Err(e) = self.manager.ensure_connected().await {
            warn!(
                "Initial connection to {} scale {} failed, waiting for it to advertise: {}",
                self.family,
                self.manager.address(),
                e
            );
        }
        Ok(())
    }

    pub async fn run(&self) {
        self.manager.run().await
    }

    /// Host finished starting; releases a reconnect held back until now.
    pub fn mark_ready(&self) {
        self.manager.mark_ready();
    }

    pub async fn shutdown(&self) {
        self.manager.shutdown().await
    }

    pub async fn command(&self, command: ScaleCommand) -> bool {
        let Some(byte) = self.family.protocol().encode_command(command) else {
            warn!("{} scales do not support {}", self.family, command.name());
            return false;
        };

        let sent = self.manager.send_command(byte).await;
        if sent {
            self.track_switches(command);
        }
        sent
    }

    fn track_switches(&self, command: ScaleCommand) {
        match command {
            ScaleCommand::StartTimer => self.timer_running.store(true, Ordering::Release),
            ScaleCommand::StopTimer | ScaleCommand::ResetTimer => {
                self.timer_running.store(false, Ordering::Release)
            }
            ScaleCommand::ToggleTimer => {
                self.timer_running.fetch_xor(true, Ordering::AcqRel);
            }
            ScaleCommand::TogglePrecision => {
                self.precision_high.fetch_xor(true, Ordering::AcqRel);
            }
            ScaleCommand::Tare | ScaleCommand::ToggleUnit => {}
        }
    }

    pub async fn tare(&self) -> bool {
        self.command(ScaleCommand::Tare).await
    }

    pub async fn toggle_unit(&self) -> bool {
        self.command(ScaleCommand::ToggleUnit).await
    }

    pub async fn start_timer(&self) -> bool {
        self.command(ScaleCommand::StartTimer).await
    }

    pub async fn stop_timer(&self) -> bool {
        self.command(ScaleCommand::StopTimer).await
    }

    pub async fn reset_timer(&self) -> bool {
        self.command(ScaleCommand::ResetTimer).await
    }

    pub async fn toggle_timer(&self) -> bool {
        self.command(ScaleCommand::ToggleTimer).await
    }

    pub async fn toggle_precision(&self) -> bool {
        self.command(ScaleCommand::TogglePrecision).await
    }

    /// Switches the scale to `unit` by toggling, but only when it shows something else.
    /// Only grams and ounces can be selected; with no reading yet the scale is taken to
    /// show grams.
    pub async fn select_unit(&self, unit: WeightUnit) -> bool {
        if !matches!(unit, WeightUnit::Grams | WeightUnit::Ounces) {
            warn!("Cannot select unit {} on {} scales", unit, self.family);
            return false;
        }

        let current = self
            .latest_reading()
            .map_or(WeightUnit::Grams, |r| r.native_unit());
        if current == unit {
            return true;
        }
        self.toggle_unit().await
    }

    pub async fn set_precision_mode(&self, high: bool) -> bool {
        if self.precision_high() == high {
            return true;
        }
        self.toggle_precision().await
    }

    pub async fn set_timer(&self, running: bool) -> bool {
        if running {
            self.start_timer().await
        } else {
            self.stop_timer().await
        }
    }

    pub fn precision_high(&self) -> bool {
        self.precision_high.load(Ordering::Acquire)
    }

    pub fn timer_running(&self) -> bool {
        self.timer_running.load(Ordering::Acquire)
    }

    pub fn latest_reading(&self) -> Option<Reading> {
        self.manager.latest_reading()
    }

    pub fn snapshot(&self) -> Option<ScaleState> {
        self.latest_reading()
            .map(|reading| ScaleState::from_reading(&reading, self.family.variant()))
    }

    pub fn connection_stats(&self) -> ConnectionStats {
        ConnectionStats::from_stats(&self.manager.stats(), Instant::now(), Utc::now())
    }

    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics::new(
            self.manager.address(),
            self.family,
            self.manager.connection_state(),
            self.manager.is_notifying(),
            self.connection_stats(),
            self.snapshot(),
        )
    }

    pub fn subscribe(&self) -> Result<UpdateSubscriber<'_>, embassy_sync::pubsub::Error> {
        self.manager.subscribe()
    }

    pub fn events(&self) -> Arc<LinkEventChannel> {
        self.manager.events()
    }
}
