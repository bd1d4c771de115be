//! Per-address connection manager
//!
//! Owns the link to one scale: serializes connect attempts behind an async lock, turns
//! advertisements into (possibly throttled) reconnects, decodes notifications and
//! publishes the results. Every mutable field lives in one [`LinkState`] behind a
//! blocking mutex that is never held across an await.

use crate::ble::{classify, BleError, BleTransport, ConnectOptions, ErrorClass};
use crate::link::machine::{ConnectionState, LinkInput, LinkStateMachine, LinkStats};
use crate::link::readiness::Readiness;
use crate::scales::{DecodeError, ScaleProtocol, StabilityEngine, StabilitySource};
use crate::system::config::LinkPolicy;
use crate::system::events::{LinkEvent, LinkEventChannel, ScaleUpdate, UpdateBus, UpdateSubscriber};
use crate::types::{DeviceAddress, Reading};
use core::cell::RefCell;
use embassy_futures::select::{select, select4, Either};
use embassy_sync::{
    blocking_mutex::{raw::CriticalSectionRawMutex, Mutex as BlockingMutex},
    mutex::Mutex,
    signal::Signal,
};
use embassy_time::{with_timeout, Instant};
use log::{debug, error, info, warn};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionError {
    /// The address does not resolve to anything the transport can connect to.
    DeviceNotFound,
    ShuttingDown,
    Ble(BleError),
}

impl ConnectionError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ConnectionError::DeviceNotFound | ConnectionError::ShuttingDown => ErrorClass::Expected,
            ConnectionError::Ble(e) => classify(e),
        }
    }
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ConnectionError::DeviceNotFound => write!(f, "Device not found by address"),
            ConnectionError::ShuttingDown => write!(f, "Connection manager is shutting down"),
            ConnectionError::Ble(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<BleError> for ConnectionError {
    fn from(e: BleError) -> Self {
        ConnectionError::Ble(e)
    }
}

/// What [`ConnectionManager::handle_advertisement`] did with an advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvertisementOutcome {
    /// Already connected or shutting down.
    Ignored,
    Throttled,
    /// Held back until the host reports ready.
    Deferred,
    Scheduled,
}

struct LinkState<T: BleTransport> {
    machine: LinkStateMachine,
    device: Option<T::Device>,
    link: Option<T::Link>,
    notifying: bool,
    unavailable_logged: bool,
    last_advertisement_attempt: Option<Instant>,
    latest: Option<Reading>,
    stability: Option<StabilityEngine>,
}

pub struct ConnectionManager<T: BleTransport> {
    address: DeviceAddress,
    protocol: &'static dyn ScaleProtocol,
    policy: LinkPolicy,
    transport: T,
    connect_lock: Mutex<CriticalSectionRawMutex, ()>,
    state: BlockingMutex<CriticalSectionRawMutex, RefCell<LinkState<T>>>,
    reconnect: Signal<CriticalSectionRawMutex, ()>,
    /// Raised when a dropped attempt leaves an open link behind.
    abandoned: Signal<CriticalSectionRawMutex, ()>,
    stopped: Signal<CriticalSectionRawMutex, ()>,
    events: Arc<LinkEventChannel>,
    updates: UpdateBus,
    readiness: Readiness,
}

/// Puts the machine back to `Disconnected` if the attempt is dropped mid-flight. A link
/// the transport already opened stays in [`LinkState`] and is flagged for release.
struct AttemptGuard<'a, T: BleTransport> {
    manager: &'a ConnectionManager<T>,
}

impl<T: BleTransport> Drop for AttemptGuard<'_, T> {
    fn drop(&mut self) {
        let stranded = self.manager.with_state(|s| {
            if s.machine.state() != ConnectionState::Connecting {
                return false;
            }
            debug!("Connection attempt abandoned");
            s.machine.handle(LinkInput::ConnectAborted);
            s.link.is_some()
        });
        if stranded {
            self.manager.abandoned.signal(());
        }
    }
}

impl<T: BleTransport> ConnectionManager<T> {
    pub fn new(
        address: DeviceAddress,
        protocol: &'static dyn ScaleProtocol,
        policy: LinkPolicy,
        transport: T,
    ) -> Self {
        let stability = match protocol.variant().stability {
            StabilitySource::Derived => Some(StabilityEngine::new()),
            StabilitySource::InPacket => None,
        };
        let readiness = if policy.readiness_gated {
            Readiness::gated()
        } else {
            Readiness::open()
        };

        Self {
            address,
            protocol,
            policy,
            transport,
            connect_lock: Mutex::new(()),
            state: BlockingMutex::new(RefCell::new(LinkState {
                machine: LinkStateMachine::new(),
                device: None,
                link: None,
                notifying: false,
                unavailable_logged: false,
                last_advertisement_attempt: None,
                latest: None,
                stability,
            })),
            reconnect: Signal::new(),
            abandoned: Signal::new(),
            stopped: Signal::new(),
            events: Arc::new(LinkEventChannel::new()),
            updates: UpdateBus::new(),
            readiness,
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut LinkState<T>) -> R) -> R {
        self.state.lock(|cell| f(&mut cell.borrow_mut()))
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    pub fn protocol(&self) -> &'static dyn ScaleProtocol {
        self.protocol
    }

    pub fn policy(&self) -> &LinkPolicy {
        &self.policy
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.with_state(|s| s.machine.state())
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    pub fn is_notifying(&self) -> bool {
        self.with_state(|s| s.notifying)
    }

    pub fn stats(&self) -> LinkStats {
        self.with_state(|s| s.machine.stats())
    }

    pub fn latest_reading(&self) -> Option<Reading> {
        self.with_state(|s| s.latest)
    }

    /// Sender side for host callbacks.
    pub fn events(&self) -> Arc<LinkEventChannel> {
        Arc::clone(&self.events)
    }

    pub fn subscribe(&self) -> Result<UpdateSubscriber<'_>, embassy_sync::pubsub::Error> {
        self.updates.subscribe()
    }

    pub fn mark_ready(&self) {
        self.readiness.mark_ready();
    }

    /// Resolves the address to a transport handle and caches it.
    pub async fn resolve_device(&self) -> Result<T::Device, ConnectionError> {
        if let Some(device) = self.with_state(|s| s.device.clone()) {
            return Ok(device);
        }

        match self.transport.resolve(&self.address).await {
            Some(device) => {
                self.with_state(|s| s.device = Some(device.clone()));
                Ok(device)
            }
            None => Err(ConnectionError::DeviceNotFound),
        }
    }

    /// Connects unless already connected. At most one attempt runs at a time; callers
    /// arriving while one is in flight wait for it and then see its result.
    pub async fn ensure_connected(&self) -> Result<(), ConnectionError> {
        let _lock = self.connect_lock.lock().await;

        match self.connection_state() {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::ShuttingDown => return Err(ConnectionError::ShuttingDown),
            _ => {}
        }
        self.release_stale_link().await;

        let device = match self.resolve_device().await {
            Ok(device) => device,
            Err(e) => {
                self.with_state(|s| s.machine.handle(LinkInput::ConnectAborted));
                self.report_unavailable(&e);
                return Err(e);
            }
        };

        let attempt = self.with_state(|s| {
            s.machine.handle(LinkInput::ConnectStarted);
            s.machine.stats().attempts
        });
        let _guard = AttemptGuard { manager: self };

        let options = ConnectOptions {
            timeout: self.policy.connect_timeout(),
            max_attempts: self.policy.max_connect_attempts,
        };
        debug!(
            "Connecting to {} scale {} (attempt {}, timeout {}ms x{})",
            self.protocol.variant().brand,
            self.address,
            attempt,
            options.timeout.as_millis(),
            options.max_attempts
        );

        match self.open_link(&device, &options).await {
            Ok(link) => self.on_connected(link, attempt).await,
            Err(e) => {
                self.with_state(|s| s.machine.handle(LinkInput::ConnectFailed));
                self.report_unavailable(&e);
                Err(e)
            }
        }
    }

    async fn open_link(
        &self,
        device: &T::Device,
        options: &ConnectOptions,
    ) -> Result<T::Link, ConnectionError> {
        let link = match with_timeout(options.deadline(), self.transport.connect(device, options)).await {
            Ok(result) => result?,
            Err(_) => return Err(BleError::Timeout.into()),
        };

        // tracked from here on so a cancelled attempt cannot leak it
        self.with_state(|s| s.link = Some(link.clone()));

        let characteristic = self.protocol.variant().characteristic_uuid;
        if let Err(e) = self.transport.start_notify(&link, characteristic).await {
            self.with_state(|s| s.link = None);
            if let Err(e) = self.transport.disconnect(&link).await {
                debug!("Disconnect after failed subscribe also failed: {}", e);
            }
            return Err(e.into());
        }

        Ok(link)
    }

    async fn on_connected(&self, link: T::Link, attempt: u32) -> Result<(), ConnectionError> {
        let accepted = self.with_state(|s| {
            if s.machine.state() == ConnectionState::ShuttingDown {
                // still held means shutdown ran before the link was tracked
                return Err(s.link.take());
            }
            s.link = Some(link);
            s.notifying = true;
            s.machine.handle(LinkInput::ConnectSucceeded { at: Instant::now() });
            Ok(core::mem::replace(&mut s.unavailable_logged, false))
        });

        let was_unavailable = match accepted {
            Ok(was_unavailable) => was_unavailable,
            Err(leftover) => {
                if let Some(link) = leftover {
                    if let Err(e) = self.transport.disconnect(&link).await {
                        debug!("Disconnect during shutdown failed: {}", e);
                    }
                }
                return Err(ConnectionError::ShuttingDown);
            }
        };

        let brand = self.protocol.variant().brand;
        if was_unavailable {
            info!("✅ {} scale {} is back online", brand, self.address);
        } else {
            info!(
                "✅ Successfully connected to {} scale {} (attempt {})",
                brand, self.address, attempt
            );
        }
        self.updates.publish(ScaleUpdate::Connected);
        Ok(())
    }

    /// Disconnects a link an abandoned attempt left open. Callers hold `connect_lock`, so
    /// any link present outside `Connected` belongs to no live attempt.
    async fn release_stale_link(&self) {
        let stale = self.with_state(|s| match s.machine.state() {
            ConnectionState::Connected => None,
            _ => s.link.take(),
        });

        if let Some(link) = stale {
            debug!("Releasing link left open by an abandoned attempt to {}", self.address);
            if let Err(e) = self.transport.disconnect(&link).await {
                warn!("Failed to release abandoned link to {}: {}", self.address, e);
            }
        }
    }

    // One line per unavailability episode, at info for expected errors and error otherwise
    fn report_unavailable(&self, err: &ConnectionError) {
        let first = self.with_state(|s| !core::mem::replace(&mut s.unavailable_logged, true));
        if !first {
            debug!("{} scale {} still unavailable: {}", self.protocol.variant().brand, self.address, err);
            return;
        }

        match err.class() {
            ErrorClass::Expected => info!(
                "{} scale {} is unavailable: {}",
                self.protocol.variant().brand,
                self.address,
                err
            ),
            ErrorClass::Unexpected => error!(
                "❌ Unexpected error connecting to {} scale {}: {}",
                self.protocol.variant().brand,
                self.address,
                err
            ),
        }
    }

    /// Reacts to the scale advertising. Never blocks on a connection attempt; accepted
    /// advertisements only schedule one for [`run`](Self::run) to perform.
    pub fn handle_advertisement(&self, seen_at: Instant) -> AdvertisementOutcome {
        match self.connection_state() {
            ConnectionState::Connected | ConnectionState::ShuttingDown => {
                return AdvertisementOutcome::Ignored
            }
            _ => {}
        }

        if self.policy.readiness_gated && !self.readiness.is_ready() {
            if self.readiness.defer() {
                debug!("Host not ready, deferring reconnection to {}", self.address);
            }
            return AdvertisementOutcome::Deferred;
        }

        if let Some(interval) = self.policy.reconnect_interval() {
            let throttled = self.with_state(|s| {
                let recent = s.last_advertisement_attempt.map_or(false, |last| {
                    seen_at
                        .checked_duration_since(last)
                        .map_or(true, |elapsed| elapsed < interval)
                });
                if !recent {
                    s.last_advertisement_attempt = Some(seen_at);
                }
                recent
            });
            if throttled {
                debug!("Reconnection to {} throttled", self.address);
                return AdvertisementOutcome::Throttled;
            }
        }

        self.schedule_reconnect();
        AdvertisementOutcome::Scheduled
    }

    fn schedule_reconnect(&self) {
        self.with_state(|s| s.machine.handle(LinkInput::ReconnectScheduled));
        self.reconnect.signal(());
    }

    /// Transport reported the link gone.
    pub fn handle_disconnect(&self) {
        let policy = self.policy;
        let previous = self.with_state(|s| {
            let previous = s.machine.state();
            s.link = None;
            s.device = None;
            s.notifying = false;
            if let Some(engine) = s.stability.as_mut() {
                engine.reset();
            }
            if policy.clear_reading_on_disconnect {
                s.latest = None;
            }
            if policy.reset_log_gate_on_disconnect {
                s.unavailable_logged = false;
            }
            s.machine.handle(LinkInput::TransportDisconnected);
            previous
        });

        if previous == ConnectionState::ShuttingDown {
            return;
        }
        info!("🔌 {} scale {} disconnected", self.protocol.variant().brand, self.address);

        if policy.rearm_on_disconnect {
            self.transport.rearm_advertisements(&self.address);
        }
        self.updates.publish(ScaleUpdate::Stale);
    }

    /// Decodes one notification; undecodable packets are dropped and the previous
    /// reading stays current.
    pub fn handle_notification(&self, packet: &[u8]) -> Option<Reading> {
        debug!("Raw notification: {:02X?}", packet);

        let reading = match self.protocol.decode(packet) {
            Ok(reading) => reading,
            Err(e @ DecodeError::OutOfRange { .. }) => {
                warn!("⚠️ Dropping {} packet: {}", self.protocol.variant().brand, e);
                return None;
            }
            Err(e) => {
                debug!("Dropping {} packet: {}", self.protocol.variant().brand, e);
                return None;
            }
        };

        let reading = self.with_state(|s| {
            let reading = match s.stability.as_mut() {
                Some(engine) => reading.with_stability(engine.update(reading.weight_grams())),
                None => reading,
            };
            s.latest = Some(reading);
            reading
        });

        self.updates.publish(ScaleUpdate::Reading(reading));
        Some(reading)
    }

    /// Writes one command byte, connecting first if needed. No retries.
    pub async fn send_command(&self, byte: u8) -> bool {
        if !self.protocol.variant().accepts_commands() {
            warn!("{} scales do not accept commands", self.protocol.variant().brand);
            return false;
        }

        if let Err(e) = self.ensure_connected().await {
            warn!("Cannot send command 0x{:02X}: {}", byte, e);
            return false;
        }

        let Some(link) = self.with_state(|s| s.link.clone()) else {
            warn!("Cannot send command 0x{:02X}: link lost", byte);
            return false;
        };

        let characteristic = self.protocol.variant().characteristic_uuid;
        match self.transport.write(&link, characteristic, &[byte]).await {
            Ok(()) => {
                debug!("Sent command 0x{:02X}", byte);
                true
            }
            Err(e) => {
                error!("❌ Failed to send command 0x{:02X}: {}", byte, e);
                false
            }
        }
    }

    /// Cancels pending reconnection, unsubscribes and disconnects. Idempotent.
    pub async fn shutdown(&self) {
        let teardown = self.with_state(|s| {
            if s.machine.state() == ConnectionState::ShuttingDown {
                return None;
            }
            s.machine.handle(LinkInput::Shutdown);
            s.device = None;
            let notifying = core::mem::take(&mut s.notifying);
            Some((s.link.take(), notifying))
        });

        let Some((link, notifying)) = teardown else {
            debug!("Shutdown already in progress for {}", self.address);
            return;
        };

        self.reconnect.reset();
        self.stopped.signal(());

        if let Some(link) = link {
            if notifying {
                let characteristic = self.protocol.variant().characteristic_uuid;
                if let Err(e) = self.transport.stop_notify(&link, characteristic).await {
                    debug!("Failed to stop notifications: {}", e);
                }
            }
            if let Err(e) = self.transport.disconnect(&link).await {
                warn!("Disconnect during shutdown failed: {}", e);
            }
        }
        info!("🛑 Connection manager for {} stopped", self.address);
    }

    /// Runs one scheduled reconnect, if any.
    pub async fn poll_reconnect(&self) -> Option<Result<(), ConnectionError>> {
        self.reconnect.try_take()?;
        Some(self.ensure_connected().await)
    }

    async fn attempt_reconnect(&self) {
        if let Err(e) = self.ensure_connected().await {
            debug!("Reconnection to {} failed: {}", self.address, e);
        }
    }

    async fn reconnect_loop(&self) {
        loop {
            if let Either::Second(()) = select(self.reconnect.wait(), self.abandoned.wait()).await {
                let _lock = self.connect_lock.lock().await;
                self.release_stale_link().await;
                continue;
            }
            if !self.policy.supersede_in_flight {
                self.attempt_reconnect().await;
                continue;
            }
            // a fresh request cancels the attempt in flight and starts over
            while let Either::Second(()) = select(self.attempt_reconnect(), self.reconnect.wait()).await {
                debug!("Superseding in-flight reconnection to {}", self.address);
            }
        }
    }

    async fn readiness_loop(&self) {
        loop {
            self.readiness.released().await;
            if !matches!(
                self.connection_state(),
                ConnectionState::Connected | ConnectionState::ShuttingDown
            ) {
                info!("Host ready, running deferred reconnection to {}", self.address);
                self.schedule_reconnect();
            }
        }
    }

    async fn event_loop(&self) {
        loop {
            match self.events.receive().await {
                LinkEvent::Advertisement { seen_at } => {
                    self.handle_advertisement(seen_at);
                }
                LinkEvent::Disconnected => self.handle_disconnect(),
                LinkEvent::Notification(packet) => {
                    self.handle_notification(&packet);
                }
            }
        }
    }

    /// Drives host events, reconnects and the readiness gate until [`shutdown`](Self::shutdown).
    pub async fn run(&self) {
        info!(
            "🚀 Managing {} scale {}",
            self.protocol.variant().brand,
            self.address
        );
        select4(
            self.reconnect_loop(),
            self.readiness_loop(),
            self.event_loop(),
            self.stopped.wait(),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::mock::{ConnectOutcome, MockLink, MockTransport};
    use crate::scales::{ChipseaProtocol, ScaleFamily};
    use embassy_futures::{block_on, join::join_array};
    use embassy_time::{Duration, Timer};
    use std::sync::atomic::Ordering;

    const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

    thread_local! {
        static LOUD_LINES: core::cell::Cell<usize> = const { core::cell::Cell::new(0) };
    }

    /// Counts info-or-louder records per test thread.
    struct CountingLogger;

    impl log::Log for CountingLogger {
        fn enabled(&self, _metadata: &log::Metadata) -> bool {
            true
        }

        fn log(&self, record: &log::Record) {
            if record.level() <= log::Level::Info {
                LOUD_LINES.with(|n| n.set(n.get() + 1));
            }
        }

        fn flush(&self) {}
    }

    static LOGGER: CountingLogger = CountingLogger;

    fn loud_lines() -> usize {
        static INSTALL: std::sync::Once = std::sync::Once::new();
        INSTALL.call_once(|| {
            if log::set_logger(&LOGGER).is_ok() {
                log::set_max_level(log::LevelFilter::Trace);
            }
        });
        LOUD_LINES.with(|n| n.get())
    }

    fn manager(family: ScaleFamily, transport: MockTransport) -> ConnectionManager<MockTransport> {
        ConnectionManager::new(
            DeviceAddress::parse(ADDRESS).unwrap(),
            family.protocol(),
            LinkPolicy::for_family(family),
            transport,
        )
    }

    fn felicita_packet(weight: &[u8; 6]) -> [u8; 18] {
        let mut data = [0u8; 18];
        data[3..9].copy_from_slice(weight);
        data[9..11].copy_from_slice(b"g ");
        data[15] = 145;
        data
    }

    #[test]
    fn test_connect_and_reuse() {
        let m = manager(ScaleFamily::Chipsea, MockTransport::succeeding());
        block_on(async {
            assert_eq!(m.ensure_connected().await, Ok(()));
            assert_eq!(m.ensure_connected().await, Ok(()));
        });

        assert!(m.is_connected());
        assert!(m.is_notifying());
        assert_eq!(m.transport().connects(), 1);
        assert_eq!(m.stats().attempts, 1);
        assert!(m.stats().last_success.is_some());
    }

    #[test]
    fn test_concurrent_callers_share_one_attempt() {
        let m = manager(ScaleFamily::Felicita, MockTransport::succeeding());
        let results = block_on(join_array([
            m.ensure_connected(),
            m.ensure_connected(),
            m.ensure_connected(),
            m.ensure_connected(),
            m.ensure_connected(),
        ]));

        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(m.transport().connects(), 1);
    }

    #[test]
    fn test_failure_is_typed_and_not_retried() {
        let m = manager(
            ScaleFamily::Chipsea,
            MockTransport::failing("Device is no longer reachable"),
        );
        let result = block_on(m.ensure_connected());

        let err = result.unwrap_err();
        assert!(matches!(err, ConnectionError::Ble(BleError::ConnectionFailed(_))));
        assert_eq!(err.class(), ErrorClass::Expected);
        assert_eq!(m.transport().connects(), 1);
        assert_eq!(m.connection_state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_unresolvable_address() {
        let transport = MockTransport::succeeding();
        transport.resolvable.store(false, Ordering::SeqCst);
        let m = manager(ScaleFamily::Chipsea, transport);

        assert_eq!(block_on(m.ensure_connected()), Err(ConnectionError::DeviceNotFound));
        assert_eq!(m.transport().connects(), 0);
        assert_eq!(m.connection_state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_unavailable_logged_once_per_episode() {
        let transport = MockTransport::failing("out of connection slots");
        let m = manager(ScaleFamily::Chipsea, transport);

        block_on(async {
            let _ = m.ensure_connected().await;
            assert!(m.with_state(|s| s.unavailable_logged));
            let _ = m.ensure_connected().await;
            assert!(m.with_state(|s| s.unavailable_logged));

            m.transport().set_fallback(ConnectOutcome::Succeed);
            m.ensure_connected().await.unwrap();
        });
        assert!(!m.with_state(|s| s.unavailable_logged));
    }

    #[test]
    fn test_subscribe_failure_disconnects() {
        let transport = MockTransport::succeeding();
        transport.fail_notify.store(true, Ordering::SeqCst);
        let m = manager(ScaleFamily::Felicita, transport);

        assert!(block_on(m.ensure_connected()).is_err());
        assert_eq!(m.transport().disconnects(), 1);
        assert!(!m.is_notifying());
        assert_eq!(m.connection_state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_connect_timeout() {
        let transport = MockTransport::new(ConnectOutcome::Hang);
        let mut policy = LinkPolicy::CHIPSEA;
        policy.connect_timeout_ms = 20;
        policy.max_connect_attempts = 1;
        let m = ConnectionManager::new(
            DeviceAddress::parse(ADDRESS).unwrap(),
            &ChipseaProtocol,
            policy,
            transport,
        );

        assert_eq!(
            block_on(m.ensure_connected()),
            Err(ConnectionError::Ble(BleError::Timeout))
        );
        assert_eq!(m.connection_state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_cancelled_attempt_releases_lock_and_state() {
        let m = manager(
            ScaleFamily::Felicita,
            MockTransport::new(ConnectOutcome::Hang).script([ConnectOutcome::Hang]),
        );

        block_on(async {
            let outcome = select(m.ensure_connected(), Timer::after(Duration::from_millis(20))).await;
            assert!(matches!(outcome, Either::Second(())));
        });
        assert_eq!(m.connection_state(), ConnectionState::Disconnected);

        m.transport().set_fallback(ConnectOutcome::Succeed);
        assert_eq!(block_on(m.ensure_connected()), Ok(()));
        assert_eq!(m.transport().connects(), 2);
    }

    #[test]
    fn test_abandoned_link_released_by_next_attempt() {
        let transport = MockTransport::succeeding();
        transport.hang_notify.store(true, Ordering::SeqCst);
        let m = manager(ScaleFamily::Felicita, transport);

        block_on(async {
            let outcome = select(m.ensure_connected(), Timer::after(Duration::from_millis(20))).await;
            assert!(matches!(outcome, Either::Second(())));
        });
        assert_eq!(m.connection_state(), ConnectionState::Disconnected);
        assert!(m.with_state(|s| s.link.is_some()));

        m.transport().hang_notify.store(false, Ordering::SeqCst);
        assert_eq!(block_on(m.ensure_connected()), Ok(()));
        assert_eq!(m.transport().connects(), 2);
        assert_eq!(m.transport().disconnects(), 1);
        assert_eq!(m.with_state(|s| s.link.clone()), Some(MockLink(2)));
    }

    #[test]
    fn test_run_releases_abandoned_link() {
        let transport = MockTransport::succeeding();
        transport.hang_notify.store(true, Ordering::SeqCst);
        let m = manager(ScaleFamily::Chipsea, transport);

        block_on(async {
            let outcome = select(m.ensure_connected(), Timer::after(Duration::from_millis(20))).await;
            assert!(matches!(outcome, Either::Second(())));

            let drive = async {
                for _ in 0..50 {
                    if m.transport().disconnects() == 1 {
                        break;
                    }
                    Timer::after(Duration::from_millis(1)).await;
                }
                assert!(m.with_state(|s| s.link.is_none()));
                m.shutdown().await;
            };
            select(m.run(), drive).await;
        });

        assert_eq!(m.transport().connects(), 1);
        assert_eq!(m.transport().disconnects(), 1);
    }

    #[test]
    fn test_shutdown_during_subscribe_disconnects() {
        let transport = MockTransport::succeeding();
        transport.hang_notify.store(true, Ordering::SeqCst);
        let m = manager(ScaleFamily::Chipsea, transport);
        m.handle_advertisement(Instant::now());

        block_on(async {
            let drive = async {
                for _ in 0..50 {
                    if m.with_state(|s| s.link.is_some()) {
                        break;
                    }
                    Timer::after(Duration::from_millis(1)).await;
                }
                m.shutdown().await;
            };
            select(m.run(), drive).await;
        });

        assert_eq!(m.transport().connects(), 1);
        assert_eq!(m.transport().disconnects(), 1);
        assert!(!m.is_notifying());
        assert_eq!(m.connection_state(), ConnectionState::ShuttingDown);
    }

    #[test]
    fn test_felicita_advertisement_supersedes_attempt() {
        let m = manager(
            ScaleFamily::Felicita,
            MockTransport::succeeding().script([ConnectOutcome::Hang]),
        );
        m.mark_ready();
        let events = m.events();

        block_on(async {
            let drive = async {
                events.send(LinkEvent::Advertisement { seen_at: Instant::now() }).await;
                for _ in 0..50 {
                    if m.transport().connects() == 1 {
                        break;
                    }
                    Timer::after(Duration::from_millis(1)).await;
                }
                assert_eq!(m.connection_state(), ConnectionState::Connecting);

                events.send(LinkEvent::Advertisement { seen_at: Instant::now() }).await;
                for _ in 0..50 {
                    if m.is_connected() {
                        break;
                    }
                    Timer::after(Duration::from_millis(1)).await;
                }
                assert_eq!(m.connection_state(), ConnectionState::Connected);
                m.shutdown().await;
            };
            select(m.run(), drive).await;
        });

        assert_eq!(m.transport().connects(), 2);
        assert_eq!(m.stats().attempts, 2);
    }

    #[test]
    fn test_chipsea_attempt_not_superseded() {
        let m = manager(
            ScaleFamily::Chipsea,
            MockTransport::succeeding().script([ConnectOutcome::Hang]),
        );
        let events = m.events();
        let start = Instant::now();

        block_on(async {
            let drive = async {
                events.send(LinkEvent::Advertisement { seen_at: start }).await;
                for _ in 0..50 {
                    if m.transport().connects() == 1 {
                        break;
                    }
                    Timer::after(Duration::from_millis(1)).await;
                }

                // past the throttle window, so the request is accepted
                events
                    .send(LinkEvent::Advertisement { seen_at: start + Duration::from_secs(6) })
                    .await;
                Timer::after(Duration::from_millis(20)).await;

                assert_eq!(m.transport().connects(), 1);
                assert_eq!(m.connection_state(), ConnectionState::Connecting);
                m.shutdown().await;
            };
            select(m.run(), drive).await;
        });

        assert_eq!(m.stats().attempts, 1);
    }

    #[test]
    fn test_repeat_failures_stay_quiet() {
        let m = manager(
            ScaleFamily::Chipsea,
            MockTransport::failing("Device is no longer reachable"),
        );
        let start = Instant::from_secs(100);

        block_on(async {
            m.handle_advertisement(start);
            assert!(m.poll_reconnect().await.unwrap().is_err());

            let before = loud_lines();
            for n in 1..=5 {
                let seen_at = start + Duration::from_secs(6 * n);
                assert_eq!(m.handle_advertisement(seen_at), AdvertisementOutcome::Scheduled);
                assert!(m.poll_reconnect().await.unwrap().is_err());
            }
            assert_eq!(loud_lines(), before);
        });
        assert_eq!(m.transport().connects(), 6);
    }

    #[test]
    fn test_chipsea_advertisements_throttled() {
        let m = manager(ScaleFamily::Chipsea, MockTransport::failing("device disconnected"));
        let start = Instant::from_secs(100);

        block_on(async {
            assert_eq!(m.handle_advertisement(start), AdvertisementOutcome::Scheduled);
            assert_eq!(m.connection_state(), ConnectionState::Reconnecting);
            assert!(m.poll_reconnect().await.unwrap().is_err());

            assert_eq!(
                m.handle_advertisement(start + Duration::from_secs(1)),
                AdvertisementOutcome::Throttled
            );
            assert!(m.poll_reconnect().await.is_none());
            assert_eq!(m.transport().connects(), 1);

            assert_eq!(
                m.handle_advertisement(start + Duration::from_secs(6)),
                AdvertisementOutcome::Scheduled
            );
            assert!(m.poll_reconnect().await.is_some());
        });
        assert_eq!(m.transport().connects(), 2);
    }

    #[test]
    fn test_advertisement_ignored_when_connected() {
        let m = manager(ScaleFamily::Chipsea, MockTransport::succeeding());
        block_on(m.ensure_connected()).unwrap();
        assert_eq!(m.handle_advertisement(Instant::now()), AdvertisementOutcome::Ignored);
    }

    #[test]
    fn test_felicita_waits_for_readiness() {
        let m = manager(ScaleFamily::Felicita, MockTransport::succeeding());
        let now = Instant::from_secs(10);

        assert_eq!(m.handle_advertisement(now), AdvertisementOutcome::Deferred);
        assert_eq!(m.handle_advertisement(now), AdvertisementOutcome::Deferred);
        assert!(block_on(m.poll_reconnect()).is_none());

        m.mark_ready();
        // no throttle once the gate is open
        assert_eq!(m.handle_advertisement(now), AdvertisementOutcome::Scheduled);
        assert_eq!(m.handle_advertisement(now), AdvertisementOutcome::Scheduled);
        assert_eq!(block_on(m.poll_reconnect()), Some(Ok(())));
        assert_eq!(m.transport().connects(), 1);
    }

    #[test]
    fn test_run_connects_on_readiness() {
        let m = manager(ScaleFamily::Felicita, MockTransport::succeeding());
        m.handle_advertisement(Instant::now());

        block_on(async {
            let drive = async {
                m.mark_ready();
                for _ in 0..50 {
                    if m.is_connected() {
                        break;
                    }
                    Timer::after(Duration::from_millis(1)).await;
                }
                m.shutdown().await;
            };
            select(m.run(), drive).await;
        });

        assert_eq!(m.transport().connects(), 1);
        assert_eq!(m.connection_state(), ConnectionState::ShuttingDown);
    }

    #[test]
    fn test_run_processes_host_events() {
        let m = manager(ScaleFamily::Felicita, MockTransport::succeeding());
        m.mark_ready();
        let events = m.events();

        block_on(async {
            let drive = async {
                events.send(LinkEvent::Advertisement { seen_at: Instant::now() }).await;
                for _ in 0..50 {
                    if m.is_connected() {
                        break;
                    }
                    Timer::after(Duration::from_millis(1)).await;
                }
                events.send(LinkEvent::notification(&felicita_packet(b"001250"))).await;
                for _ in 0..50 {
                    if m.latest_reading().is_some() {
                        break;
                    }
                    Timer::after(Duration::from_millis(1)).await;
                }
                m.shutdown().await;
            };
            select(m.run(), drive).await;
        });

        assert_eq!(m.latest_reading().map(|r| r.weight_grams()), Some(12.5));
    }

    #[test]
    fn test_notifications_update_latest_and_stability() {
        let m = manager(ScaleFamily::Felicita, MockTransport::succeeding());
        let mut listener = m.subscribe().unwrap();

        for _ in 0..3 {
            assert!(!m.handle_notification(&felicita_packet(b"001000")).unwrap().is_stable());
        }
        assert!(m.handle_notification(&felicita_packet(b"001000")).unwrap().is_stable());

        // garbage leaves the latest reading alone
        assert!(m.handle_notification(&[0x01, 0x02]).is_none());
        assert_eq!(m.latest_reading().map(|r| r.weight_grams()), Some(10.0));
        assert!(m.latest_reading().unwrap().is_stable());

        let mut published = 0;
        while let Some(update) = listener.try_next_update() {
            assert!(matches!(update, ScaleUpdate::Reading(_)));
            published += 1;
        }
        assert_eq!(published, 4);
    }

    #[test]
    fn test_chipsea_stability_comes_from_packet() {
        let m = manager(ScaleFamily::Chipsea, MockTransport::succeeding());
        let stable = [0xCA, 0, 0, 0x01, 0, 0x00, 0x64, 0];
        assert!(m.handle_notification(&stable).unwrap().is_stable());
        let unstable = [0xCA, 0, 0, 0x00, 0, 0x00, 0x64, 0];
        assert!(!m.handle_notification(&unstable).unwrap().is_stable());
    }

    #[test]
    fn test_felicita_disconnect() {
        let m = manager(ScaleFamily::Felicita, MockTransport::succeeding());
        block_on(m.ensure_connected()).unwrap();
        m.handle_notification(&felicita_packet(b"000500"));
        let mut listener = m.subscribe().unwrap();

        m.handle_disconnect();

        assert_eq!(m.connection_state(), ConnectionState::Disconnected);
        assert!(!m.is_notifying());
        assert!(m.latest_reading().is_none());
        assert_eq!(m.stats().total_disconnections, 1);
        assert_eq!(m.stats().connected_since, None);
        assert_eq!(m.transport().rearms.load(Ordering::SeqCst), 1);
        assert!(m.with_state(|s| s.device.is_none() && s.link.is_none()));
        assert!(m.with_state(|s| s.stability.as_ref().map_or(false, |e| e.is_empty())));
        assert_eq!(listener.try_next_update(), Some(ScaleUpdate::Stale));
    }

    #[test]
    fn test_chipsea_disconnect_keeps_reading() {
        let m = manager(ScaleFamily::Chipsea, MockTransport::succeeding());
        block_on(m.ensure_connected()).unwrap();
        m.handle_notification(&[0xCA, 0, 0, 0x00, 0, 0x00, 0x64, 0]);

        m.handle_disconnect();

        assert_eq!(m.latest_reading().map(|r| r.weight_grams()), Some(100.0));
        assert_eq!(m.transport().rearms.load(Ordering::SeqCst), 0);
        assert_eq!(m.stats().total_disconnections, 1);
    }

    #[test]
    fn test_send_command() {
        let m = manager(ScaleFamily::Felicita, MockTransport::succeeding());
        assert!(block_on(m.send_command(0x54)));
        assert_eq!(m.transport().written(), vec![vec![0x54]]);
        assert_eq!(m.transport().connects(), 1);

        m.transport().fail_write.store(true, Ordering::SeqCst);
        assert!(!block_on(m.send_command(0x54)));
        assert_eq!(m.transport().written().len(), 1);
    }

    #[test]
    fn test_send_command_needs_connection() {
        let m = manager(ScaleFamily::Felicita, MockTransport::failing("not connected"));
        assert!(!block_on(m.send_command(0x54)));
        assert!(m.transport().written().is_empty());

        let chipsea = manager(ScaleFamily::Chipsea, MockTransport::succeeding());
        assert!(!block_on(chipsea.send_command(0x54)));
        assert_eq!(chipsea.transport().connects(), 0);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let m = manager(ScaleFamily::Felicita, MockTransport::succeeding());
        block_on(async {
            m.ensure_connected().await.unwrap();
            m.shutdown().await;
            m.shutdown().await;
        });

        assert_eq!(m.transport().disconnects(), 1);
        assert_eq!(m.transport().stop_notifies.load(Ordering::SeqCst), 1);
        assert_eq!(m.connection_state(), ConnectionState::ShuttingDown);
        assert_eq!(
            block_on(m.ensure_connected()),
            Err(ConnectionError::ShuttingDown)
        );
        assert_eq!(m.handle_advertisement(Instant::now()), AdvertisementOutcome::Ignored);
    }

    #[test]
    fn test_shutdown_before_connect() {
        let m = manager(ScaleFamily::Chipsea, MockTransport::succeeding());
        block_on(m.shutdown());
        assert_eq!(m.transport().disconnects(), 0);
        // run returns straight away once stopped
        block_on(m.run());
    }
}
