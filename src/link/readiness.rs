//! Gate holding back the first reconnection until the host has finished starting up.

use core::sync::atomic::{AtomicBool, Ordering};
use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, signal::Signal};

pub struct Readiness {
    ready: AtomicBool,
    pending: AtomicBool,
    released: Signal<CriticalSectionRawMutex, ()>,
}

impl Readiness {
    /// Gate that is already open; nothing is ever deferred.
    pub fn open() -> Self {
        Self::with_state(true)
    }

    pub fn gated() -> Self {
        Self::with_state(false)
    }

    fn with_state(ready: bool) -> Self {
        Self {
            ready: AtomicBool::new(ready),
            pending: AtomicBool::new(false),
            released: Signal::new(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Records that a reconnect is waiting on the gate. Repeated calls collapse into
    /// one; returns `true` for the call that armed it.
    pub fn defer(&self) -> bool {
        !self.pending.swap(true, Ordering::AcqRel)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Opens the gate and releases the deferred reconnect, if there is one.
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
        if self.pending.swap(false, Ordering::AcqRel) {
            self.released.signal(());
        }
    }

    /// Resolves once per released deferral.
    pub async fn released(&self) {
        self.released.wait().await
    }
}
