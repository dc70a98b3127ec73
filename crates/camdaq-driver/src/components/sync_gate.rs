//! Software-trigger synchronization gate.
//!
//! In synchronized mode each exposure is started by an external event rather
//! than by the free-running hardware timer. The acquisition loop arms the gate
//! before every frame; the event source notifies it from another thread.
//!
//! ```text
//!              notify_event                 arm_and_wait
//! Disarmed ─────────────────► LateFired ─────────────────► Disarmed (fire now)
//!    │ arm_and_wait
//!    ▼          notify_event
//!  Armed ─────────────────► Fired ──► Disarmed (fire)
//!                              │ notify_event
//!                              ▼
//!                      Fired + late ──► LateFired (fire)
//! ```
//!
//! At most one late event is remembered, including one that arrives while the
//! previous event is still being consumed. A further event while one is
//! pending is logged and dropped so the oldest is used.

use camdaq_core::cancel::CancelToken;
use camdaq_core::error::{AppResult, DaqError};
use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncGateState {
    Disarmed,
    Armed,
    Fired,
    LateFired,
}

/// How a successful [`SyncGate::arm_and_wait`] was released.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GateRelease {
    /// The event arrived while armed.
    Event,
    /// A late event was pending; `lateness` is how long it waited.
    Late { lateness: Duration },
    /// Synchronization was switched off while armed.
    Disabled,
}

/// The action performed when the gate opens.
pub trait SyncTrigger {
    fn fire(&mut self) -> AppResult<()>;
}

impl<F> SyncTrigger for F
where
    F: FnMut() -> AppResult<()>,
{
    fn fire(&mut self) -> AppResult<()> {
        self()
    }
}

#[derive(Debug)]
struct GateInner {
    state: SyncGateState,
    enabled: bool,
    late_since: Option<Instant>,
}

/// Gate deferring each exposure until an external event.
#[derive(Debug)]
pub struct SyncGate {
    inner: Mutex<GateInner>,
    cond: Condvar,
    poll_interval: Duration,
}

impl SyncGate {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            inner: Mutex::new(GateInner {
                state: SyncGateState::Disarmed,
                enabled: false,
                late_since: None,
            }),
            cond: Condvar::new(),
            poll_interval,
        }
    }

    pub fn state(&self) -> SyncGateState {
        self.inner.lock().state
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().enabled
    }

    /// Turn synchronization on or off.
    ///
    /// Disabling releases a waiting `arm_and_wait` and forgets a pending late
    /// event.
    pub fn set_enabled(&self, enabled: bool) {
        let mut inner = self.inner.lock();
        inner.enabled = enabled;
        if !enabled {
            inner.late_since = None;
            if inner.state == SyncGateState::LateFired {
                inner.state = SyncGateState::Disarmed;
            }
        }
        self.cond.notify_all();
    }

    /// External event notification. Safe to call from any thread.
    pub fn notify_event(&self) {
        let mut inner = self.inner.lock();
        if !inner.enabled {
            debug!("Sync event ignored, synchronization disabled");
            return;
        }
        match inner.state {
            SyncGateState::Armed => {
                inner.state = SyncGateState::Fired;
                self.cond.notify_all();
            }
            SyncGateState::Disarmed => {
                inner.state = SyncGateState::LateFired;
                inner.late_since = Some(Instant::now());
                debug!("Sync event arrived before arming, queued as late fire");
            }
            SyncGateState::Fired if inner.late_since.is_none() => {
                inner.late_since = Some(Instant::now());
                debug!("Sync event arrived while the previous one is being consumed, queued as late fire");
            }
            SyncGateState::LateFired | SyncGateState::Fired => {
                warn!("Sync event arrived while a late fire is already pending, keeping the oldest");
            }
        }
    }

    /// Wait for the external event, then fire `trigger`.
    ///
    /// Returns [`DaqError::Cancelled`] without firing when `cancel` is set.
    pub fn arm_and_wait(
        &self,
        cancel: &CancelToken,
        trigger: &mut dyn SyncTrigger,
    ) -> AppResult<GateRelease> {
        let release = {
            let mut inner = self.inner.lock();
            if inner.state == SyncGateState::LateFired {
                inner.state = SyncGateState::Disarmed;
                let lateness = inner
                    .late_since
                    .take()
                    .map(|since| since.elapsed())
                    .unwrap_or_default();
                warn!(
                    lateness_ms = lateness.as_millis() as u64,
                    "Sync event arrived before the gate was armed, firing immediately"
                );
                GateRelease::Late { lateness }
            } else {
                inner.state = SyncGateState::Armed;
                loop {
                    if cancel.is_cancelled() {
                        inner.state = SyncGateState::Disarmed;
                        inner.late_since = None;
                        return Err(DaqError::Cancelled);
                    }
                    if inner.state == SyncGateState::Fired {
                        // An event that arrived meanwhile is kept for the next arm.
                        inner.state = if inner.late_since.is_some() {
                            SyncGateState::LateFired
                        } else {
                            SyncGateState::Disarmed
                        };
                        break GateRelease::Event;
                    }
                    if !inner.enabled {
                        inner.state = SyncGateState::Disarmed;
                        break GateRelease::Disabled;
                    }
                    self.cond.wait_for(&mut inner, self.poll_interval);
                }
            }
        };

        if cancel.is_cancelled() {
            return Err(DaqError::Cancelled);
        }
        trigger.fire()?;
        Ok(release)
    }
}

/// A source of external synchronization events.
pub trait EventSource: Send + Sync {
    /// Start delivering events to `gate`.
    fn attach(&self, gate: Weak<SyncGate>);

    /// Stop delivering events.
    fn detach(&self);
}

/// Event source fired explicitly by application code.
#[derive(Debug, Default)]
pub struct ManualEventSource {
    gate: Mutex<Option<Weak<SyncGate>>>,
}

impl ManualEventSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Deliver one event. Returns false when no gate is attached.
    pub fn fire(&self) -> bool {
        let gate = self.gate.lock().as_ref().and_then(Weak::upgrade);
        match gate {
            Some(gate) => {
                gate.notify_event();
                true
            }
            None => false,
        }
    }
}

impl EventSource for ManualEventSource {
    fn attach(&self, gate: Weak<SyncGate>) {
        *self.gate.lock() = Some(gate);
    }

    fn detach(&self) {
        *self.gate.lock() = None;
    }
}
