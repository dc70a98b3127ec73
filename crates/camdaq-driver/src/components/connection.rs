//! Reconnection state machine.
//!
//! ```text
//! Connected ──mark_lost──► LostPending ──reconnect──► Reconnecting ──open+validate──► Connected
//!     │                                                   │   ▲
//!     └──────────── reconnect (proactive) ────────────────┘   └── backoff, retry
//! ```
//!
//! [`ConnectionTracker`] holds the state and publishes every status change.
//! It is shared, so a second [`Reconnector::reconnect`] while one is already
//! running returns [`ReconnectOutcome::AlreadyInProgress`] without touching
//! the hardware.

use crate::components::telemetry::TelemetryPoller;
use crate::hardware::{props, read_enum, CameraHardware};
use camdaq_core::cancel::CancelToken;
use camdaq_core::error::{AppResult, DaqError, ErrorClass};
use camdaq_core::settings::SettingsSnapshot;
use camdaq_core::status::{ConnectionState, ConnectionStatus, StatusPublisher};
use parking_lot::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Shared connection state plus the status stream it drives.
#[derive(Debug)]
pub struct ConnectionTracker {
    state: Mutex<ConnectionState>,
    status: StatusPublisher,
}

impl ConnectionTracker {
    pub fn new(status: StatusPublisher) -> Self {
        Self {
            state: Mutex::new(ConnectionState::Connected),
            status,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn status(&self) -> &StatusPublisher {
        &self.status
    }

    /// Record a classified connection loss.
    ///
    /// Returns true on the `Connected → LostPending` transition; later calls
    /// while recovery is pending or running are no-ops.
    pub fn mark_lost(&self, cause: &DaqError) -> bool {
        let mut state = self.state.lock();
        if *state != ConnectionState::Connected {
            return false;
        }
        *state = ConnectionState::LostPending;
        drop(state);
        warn!(error = %cause, "Connection to camera lost");
        self.status.publish(ConnectionStatus::Disconnected);
        true
    }

    /// Claim the reconnection. False if one is already running.
    fn begin(&self) -> bool {
        let mut state = self.state.lock();
        if *state == ConnectionState::Reconnecting {
            return false;
        }
        *state = ConnectionState::Reconnecting;
        drop(state);
        self.status.publish(ConnectionStatus::Reconnecting);
        true
    }

    fn finish(&self, connected: bool) {
        let (state, status) = if connected {
            (ConnectionState::Connected, ConnectionStatus::Connected)
        } else {
            (ConnectionState::LostPending, ConnectionStatus::Disconnected)
        };
        *self.state.lock() = state;
        self.status.publish(status);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectOutcome {
    /// The session was reopened and validated after `attempts` opens.
    Reconnected { attempts: u32 },
    /// Another reconnection owns the state machine; nothing was done.
    AlreadyInProgress,
}

/// One reconnection run against a hardware session.
pub struct Reconnector<'a> {
    tracker: &'a ConnectionTracker,
    cancel: &'a CancelToken,
    backoff: Duration,
    expected_interface: Option<&'a str>,
}

impl<'a> Reconnector<'a> {
    pub fn new(
        tracker: &'a ConnectionTracker,
        cancel: &'a CancelToken,
        backoff: Duration,
        expected_interface: Option<&'a str>,
    ) -> Self {
        Self {
            tracker,
            cancel,
            backoff,
            expected_interface,
        }
    }

    /// Close the session and reopen it until it validates.
    ///
    /// Connection-class open failures and failed validations are retried after
    /// `backoff`; any other open failure is returned. On success `snapshot` is
    /// cleared so every setting is re-applied. Cancellation leaves the state
    /// at `LostPending` and returns [`DaqError::Cancelled`].
    pub fn reconnect(
        &self,
        hw: &mut dyn CameraHardware,
        telemetry: &mut TelemetryPoller,
        snapshot: &mut Option<SettingsSnapshot>,
    ) -> AppResult<ReconnectOutcome> {
        if !self.tracker.begin() {
            debug!("Reconnection already in progress");
            return Ok(ReconnectOutcome::AlreadyInProgress);
        }

        telemetry.pause();
        if let Err(e) = hw.close() {
            debug!(error = %e, "Closing lost session failed");
        }

        let mut attempts = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                self.tracker.finish(false);
                return Err(DaqError::Cancelled);
            }
            attempts += 1;

            match hw.open() {
                Ok(()) => match self.validate(hw) {
                    Ok(()) => break,
                    Err(e) => {
                        warn!(attempt = attempts, error = %e, "Reopened device failed validation");
                        if let Err(e) = hw.close() {
                            debug!(error = %e, "Closing unvalidated session failed");
                        }
                    }
                },
                Err(e) if e.class() == ErrorClass::ConnectionLost => {
                    debug!(attempt = attempts, error = %e, "Reopen failed, retrying");
                }
                Err(e) => {
                    warn!(attempt = attempts, error = %e, "Reopen failed fatally, giving up");
                    self.tracker.finish(false);
                    return Err(e);
                }
            }

            if self.cancel.sleep(self.backoff) {
                self.tracker.finish(false);
                return Err(DaqError::Cancelled);
            }
        }

        *snapshot = None;
        telemetry.resume();
        self.tracker.finish(true);
        info!(attempts, camera = %hw.name(), "Camera reconnected");
        Ok(ReconnectOutcome::Reconnected { attempts })
    }

    fn validate(&self, hw: &mut dyn CameraHardware) -> AppResult<()> {
        let Some(expected) = self.expected_interface else {
            return Ok(());
        };
        let actual = read_enum(hw, props::INTERFACE_TYPE)?;
        if actual != expected {
            return Err(DaqError::Configuration(format!(
                "device reports interface {actual}, expected {expected}"
            )));
        }
        Ok(())
    }
}
