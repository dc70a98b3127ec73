//! Periodic sensor telemetry.
//!
//! Polled from the acquisition worker between frames so every hardware call
//! stays on one thread. The reconnection state machine pauses polling while
//! the session is down.

use crate::hardware::{props, read_f64, CameraHardware};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::debug;

/// Latest sensor readings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    /// Sensor temperature in °C, when the device reports one.
    pub sensor_temperature: Option<f64>,
    pub updated_at: Option<DateTime<Utc>>,
}

pub struct TelemetryPoller {
    interval: Duration,
    last_poll: Option<Instant>,
    paused: bool,
    tx: watch::Sender<Telemetry>,
}

impl TelemetryPoller {
    pub fn new(interval: Duration, tx: watch::Sender<Telemetry>) -> Self {
        Self {
            interval,
            last_poll: None,
            paused: false,
            tx,
        }
    }

    pub fn pause(&mut self) {
        if !self.paused {
            debug!("Telemetry polling paused");
        }
        self.paused = true;
    }

    /// Resume polling; the next `poll_due` reads immediately.
    pub fn resume(&mut self) {
        if self.paused {
            debug!("Telemetry polling resumed");
        }
        self.paused = false;
        self.last_poll = None;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Read the sensor if the interval has elapsed. Failures are logged and
    /// left to the acquisition path to classify.
    pub fn poll_due(&mut self, hw: &mut dyn CameraHardware) {
        if self.paused || self.interval.is_zero() {
            return;
        }
        if self
            .last_poll
            .is_some_and(|last| last.elapsed() < self.interval)
        {
            return;
        }
        self.last_poll = Some(Instant::now());

        match hw.is_implemented(props::SENSOR_TEMPERATURE) {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                debug!(error = %e, "Telemetry probe failed");
                return;
            }
        }
        match read_f64(hw, props::SENSOR_TEMPERATURE) {
            Ok(temperature) => {
                self.tx.send_replace(Telemetry {
                    sensor_temperature: Some(temperature),
                    updated_at: Some(Utc::now()),
                });
            }
            Err(e) => debug!(error = %e, "Sensor temperature read failed"),
        }
    }
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;
    use crate::hardware::PropertyValue;
    use crate::mock::MockCamera;

    #[test]
    fn test_poll_publishes_and_respects_interval() {
        let mut camera = MockCamera::new("mock");
        let control = camera.control();
        let (tx, rx) = watch::channel(Telemetry::default());
        let mut poller = TelemetryPoller::new(Duration::from_secs(60), tx);

        poller.poll_due(&mut camera);
        assert_eq!(rx.borrow().sensor_temperature, Some(-10.0));

        control.set_property(props::SENSOR_TEMPERATURE, PropertyValue::Float(-20.0));
        poller.poll_due(&mut camera);
        assert_eq!(rx.borrow().sensor_temperature, Some(-10.0));

        poller.pause();
        poller.resume();
        poller.poll_due(&mut camera);
        assert_eq!(rx.borrow().sensor_temperature, Some(-20.0));
    }

    #[test]
    fn test_paused_poller_does_not_touch_hardware() {
        let mut camera = MockCamera::new("mock");
        let control = camera.control();
        control.disconnect();
        let (tx, rx) = watch::channel(Telemetry::default());
        let mut poller = TelemetryPoller::new(Duration::from_millis(1), tx);
        poller.pause();
        poller.poll_due(&mut camera);
        assert!(rx.borrow().updated_at.is_none());
        assert!(poller.is_paused());
    }
}
