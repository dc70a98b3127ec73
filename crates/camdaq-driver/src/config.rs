//! Tuning constants of the acquisition core.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Acquisition tuning, deserialisable from the `[acquisition]` config section.
///
/// Durations are humantime strings (`"100ms"`, `"5s"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Buffers kept submitted to the hardware.
    pub pipeline_depth: usize,

    /// Length of one bounded poll; also the cancellation latency bound.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Backlog frames the frame waiter may skip in free-running mode.
    /// Synchronized acquisition always uses 0.
    pub max_discard: u32,

    /// Added to exposure + readout time to form the per-frame deadline.
    #[serde(with = "humantime_serde")]
    pub frame_timeout_margin: Duration,

    /// Consecutive timeout/overflow errors before a proactive reconnect.
    pub consecutive_error_reconnect: u32,

    /// Consecutive timeout/overflow errors before the loop gives up.
    pub consecutive_error_abort: u32,

    /// Wait between failed reopen attempts.
    #[serde(with = "humantime_serde")]
    pub reconnect_backoff: Duration,

    /// Interface type the device must report after reopening, e.g. "USB3".
    pub expected_interface: Option<String>,

    #[serde(with = "humantime_serde")]
    pub telemetry_interval: Duration,

    /// Delivered frames between pipeline summary logs. 0 disables them.
    pub stats_interval_frames: u64,

    /// How long `start()` waits for the first AcquisitionStart.
    #[serde(with = "humantime_serde")]
    pub startup_timeout: Duration,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            pipeline_depth: 2,
            poll_interval: Duration::from_millis(100),
            max_discard: 3,
            frame_timeout_margin: Duration::from_secs(1),
            consecutive_error_reconnect: 3,
            consecutive_error_abort: 10,
            reconnect_backoff: Duration::from_secs(1),
            expected_interface: None,
            telemetry_interval: Duration::from_secs(5),
            stats_interval_frames: 100,
            startup_timeout: Duration::from_secs(10),
        }
    }
}

impl AcquisitionConfig {
    /// Discard budget for the given trigger mode.
    pub fn discard_budget(&self, synchronized: bool) -> u32 {
        if synchronized {
            0
        } else {
            self.max_discard
        }
    }

    /// Overall wait for one frame: exposure + readout + margin.
    pub fn frame_deadline(&self, exposure_s: f64, readout_time_s: f64) -> Duration {
        let hardware = exposure_s.max(0.0) + readout_time_s.max(0.0);
        Duration::try_from_secs_f64(hardware)
            .unwrap_or(Duration::ZERO)
            .saturating_add(self.frame_timeout_margin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AcquisitionConfig::default();
        assert_eq!(config.pipeline_depth, 2);
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.discard_budget(true), 0);
        assert_eq!(config.discard_budget(false), 3);
    }

    #[test]
    fn test_frame_deadline() {
        let config = AcquisitionConfig::default();
        assert_eq!(
            config.frame_deadline(0.5, 0.25),
            Duration::from_millis(1_750)
        );
        assert_eq!(config.frame_deadline(f64::NAN, -1.0), Duration::from_secs(1));
    }

    #[test]
    fn test_humantime_fields() {
        let json = r#"{ "poll_interval": "50ms", "reconnect_backoff": "2s", "max_discard": 1 }"#;
        let config: AcquisitionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.poll_interval, Duration::from_millis(50));
        assert_eq!(config.reconnect_backoff, Duration::from_secs(2));
        assert_eq!(config.max_discard, 1);
        assert_eq!(config.pipeline_depth, 2);
    }
}
