//! Acquisition counters readable from any thread.

use camdaq_core::error::ErrorClass;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct AcquisitionStats {
    frames_delivered: AtomicU64,
    frames_discarded: AtomicU64,
    timeouts: AtomicU64,
    overflows: AtomicU64,
    reconnections: AtomicU64,
    consecutive_errors: AtomicU32,
}

/// Point-in-time copy of [`AcquisitionStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub frames_delivered: u64,
    pub frames_discarded: u64,
    pub timeouts: u64,
    pub overflows: u64,
    pub reconnections: u64,
    pub consecutive_errors: u32,
}

impl AcquisitionStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a delivered frame and clear the error streak.
    pub fn record_frame(&self, discarded: u32) {
        self.frames_delivered.fetch_add(1, Ordering::Relaxed);
        self.frames_discarded
            .fetch_add(u64::from(discarded), Ordering::Relaxed);
        self.consecutive_errors.store(0, Ordering::Relaxed);
    }

    /// Count a timeout/overflow-class error; returns the streak length.
    pub fn record_error(&self, class: ErrorClass) -> u32 {
        match class {
            ErrorClass::Overflow => {
                self.overflows.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_reconnection(&self) {
        self.reconnections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset_streak(&self) {
        self.consecutive_errors.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            frames_discarded: self.frames_discarded.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            overflows: self.overflows.load(Ordering::Relaxed),
            reconnections: self.reconnections.load(Ordering::Relaxed),
            consecutive_errors: self.consecutive_errors.load(Ordering::Relaxed),
        }
    }
}
