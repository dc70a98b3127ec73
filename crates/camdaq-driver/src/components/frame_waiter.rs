//! Waits for filled buffers and drains backlog.
//!
//! The hardware wait is split into short polls so a stop request is observed
//! within one `poll_interval`. After the first filled buffer, up to
//! `max_discard` already-filled newer buffers are taken with non-blocking
//! checks and the older ones are handed back to the pool, so the caller
//! always gets the most recent frame available within the budget.

use crate::hardware::CameraHardware;
use camdaq_core::cancel::CancelToken;
use camdaq_core::error::{AppResult, DaqError};
use camdaq_pool::{BufferPool, FrameBuffer};
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// A retrieved buffer ready to be interpreted.
#[derive(Debug)]
pub struct WaitOutcome {
    /// The retained buffer; the pool counts it as held until replaced.
    pub buffer: FrameBuffer,
    /// Bytes the hardware filled.
    pub size: usize,
    /// Older frames dropped in favour of `buffer`.
    pub discarded: u32,
    /// The discard budget ran out while frames were still backing up.
    pub backlog: bool,
}

#[derive(Debug, Clone)]
pub struct FrameWaiter {
    cancel: CancelToken,
    poll_interval: Duration,
}

impl FrameWaiter {
    pub fn new(cancel: CancelToken, poll_interval: Duration) -> Self {
        Self {
            cancel,
            poll_interval,
        }
    }

    /// Wait up to `deadline` for the next frame.
    ///
    /// Errors:
    /// - [`DaqError::Cancelled`] if a stop was requested, even when a frame is
    ///   ready
    /// - [`DaqError::FrameTimeout`] when nothing arrived before `deadline`
    /// - [`DaqError::BufferMismatch`] when the hardware returned a buffer other
    ///   than the oldest pending one
    /// - any non-timeout hardware error of the blocking wait
    pub fn wait_frame(
        &self,
        hw: &mut dyn CameraHardware,
        pool: &mut BufferPool,
        deadline: Duration,
        max_discard: u32,
    ) -> AppResult<WaitOutcome> {
        let started = Instant::now();
        let deadline_at = started + deadline;

        let first = loop {
            if self.cancel.is_cancelled() {
                return Err(DaqError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline_at {
                return Err(DaqError::FrameTimeout {
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            let attempt = self.poll_interval.min(deadline_at - now);
            match hw.wait_filled(attempt) {
                Ok(filled) => break filled,
                Err(e) if e.is_hardware_timeout() => continue,
                Err(e) => return Err(e),
            }
        };

        let mut buffer = pool.retrieve(first.buffer)?;
        let mut size = first.size;
        let mut discarded = 0u32;
        let mut backlog = false;

        if max_discard > 0 {
            while discarded < max_discard {
                match hw.wait_filled(Duration::ZERO) {
                    Ok(newer) => {
                        pool.replace(hw, buffer)?;
                        buffer = pool.retrieve(newer.buffer)?;
                        size = newer.size;
                        discarded += 1;
                    }
                    Err(e) if e.is_hardware_timeout() => break,
                    Err(e) => {
                        warn!(error = %e, "Non-blocking frame check failed, delivering frame in hand");
                        break;
                    }
                }
            }
            if discarded == max_discard {
                backlog = true;
                warn!(
                    discarded,
                    max_discard,
                    pending = pool.pending_len(),
                    "Frames arrive faster than they are drained, delivering stale frames"
                );
            }
        }

        if self.cancel.is_cancelled() {
            pool.release(buffer);
            return Err(DaqError::Cancelled);
        }

        trace!(
            buffer = %buffer.id(),
            size,
            discarded,
            waited_us = started.elapsed().as_micros() as u64,
            "Frame retrieved"
        );
        Ok(WaitOutcome {
            buffer,
            size,
            discarded,
            backlog,
        })
    }
}
