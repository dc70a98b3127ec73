//! Acquisition loop.
//!
//! Runs on the dedicated worker thread and owns the hardware session for the
//! duration of one `start()`..`stop()` cycle.
//!
//! ```text
//! Idle ──► Starting ──► Running ──► Stopping ──► Idle
//!             ▲            │
//!             └────────────┘  settings changed / reconnected
//! ```
//!
//! - **Starting**: stop stray acquisition, re-apply changed settings, calibrate
//!   the hardware clock, initialize the buffer pipeline, `AcquisitionStart`.
//! - **Running**: sync gate (synchronized mode) → frame waiter → metadata
//!   parser → delivery callback.
//! - **Stopping**: best-effort `AcquisitionStop` + `Flush`, pipeline teardown.
//!
//! Errors are escalated by class: timeouts and overflows are retried, then
//! answered with one proactive reconnection, then abort the loop; connection
//! loss runs the reconnection state machine and re-enters Starting;
//! configuration and fatal errors end the loop.

use crate::components::connection::{ConnectionTracker, ReconnectOutcome, Reconnector};
use crate::components::features::apply_settings;
use crate::components::frame_waiter::{FrameWaiter, WaitOutcome};
use crate::components::metadata::{extract_timestamp, HardwareClock};
use crate::components::sync_gate::SyncGate;
use crate::components::telemetry::{Telemetry, TelemetryPoller};
use crate::config::AcquisitionConfig;
use crate::hardware::{is_settable, props, read_f64, CameraHardware, Command, PropertyValue};
use crate::stats::AcquisitionStats;
use bytes::Bytes;
use camdaq_core::cancel::CancelToken;
use camdaq_core::error::{AppResult, DaqError, ErrorClass};
use camdaq_core::frame::{Frame, FrameMetadata};
use camdaq_core::settings::{SettingsHandle, SettingsSnapshot};
use camdaq_pool::BufferPool;
use chrono::Utc;
use std::sync::mpsc;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    Idle,
    Starting,
    Running,
    Stopping,
}

/// Shared handles a loop run works with.
#[derive(Clone)]
pub struct LoopContext {
    pub config: AcquisitionConfig,
    pub settings: SettingsHandle,
    pub cancel: CancelToken,
    pub gate: Arc<SyncGate>,
    pub tracker: Arc<ConnectionTracker>,
    pub stats: Arc<AcquisitionStats>,
    pub telemetry: watch::Sender<Telemetry>,
}

/// Receives the outcome of the first Starting phase.
pub type StartupReport = mpsc::Sender<AppResult<()>>;

enum Next {
    /// Retry the current step.
    Retry,
    /// Go back to Starting.
    Restart,
}

enum StreamExit {
    Cancelled,
    Restart,
}

pub struct AcquisitionLoop<'a> {
    hw: &'a mut dyn CameraHardware,
    ctx: LoopContext,
    pool: BufferPool,
    snapshot: Option<SettingsSnapshot>,
    clock: Option<HardwareClock>,
    telemetry: TelemetryPoller,
    waiter: FrameWaiter,
    phase: LoopPhase,
    startup: Option<StartupReport>,
    frame_number: u64,
    proactive_attempted: bool,
}

impl<'a> AcquisitionLoop<'a> {
    /// `snapshot` is what a previous run left applied, `None` to apply everything.
    pub fn new(
        hw: &'a mut dyn CameraHardware,
        ctx: LoopContext,
        snapshot: Option<SettingsSnapshot>,
    ) -> Self {
        let telemetry = TelemetryPoller::new(ctx.config.telemetry_interval, ctx.telemetry.clone());
        let waiter = FrameWaiter::new(ctx.cancel.clone(), ctx.config.poll_interval);
        Self {
            hw,
            ctx,
            pool: BufferPool::new(),
            snapshot,
            clock: None,
            telemetry,
            waiter,
            phase: LoopPhase::Idle,
            startup: None,
            frame_number: 0,
            proactive_attempted: false,
        }
    }

    pub fn with_startup_report(mut self, report: StartupReport) -> Self {
        self.startup = Some(report);
        self
    }

    pub fn phase(&self) -> LoopPhase {
        self.phase
    }

    /// Settings left applied on the hardware, for the next run.
    pub fn into_snapshot(self) -> Option<SettingsSnapshot> {
        self.snapshot
    }

    /// Run until cancelled (returns `Ok`) or a fatal error.
    ///
    /// Stopping is always executed before returning.
    pub fn run(&mut self, deliver: &mut dyn FnMut(Frame)) -> AppResult<()> {
        let span = info_span!("acquisition", camera = %self.hw.name());
        let _guard = span.enter();

        self.frame_number = 0;
        self.proactive_attempted = false;
        // Errors of a previous run do not count towards this run's thresholds.
        self.ctx.stats.reset_streak();
        let result = match self.run_phases(deliver) {
            Err(DaqError::Cancelled) => Ok(()),
            other => other,
        };
        if let Err(e) = &result {
            error!(error = %e, class = %e.class(), "Acquisition loop aborted");
        }
        self.report_startup(result.clone());
        self.stopping();
        result
    }

    fn run_phases(&mut self, deliver: &mut dyn FnMut(Frame)) -> AppResult<()> {
        loop {
            self.set_phase(LoopPhase::Starting);
            if let Err(e) = self.start_acquisition() {
                if let Next::Retry = self.recover(e)? {
                    if self.ctx.cancel.sleep(self.ctx.config.poll_interval) {
                        return Err(DaqError::Cancelled);
                    }
                }
                continue;
            }
            self.report_startup(Ok(()));

            self.set_phase(LoopPhase::Running);
            match self.stream(deliver)? {
                StreamExit::Cancelled => return Ok(()),
                StreamExit::Restart => continue,
            }
        }
    }

    fn start_acquisition(&mut self) -> AppResult<()> {
        if self.ctx.cancel.is_cancelled() {
            return Err(DaqError::Cancelled);
        }
        self.best_effort(Command::AcquisitionStop);
        self.best_effort(Command::Flush);
        self.pool.teardown();

        let live = self.ctx.settings.get();
        let snapshot = match self.snapshot.take() {
            Some(previous) if previous.matches(&live) => previous,
            previous => {
                let applied = apply_settings(&mut *self.hw, &live, previous.as_ref());
                match applied {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        self.snapshot = previous;
                        return Err(e);
                    }
                }
            }
        };
        let format = snapshot.format;
        self.snapshot = Some(snapshot);

        self.clock = self.calibrate_clock()?;
        self.pool
            .initialize_pipeline(&mut *self.hw, format, self.ctx.config.pipeline_depth)?;
        self.hw.command(Command::AcquisitionStart)?;
        info!(
            width = format.width,
            height = format.height,
            depth = self.ctx.config.pipeline_depth,
            hardware_timestamps = self.clock.is_some(),
            "Acquisition started"
        );
        Ok(())
    }

    /// Enable trailing metadata and map the timestamp clock to host time.
    fn calibrate_clock(&mut self) -> AppResult<Option<HardwareClock>> {
        let hw = &mut *self.hw;
        if !is_settable(hw, props::METADATA_ENABLE)?
            || !hw.is_implemented(props::TIMESTAMP_CLOCK_FREQUENCY)?
        {
            debug!("Hardware timestamps not supported");
            return Ok(None);
        }
        hw.set(props::METADATA_ENABLE, PropertyValue::Bool(true))?;
        let frequency = read_f64(hw, props::TIMESTAMP_CLOCK_FREQUENCY)?;
        hw.command(Command::TimestampClockReset)?;
        let offset = Utc::now();

        match HardwareClock::from_frequency(offset, frequency) {
            Some(clock) => {
                debug!(frequency, "Timestamp clock reset");
                Ok(Some(clock))
            }
            None => {
                warn!(frequency, "Invalid timestamp clock frequency, hardware timestamps disabled");
                Ok(None)
            }
        }
    }

    fn stream(&mut self, deliver: &mut dyn FnMut(Frame)) -> AppResult<StreamExit> {
        let Some(snapshot) = self.snapshot.clone() else {
            return Ok(StreamExit::Restart);
        };
        let synchronized = snapshot.applied.synchronized;
        let max_discard = self.ctx.config.discard_budget(synchronized);
        let deadline = self
            .ctx
            .config
            .frame_deadline(snapshot.exposure_s, snapshot.readout_time_s);
        debug!(
            deadline_ms = deadline.as_millis() as u64,
            max_discard, synchronized, "Streaming frames"
        );

        loop {
            if self.ctx.cancel.is_cancelled() {
                return Ok(StreamExit::Cancelled);
            }
            if !snapshot.matches(&self.ctx.settings.get()) {
                info!("Settings changed, reinitializing acquisition");
                return Ok(StreamExit::Restart);
            }
            self.telemetry.poll_due(&mut *self.hw);

            if synchronized {
                let hw = &mut *self.hw;
                let released = self.ctx.gate.arm_and_wait(&self.ctx.cancel, &mut || {
                    hw.command(Command::SoftwareTrigger)
                });
                if let Err(e) = released {
                    match self.recover(e)? {
                        Next::Retry => continue,
                        Next::Restart => return Ok(StreamExit::Restart),
                    }
                }
            }

            let result = self
                .waiter
                .wait_frame(&mut *self.hw, &mut self.pool, deadline, max_discard)
                .and_then(|outcome| self.deliver(outcome, &snapshot, deliver));
            if let Err(e) = result {
                match self.recover(e)? {
                    Next::Retry => continue,
                    Next::Restart => return Ok(StreamExit::Restart),
                }
            }
        }
    }

    fn deliver(
        &mut self,
        outcome: WaitOutcome,
        snapshot: &SettingsSnapshot,
        deliver: &mut dyn FnMut(Frame),
    ) -> AppResult<()> {
        let WaitOutcome {
            buffer,
            size,
            discarded,
            ..
        } = outcome;
        let acquisition_date = Utc::now();
        let format = snapshot.format;
        let payload_len = format.payload_bytes().unwrap_or(usize::MAX);
        let filled_len = size.min(buffer.len());
        if filled_len < payload_len {
            self.pool.release(buffer);
            return Err(DaqError::Allocation {
                required: payload_len,
                hardware: filled_len,
            });
        }

        let filled = &buffer.as_bytes()[..filled_len];
        let hardware_timestamp = self.clock.as_ref().and_then(|clock| {
            extract_timestamp(filled, payload_len, clock).unwrap_or_else(|e| {
                debug!(error = %e, "Malformed frame metadata, no hardware timestamp");
                None
            })
        });
        let payload = Bytes::copy_from_slice(&filled[..payload_len]);
        self.pool.replace(&mut *self.hw, buffer)?;

        if self.ctx.cancel.is_cancelled() {
            return Ok(());
        }

        let applied = &snapshot.applied;
        let metadata = FrameMetadata {
            acquisition_date,
            exposure_time_s: snapshot.exposure_s,
            readout_time_s: snapshot.readout_time_s,
            position: (applied.roi.x, applied.roi.y),
            gain: applied.gain.clone(),
            bit_depth: applied.encoding.bit_depth(),
            hardware_timestamp,
            frame_number: self.frame_number,
            discarded,
        };
        self.frame_number += 1;
        self.ctx.stats.record_frame(discarded);
        self.proactive_attempted = false;

        trace!(frame = metadata.frame_number, discarded, "Delivering frame");
        deliver(Frame {
            format,
            payload,
            metadata,
        });

        let every = self.ctx.config.stats_interval_frames;
        if every > 0 && self.frame_number % every == 0 {
            let stats = self.ctx.stats.snapshot();
            info!(
                frames = self.frame_number,
                discarded = stats.frames_discarded,
                timeouts = stats.timeouts,
                overflows = stats.overflows,
                reconnections = stats.reconnections,
                pending = self.pool.pending_len(),
                buffers_allocated = self.pool.total_allocated(),
                "Acquisition progress"
            );
        }
        Ok(())
    }

    fn recover(&mut self, err: DaqError) -> AppResult<Next> {
        let class = err.class();
        match class {
            ErrorClass::Cancelled | ErrorClass::ConfigurationInconsistent | ErrorClass::Fatal => {
                Err(err)
            }
            ErrorClass::ConnectionLost => {
                self.ctx.tracker.mark_lost(&err);
                self.reconnect()
            }
            ErrorClass::Transient | ErrorClass::Overflow => {
                let streak = self.ctx.stats.record_error(class);
                if class == ErrorClass::Overflow {
                    warn!(error = %err, streak, "Hardware buffer overflow, frames are consumed too slowly");
                } else {
                    debug!(error = %err, streak, "Transient acquisition error");
                }

                let config = &self.ctx.config;
                if streak >= config.consecutive_error_abort {
                    error!(streak, "Too many consecutive acquisition errors");
                    return Err(err);
                }
                if streak >= config.consecutive_error_reconnect && !self.proactive_attempted {
                    self.proactive_attempted = true;
                    warn!(streak, error = %err, "Repeated acquisition errors, reconnecting");
                    return self.reconnect();
                }
                Ok(Next::Retry)
            }
        }
    }

    fn reconnect(&mut self) -> AppResult<Next> {
        self.pool.teardown();
        self.clock = None;

        let config = &self.ctx.config;
        let reconnector = Reconnector::new(
            &self.ctx.tracker,
            &self.ctx.cancel,
            config.reconnect_backoff,
            config.expected_interface.as_deref(),
        );
        let outcome =
            reconnector.reconnect(&mut *self.hw, &mut self.telemetry, &mut self.snapshot)?;
        match outcome {
            ReconnectOutcome::Reconnected { .. } => self.ctx.stats.record_reconnection(),
            ReconnectOutcome::AlreadyInProgress => {
                if self.ctx.cancel.sleep(config.reconnect_backoff) {
                    return Err(DaqError::Cancelled);
                }
            }
        }
        Ok(Next::Restart)
    }

    fn stopping(&mut self) {
        self.set_phase(LoopPhase::Stopping);
        self.best_effort(Command::AcquisitionStop);
        self.best_effort(Command::Flush);
        self.pool.teardown();
        self.set_phase(LoopPhase::Idle);
        info!(frames = self.frame_number, "Acquisition stopped");
    }

    fn best_effort(&mut self, command: Command) {
        if let Err(e) = self.hw.command(command) {
            warn!(command = command.as_str(), error = %e, "Best-effort command failed");
        }
    }

    fn report_startup(&mut self, result: AppResult<()>) {
        if let Some(report) = self.startup.take() {
            let _ = report.send(result);
        }
    }

    fn set_phase(&mut self, phase: LoopPhase) {
        if self.phase != phase {
            debug!(from = ?self.phase, to = ?phase, "Acquisition phase");
            self.phase = phase;
        }
    }
}
