//! Acquisition core for scientific cameras (componentized)
//!
//! - Hardware: the session trait every camera backend implements
//! - Components: metadata parser, frame waiter, sync gate, reconnection,
//!   settings application, telemetry and the acquisition loop
//! - [`CameraDriver`]: start/stop lifecycle around one dedicated worker thread
//!
//! All hardware calls of a session happen on its worker thread. The rest of
//! the application talks to the worker through the [`SettingsHandle`], the
//! cancellation token (via [`CameraDriver::stop`]) and the sync gate.

pub mod components;
pub mod config;
pub mod hardware;
#[cfg(feature = "mock")]
pub mod mock;
pub mod stats;

pub use crate::components::acquisition::{AcquisitionLoop, LoopContext, LoopPhase};
pub use crate::components::connection::{ConnectionTracker, ReconnectOutcome, Reconnector};
pub use crate::components::sync_gate::{
    EventSource, GateRelease, ManualEventSource, SyncGate, SyncGateState, SyncTrigger,
};
pub use crate::components::telemetry::Telemetry;
pub use crate::config::AcquisitionConfig;
pub use crate::hardware::{AbortHandle, CameraHardware, Command, FilledBuffer, PropertyValue};
pub use crate::stats::{AcquisitionStats, StatsSnapshot};

use camdaq_core::cancel::CancelToken;
use camdaq_core::error::{AppResult, DaqError};
use camdaq_core::frame::Frame;
use camdaq_core::settings::{CameraSettings, SettingsHandle, SettingsSnapshot};
use camdaq_core::status::{ConnectionState, ConnectionStatus, StatusPublisher};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Hardware session parked between runs.
struct Session {
    hw: Box<dyn CameraHardware>,
    /// What the last run left applied; `None` forces a full apply.
    snapshot: Option<SettingsSnapshot>,
}

/// Driver for one camera session.
///
/// # Drop Order
///
/// Dropping the driver stops the worker and joins it before the hardware
/// session is released.
pub struct CameraDriver {
    name: String,
    config: AcquisitionConfig,
    settings: SettingsHandle,
    cancel: CancelToken,
    gate: Arc<SyncGate>,
    tracker: Arc<ConnectionTracker>,
    telemetry: watch::Sender<Telemetry>,
    stats: Arc<AcquisitionStats>,
    running: Arc<AtomicBool>,
    session: Arc<Mutex<Option<Session>>>,
    abort: Option<Arc<dyn AbortHandle>>,
    worker: Mutex<Option<JoinHandle<AppResult<()>>>>,
    event_source: Mutex<Option<Arc<dyn EventSource>>>,
}

impl CameraDriver {
    /// Wrap an opened hardware session.
    pub fn new(
        hw: Box<dyn CameraHardware>,
        settings: CameraSettings,
        config: AcquisitionConfig,
    ) -> Self {
        let name = hw.name().to_string();
        let abort = hw.abort_handle();
        let (telemetry, _) = watch::channel(Telemetry::default());
        info!(
            camera = %name,
            pipeline_depth = config.pipeline_depth,
            poll_interval_ms = config.poll_interval.as_millis() as u64,
            abortable = abort.is_some(),
            "Camera driver created"
        );

        Self {
            gate: Arc::new(SyncGate::new(config.poll_interval)),
            tracker: Arc::new(ConnectionTracker::new(StatusPublisher::new())),
            settings: SettingsHandle::new(settings),
            cancel: CancelToken::new(),
            telemetry,
            stats: Arc::new(AcquisitionStats::new()),
            running: Arc::new(AtomicBool::new(false)),
            session: Arc::new(Mutex::new(Some(Session { hw, snapshot: None }))),
            abort,
            worker: Mutex::new(None),
            event_source: Mutex::new(None),
            name,
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &AcquisitionConfig {
        &self.config
    }

    /// Start acquiring; `callback` runs on the worker thread for every frame.
    ///
    /// Blocks until the first `AcquisitionStart` was issued or startup failed
    /// with a configuration or fatal error. If neither happens within
    /// `startup_timeout` (e.g. the device is being reconnected) this returns
    /// `Ok` and the worker keeps trying; later failures are reported by
    /// [`CameraDriver::wait_stopped`].
    pub fn start<F>(&self, callback: F) -> AppResult<()>
    where
        F: FnMut(Frame) + Send + 'static,
    {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(DaqError::AlreadyRunning);
        }
        self.reap_worker();
        self.cancel.reset();

        let ctx = LoopContext {
            config: self.config.clone(),
            settings: self.settings.clone(),
            cancel: self.cancel.clone(),
            gate: self.gate.clone(),
            tracker: self.tracker.clone(),
            stats: self.stats.clone(),
            telemetry: self.telemetry.clone(),
        };
        let (report, startup) = mpsc::channel();
        let slot = self.session.clone();
        let running = self.running.clone();

        let spawned = thread::Builder::new()
            .name(format!("camdaq-acq-{}", self.name))
            .spawn(move || run_worker(ctx, slot, running, report, callback));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.running.store(false, Ordering::Release);
                return Err(DaqError::Worker(format!(
                    "failed to spawn acquisition worker: {e}"
                )));
            }
        };
        *self.worker.lock() = Some(handle);

        match startup.recv_timeout(self.config.startup_timeout) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                // The worker is already in Stopping; collect it so a retry can start.
                self.join_worker();
                Err(e)
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    camera = %self.name,
                    timeout_ms = self.config.startup_timeout.as_millis() as u64,
                    "Acquisition start not confirmed in time, worker keeps trying"
                );
                Ok(())
            }
            Err(RecvTimeoutError::Disconnected) => match self.join_worker() {
                Some(Err(e)) => Err(e),
                _ => Err(DaqError::Worker(
                    "acquisition worker exited without reporting startup".into(),
                )),
            },
        }
    }

    /// Request the worker to stop. Does not wait; see [`CameraDriver::wait_stopped`].
    pub fn stop(&self) {
        if !self.is_running() {
            return;
        }
        debug!(camera = %self.name, "Stop requested");
        self.cancel.cancel();
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }

    /// Wait up to `timeout` for the worker to exit and return its result.
    ///
    /// Returns `Ok` when no worker was started. A timeout leaves the worker
    /// running and returns [`DaqError::Worker`].
    pub fn wait_stopped(&self, timeout: Duration) -> AppResult<()> {
        let deadline = Instant::now() + timeout;
        let poll = self.config.poll_interval.min(Duration::from_millis(10));
        loop {
            let finished = match self.worker.lock().as_ref() {
                None => return Ok(()),
                Some(handle) => handle.is_finished(),
            };
            if finished {
                return self.join_worker().unwrap_or(Ok(()));
            }
            if Instant::now() >= deadline {
                return Err(DaqError::Worker(format!(
                    "acquisition worker did not stop within {} ms",
                    timeout.as_millis()
                )));
            }
            thread::sleep(poll);
        }
    }

    /// Switch synchronized acquisition on (`Some`) or off (`None`).
    ///
    /// The previous event source, if any, is detached. The change reaches the
    /// hardware through the settings on the next Running iteration.
    pub fn synchronize_on(&self, source: Option<Arc<dyn EventSource>>) {
        let mut current = self.event_source.lock();
        if let Some(previous) = current.take() {
            previous.detach();
        }
        let synchronized = source.is_some();
        if let Some(source) = source {
            self.gate.set_enabled(true);
            source.attach(Arc::downgrade(&self.gate));
            *current = Some(source);
        } else {
            self.gate.set_enabled(false);
        }
        self.settings.update(|s| s.synchronized = synchronized);
        info!(camera = %self.name, synchronized, "Synchronization changed");
    }

    /// Shared live settings; edits are applied on the next Running iteration.
    pub fn settings(&self) -> SettingsHandle {
        self.settings.clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.tracker.status().subscribe()
    }

    pub fn subscribe_telemetry(&self) -> watch::Receiver<Telemetry> {
        self.telemetry.subscribe()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.tracker.state()
    }

    pub fn sync_gate(&self) -> &Arc<SyncGate> {
        &self.gate
    }

    fn join_worker(&self) -> Option<AppResult<()>> {
        let handle = self.worker.lock().take()?;
        Some(handle.join().unwrap_or_else(|_| {
            Err(DaqError::Worker("acquisition worker panicked".into()))
        }))
    }

    /// Collect a worker whose result nobody waited for.
    fn reap_worker(&self) {
        if let Some(Err(e)) = self.join_worker() {
            debug!(camera = %self.name, error = %e, "Discarding result of previous run");
        }
    }
}

impl Drop for CameraDriver {
    fn drop(&mut self) {
        if let Some(source) = self.event_source.lock().take() {
            source.detach();
        }
        self.stop();
        if let Err(e) = self.wait_stopped(self.config.startup_timeout) {
            warn!(camera = %self.name, error = %e, "Acquisition worker not stopped on drop");
        }
    }
}

/// Worker thread body: borrow the parked session, run the loop, park it again.
fn run_worker<F>(
    ctx: LoopContext,
    slot: Arc<Mutex<Option<Session>>>,
    running: Arc<AtomicBool>,
    report: mpsc::Sender<AppResult<()>>,
    mut callback: F,
) -> AppResult<()>
where
    F: FnMut(Frame),
{
    let cancel = ctx.cancel.clone();
    let Some(Session { mut hw, snapshot }) = slot.lock().take() else {
        let err = DaqError::Worker("hardware session is not available".into());
        let _ = report.send(Err(err.clone()));
        running.store(false, Ordering::Release);
        return Err(err);
    };

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let mut acquisition =
            AcquisitionLoop::new(hw.as_mut(), ctx, snapshot).with_startup_report(report.clone());
        let result = acquisition.run(&mut callback);
        (result, acquisition.into_snapshot())
    }));
    let (result, snapshot) = match outcome {
        Ok(finished) => finished,
        Err(_) => {
            error!("Acquisition worker panicked");
            let err = DaqError::Worker("acquisition worker panicked".into());
            let _ = report.send(Err(err.clone()));
            (Err(err), None)
        }
    };

    *slot.lock() = Some(Session { hw, snapshot });
    cancel.reset();
    running.store(false, Ordering::Release);
    result
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;
    use crate::mock::MockCamera;
    use camdaq_core::settings::Roi;

    fn driver() -> (CameraDriver, crate::mock::MockControl) {
        let camera = MockCamera::with_sensor("unit", 128, 128);
        let control = camera.control();
        let settings = CameraSettings {
            roi: Roi::new(0, 0, 32, 32),
            exposure_s: 0.001,
            ..Default::default()
        };
        let config = AcquisitionConfig {
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        };
        (CameraDriver::new(Box::new(camera), settings, config), control)
    }

    #[test]
    fn test_second_start_is_rejected() {
        let (driver, control) = driver();
        driver.start(|_| {}).unwrap();
        assert!(driver.is_running());
        assert!(matches!(driver.start(|_| {}), Err(DaqError::AlreadyRunning)));

        driver.stop();
        driver.wait_stopped(Duration::from_secs(2)).unwrap();
        assert!(!driver.is_running());
        assert!(!control.is_acquiring());
    }

    #[test]
    fn test_wait_stopped_without_worker() {
        let (driver, _control) = driver();
        driver.wait_stopped(Duration::from_millis(10)).unwrap();
        driver.stop();
        assert!(!driver.is_running());
    }

    #[test]
    fn test_synchronize_on_toggles_settings_and_gate() {
        let (driver, _control) = driver();
        let source = ManualEventSource::new();
        driver.synchronize_on(Some(source.clone()));
        assert!(driver.settings().get().synchronized);
        assert!(driver.sync_gate().is_enabled());

        driver.synchronize_on(None);
        assert!(!driver.settings().get().synchronized);
        assert!(!driver.sync_gate().is_enabled());
        assert!(!source.fire());
    }
}
