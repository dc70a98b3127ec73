//! Shared helpers for driver integration tests against the mock camera.

#![allow(dead_code)] // Not every test file uses every helper

use camdaq_core::frame::Frame;
use camdaq_core::settings::{CameraSettings, Roi};
use camdaq_driver::mock::{MockCamera, MockControl};
use camdaq_driver::{AcquisitionConfig, CameraDriver};
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::{Duration, Instant};

pub const SENSOR: u32 = 256;
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(3);

/// 64x64 Mono16 region, short exposure.
pub fn small_settings() -> CameraSettings {
    CameraSettings {
        roi: Roi::new(16, 32, 64, 64),
        exposure_s: 0.001,
        ..Default::default()
    }
}

/// Fast polling and backoff so tests finish quickly.
pub fn fast_config() -> AcquisitionConfig {
    AcquisitionConfig {
        pipeline_depth: 2,
        poll_interval: Duration::from_millis(20),
        frame_timeout_margin: Duration::from_millis(500),
        reconnect_backoff: Duration::from_millis(20),
        startup_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

pub fn mock_driver(config: AcquisitionConfig) -> (CameraDriver, MockControl) {
    let camera = MockCamera::with_sensor("test-cam", SENSOR, SENSOR);
    let control = camera.control();
    let driver = CameraDriver::new(Box::new(camera), small_settings(), config);
    (driver, control)
}

/// Delivery callback forwarding frames into a channel.
pub fn frame_channel() -> (impl FnMut(Frame) + Send + 'static, Receiver<Frame>) {
    let (tx, rx): (Sender<Frame>, Receiver<Frame>) = mpsc::channel();
    let callback = move |frame: Frame| {
        let _ = tx.send(frame);
    };
    (callback, rx)
}

/// Collect `n` frames or panic after `timeout`.
pub fn recv_frames(rx: &Receiver<Frame>, n: usize, timeout: Duration) -> Vec<Frame> {
    let deadline = Instant::now() + timeout;
    let mut frames = Vec::with_capacity(n);
    while frames.len() < n {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(frame) => frames.push(frame),
            Err(e) => panic!("received {} of {n} frames: {e}", frames.len()),
        }
    }
    frames
}

/// Poll `condition` until it holds or `timeout` expires.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Mock frames carry their fill index in the first 8 payload bytes.
pub fn fill_index(frame: &Frame) -> u64 {
    let mut stamp = [0u8; 8];
    stamp.copy_from_slice(&frame.payload[..8]);
    u64::from_le_bytes(stamp)
}
