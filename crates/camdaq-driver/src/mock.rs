//! Simulated camera for tests and the CLI.
//!
//! [`MockCamera`] implements [`CameraHardware`] in process: buffers submitted
//! to it wait in a FIFO until they are filled, either explicitly through the
//! cloneable [`MockControl`] handle or by an internal frame timer while
//! acquiring in `Internal` trigger mode. The control handle can also inject
//! errors, simulate a disconnect and inspect what the driver did.
//!
//! Filled frames carry the frame index as a little-endian u64 in their first
//! 8 payload bytes. When `MetadataEnable` is on, a 32-byte trailer (timestamp
//! record followed by a frame-info record) is appended after the payload.

use crate::components::metadata::{encode_record, FRAME_INFO_TAG, TIMESTAMP_TAG};
use crate::hardware::{props, AbortHandle, CameraHardware, Command, FilledBuffer, PropertyValue};
use camdaq_core::error::{AppResult, DaqError, HardwareError, HardwareErrorKind};
use camdaq_core::settings::PixelEncoding;
use camdaq_pool::{BufferSink, FrameBuffer};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Bytes appended after the payload when metadata is enabled.
pub const MOCK_TRAILER_LEN: usize = 32;

/// Hardware calls that can have errors injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Get,
    Set,
    Command,
    Submit,
    WaitFilled,
    Open,
}

fn mock_error(kind: HardwareErrorKind, message: impl Into<String>) -> DaqError {
    DaqError::Hardware(HardwareError::new(-1, kind, message))
}

struct MockState {
    sensor_width: i64,
    sensor_height: i64,
    open: bool,
    disconnected: bool,
    acquiring: bool,
    aborted: bool,
    properties: HashMap<String, PropertyValue>,
    read_only: HashSet<String>,
    queued: VecDeque<FrameBuffer>,
    filled: VecDeque<FilledBuffer>,
    frames_filled: u64,
    missed_fills: u64,
    auto_fill: Option<Duration>,
    last_auto_fill: Instant,
    clock_start: Instant,
    failures: HashMap<MockOp, VecDeque<HardwareErrorKind>>,
    open_failures: u32,
    open_count: u32,
    image_size_override: Option<usize>,
    set_log: Vec<(String, PropertyValue)>,
    command_log: Vec<Command>,
}

impl MockState {
    fn new(sensor_width: u32, sensor_height: u32) -> Self {
        let mut properties = HashMap::new();
        let mut insert = |name: &str, value: PropertyValue| {
            properties.insert(name.to_string(), value);
        };
        insert(
            props::TRIGGER_MODE,
            PropertyValue::Enum(props::TRIGGER_INTERNAL.into()),
        );
        insert(
            props::GAIN,
            PropertyValue::Enum("16-bit (low noise & high well capacity)".into()),
        );
        insert(props::READOUT_RATE, PropertyValue::Enum("100 MHz".into()));
        insert(props::EXPOSURE_TIME, PropertyValue::Float(0.01));
        insert(props::BINNING, PropertyValue::Enum("1x1".into()));
        insert(props::AOI_WIDTH, PropertyValue::Int(i64::from(sensor_width)));
        insert(props::AOI_HEIGHT, PropertyValue::Int(i64::from(sensor_height)));
        insert(props::AOI_LEFT, PropertyValue::Int(0));
        insert(props::AOI_TOP, PropertyValue::Int(0));
        insert(props::PIXEL_ENCODING, PropertyValue::Enum("Mono16".into()));
        insert(props::READOUT_TIME, PropertyValue::Float(0.01));
        insert(props::METADATA_ENABLE, PropertyValue::Bool(false));
        insert(
            props::TIMESTAMP_CLOCK_FREQUENCY,
            PropertyValue::Int(1_000_000_000),
        );
        insert(props::SENSOR_TEMPERATURE, PropertyValue::Float(-10.0));
        insert(props::INTERFACE_TYPE, PropertyValue::Enum("USB3".into()));

        let read_only = [
            props::READOUT_TIME,
            props::TIMESTAMP_CLOCK_FREQUENCY,
            props::SENSOR_TEMPERATURE,
            props::INTERFACE_TYPE,
            props::IMAGE_SIZE_BYTES,
        ]
        .into_iter()
        .map(String::from)
        .collect();

        let now = Instant::now();
        Self {
            sensor_width: i64::from(sensor_width),
            sensor_height: i64::from(sensor_height),
            open: true,
            disconnected: false,
            acquiring: false,
            aborted: false,
            properties,
            read_only,
            queued: VecDeque::new(),
            filled: VecDeque::new(),
            frames_filled: 0,
            missed_fills: 0,
            auto_fill: None,
            last_auto_fill: now,
            clock_start: now,
            failures: HashMap::new(),
            open_failures: 0,
            open_count: 0,
            image_size_override: None,
            set_log: Vec::new(),
            command_log: Vec::new(),
        }
    }

    fn take_failure(&mut self, op: MockOp) -> AppResult<()> {
        match self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(kind) => Err(mock_error(kind, format!("injected {op:?} failure"))),
            None => Ok(()),
        }
    }

    fn check_connected(&self) -> AppResult<()> {
        if self.disconnected {
            return Err(mock_error(
                HardwareErrorKind::Communication,
                "device not responding",
            ));
        }
        if !self.open {
            return Err(mock_error(
                HardwareErrorKind::Communication,
                "device session is closed",
            ));
        }
        Ok(())
    }

    fn int(&self, name: &str) -> i64 {
        self.properties
            .get(name)
            .and_then(PropertyValue::as_i64)
            .unwrap_or(0)
    }

    fn enumerated(&self, name: &str) -> &str {
        self.properties
            .get(name)
            .and_then(PropertyValue::as_str)
            .unwrap_or_default()
    }

    fn metadata_enabled(&self) -> bool {
        self.properties
            .get(props::METADATA_ENABLE)
            .and_then(PropertyValue::as_bool)
            .unwrap_or(false)
    }

    fn binning(&self) -> (i64, i64) {
        parse_binning(self.enumerated(props::BINNING)).unwrap_or((1, 1))
    }

    fn bytes_per_pixel(&self) -> i64 {
        PixelEncoding::parse(self.enumerated(props::PIXEL_ENCODING))
            .map(|e| i64::from(e.bytes_per_pixel()))
            .unwrap_or(2)
    }

    fn frame_dims(&self) -> (i64, i64) {
        let (h, v) = self.binning();
        (
            self.int(props::AOI_WIDTH) / h.max(1),
            self.int(props::AOI_HEIGHT) / v.max(1),
        )
    }

    fn payload_size(&self) -> usize {
        let (w, h) = self.frame_dims();
        usize::try_from(w * h * self.bytes_per_pixel()).unwrap_or(0)
    }

    fn image_size(&self) -> usize {
        if let Some(size) = self.image_size_override {
            return size;
        }
        let trailer = if self.metadata_enabled() {
            MOCK_TRAILER_LEN
        } else {
            0
        };
        self.payload_size() + trailer
    }

    fn trailer(&self) -> Vec<u8> {
        let frequency = self
            .properties
            .get(props::TIMESTAMP_CLOCK_FREQUENCY)
            .and_then(PropertyValue::as_f64)
            .unwrap_or(1e9);
        let ticks = (self.clock_start.elapsed().as_secs_f64() * frequency) as u64;

        let (w, h) = self.frame_dims();
        let mut info = Vec::with_capacity(8);
        info.extend_from_slice(&(w as u16).to_le_bytes());
        info.extend_from_slice(&(h as u16).to_le_bytes());
        info.extend_from_slice(&(self.bytes_per_pixel() as u16).to_le_bytes());
        info.extend_from_slice(&0u16.to_le_bytes());

        let mut trailer = Vec::with_capacity(MOCK_TRAILER_LEN);
        encode_record(&mut trailer, TIMESTAMP_TAG, &ticks.to_le_bytes());
        encode_record(&mut trailer, FRAME_INFO_TAG, &info);
        trailer
    }

    /// Fill the oldest queued buffer. Returns false when none is queued.
    fn fill_one(&mut self) -> bool {
        let Some(mut buffer) = self.queued.pop_front() else {
            self.missed_fills += 1;
            return false;
        };
        let index = self.frames_filled;
        self.frames_filled += 1;

        let trailer = if self.metadata_enabled() {
            self.trailer()
        } else {
            Vec::new()
        };
        let len = buffer.len();
        let bytes = buffer.as_bytes_mut();
        let payload_end = len.saturating_sub(trailer.len());
        let stamp = index.to_le_bytes();
        let n = payload_end.min(stamp.len());
        bytes[..n].copy_from_slice(&stamp[..n]);
        if trailer.len() <= len {
            bytes[payload_end..].copy_from_slice(&trailer);
        }

        self.filled.push_back(FilledBuffer { buffer, size: len });
        true
    }

    fn next_auto_fill(&self) -> Option<Instant> {
        let period = self.auto_fill?;
        let internal = self.enumerated(props::TRIGGER_MODE) == props::TRIGGER_INTERNAL;
        (self.acquiring && internal).then(|| self.last_auto_fill + period)
    }

    fn validate(&self, name: &str, value: &PropertyValue) -> AppResult<PropertyValue> {
        let invalid = |detail: String| {
            mock_error(
                HardwareErrorKind::InvalidParameter,
                format!("{name}: {detail}"),
            )
        };
        let current = self.properties.get(name);
        let same_type = matches!(
            (current, value),
            (Some(PropertyValue::Int(_)), PropertyValue::Int(_))
                | (Some(PropertyValue::Float(_)), PropertyValue::Float(_))
                | (Some(PropertyValue::Float(_)), PropertyValue::Int(_))
                | (Some(PropertyValue::Bool(_)), PropertyValue::Bool(_))
                | (Some(PropertyValue::Enum(_)), PropertyValue::Enum(_))
        );
        if !same_type {
            return Err(invalid(format!("unexpected value type {value:?}")));
        }

        match name {
            props::EXPOSURE_TIME => {
                let requested = value.as_f64().unwrap_or_default();
                Ok(PropertyValue::Float(requested.clamp(1e-5, 30.0)))
            }
            props::AOI_WIDTH | props::AOI_LEFT => {
                let v = value.as_i64().unwrap_or(-1);
                let min = if name == props::AOI_WIDTH { 1 } else { 0 };
                if v < min || v > self.sensor_width {
                    return Err(invalid(format!("{v} outside 0..={}", self.sensor_width)));
                }
                Ok(value.clone())
            }
            props::AOI_HEIGHT | props::AOI_TOP => {
                let v = value.as_i64().unwrap_or(-1);
                let min = if name == props::AOI_HEIGHT { 1 } else { 0 };
                if v < min || v > self.sensor_height {
                    return Err(invalid(format!("{v} outside 0..={}", self.sensor_height)));
                }
                Ok(value.clone())
            }
            props::BINNING => {
                let label = value.as_str().unwrap_or_default();
                match parse_binning(label) {
                    Some((h, v)) if [1, 2, 3, 4, 8].contains(&h) && [1, 2, 3, 4, 8].contains(&v) => {
                        Ok(value.clone())
                    }
                    _ => Err(invalid(format!("unsupported binning {label}"))),
                }
            }
            props::PIXEL_ENCODING => {
                let label = value.as_str().unwrap_or_default();
                PixelEncoding::parse(label)
                    .map(|_| value.clone())
                    .ok_or_else(|| invalid(format!("unsupported encoding {label}")))
            }
            props::TRIGGER_MODE => match value.as_str() {
                Some("Internal" | "Software" | "External") => Ok(value.clone()),
                _ => Err(invalid(format!("unsupported trigger mode {value}"))),
            },
            _ => Ok(value.clone()),
        }
    }
}

fn parse_binning(label: &str) -> Option<(i64, i64)> {
    let (h, v) = label.split_once('x')?;
    Some((h.trim().parse().ok()?, v.trim().parse().ok()?))
}

struct MockShared {
    state: Mutex<MockState>,
    cond: Condvar,
}

/// In-process camera.
pub struct MockCamera {
    name: String,
    shared: Arc<MockShared>,
}

impl MockCamera {
    /// A 2048x2048 camera.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_sensor(name, 2048, 2048)
    }

    pub fn with_sensor(name: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            name: name.into(),
            shared: Arc::new(MockShared {
                state: Mutex::new(MockState::new(width, height)),
                cond: Condvar::new(),
            }),
        }
    }

    /// Handle for scripting the camera from tests.
    pub fn control(&self) -> MockControl {
        MockControl {
            shared: self.shared.clone(),
        }
    }
}

impl BufferSink for MockCamera {
    fn submit(&mut self, buffer: FrameBuffer) -> AppResult<()> {
        let mut state = self.shared.state.lock();
        state.take_failure(MockOp::Submit)?;
        state.check_connected()?;
        let expected = state.image_size();
        if buffer.len() != expected {
            return Err(mock_error(
                HardwareErrorKind::InvalidSize,
                format!("buffer of {} bytes, image size is {expected}", buffer.len()),
            ));
        }
        state.queued.push_back(buffer);
        Ok(())
    }

    fn image_size_bytes(&mut self) -> AppResult<usize> {
        let mut state = self.shared.state.lock();
        state.take_failure(MockOp::Get)?;
        state.check_connected()?;
        Ok(state.image_size())
    }
}

impl CameraHardware for MockCamera {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&mut self, name: &str) -> AppResult<PropertyValue> {
        let mut state = self.shared.state.lock();
        state.take_failure(MockOp::Get)?;
        state.check_connected()?;
        if name == props::IMAGE_SIZE_BYTES {
            return Ok(PropertyValue::Int(state.image_size() as i64));
        }
        state.properties.get(name).cloned().ok_or_else(|| {
            mock_error(
                HardwareErrorKind::NotImplemented,
                format!("{name} not implemented"),
            )
        })
    }

    fn set(&mut self, name: &str, value: PropertyValue) -> AppResult<PropertyValue> {
        let mut state = self.shared.state.lock();
        state.take_failure(MockOp::Set)?;
        state.check_connected()?;
        if !state.properties.contains_key(name) {
            return Err(mock_error(
                HardwareErrorKind::NotImplemented,
                format!("{name} not implemented"),
            ));
        }
        if state.read_only.contains(name) {
            return Err(mock_error(
                HardwareErrorKind::NotWritable,
                format!("{name} is read-only"),
            ));
        }
        let actual = state.validate(name, &value)?;
        state.properties.insert(name.to_string(), actual.clone());
        state.set_log.push((name.to_string(), value));
        Ok(actual)
    }

    fn is_implemented(&mut self, name: &str) -> AppResult<bool> {
        let state = self.shared.state.lock();
        state.check_connected()?;
        Ok(name == props::IMAGE_SIZE_BYTES || state.properties.contains_key(name))
    }

    fn is_writable(&mut self, name: &str) -> AppResult<bool> {
        let state = self.shared.state.lock();
        state.check_connected()?;
        Ok(state.properties.contains_key(name) && !state.read_only.contains(name))
    }

    fn command(&mut self, command: Command) -> AppResult<()> {
        let mut state = self.shared.state.lock();
        state.take_failure(MockOp::Command)?;
        state.check_connected()?;
        state.command_log.push(command);
        match command {
            Command::AcquisitionStart => {
                state.acquiring = true;
                state.aborted = false;
                state.last_auto_fill = Instant::now();
            }
            Command::AcquisitionStop => state.acquiring = false,
            Command::Flush => {
                state.queued.clear();
                state.filled.clear();
            }
            Command::SoftwareTrigger => {
                let software =
                    state.enumerated(props::TRIGGER_MODE) == props::TRIGGER_SOFTWARE;
                if state.acquiring && software {
                    state.fill_one();
                }
            }
            Command::TimestampClockReset => state.clock_start = Instant::now(),
        }
        self.shared.cond.notify_all();
        Ok(())
    }

    fn wait_filled(&mut self, timeout: Duration) -> AppResult<FilledBuffer> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            state.take_failure(MockOp::WaitFilled)?;
            if state.disconnected {
                return Err(mock_error(
                    HardwareErrorKind::Communication,
                    "device not responding",
                ));
            }
            if std::mem::take(&mut state.aborted) {
                return Err(DaqError::Hardware(HardwareError::timeout("wait aborted")));
            }
            if let Some(filled) = state.filled.pop_front() {
                return Ok(filled);
            }

            let now = Instant::now();
            let mut wake = deadline;
            if let Some(next) = state.next_auto_fill() {
                if now >= next {
                    state.last_auto_fill = now;
                    state.fill_one();
                    continue;
                }
                wake = wake.min(next);
            }
            if now >= deadline {
                return Err(DaqError::Hardware(HardwareError::timeout(
                    "no filled buffer",
                )));
            }
            self.shared.cond.wait_until(&mut state, wake);
        }
    }

    fn open(&mut self) -> AppResult<()> {
        let mut state = self.shared.state.lock();
        state.open_count += 1;
        state.take_failure(MockOp::Open)?;
        if state.open_failures > 0 {
            state.open_failures -= 1;
            return Err(mock_error(
                HardwareErrorKind::Communication,
                "device not found",
            ));
        }
        state.disconnected = false;
        state.open = true;
        state.aborted = false;
        debug!(camera = %self.name, "Mock camera opened");
        Ok(())
    }

    fn close(&mut self) -> AppResult<()> {
        let mut state = self.shared.state.lock();
        state.open = false;
        state.acquiring = false;
        state.queued.clear();
        state.filled.clear();
        debug!(camera = %self.name, "Mock camera closed");
        Ok(())
    }

    fn abort_handle(&self) -> Option<Arc<dyn AbortHandle>> {
        Some(Arc::new(MockAbort {
            shared: self.shared.clone(),
        }))
    }
}

struct MockAbort {
    shared: Arc<MockShared>,
}

impl AbortHandle for MockAbort {
    fn abort(&self) {
        self.shared.state.lock().aborted = true;
        self.shared.cond.notify_all();
    }
}

/// Cloneable scripting handle for a [`MockCamera`].
#[derive(Clone)]
pub struct MockControl {
    shared: Arc<MockShared>,
}

impl MockControl {
    fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let result = f(&mut self.shared.state.lock());
        self.shared.cond.notify_all();
        result
    }

    /// Fill up to `n` queued buffers. Returns how many were filled.
    pub fn fill(&self, n: usize) -> usize {
        self.with_state(|s| (0..n).take_while(|_| s.fill_one()).count())
    }

    /// Fill frames every `period` while acquiring in `Internal` trigger mode.
    pub fn set_auto_fill(&self, period: Option<Duration>) {
        self.with_state(|s| {
            s.auto_fill = period;
            s.last_auto_fill = Instant::now();
        });
    }

    /// Make the next call of `op` fail with `kind`. Failures queue up.
    pub fn inject_error(&self, op: MockOp, kind: HardwareErrorKind) {
        self.with_state(|s| s.failures.entry(op).or_default().push_back(kind));
    }

    /// Drop the connection: every call fails with a communication error until
    /// the device is reopened.
    pub fn disconnect(&self) {
        self.with_state(|s| {
            s.disconnected = true;
            s.acquiring = false;
            s.queued.clear();
            s.filled.clear();
        });
    }

    /// Make the next `n` opens fail with a communication error.
    pub fn fail_next_opens(&self, n: u32) {
        self.with_state(|s| s.open_failures = n);
    }

    pub fn set_interface(&self, interface: &str) {
        self.set_property(props::INTERFACE_TYPE, PropertyValue::Enum(interface.into()));
    }

    /// Report `size` as image size regardless of the configured format.
    pub fn set_image_size_override(&self, size: Option<usize>) {
        self.with_state(|s| s.image_size_override = size);
    }

    /// Write a property directly, bypassing validation and the set log.
    pub fn set_property(&self, name: &str, value: PropertyValue) {
        self.with_state(|s| {
            s.properties.insert(name.to_string(), value);
        });
    }

    pub fn property(&self, name: &str) -> Option<PropertyValue> {
        self.with_state(|s| s.properties.get(name).cloned())
    }

    /// Make a property unknown to the device.
    pub fn remove_property(&self, name: &str) {
        self.with_state(|s| {
            s.properties.remove(name);
        });
    }

    pub fn set_read_only(&self, name: &str) {
        self.with_state(|s| {
            s.read_only.insert(name.to_string());
        });
    }

    /// Every successful `set`, in call order.
    pub fn set_log(&self) -> Vec<(String, PropertyValue)> {
        self.with_state(|s| s.set_log.clone())
    }

    pub fn commands(&self) -> Vec<Command> {
        self.with_state(|s| s.command_log.clone())
    }

    pub fn clear_logs(&self) {
        self.with_state(|s| {
            s.set_log.clear();
            s.command_log.clear();
        });
    }

    pub fn open_count(&self) -> u32 {
        self.with_state(|s| s.open_count)
    }

    pub fn is_open(&self) -> bool {
        self.with_state(|s| s.open && !s.disconnected)
    }

    pub fn is_acquiring(&self) -> bool {
        self.with_state(|s| s.acquiring)
    }

    pub fn queued_len(&self) -> usize {
        self.with_state(|s| s.queued.len())
    }

    pub fn filled_len(&self) -> usize {
        self.with_state(|s| s.filled.len())
    }

    pub fn frames_filled(&self) -> u64 {
        self.with_state(|s| s.frames_filled)
    }

    /// Fill attempts that found no queued buffer.
    pub fn missed_fills(&self) -> u64 {
        self.with_state(|s| s.missed_fills)
    }
}
