//! Hardware abstraction consumed by the acquisition core.
//!
//! The property layer (named settings such as exposure time, gain or binning)
//! and the buffer primitives of a vendor SDK are modelled as one trait,
//! [`CameraHardware`]. All calls are made from the single acquisition worker;
//! the only thread-safe entry point is the optional [`AbortHandle`].

use camdaq_core::error::{AppResult, DaqError};
use camdaq_pool::{BufferSink, FrameBuffer};
use std::sync::Arc;
use std::time::Duration;

/// Property names understood by the core.
pub mod props {
    pub const TRIGGER_MODE: &str = "TriggerMode";
    pub const GAIN: &str = "GainMode";
    pub const READOUT_RATE: &str = "PixelReadoutRate";
    pub const EXPOSURE_TIME: &str = "ExposureTime";
    pub const BINNING: &str = "AOIBinning";
    pub const AOI_WIDTH: &str = "AOIWidth";
    pub const AOI_HEIGHT: &str = "AOIHeight";
    pub const AOI_LEFT: &str = "AOILeft";
    pub const AOI_TOP: &str = "AOITop";
    pub const PIXEL_ENCODING: &str = "PixelEncoding";
    pub const IMAGE_SIZE_BYTES: &str = "ImageSizeBytes";
    pub const READOUT_TIME: &str = "ReadoutTime";
    pub const METADATA_ENABLE: &str = "MetadataEnable";
    pub const TIMESTAMP_CLOCK_FREQUENCY: &str = "TimestampClockFrequency";
    pub const SENSOR_TEMPERATURE: &str = "SensorTemperature";
    pub const INTERFACE_TYPE: &str = "InterfaceType";

    /// Trigger mode values.
    pub const TRIGGER_INTERNAL: &str = "Internal";
    pub const TRIGGER_SOFTWARE: &str = "Software";
}

/// Value of a hardware property.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Enum(String),
}

impl PropertyValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Float(v) => Some(*v),
            PropertyValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PropertyValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Enum(v) => Some(v),
            _ => None,
        }
    }
}

impl std::fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PropertyValue::Int(v) => write!(f, "{v}"),
            PropertyValue::Float(v) => write!(f, "{v}"),
            PropertyValue::Bool(v) => write!(f, "{v}"),
            PropertyValue::Enum(v) => write!(f, "{v}"),
        }
    }
}

/// Stateless hardware actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    AcquisitionStart,
    AcquisitionStop,
    /// Drop every buffer the hardware still holds.
    Flush,
    SoftwareTrigger,
    TimestampClockReset,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::AcquisitionStart => "AcquisitionStart",
            Command::AcquisitionStop => "AcquisitionStop",
            Command::Flush => "Flush",
            Command::SoftwareTrigger => "SoftwareTrigger",
            Command::TimestampClockReset => "TimestampClockReset",
        }
    }
}

/// A buffer handed back by the hardware, with the number of bytes it filled.
#[derive(Debug)]
pub struct FilledBuffer {
    pub buffer: FrameBuffer,
    pub size: usize,
}

/// Thread-safe way to interrupt an in-progress [`CameraHardware::wait_filled`].
pub trait AbortHandle: Send + Sync {
    /// Best-effort: make the current (or next) wait return promptly.
    fn abort(&self);
}

/// A camera session as seen by the acquisition core.
///
/// Buffers are submitted through the [`BufferSink`] supertrait.
pub trait CameraHardware: BufferSink + Send {
    /// Device name for logs.
    fn name(&self) -> &str;

    fn get(&mut self, name: &str) -> AppResult<PropertyValue>;

    /// Write a property; returns the value actually applied by the device.
    fn set(&mut self, name: &str, value: PropertyValue) -> AppResult<PropertyValue>;

    fn is_implemented(&mut self, name: &str) -> AppResult<bool>;

    fn is_writable(&mut self, name: &str) -> AppResult<bool>;

    fn command(&mut self, command: Command) -> AppResult<()>;

    /// Wait up to `timeout` for the oldest submitted buffer to be filled.
    ///
    /// `Duration::ZERO` is a non-blocking check. "Nothing ready" is reported as
    /// a hardware `Timeout` error.
    fn wait_filled(&mut self, timeout: Duration) -> AppResult<FilledBuffer>;

    /// Open (or re-open) the device session.
    fn open(&mut self) -> AppResult<()>;

    /// Close the device session. Buffers still held by the device are dropped.
    fn close(&mut self) -> AppResult<()>;

    fn abort_handle(&self) -> Option<Arc<dyn AbortHandle>> {
        None
    }
}

/// Read a numeric property.
pub fn read_f64(hw: &mut dyn CameraHardware, name: &str) -> AppResult<f64> {
    hw.get(name)?
        .as_f64()
        .ok_or_else(|| DaqError::Configuration(format!("property {name} is not numeric")))
}

/// Read an enumerated property.
pub fn read_enum(hw: &mut dyn CameraHardware, name: &str) -> AppResult<String> {
    match hw.get(name)? {
        PropertyValue::Enum(value) => Ok(value),
        other => Err(DaqError::Configuration(format!(
            "property {name} is not an enumeration (got {other})"
        ))),
    }
}

/// Whether a property can be written right now.
pub fn is_settable(hw: &mut dyn CameraHardware, name: &str) -> AppResult<bool> {
    Ok(hw.is_implemented(name)? && hw.is_writable(name)?)
}
