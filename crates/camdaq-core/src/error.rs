//! Error types for the acquisition core.
//!
//! `DaqError` is the single error type returned by the pool, the driver
//! components and the acquisition loop. Hardware failures carry a structured
//! [`HardwareError`] whose [`HardwareErrorKind`] is what recovery decisions are
//! based on, never the raw vendor code.
//!
//! ## Classification
//!
//! Every error maps onto exactly one [`ErrorClass`] through [`DaqError::class`]:
//!
//! - **`Transient`**: a single timed-out wait, a momentarily full buffer queue.
//!   Retried locally by the frame waiter / acquisition loop.
//! - **`Overflow`**: the device's internal buffer saturated because frames are
//!   consumed too slowly. Logged as a warning and escalated like a timeout.
//! - **`ConnectionLost`**: communication failure, device in use, or an
//!   out-of-range answer meaning the device is gone. Handled by the
//!   reconnection state machine.
//! - **`ConfigurationInconsistent`**: buffer size disagreeing with the device,
//!   invalid or unwritable parameters. Fatal to the current start attempt.
//! - **`Fatal`**: anything else. Aborts the acquisition loop.
//! - **`Cancelled`**: a cooperative stop request was observed.

use thiserror::Error;

/// Category of a hardware failure, independent of vendor error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HardwareErrorKind {
    /// A wait for a filled buffer timed out.
    Timeout,
    /// The device buffer queue is momentarily full.
    BufferFull,
    /// The device's internal frame buffer overflowed.
    Overflow,
    /// Communication with the device failed.
    Communication,
    /// The device is opened by another session.
    DeviceInUse,
    /// The device answered with an out-of-range index (typically: device absent).
    OutOfRange,
    /// A submitted buffer has the wrong size.
    InvalidSize,
    /// A parameter value was rejected.
    InvalidParameter,
    /// The property or command is not implemented by this device.
    NotImplemented,
    /// The property exists but cannot be written now.
    NotWritable,
    /// Unrecognised failure.
    Other,
}

impl std::fmt::Display for HardwareErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            HardwareErrorKind::Timeout => "timeout",
            HardwareErrorKind::BufferFull => "buffer_full",
            HardwareErrorKind::Overflow => "overflow",
            HardwareErrorKind::Communication => "communication",
            HardwareErrorKind::DeviceInUse => "device_in_use",
            HardwareErrorKind::OutOfRange => "out_of_range",
            HardwareErrorKind::InvalidSize => "invalid_size",
            HardwareErrorKind::InvalidParameter => "invalid_parameter",
            HardwareErrorKind::NotImplemented => "not_implemented",
            HardwareErrorKind::NotWritable => "not_writable",
            HardwareErrorKind::Other => "other",
        };
        write!(f, "{}", label)
    }
}

/// Structured hardware error with category.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("hardware {kind} error (code {code}): {message}")]
pub struct HardwareError {
    /// Vendor error code, kept for diagnostics only.
    pub code: i32,
    pub kind: HardwareErrorKind,
    pub message: String,
}

impl HardwareError {
    pub fn new(code: i32, kind: HardwareErrorKind, message: impl Into<String>) -> Self {
        Self {
            code,
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for a timeout with no vendor code.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(0, HardwareErrorKind::Timeout, message)
    }
}

/// Recovery class of an error. See the module docs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Transient,
    Overflow,
    ConnectionLost,
    ConfigurationInconsistent,
    Fatal,
    Cancelled,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Overflow => "overflow",
            ErrorClass::ConnectionLost => "connection_lost",
            ErrorClass::ConfigurationInconsistent => "configuration_inconsistent",
            ErrorClass::Fatal => "fatal",
            ErrorClass::Cancelled => "cancelled",
        };
        write!(f, "{}", label)
    }
}

/// Convenience alias for results using the core error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Primary error type for the acquisition core.
#[derive(Error, Debug, Clone)]
pub enum DaqError {
    /// A hardware call failed.
    #[error("{0}")]
    Hardware(#[from] HardwareError),

    /// The requested buffer size is inconsistent with what the hardware reports.
    ///
    /// The hardware image size must be at least `width * height * bytes_per_pixel`.
    /// This is a configuration-consistency problem, not a transient fault.
    #[error("buffer allocation error: frame needs {required} bytes but hardware reports an image size of {hardware} bytes")]
    Allocation { required: usize, hardware: usize },

    /// Semantic configuration error (invalid value, impossible combination).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// No filled buffer arrived before the per-frame deadline.
    #[error("no frame arrived within {waited_ms} ms")]
    FrameTimeout { waited_ms: u64 },

    /// The buffer returned by the hardware is not the oldest pending buffer.
    ///
    /// This is a bookkeeping bug, not a recoverable fault.
    #[error("buffer identity mismatch: expected buffer #{expected:?}, hardware returned #{returned}")]
    BufferMismatch { expected: Option<u64>, returned: u64 },

    /// The trailing metadata region of a frame could not be parsed.
    #[error("metadata parse error: {0}")]
    Metadata(String),

    /// An acquisition is already running on this driver.
    #[error("acquisition already running")]
    AlreadyRunning,

    /// A cooperative stop request was observed.
    #[error("operation cancelled")]
    Cancelled,

    /// The acquisition worker could not be started or terminated abnormally.
    #[error("acquisition worker error: {0}")]
    Worker(String),
}

impl DaqError {
    /// Classify this error into its recovery class.
    pub fn class(&self) -> ErrorClass {
        match self {
            DaqError::Hardware(hw) => match hw.kind {
                HardwareErrorKind::Timeout | HardwareErrorKind::BufferFull => ErrorClass::Transient,
                HardwareErrorKind::Overflow => ErrorClass::Overflow,
                HardwareErrorKind::Communication
                | HardwareErrorKind::DeviceInUse
                | HardwareErrorKind::OutOfRange => ErrorClass::ConnectionLost,
                HardwareErrorKind::InvalidSize
                | HardwareErrorKind::InvalidParameter
                | HardwareErrorKind::NotImplemented
                | HardwareErrorKind::NotWritable => ErrorClass::ConfigurationInconsistent,
                HardwareErrorKind::Other => ErrorClass::Fatal,
            },
            DaqError::FrameTimeout { .. } => ErrorClass::Transient,
            DaqError::Allocation { .. } | DaqError::Configuration(_) => {
                ErrorClass::ConfigurationInconsistent
            }
            DaqError::Cancelled => ErrorClass::Cancelled,
            DaqError::BufferMismatch { .. }
            | DaqError::Metadata(_)
            | DaqError::AlreadyRunning
            | DaqError::Worker(_) => ErrorClass::Fatal,
        }
    }

    /// True for a hardware `Timeout`, i.e. "nothing ready yet".
    pub fn is_hardware_timeout(&self) -> bool {
        matches!(self, DaqError::Hardware(hw) if hw.kind == HardwareErrorKind::Timeout)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, DaqError::Cancelled)
    }
}
