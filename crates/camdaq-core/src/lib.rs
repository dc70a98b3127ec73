//! Core types shared by every camdaq crate.
//!
//! - [`error`]: the `DaqError` taxonomy and its classification into recovery classes
//! - [`cancel`]: the cooperative cancellation flag observed at every suspension point
//! - [`settings`]: live camera settings, the applied-settings snapshot and frame format
//! - [`frame`]: delivered frames and their per-frame metadata
//! - [`status`]: connection state and the one-way status notification stream

pub mod cancel;
pub mod error;
pub mod frame;
pub mod settings;
pub mod status;

pub use cancel::CancelToken;
pub use error::{AppResult, DaqError, ErrorClass, HardwareError, HardwareErrorKind};
pub use frame::{Frame, FrameMetadata};
pub use settings::{
    Binning, CameraSettings, FrameFormat, PixelEncoding, Roi, SettingsHandle, SettingsSnapshot,
};
pub use status::{ConnectionState, ConnectionStatus, StatusPublisher};
