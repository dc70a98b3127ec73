//! Camera settings, the applied-settings snapshot and the frame format.
//!
//! [`CameraSettings`] is the live configuration other threads edit through a
//! [`SettingsHandle`]. The acquisition loop keeps a [`SettingsSnapshot`] of what
//! it last applied and compares it by value at the top of every iteration.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// On-chip binning factors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binning {
    pub horizontal: u16,
    pub vertical: u16,
}

impl Binning {
    pub fn new(horizontal: u16, vertical: u16) -> Self {
        Self {
            horizontal,
            vertical,
        }
    }
}

impl Default for Binning {
    fn default() -> Self {
        Self::new(1, 1)
    }
}

impl std::fmt::Display for Binning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.horizontal, self.vertical)
    }
}

/// Region of interest on the sensor, in unbinned pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Roi {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

impl Default for Roi {
    fn default() -> Self {
        Self::new(0, 0, 2048, 2048)
    }
}

/// Pixel encoding of the raw frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PixelEncoding {
    Mono8,
    Mono12,
    #[default]
    Mono16,
    Mono32,
}

impl PixelEncoding {
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            PixelEncoding::Mono8 => 1,
            PixelEncoding::Mono12 | PixelEncoding::Mono16 => 2,
            PixelEncoding::Mono32 => 4,
        }
    }

    pub fn bit_depth(self) -> u32 {
        match self {
            PixelEncoding::Mono8 => 8,
            PixelEncoding::Mono12 => 12,
            PixelEncoding::Mono16 => 16,
            PixelEncoding::Mono32 => 32,
        }
    }

    /// Name used by the hardware property layer.
    pub fn as_str(self) -> &'static str {
        match self {
            PixelEncoding::Mono8 => "Mono8",
            PixelEncoding::Mono12 => "Mono12",
            PixelEncoding::Mono16 => "Mono16",
            PixelEncoding::Mono32 => "Mono32",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "Mono8" => Some(PixelEncoding::Mono8),
            "Mono12" => Some(PixelEncoding::Mono12),
            "Mono16" => Some(PixelEncoding::Mono16),
            "Mono32" => Some(PixelEncoding::Mono32),
            _ => None,
        }
    }
}

/// Live, user-editable camera configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraSettings {
    pub binning: Binning,
    pub roi: Roi,
    /// Requested exposure time in seconds.
    pub exposure_s: f64,
    /// Readout rate label, e.g. "100 MHz".
    pub readout_rate: String,
    /// Gain mode label.
    pub gain: String,
    pub encoding: PixelEncoding,
    /// Frames are started by an external event through the sync gate.
    pub synchronized: bool,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            binning: Binning::default(),
            roi: Roi::default(),
            exposure_s: 0.01,
            readout_rate: "100 MHz".to_string(),
            gain: "16-bit (low noise & high well capacity)".to_string(),
            encoding: PixelEncoding::default(),
            synchronized: false,
        }
    }
}

/// Width, height and bytes per pixel of the frame the hardware will deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameFormat {
    pub width: u32,
    pub height: u32,
    pub bytes_per_pixel: u32,
}

impl FrameFormat {
    pub fn new(width: u32, height: u32, bytes_per_pixel: u32) -> Self {
        Self {
            width,
            height,
            bytes_per_pixel,
        }
    }

    /// Format implied by the settings: the ROI divided by the binning.
    pub fn from_settings(settings: &CameraSettings) -> Self {
        let h = u32::from(settings.binning.horizontal.max(1));
        let v = u32::from(settings.binning.vertical.max(1));
        Self::new(
            settings.roi.width / h,
            settings.roi.height / v,
            settings.encoding.bytes_per_pixel(),
        )
    }

    /// Pixel payload size in bytes, `None` on overflow.
    pub fn payload_bytes(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(self.bytes_per_pixel as usize)
    }
}

/// Record of the configuration last applied to the hardware.
///
/// `applied` is what was requested (so it compares equal to the live settings
/// until they change); the remaining fields are what the hardware reported back.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingsSnapshot {
    pub applied: CameraSettings,
    pub format: FrameFormat,
    /// Exposure time the hardware actually accepted, in seconds.
    pub exposure_s: f64,
    /// Sensor readout time in seconds.
    pub readout_time_s: f64,
}

impl SettingsSnapshot {
    pub fn matches(&self, live: &CameraSettings) -> bool {
        &self.applied == live
    }
}

/// Cloneable, lock-protected handle to the live settings.
#[derive(Clone, Default)]
pub struct SettingsHandle {
    inner: Arc<RwLock<CameraSettings>>,
}

impl SettingsHandle {
    pub fn new(settings: CameraSettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
        }
    }

    pub fn get(&self) -> CameraSettings {
        self.inner.read().clone()
    }

    pub fn set(&self, settings: CameraSettings) {
        *self.inner.write() = settings;
    }

    /// Edit the settings in place.
    pub fn update(&self, f: impl FnOnce(&mut CameraSettings)) {
        f(&mut self.inner.write());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_settings_applies_binning() {
        let settings = CameraSettings {
            roi: Roi::new(16, 32, 128, 64),
            binning: Binning::new(2, 4),
            encoding: PixelEncoding::Mono16,
            ..Default::default()
        };
        let format = FrameFormat::from_settings(&settings);
        assert_eq!(format, FrameFormat::new(64, 16, 2));
        assert_eq!(format.payload_bytes(), Some(64 * 16 * 2));
    }

    #[test]
    fn test_payload_overflow_is_detected() {
        let format = FrameFormat::new(u32::MAX, u32::MAX, 4);
        if usize::BITS == 64 {
            assert!(format.payload_bytes().is_none());
        }
    }

    #[test]
    fn test_snapshot_matches_by_value() {
        let live = CameraSettings::default();
        let snapshot = SettingsSnapshot {
            applied: live.clone(),
            format: FrameFormat::from_settings(&live),
            exposure_s: 0.0101,
            readout_time_s: 0.01,
        };
        assert!(snapshot.matches(&live));

        let mut changed = live;
        changed.exposure_s = 0.5;
        assert!(!snapshot.matches(&changed));
    }

    #[test]
    fn test_settings_handle_shares_state() {
        let handle = SettingsHandle::new(CameraSettings::default());
        let other = handle.clone();
        other.update(|s| s.synchronized = true);
        assert!(handle.get().synchronized);
    }

    #[test]
    fn test_encoding_names_round_trip() {
        for encoding in [
            PixelEncoding::Mono8,
            PixelEncoding::Mono12,
            PixelEncoding::Mono16,
            PixelEncoding::Mono32,
        ] {
            assert_eq!(PixelEncoding::parse(encoding.as_str()), Some(encoding));
        }
        assert_eq!(PixelEncoding::parse("Bayer"), None);
    }
}
