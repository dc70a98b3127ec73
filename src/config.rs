//! Application configuration using Figment
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Built-in defaults
//! 2. A TOML file (`camdaq.toml` unless another path is given)
//! 3. Environment variables prefixed with `CAMDAQ_`, nested keys split on `__`
//!
//! # Example
//! ```no_run
//! use camdaq::config::AppConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::load()?;
//! config.validate()?;
//! println!("Camera: {}", config.camera.name);
//! # Ok(())
//! # }
//! ```
//!
//! `CAMDAQ_ACQUISITION__POLL_INTERVAL=50ms` overrides `[acquisition] poll_interval`.

use camdaq_core::settings::CameraSettings;
use camdaq_driver::AcquisitionConfig;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "camdaq.toml";

/// Prefix of configuration environment variables.
pub const ENV_PREFIX: &str = "CAMDAQ_";

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Camera session and initial camera settings
    pub camera: CameraConfig,
    /// Acquisition tuning
    pub acquisition: AcquisitionConfig,
}

/// Application-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "camdaq".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, colored (development)
    #[default]
    Pretty,
    /// Single-line, no colors
    Compact,
    /// One JSON object per event (log aggregation)
    Json,
}

/// Camera session configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Device name used in logs and the worker thread name
    pub name: String,
    /// Sensor width in pixels (mock camera)
    pub sensor_width: u32,
    /// Sensor height in pixels (mock camera)
    pub sensor_height: u32,
    /// Settings applied at the first start
    pub settings: CameraSettings,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            name: "mock-camera".to_string(),
            sensor_width: 2048,
            sensor_height: 2048,
            settings: CameraSettings::default(),
        }
    }
}

impl AppConfig {
    /// Load from `camdaq.toml` (if present) and the environment.
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load from a specific file path and the environment.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(path.as_ref()).extract()
    }

    /// The layered provider chain, exposed for inspection in tests and the CLI.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let level = self.application.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                VALID_LOG_LEVELS.join(", ")
            ));
        }

        let acquisition = &self.acquisition;
        if acquisition.pipeline_depth == 0 {
            return Err("acquisition.pipeline_depth must be at least 1".to_string());
        }
        if acquisition.poll_interval.is_zero() {
            return Err("acquisition.poll_interval must be greater than zero".to_string());
        }
        if acquisition.consecutive_error_abort < acquisition.consecutive_error_reconnect {
            return Err(format!(
                "acquisition.consecutive_error_abort ({}) must not be below consecutive_error_reconnect ({})",
                acquisition.consecutive_error_abort, acquisition.consecutive_error_reconnect
            ));
        }

        let camera = &self.camera;
        if camera.sensor_width == 0 || camera.sensor_height == 0 {
            return Err("camera sensor size must be non-zero".to_string());
        }
        let settings = &camera.settings;
        if !(settings.exposure_s.is_finite() && settings.exposure_s > 0.0) {
            return Err(format!(
                "Invalid exposure_s {}. Must be a positive number of seconds",
                settings.exposure_s
            ));
        }
        let roi = settings.roi;
        if roi.width == 0 || roi.height == 0 {
            return Err("camera.settings.roi must have a non-zero size".to_string());
        }
        if roi.x.saturating_add(roi.width) > camera.sensor_width
            || roi.y.saturating_add(roi.height) > camera.sensor_height
        {
            return Err(format!(
                "ROI {}x{}+{}+{} exceeds the {}x{} sensor",
                roi.width, roi.height, roi.x, roi.y, camera.sensor_width, camera.sensor_height
            ));
        }

        Ok(())
    }
}
