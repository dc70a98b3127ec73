//! Applying camera settings to the hardware property layer.
//!
//! Settings are written in a fixed order because later properties depend on
//! earlier ones (available readout rates depend on the gain mode, the AOI
//! limits depend on binning):
//!
//! trigger mode → gain → readout rate → exposure time → binning → AOI → pixel encoding
//!
//! Only settings that differ from the previous snapshot are written. Without a
//! previous snapshot (first start, after a reconnection) everything is.

use crate::hardware::{is_settable, props, read_f64, CameraHardware, PropertyValue};
use camdaq_core::error::AppResult;
use camdaq_core::settings::{CameraSettings, FrameFormat, SettingsSnapshot};
use tracing::{debug, info};

/// Write `live` to the hardware and return the resulting snapshot.
pub fn apply_settings(
    hw: &mut dyn CameraHardware,
    live: &CameraSettings,
    previous: Option<&SettingsSnapshot>,
) -> AppResult<SettingsSnapshot> {
    let prev = previous.map(|p| &p.applied);

    if prev.map_or(true, |p| p.synchronized != live.synchronized) {
        let mode = if live.synchronized {
            props::TRIGGER_SOFTWARE
        } else {
            props::TRIGGER_INTERNAL
        };
        write(hw, props::TRIGGER_MODE, PropertyValue::Enum(mode.into()))?;
    }

    if prev.map_or(true, |p| p.gain != live.gain) {
        write(hw, props::GAIN, PropertyValue::Enum(live.gain.clone()))?;
    }

    if prev.map_or(true, |p| p.readout_rate != live.readout_rate) {
        write(
            hw,
            props::READOUT_RATE,
            PropertyValue::Enum(live.readout_rate.clone()),
        )?;
    }

    let mut exposure_s = previous.map_or(live.exposure_s, |p| p.exposure_s);
    if prev.map_or(true, |p| p.exposure_s != live.exposure_s) {
        let actual = write(hw, props::EXPOSURE_TIME, PropertyValue::Float(live.exposure_s))?;
        exposure_s = actual.and_then(|v| v.as_f64()).unwrap_or(live.exposure_s);
    }

    let binning_changed = prev.map_or(true, |p| p.binning != live.binning);
    if binning_changed {
        write(
            hw,
            props::BINNING,
            PropertyValue::Enum(live.binning.to_string()),
        )?;
    }

    // Binning resets the AOI on most sensors, so re-apply it whenever either changed.
    if binning_changed || prev.map_or(true, |p| p.roi != live.roi) {
        let roi = live.roi;
        write(hw, props::AOI_WIDTH, PropertyValue::Int(i64::from(roi.width)))?;
        write(hw, props::AOI_HEIGHT, PropertyValue::Int(i64::from(roi.height)))?;
        write(hw, props::AOI_LEFT, PropertyValue::Int(i64::from(roi.x)))?;
        write(hw, props::AOI_TOP, PropertyValue::Int(i64::from(roi.y)))?;
    }

    if prev.map_or(true, |p| p.encoding != live.encoding) {
        write(
            hw,
            props::PIXEL_ENCODING,
            PropertyValue::Enum(live.encoding.as_str().into()),
        )?;
    }

    let readout_time_s = if hw.is_implemented(props::READOUT_TIME)? {
        read_f64(hw, props::READOUT_TIME)?
    } else {
        0.0
    };

    let snapshot = SettingsSnapshot {
        applied: live.clone(),
        format: FrameFormat::from_settings(live),
        exposure_s,
        readout_time_s,
    };
    info!(
        full = previous.is_none(),
        width = snapshot.format.width,
        height = snapshot.format.height,
        binning = %live.binning,
        exposure_s,
        readout_time_s,
        synchronized = live.synchronized,
        "Camera settings applied"
    );
    Ok(snapshot)
}

/// Set one property, skipping it when the device cannot take it.
///
/// Returns the value the device actually applied, or `None` when skipped.
fn write(
    hw: &mut dyn CameraHardware,
    name: &str,
    value: PropertyValue,
) -> AppResult<Option<PropertyValue>> {
    if !is_settable(hw, name)? {
        debug!(property = name, "Property not settable on this device, skipping");
        return Ok(None);
    }
    let actual = hw.set(name, value)?;
    debug!(property = name, value = %actual, "Property set");
    Ok(Some(actual))
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;
    use crate::mock::MockCamera;
    use camdaq_core::error::ErrorClass;
    use camdaq_core::settings::{Binning, Roi};

    fn small_settings() -> CameraSettings {
        CameraSettings {
            roi: Roi::new(8, 8, 64, 64),
            exposure_s: 0.005,
            ..Default::default()
        }
    }

    #[test]
    fn test_full_apply_uses_fixed_order() {
        let mut camera = MockCamera::with_sensor("mock", 256, 256);
        let control = camera.control();
        let snapshot = apply_settings(&mut camera, &small_settings(), None).unwrap();

        let names: Vec<String> = control.set_log().into_iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            vec![
                props::TRIGGER_MODE,
                props::GAIN,
                props::READOUT_RATE,
                props::EXPOSURE_TIME,
                props::BINNING,
                props::AOI_WIDTH,
                props::AOI_HEIGHT,
                props::AOI_LEFT,
                props::AOI_TOP,
                props::PIXEL_ENCODING,
            ]
        );
        assert_eq!(snapshot.format, FrameFormat::new(64, 64, 2));
        assert_eq!(snapshot.exposure_s, 0.005);
        assert_eq!(snapshot.readout_time_s, 0.01);
    }

    #[test]
    fn test_incremental_apply_writes_only_changes() {
        let mut camera = MockCamera::with_sensor("mock", 256, 256);
        let control = camera.control();
        let first = apply_settings(&mut camera, &small_settings(), None).unwrap();
        control.clear_logs();

        let mut live = small_settings();
        live.binning = Binning::new(2, 2);
        live.synchronized = true;
        let second = apply_settings(&mut camera, &live, Some(&first)).unwrap();

        let names: Vec<String> = control.set_log().into_iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            vec![
                props::TRIGGER_MODE,
                props::BINNING,
                props::AOI_WIDTH,
                props::AOI_HEIGHT,
                props::AOI_LEFT,
                props::AOI_TOP,
            ]
        );
        assert_eq!(
            control.property(props::TRIGGER_MODE),
            Some(PropertyValue::Enum(props::TRIGGER_SOFTWARE.into()))
        );
        assert_eq!(second.format, FrameFormat::new(32, 32, 2));
        assert!(second.matches(&live));
    }

    #[test]
    fn test_exposure_reports_hardware_value() {
        let mut camera = MockCamera::new("mock");
        let live = CameraSettings {
            exposure_s: 1e-9,
            ..Default::default()
        };
        let snapshot = apply_settings(&mut camera, &live, None).unwrap();
        assert_eq!(snapshot.exposure_s, 1e-5);
        assert_eq!(snapshot.applied.exposure_s, 1e-9);
    }

    #[test]
    fn test_unsupported_property_is_skipped() {
        let mut camera = MockCamera::new("mock");
        let control = camera.control();
        control.remove_property(props::GAIN);
        control.set_read_only(props::READOUT_RATE);
        apply_settings(&mut camera, &CameraSettings::default(), None).unwrap();

        let names: Vec<String> = control.set_log().into_iter().map(|(n, _)| n).collect();
        assert!(!names.iter().any(|n| n == props::GAIN || n == props::READOUT_RATE));
        assert!(names.iter().any(|n| n == props::EXPOSURE_TIME));
    }

    #[test]
    fn test_invalid_value_is_configuration_error() {
        let mut camera = MockCamera::with_sensor("mock", 128, 128);
        let live = CameraSettings {
            roi: Roi::new(0, 0, 4096, 4096),
            ..Default::default()
        };
        let err = apply_settings(&mut camera, &live, None).unwrap_err();
        assert_eq!(err.class(), ErrorClass::ConfigurationInconsistent);
    }
}
