//! Delivered frames and their metadata.

use crate::settings::FrameFormat;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-frame metadata, built fresh for every delivered frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameMetadata {
    /// Host time at which the filled buffer was retrieved.
    pub acquisition_date: DateTime<Utc>,
    /// Exposure time the hardware accepted, in seconds.
    pub exposure_time_s: f64,
    pub readout_time_s: f64,
    /// ROI origin on the sensor (unbinned pixels).
    pub position: (u32, u32),
    pub gain: String,
    pub bit_depth: u32,
    /// Time decoded from the trailing metadata region, if the hardware stamped it.
    pub hardware_timestamp: Option<DateTime<Utc>>,
    /// Index of the frame since `start()`, starting at 0.
    pub frame_number: u64,
    /// Frames skipped by the drain step just before this one.
    pub discarded: u32,
}

impl FrameMetadata {
    /// Key/value view of the metadata.
    pub fn to_map(&self) -> serde_json::Map<String, serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }
}

/// A frame handed to the delivery callback.
///
/// `payload` holds exactly `width * height * bytes_per_pixel` bytes; trailing
/// hardware metadata is not included.
#[derive(Debug, Clone)]
pub struct Frame {
    pub format: FrameFormat,
    pub payload: Bytes,
    pub metadata: FrameMetadata,
}

impl Frame {
    /// Interpret the payload as little-endian 16-bit pixels.
    ///
    /// Returns `None` unless the format has 2 bytes per pixel.
    pub fn pixels_u16(&self) -> Option<Vec<u16>> {
        if self.format.bytes_per_pixel != 2 {
            return None;
        }
        Some(
            self.payload
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> FrameMetadata {
        FrameMetadata {
            acquisition_date: Utc::now(),
            exposure_time_s: 0.01,
            readout_time_s: 0.005,
            position: (4, 8),
            gain: "high".into(),
            bit_depth: 16,
            hardware_timestamp: None,
            frame_number: 7,
            discarded: 0,
        }
    }

    #[test]
    fn test_metadata_map_contains_keys() {
        let map = metadata().to_map();
        for key in [
            "acquisition_date",
            "exposure_time_s",
            "readout_time_s",
            "position",
            "gain",
            "bit_depth",
            "hardware_timestamp",
        ] {
            assert!(map.contains_key(key), "missing key {key}");
        }
        assert_eq!(map["frame_number"], serde_json::json!(7));
    }

    #[test]
    fn test_pixels_u16() {
        let frame = Frame {
            format: FrameFormat::new(2, 1, 2),
            payload: Bytes::from_static(&[0x01, 0x00, 0xff, 0x0f]),
            metadata: metadata(),
        };
        assert_eq!(frame.pixels_u16(), Some(vec![1, 0x0fff]));

        let mono8 = Frame {
            format: FrameFormat::new(4, 1, 1),
            ..frame
        };
        assert!(mono8.pixels_u16().is_none());
    }
}
