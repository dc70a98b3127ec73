//! Trailing frame metadata parser.
//!
//! When hardware metadata is enabled the device appends tagged records after
//! the pixel payload. Records are laid out so they can be walked backward from
//! the end of the filled region:
//!
//! ```text
//! ┌──────────┬──────────────┬────────┬───────────┬──────────────┬────────┬───────────┐
//! │ payload  │ record data  │ tag id │ length    │ record data  │ tag id │ length    │
//! │ (pixels) │ (length B)   │ u32 LE │ u32 LE    │ (length B)   │ u32 LE │ u32 LE    │
//! └──────────┴──────────────┴────────┴───────────┴──────────────┴────────┴───────────┘
//!                                                                                 end ┘
//! ```
//!
//! The timestamp record (tag [`TIMESTAMP_TAG`]) holds a u64 LE tick count of
//! the hardware clock. Every read is bounds-checked; a malformed trailer is a
//! [`MetadataError`], never an over-read.

use camdaq_core::error::DaqError;
use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;
use tracing::trace;

/// Tag id of the hardware timestamp record.
pub const TIMESTAMP_TAG: u32 = 1;
/// Tag id of the frame-info record (stride, encoding, dimensions).
pub const FRAME_INFO_TAG: u32 = 7;

/// Size of the `[tag id][length]` footer of every record.
const FOOTER_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetadataError {
    #[error("payload size {payload} exceeds filled size {filled}")]
    PayloadBeyondEnd { payload: usize, filled: usize },

    #[error("truncated record footer at offset {offset} ({available} bytes left after payload)")]
    TruncatedFooter { offset: usize, available: usize },

    #[error("record with tag {tag} at offset {offset} declares {length} bytes but only {available} remain")]
    RecordOverrun {
        offset: usize,
        tag: u32,
        length: usize,
        available: usize,
    },

    #[error("timestamp record has {0} bytes, expected 8")]
    BadTimestampLength(usize),

    #[error("timestamp of {0} ticks is outside the representable time range")]
    TimestampOutOfRange(u64),
}

impl From<MetadataError> for DaqError {
    fn from(err: MetadataError) -> Self {
        DaqError::Metadata(err.to_string())
    }
}

/// Mapping from hardware clock ticks to absolute time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HardwareClock {
    /// Absolute time of tick 0.
    pub offset: DateTime<Utc>,
    /// Seconds per tick.
    pub scale_s: f64,
}

impl HardwareClock {
    pub fn new(offset: DateTime<Utc>, scale_s: f64) -> Self {
        Self { offset, scale_s }
    }

    /// Clock calibrated from a tick frequency in Hz.
    pub fn from_frequency(offset: DateTime<Utc>, frequency_hz: f64) -> Option<Self> {
        (frequency_hz.is_finite() && frequency_hz > 0.0)
            .then(|| Self::new(offset, 1.0 / frequency_hz))
    }

    /// `offset + ticks * scale`.
    pub fn to_time(&self, ticks: u64) -> Option<DateTime<Utc>> {
        let nanos = (ticks as f64 * self.scale_s * 1e9).round();
        if !nanos.is_finite() || nanos.abs() > i64::MAX as f64 {
            return None;
        }
        self.offset
            .checked_add_signed(TimeDelta::nanoseconds(nanos as i64))
    }
}

/// Extract the hardware timestamp from a filled buffer.
///
/// `buffer` is the filled region (its length is the declared size) and
/// `payload_size` is where the pixel data ends. Returns `Ok(None)` when no
/// timestamp record is present, which is normal whenever hardware
/// timestamping is disabled.
pub fn extract_timestamp(
    buffer: &[u8],
    payload_size: usize,
    clock: &HardwareClock,
) -> Result<Option<DateTime<Utc>>, MetadataError> {
    let filled = buffer.len();
    if payload_size > filled {
        return Err(MetadataError::PayloadBeyondEnd {
            payload: payload_size,
            filled,
        });
    }

    let mut end = filled;
    while end > payload_size {
        let available = end - payload_size;
        if available < FOOTER_LEN {
            return Err(MetadataError::TruncatedFooter {
                offset: end,
                available,
            });
        }
        let length = read_u32(buffer, end - 4) as usize;
        let tag = read_u32(buffer, end - FOOTER_LEN);
        let data_end = end - FOOTER_LEN;
        let data_available = data_end - payload_size;
        if length > data_available {
            return Err(MetadataError::RecordOverrun {
                offset: end,
                tag,
                length,
                available: data_available,
            });
        }
        let data_start = data_end - length;

        if tag == TIMESTAMP_TAG {
            let data = &buffer[data_start..data_end];
            let bytes: [u8; 8] = data
                .try_into()
                .map_err(|_| MetadataError::BadTimestampLength(length))?;
            let ticks = u64::from_le_bytes(bytes);
            return clock
                .to_time(ticks)
                .map(Some)
                .ok_or(MetadataError::TimestampOutOfRange(ticks));
        }

        end = data_start;
    }

    trace!(payload_size, filled, "No timestamp record in frame trailer");
    Ok(None)
}

/// Append one record (`data`, tag id, length) to `out`.
pub fn encode_record(out: &mut Vec<u8>, tag: u32, data: &[u8]) {
    out.extend_from_slice(data);
    out.extend_from_slice(&tag.to_le_bytes());
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
}

fn read_u32(buffer: &[u8], at: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&buffer[at..at + 4]);
    u32::from_le_bytes(word)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn clock() -> HardwareClock {
        let offset = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        HardwareClock::new(offset, 1e-9)
    }

    fn frame_with_trailer(payload: usize, trailer: &[u8]) -> Vec<u8> {
        let mut buf = vec![0xAB; payload];
        buf.extend_from_slice(trailer);
        buf
    }

    #[test]
    fn test_single_timestamp_record() {
        let ticks: u64 = 123_456_789;
        let mut trailer = Vec::new();
        encode_record(&mut trailer, TIMESTAMP_TAG, &ticks.to_le_bytes());
        let buf = frame_with_trailer(64, &trailer);

        let ts = extract_timestamp(&buf, 64, &clock()).unwrap();
        let expected = clock().offset + TimeDelta::nanoseconds(123_456_789);
        assert_eq!(ts, Some(expected));
    }

    #[test]
    fn test_timestamp_behind_other_record() {
        let ticks: u64 = 5_000_000_000;
        let mut trailer = Vec::new();
        encode_record(&mut trailer, TIMESTAMP_TAG, &ticks.to_le_bytes());
        encode_record(&mut trailer, FRAME_INFO_TAG, &[1, 2, 3, 4, 5, 6, 7, 8]);
        let buf = frame_with_trailer(32, &trailer);

        let ts = extract_timestamp(&buf, 32, &clock()).unwrap();
        assert_eq!(ts, Some(clock().offset + TimeDelta::seconds(5)));
    }

    #[test]
    fn test_no_trailer_returns_none() {
        let buf = vec![0u8; 128];
        assert_eq!(extract_timestamp(&buf, 128, &clock()), Ok(None));
    }

    #[test]
    fn test_only_other_records_returns_none() {
        let mut trailer = Vec::new();
        encode_record(&mut trailer, FRAME_INFO_TAG, &[0; 8]);
        encode_record(&mut trailer, 3, &[]);
        let buf = frame_with_trailer(16, &trailer);
        assert_eq!(extract_timestamp(&buf, 16, &clock()), Ok(None));
    }

    #[test]
    fn test_truncated_footer_is_an_error() {
        let buf = frame_with_trailer(16, &[1, 0, 0]);
        assert!(matches!(
            extract_timestamp(&buf, 16, &clock()),
            Err(MetadataError::TruncatedFooter { available: 3, .. })
        ));
    }

    #[test]
    fn test_overlong_length_does_not_over_read() {
        let mut trailer = Vec::new();
        trailer.extend_from_slice(&TIMESTAMP_TAG.to_le_bytes());
        trailer.extend_from_slice(&u32::MAX.to_le_bytes());
        let buf = frame_with_trailer(16, &trailer);
        assert!(matches!(
            extract_timestamp(&buf, 16, &clock()),
            Err(MetadataError::RecordOverrun { .. })
        ));
    }

    #[test]
    fn test_record_cannot_reach_into_payload() {
        let mut trailer = vec![0u8; 4];
        trailer.extend_from_slice(&TIMESTAMP_TAG.to_le_bytes());
        trailer.extend_from_slice(&8u32.to_le_bytes());
        let buf = frame_with_trailer(16, &trailer);
        assert!(matches!(
            extract_timestamp(&buf, 16, &clock()),
            Err(MetadataError::RecordOverrun {
                length: 8,
                available: 4,
                ..
            })
        ));
    }

    #[test]
    fn test_wrong_timestamp_length() {
        let mut trailer = Vec::new();
        encode_record(&mut trailer, TIMESTAMP_TAG, &[0; 4]);
        let buf = frame_with_trailer(8, &trailer);
        assert_eq!(
            extract_timestamp(&buf, 8, &clock()),
            Err(MetadataError::BadTimestampLength(4))
        );
    }

    #[test]
    fn test_payload_beyond_end() {
        let buf = vec![0u8; 8];
        assert!(matches!(
            extract_timestamp(&buf, 9, &clock()),
            Err(MetadataError::PayloadBeyondEnd { .. })
        ));
    }

    #[test]
    fn test_clock_from_frequency() {
        let offset = clock().offset;
        let c = HardwareClock::from_frequency(offset, 1_000.0).unwrap();
        assert_eq!(c.to_time(1_500), Some(offset + TimeDelta::milliseconds(1_500)));
        assert!(HardwareClock::from_frequency(offset, 0.0).is_none());
    }
}
