//! Builds the vendor location packet the camera expects.
//!
//! The layout is reverse engineered from the camera's Bluetooth remote
//! protocol and must be reproduced byte exactly: 91 bytes, or 95 when the
//! camera advertises timezone/DST support in its capability flags.

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use chrono_tz::{OffsetComponents, Tz};

use crate::core::location::LocationSample;

/// Zero padding between the date block and the optional timezone block.
const PADDING_LEN: usize = 65;

/// Per-session packet layout configuration.
#[derive(Debug, Clone)]
pub struct PacketConfig {
    /// Whether the timezone and DST offsets are appended. Defaults to true;
    /// flipped by the capability read when the camera reports otherwise.
    pub include_tz_dst: bool,
    /// Timezone the offsets are computed for.
    pub timezone: Tz,
}

impl PacketConfig {
    pub fn new(timezone: Tz) -> Self {
        Self {
            include_tz_dst: true,
            timezone,
        }
    }

    /// Total packet size for this configuration.
    pub fn data_size(&self) -> usize {
        if self.include_tz_dst { 95 } else { 91 }
    }

    /// The fixed header. Bytes 1 and 5 encode the length class.
    fn fixed_bytes(&self) -> [u8; 11] {
        [
            0x00,
            if self.include_tz_dst { 0x5D } else { 0x59 },
            0x08,
            0x02,
            0xFC,
            if self.include_tz_dst { 0x03 } else { 0x00 },
            0x00,
            0x00,
            0x10,
            0x10,
            0x10,
        ]
    }
}

/// Returns true when the capability characteristic value announces the
/// timezone/DST extended packet format.
pub fn has_time_zone_dst_flag(value: &[u8]) -> bool {
    value.len() >= 5 && (value[4] & 0x02) != 0
}

/// Latitude and longitude as big-endian `round(degrees * 1e7)` integers.
fn convert_coordinates(sample: &LocationSample) -> [u8; 8] {
    let latitude = (sample.latitude * 10_000_000.0).round() as i32;
    let longitude = (sample.longitude * 10_000_000.0).round() as i32;

    let mut bytes = [0u8; 8];
    bytes[..4].copy_from_slice(&latitude.to_be_bytes());
    bytes[4..].copy_from_slice(&longitude.to_be_bytes());
    bytes
}

/// Current UTC date and time: 2-byte year, then month, day, hour, minute
/// and second as single bytes. The camera stamps photos with this, not with
/// the fix time.
fn convert_date(now: DateTime<Utc>) -> [u8; 7] {
    let year = (now.year() as i16).to_be_bytes();
    [
        year[0],
        year[1],
        now.month() as u8,
        now.day() as u8,
        now.hour() as u8,
        now.minute() as u8,
        now.second() as u8,
    ]
}

/// Standard (non-DST) offset from UTC in minutes, big-endian.
fn convert_time_zone_offset(timezone: Tz, now: DateTime<Utc>) -> [u8; 2] {
    let offset = timezone.offset_from_utc_datetime(&now.naive_utc());
    (offset.base_utc_offset().num_minutes() as i16).to_be_bytes()
}

/// DST saving in minutes, big-endian; zero when DST is not in effect.
fn convert_dst_offset(timezone: Tz, now: DateTime<Utc>) -> [u8; 2] {
    let offset = timezone.offset_from_utc_datetime(&now.naive_utc());
    (offset.dst_offset().num_minutes() as i16).to_be_bytes()
}

/// Builds the complete location packet for one transmission.
pub fn build_location_packet(
    config: &PacketConfig,
    sample: &LocationSample,
    now: DateTime<Utc>,
) -> Vec<u8> {
    let mut data = Vec::with_capacity(config.data_size());

    data.extend_from_slice(&config.fixed_bytes());
    data.extend_from_slice(&convert_coordinates(sample));
    data.extend_from_slice(&convert_date(now));
    data.extend_from_slice(&[0u8; PADDING_LEN]);

    if config.include_tz_dst {
        data.extend_from_slice(&convert_time_zone_offset(config.timezone, now));
        data.extend_from_slice(&convert_dst_offset(config.timezone, now));
    }

    debug_assert_eq!(data.len(), config.data_size());
    data
}
