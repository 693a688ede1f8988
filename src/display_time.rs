//! Conversion of platform epoch timestamps into the display timezone

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Europe::Vienna;
use thiserror::Error;

/// Format used for every displayed timestamp, e.g. `2024-10-21 16:10:00 CEST`
pub const DISPLAY_FORMAT: &str = "%Y-%m-%d %H:%M:%S %Z";

#[derive(Debug, Error, PartialEq)]
pub enum TimeError {
    #[error("timestamp is not a finite number: {0}")]
    NotFinite(f64),

    #[error("timestamp out of range: {0}")]
    OutOfRange(f64),
}

/// Convert fractional epoch seconds to a UTC datetime
pub fn epoch_to_utc(utc_epoch_seconds: f64) -> Result<DateTime<Utc>, TimeError> {
    if !utc_epoch_seconds.is_finite() {
        return Err(TimeError::NotFinite(utc_epoch_seconds));
    }

    let secs = utc_epoch_seconds.floor();
    if secs < i64::MIN as f64 || secs > i64::MAX as f64 {
        return Err(TimeError::OutOfRange(utc_epoch_seconds));
    }
    let nanos = ((utc_epoch_seconds - secs) * 1e9) as u32;

    Utc.timestamp_opt(secs as i64, nanos.min(999_999_999))
        .single()
        .ok_or(TimeError::OutOfRange(utc_epoch_seconds))
}

/// Render epoch seconds in Vienna local time
pub fn to_display_time(utc_epoch_seconds: f64) -> Result<String, TimeError> {
    let utc = epoch_to_utc(utc_epoch_seconds)?;
    Ok(utc.with_timezone(&Vienna).format(DISPLAY_FORMAT).to_string())
}
