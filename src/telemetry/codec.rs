//! Payload codec for inbound device telemetry
//!
//! Every sensor topic carries a comma-separated payload with a fixed field
//! layout. [`MetricKind`] names the layout, [`parse`] turns a raw payload into
//! a [`Reading`] or a [`FormatError`]. Nothing in here touches shared state;
//! callers decide what to do with a rejected packet (log and drop).

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One parsed, timestamped telemetry sample
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// `HH:mm` or `yyyy/MM/dd HH:mm`, depending on the metric schema
    pub timestamp: String,
    pub value: f64,
}

impl Reading {
    pub fn new(timestamp: impl Into<String>, value: f64) -> Self {
        Self {
            timestamp: timestamp.into(),
            value,
        }
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} -> {}", self.timestamp, self.value)
    }
}

/// Field layout of a sensor payload
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetricKind {
    /// `HH,mm,weight`
    ClockWeight,
    /// `yyyy,MM,dd,HH,mm,weight`
    DatedWeight,
    /// A single integer, stamped with the time it was received
    Level,
}

impl MetricKind {
    pub fn field_count(&self) -> usize {
        match self {
            MetricKind::ClockWeight => 3,
            MetricKind::DatedWeight => 6,
            MetricKind::Level => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FormatError {
    #[error("{kind:?} expects {expected} fields, got {found}")]
    FieldCount {
        kind: MetricKind,
        expected: usize,
        found: usize,
    },

    #[error("field {index} ({field:?}) is not a number")]
    NotANumber { index: usize, field: String },

    #[error("timestamp out of range: {0}")]
    InvalidTimestamp(String),

    #[error("value is not finite")]
    NonFiniteValue,

    #[error("unknown switch state {0:?}")]
    UnknownSwitchState(String),

    #[error("image frame is not valid base64: {0}")]
    InvalidFrame(String),
}

/// Parses a payload, stamping receive-time schemas with the local clock.
pub fn parse(kind: MetricKind, raw: &str) -> Result<Reading, FormatError> {
    parse_at(kind, raw, Local::now().naive_local())
}

/// Parses a payload; `received` is only consulted by [`MetricKind::Level`].
pub fn parse_at(
    kind: MetricKind,
    raw: &str,
    received: NaiveDateTime,
) -> Result<Reading, FormatError> {
    let fields: Vec<&str> = raw.trim().split(',').map(str::trim).collect();
    if fields.len() != kind.field_count() {
        return Err(FormatError::FieldCount {
            kind,
            expected: kind.field_count(),
            found: fields.len(),
        });
    }

    match kind {
        MetricKind::ClockWeight => {
            let hour = integer_field(&fields, 0)?;
            let minute = integer_field(&fields, 1)?;
            let value = value_field(&fields, 2)?;
            let time = clock(hour, minute)?;
            Ok(Reading::new(time.format("%H:%M").to_string(), value))
        }
        MetricKind::DatedWeight => {
            let year = integer_field(&fields, 0)?;
            let month = integer_field(&fields, 1)?;
            let day = integer_field(&fields, 2)?;
            let hour = integer_field(&fields, 3)?;
            let minute = integer_field(&fields, 4)?;
            let value = value_field(&fields, 5)?;

            let date = i32::try_from(year)
                .ok()
                .and_then(|y| NaiveDate::from_ymd_opt(y, month, day))
                .ok_or_else(|| {
                    FormatError::InvalidTimestamp(format!("{year}/{month}/{day}"))
                })?;
            let time = clock(hour, minute)?;
            Ok(Reading::new(
                date.and_time(time).format("%Y/%m/%d %H:%M").to_string(),
                value,
            ))
        }
        MetricKind::Level => {
            let level = integer_field(&fields, 0)?;
            let time = received.time();
            Ok(Reading::new(
                format!("{:02}:{:02}", time.hour(), time.minute()),
                f64::from(level),
            ))
        }
    }
}

/// Device status topics carry `ON` / `OFF`.
pub fn parse_switch(raw: &str) -> Result<bool, FormatError> {
    let state = raw.trim();
    if state.eq_ignore_ascii_case("ON") {
        Ok(true)
    } else if state.eq_ignore_ascii_case("OFF") {
        Ok(false)
    } else {
        Err(FormatError::UnknownSwitchState(state.to_string()))
    }
}

/// A camera frame delivered as base64 text
#[derive(Clone, Debug, PartialEq)]
pub struct ImageFrame {
    pub base64: String,
    pub byte_len: usize,
}

impl ImageFrame {
    pub fn decode(raw: &str) -> Result<Self, FormatError> {
        let encoded = raw.trim();
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| FormatError::InvalidFrame(e.to_string()))?;
        if bytes.is_empty() {
            return Err(FormatError::InvalidFrame("empty frame".to_string()));
        }
        Ok(Self {
            base64: encoded.to_string(),
            byte_len: bytes.len(),
        })
    }
}

fn integer_field(fields: &[&str], index: usize) -> Result<u32, FormatError> {
    fields[index]
        .parse::<u32>()
        .map_err(|_| FormatError::NotANumber {
            index,
            field: fields[index].to_string(),
        })
}

fn value_field(fields: &[&str], index: usize) -> Result<f64, FormatError> {
    let value = fields[index]
        .parse::<f64>()
        .map_err(|_| FormatError::NotANumber {
            index,
            field: fields[index].to_string(),
        })?;
    if value.is_finite() {
        Ok(value)
    } else {
        Err(FormatError::NonFiniteValue)
    }
}

fn clock(hour: u32, minute: u32) -> Result<NaiveTime, FormatError> {
    NaiveTime::from_hms_opt(hour, minute, 0)
        .ok_or_else(|| FormatError::InvalidTimestamp(format!("{hour}:{minute}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noon() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(12, 5, 0)
            .unwrap()
    }

    #[test]
    fn clock_weight_is_parsed() {
        let reading = parse(MetricKind::ClockWeight, "08,30,42").unwrap();
        assert_eq!(reading, Reading::new("08:30", 42.0));
    }

    #[test]
    fn clock_weight_pads_single_digits() {
        let reading = parse(MetricKind::ClockWeight, "8,5,3.5").unwrap();
        assert_eq!(reading.timestamp, "08:05");
        assert_eq!(reading.value, 3.5);
    }

    #[test]
    fn wrong_field_count_is_rejected() {
        let err = parse(MetricKind::ClockWeight, "08,30").unwrap_err();
        assert_eq!(
            err,
            FormatError::FieldCount {
                kind: MetricKind::ClockWeight,
                expected: 3,
                found: 2
            }
        );
    }

    #[test]
    fn non_numeric_field_is_rejected() {
        let err = parse(MetricKind::ClockWeight, "ab,30,42").unwrap_err();
        assert!(matches!(err, FormatError::NotANumber { index: 0, .. }));
    }

    #[test]
    fn out_of_range_clock_is_rejected() {
        assert!(matches!(
            parse(MetricKind::ClockWeight, "24,00,1"),
            Err(FormatError::InvalidTimestamp(_))
        ));
        assert!(matches!(
            parse(MetricKind::ClockWeight, "23,60,1"),
            Err(FormatError::InvalidTimestamp(_))
        ));
    }

    #[test]
    fn dated_weight_is_parsed() {
        let reading = parse(MetricKind::DatedWeight, "2024,05,01,07,45,4.2").unwrap();
        assert_eq!(reading, Reading::new("2024/05/01 07:45", 4.2));
    }

    #[test]
    fn dated_weight_rejects_impossible_date() {
        assert!(matches!(
            parse(MetricKind::DatedWeight, "2023,02,30,07,45,4.2"),
            Err(FormatError::InvalidTimestamp(_))
        ));
    }

    #[test]
    fn level_uses_receive_time() {
        let reading = parse_at(MetricKind::Level, " 73 ", noon()).unwrap();
        assert_eq!(reading, Reading::new("12:05", 73.0));
        assert!(parse_at(MetricKind::Level, "7.5", noon()).is_err());
    }

    #[test]
    fn non_finite_values_are_rejected() {
        assert_eq!(
            parse(MetricKind::ClockWeight, "08,30,NaN"),
            Err(FormatError::NonFiniteValue)
        );
    }

    #[test]
    fn switch_states() {
        assert_eq!(parse_switch("ON"), Ok(true));
        assert_eq!(parse_switch("off\n"), Ok(false));
        assert!(parse_switch("maybe").is_err());
    }

    #[test]
    fn image_frames_must_be_base64() {
        let frame = ImageFrame::decode("aGVsbG8=").unwrap();
        assert_eq!(frame.byte_len, 5);
        assert_eq!(frame.base64, "aGVsbG8=");
        assert!(ImageFrame::decode("not base64!").is_err());
        assert!(ImageFrame::decode("").is_err());
    }
}
