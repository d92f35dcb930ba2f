//! Outbound command payloads
//!
//! Operator input is validated here before it ever reaches the session, so a
//! rejected setpoint never costs a broker round trip.

use chrono::NaiveTime;
use std::fmt;

/// Numeric setpoints must stay strictly below this bound.
pub const SETPOINT_LIMIT: u32 = 500;

/// Request payload the device firmware answers with fresh data
pub const REFRESH_REQUEST: &str = "110";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("{0:?} is not a whole number")]
    NotANumber(String),

    #[error("setpoint {value} must be below {limit}")]
    SetpointTooLarge { value: u32, limit: u32 },

    #[error("time {0:?} must be four digits HHmm")]
    MalformedTime(String),

    #[error("time {0:?} is not a valid 24-hour clock time")]
    InvalidTime(String),

    #[error("message must not be empty")]
    EmptyMessage,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Toggle {
    On,
    Off,
}

impl Toggle {
    pub fn from_bool(on: bool) -> Self {
        if on {
            Toggle::On
        } else {
            Toggle::Off
        }
    }

    pub fn payload(&self) -> &'static str {
        match self {
            Toggle::On => "ON",
            Toggle::Off => "OFF",
        }
    }
}

impl fmt::Display for Toggle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.payload())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Setpoint(u32);

impl Setpoint {
    pub fn new(value: u32) -> Result<Self, ValidationError> {
        if value >= SETPOINT_LIMIT {
            return Err(ValidationError::SetpointTooLarge {
                value,
                limit: SETPOINT_LIMIT,
            });
        }
        Ok(Self(value))
    }

    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let value = raw
            .trim()
            .parse::<u32>()
            .map_err(|_| ValidationError::NotANumber(raw.to_string()))?;
        Self::new(value)
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    pub fn payload(&self) -> String {
        self.0.to_string()
    }
}

/// Four-digit 24-hour time (`HHmm`)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FeedTime(NaiveTime);

impl FeedTime {
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let raw = raw.trim();
        if raw.len() != 4 || !raw.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ValidationError::MalformedTime(raw.to_string()));
        }
        let hour: u32 = raw[..2]
            .parse()
            .map_err(|_| ValidationError::MalformedTime(raw.to_string()))?;
        let minute: u32 = raw[2..]
            .parse()
            .map_err(|_| ValidationError::MalformedTime(raw.to_string()))?;
        NaiveTime::from_hms_opt(hour, minute, 0)
            .map(Self)
            .ok_or_else(|| ValidationError::InvalidTime(raw.to_string()))
    }

    pub fn payload(&self) -> String {
        self.0.format("%H%M").to_string()
    }
}

/// Free-text operator message
pub fn operator_message(text: &str) -> Result<&str, ValidationError> {
    let text = text.trim();
    if text.is_empty() {
        Err(ValidationError::EmptyMessage)
    } else {
        Ok(text)
    }
}
