use std::{fmt, str::FromStr};

use chrono::Timelike;
use serde::{Deserialize, Serialize};

use crate::error::{InvalidField, Rejection};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay {
    hour: u8,
    minute: u8,
}

impl TimeOfDay {
    pub fn new(hour: u32, minute: u32) -> Option<Self> {
        if hour < 24 && minute < 60 {
            Some(Self {
                hour: hour as u8,
                minute: minute as u8,
            })
        } else {
            None
        }
    }

    pub fn of<T: Timelike>(value: &T) -> Self {
        Self {
            hour: value.hour() as u8,
            minute: value.minute() as u8,
        }
    }

    pub fn hour(self) -> u8 {
        self.hour
    }

    pub fn minute(self) -> u8 {
        self.minute
    }

    pub fn minutes_since_midnight(self) -> u16 {
        self.hour as u16 * 60 + self.minute as u16
    }

    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.trim().split(':');
        let hour = parse_component(parts.next()?)?;
        let minute = parse_component(parts.next()?)?;
        if let Some(second) = parts.next() {
            if parse_component(second)? >= 60 {
                return None;
            }
        }
        if parts.next().is_some() {
            return None;
        }
        Self::new(hour, minute)
    }
}

fn parse_component(part: &str) -> Option<u32> {
    if part.is_empty() || part.len() > 2 || !part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    part.parse().ok()
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl FromStr for TimeOfDay {
    type Err = InvalidField;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| InvalidField::new("time", s))
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = InvalidField;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(value: TimeOfDay) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Recurrence {
    Once,
    Daily,
}

impl Recurrence {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Once => "once",
            Self::Daily => "daily",
        }
    }
}

impl FromStr for Recurrence {
    type Err = InvalidField;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "once" => Ok(Self::Once),
            "daily" => Ok(Self::Daily),
            _ => Err(InvalidField::new("recurrence", s)),
        }
    }
}

impl fmt::Display for Recurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "GpioField", into = "String")]
pub enum PinRef {
    Onboard,
    Gpio(u8),
}

impl PinRef {
    pub const ONBOARD_TAG: &'static str = "LED";

    pub fn is_onboard(self) -> bool {
        matches!(self, Self::Onboard)
    }
}

impl fmt::Display for PinRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Onboard => f.write_str(Self::ONBOARD_TAG),
            Self::Gpio(pin) => write!(f, "{pin}"),
        }
    }
}

impl FromStr for PinRef {
    type Err = InvalidField;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed == Self::ONBOARD_TAG {
            return Ok(Self::Onboard);
        }
        trimmed
            .parse::<u8>()
            .map(Self::Gpio)
            .map_err(|_| InvalidField::new("gpio", s))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum GpioField {
    Text(String),
    Number(u64),
}

impl TryFrom<GpioField> for PinRef {
    type Error = InvalidField;

    fn try_from(value: GpioField) -> Result<Self, Self::Error> {
        match value {
            GpioField::Text(text) => text.parse(),
            GpioField::Number(number) => u8::try_from(number)
                .map(Self::Gpio)
                .map_err(|_| InvalidField::new("gpio", number.to_string())),
        }
    }
}

impl From<PinRef> for String {
    fn from(value: PinRef) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub name: String,
    #[serde(rename = "gpio")]
    pub pin: PinRef,
}

impl Device {
    pub fn new(name: impl Into<String>, pin: PinRef) -> Self {
        Self {
            name: name.into(),
            pin,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub device: String,
    #[serde(rename = "start_time")]
    pub start: TimeOfDay,
    #[serde(rename = "end_time")]
    pub end: TimeOfDay,
    pub recurrence: Recurrence,
}

impl Task {
    pub fn new(
        device: impl Into<String>,
        start: TimeOfDay,
        end: TimeOfDay,
        recurrence: Recurrence,
    ) -> Self {
        Self {
            device: device.into(),
            start,
            end,
            recurrence,
        }
    }

    pub fn from_fields(
        device: &str,
        start: &str,
        end: &str,
        recurrence: &str,
    ) -> Result<Self, Rejection> {
        if device.trim().is_empty() {
            return Err(Rejection::Malformed(InvalidField::new("device", device)));
        }
        Ok(Self {
            device: device.to_string(),
            start: start.parse().map_err(Rejection::Malformed)?,
            end: end.parse().map_err(Rejection::Malformed)?,
            recurrence: recurrence.parse().map_err(Rejection::Malformed)?,
        })
    }

    /// True once a one-shot task's end has been reached. Daily tasks never
    /// expire.
    pub fn is_expired(&self, now: TimeOfDay) -> bool {
        self.recurrence == Recurrence::Once && self.end <= now
    }
}
