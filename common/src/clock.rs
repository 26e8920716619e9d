use std::time::Instant;

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    error::{ClockError, SchedulerError},
    storage::{load_json, save_json, Storage},
    types::TimeOfDay,
};

pub trait Rtc {
    fn now(&self) -> NaiveDateTime;
    fn set(&mut self, at: NaiveDateTime) -> Result<(), ClockError>;
}

pub fn power_on_default() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2021, 1, 1)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct SoftRtc {
    base: NaiveDateTime,
    anchor: Instant,
}

impl SoftRtc {
    pub fn power_on() -> Self {
        Self {
            base: power_on_default(),
            anchor: Instant::now(),
        }
    }
}

impl Rtc for SoftRtc {
    fn now(&self) -> NaiveDateTime {
        let elapsed = Duration::from_std(self.anchor.elapsed()).unwrap_or_else(|_| Duration::zero());
        self.base + elapsed
    }

    fn set(&mut self, at: NaiveDateTime) -> Result<(), ClockError> {
        self.base = at;
        self.anchor = Instant::now();
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ManualRtc {
    now: NaiveDateTime,
    reject_writes: bool,
}

impl ManualRtc {
    pub fn at(now: NaiveDateTime) -> Self {
        Self {
            now,
            reject_writes: false,
        }
    }

    pub fn power_on() -> Self {
        Self::at(power_on_default())
    }

    pub fn advance_to(&mut self, hour: u32, minute: u32) {
        if let Some(time) = NaiveTime::from_hms_opt(hour, minute, 0) {
            self.now = self.now.date().and_time(time);
        }
    }

    pub fn reject_writes(&mut self, reject: bool) {
        self.reject_writes = reject;
    }
}

impl Rtc for ManualRtc {
    fn now(&self) -> NaiveDateTime {
        self.now
    }

    fn set(&mut self, at: NaiveDateTime) -> Result<(), ClockError> {
        if self.reject_writes {
            return Err(ClockError::Rejected("write refused".to_string()));
        }
        self.now = at;
        Ok(())
    }
}

/// Persisted `[year, month, day, weekday, hour, minute, second]`.
///
/// Weekday counts from Monday = 0. It is written for compatibility but the
/// date alone determines the restored value. Extra trailing elements, such
/// as a subseconds field, are ignored on load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<i64>", into = "[i64; 7]")]
pub struct ClockSnapshot {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub weekday: u32,
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
}

impl ClockSnapshot {
    pub fn of(at: &NaiveDateTime) -> Self {
        Self {
            year: at.year(),
            month: at.month(),
            day: at.day(),
            weekday: at.weekday().num_days_from_monday(),
            hour: at.hour(),
            minute: at.minute(),
            second: at.second(),
        }
    }

    pub fn to_datetime(&self) -> Option<NaiveDateTime> {
        NaiveDate::from_ymd_opt(self.year, self.month, self.day)?.and_hms_opt(
            self.hour,
            self.minute,
            self.second,
        )
    }
}

impl TryFrom<Vec<i64>> for ClockSnapshot {
    type Error = String;

    fn try_from(fields: Vec<i64>) -> Result<Self, Self::Error> {
        if fields.len() < 7 {
            return Err(format!("expected 7 clock fields, got {}", fields.len()));
        }
        let field = |index: usize| {
            u32::try_from(fields[index]).map_err(|_| format!("clock field {index} out of range"))
        };
        let snapshot = Self {
            year: i32::try_from(fields[0]).map_err(|_| "clock year out of range".to_string())?,
            month: field(1)?,
            day: field(2)?,
            weekday: field(3)?,
            hour: field(4)?,
            minute: field(5)?,
            second: field(6)?,
        };
        snapshot
            .to_datetime()
            .map(|_| snapshot)
            .ok_or_else(|| "clock fields do not form a valid timestamp".to_string())
    }
}

impl From<ClockSnapshot> for [i64; 7] {
    fn from(value: ClockSnapshot) -> Self {
        [
            value.year as i64,
            value.month as i64,
            value.day as i64,
            value.weekday as i64,
            value.hour as i64,
            value.minute as i64,
            value.second as i64,
        ]
    }
}

#[derive(Debug)]
pub struct Clock<R, S> {
    rtc: R,
    storage: S,
}

impl<R: Rtc, S: Storage> Clock<R, S> {
    pub const KEY: &'static str = "time.json";

    pub fn new(rtc: R, storage: S) -> Self {
        Self { rtc, storage }
    }

    pub fn rtc_mut(&mut self) -> &mut R {
        &mut self.rtc
    }

    pub fn now(&self) -> NaiveDateTime {
        self.rtc.now()
    }

    pub fn time_of_day(&self) -> TimeOfDay {
        TimeOfDay::of(&self.rtc.now())
    }

    pub fn restore_on_boot(&mut self) -> bool {
        let snapshot = match load_json::<ClockSnapshot, _>(&self.storage, Self::KEY) {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                info!("no persisted clock snapshot; time unknown until a client sets it");
                return false;
            }
            Err(err) => {
                warn!("ignoring unreadable clock snapshot: {err}");
                return false;
            }
        };

        let Some(at) = snapshot.to_datetime() else {
            return false;
        };

        match self.rtc.set(at) {
            Ok(()) => {
                info!("restored clock from snapshot -> {at}");
                true
            }
            Err(err) => {
                warn!("failed to restore clock: {err}");
                false
            }
        }
    }

    pub fn set(&mut self, hour: u32, minute: u32) -> Result<NaiveDateTime, SchedulerError> {
        let time = NaiveTime::from_hms_opt(hour, minute, 0)
            .ok_or(ClockError::OutOfRange { hour, minute })?;
        let at = self.rtc.now().date().and_time(time);

        self.rtc.set(at)?;

        if let Err(err) = save_json(&self.storage, Self::KEY, &ClockSnapshot::of(&at)) {
            warn!("clock set to {at} but snapshot was not persisted: {err}");
        }
        info!("clock set via client -> {at}");
        Ok(at)
    }
}
