// src/shift.rs
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub type ShiftId = i64;

const MINUTES_PER_DAY: i64 = 24 * 60;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShiftError {
    #[error("Shift name cannot be empty")]
    EmptyName,
    #[error("Shift start and end are both {0}; a shift needs a non-zero length")]
    ZeroLength(NaiveTime),
    #[error("{field} cannot be negative (got {value})")]
    NegativeMinutes { field: &'static str, value: i64 },
    #[error("Shift must have at least one working day")]
    NoWorkingDays,
    #[error("Unknown weekday '{0}'")]
    UnknownWeekday(String),
    #[error("Assignment ends ({effective_to}) before it starts ({effective_from})")]
    InvertedAssignment {
        effective_from: NaiveDate,
        effective_to: NaiveDate,
    },
}

/// Days of the week a shift is scheduled on, stored as `"Mon,Tue,Wed"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkingDays(Vec<Weekday>);

impl WorkingDays {
    pub fn new(days: impl IntoIterator<Item = Weekday>) -> Self {
        let mut days: Vec<Weekday> = days.into_iter().collect();
        days.sort_by_key(|d| d.num_days_from_monday());
        days.dedup();
        Self(days)
    }

    pub fn weekdays() -> Self {
        Self::new([
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
        ])
    }

    pub fn contains(&self, day: Weekday) -> bool {
        self.0.contains(&day)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for WorkingDays {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.0.iter().map(|d| d.to_string()).collect();
        write!(f, "{}", names.join(","))
    }
}

impl FromStr for WorkingDays {
    type Err = ShiftError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut days = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let day = part
                .parse::<Weekday>()
                .map_err(|_| ShiftError::UnknownWeekday(part.to_string()))?;
            days.push(day);
        }
        Ok(Self::new(days))
    }
}

impl TryFrom<String> for WorkingDays {
    type Error = ShiftError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<WorkingDays> for String {
    fn from(value: WorkingDays) -> Self {
        value.to_string()
    }
}

/// A concrete shift occurrence on a given attendance date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShiftWindow {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shift {
    pub id: ShiftId,
    pub name: String,
    pub start: NaiveTime,
    pub end: NaiveTime,
    /// Minutes after `start` during which arrival is not penalized.
    pub grace_minutes: i64,
    /// Minutes before `end` during which leaving is not penalized.
    pub early_departure_grace_minutes: i64,
    /// Arriving more than this many minutes before `start` counts as early.
    pub early_arrival_window_minutes: i64,
    /// Staying more than this many minutes past `end` counts as overtime.
    pub overtime_threshold_minutes: i64,
    pub working_days: WorkingDays,
}

impl Shift {
    /// Shifts ending at or before their start time run past midnight.
    pub fn is_overnight(&self) -> bool {
        self.end <= self.start
    }

    pub fn scheduled_minutes(&self) -> i64 {
        let minutes = (self.end - self.start).num_minutes();
        if minutes <= 0 {
            minutes + MINUTES_PER_DAY
        } else {
            minutes
        }
    }

    pub fn window_for(&self, date: NaiveDate) -> ShiftWindow {
        let start = date.and_time(self.start);
        ShiftWindow {
            start,
            end: start + Duration::minutes(self.scheduled_minutes()),
        }
    }

    pub fn is_working_day(&self, date: NaiveDate) -> bool {
        self.working_days.contains(date.weekday())
    }
}

fn default_grace_minutes() -> i64 {
    15
}

fn default_early_arrival_window_minutes() -> i64 {
    30
}

fn default_overtime_threshold_minutes() -> i64 {
    30
}

fn default_working_days() -> WorkingDays {
    WorkingDays::weekdays()
}

/// Shift definition as submitted through the API, before it has an id.
#[derive(Debug, Clone, Deserialize)]
pub struct ShiftDraft {
    pub name: String,
    pub start: NaiveTime,
    pub end: NaiveTime,
    #[serde(default = "default_grace_minutes")]
    pub grace_minutes: i64,
    #[serde(default)]
    pub early_departure_grace_minutes: i64,
    #[serde(default = "default_early_arrival_window_minutes")]
    pub early_arrival_window_minutes: i64,
    #[serde(default = "default_overtime_threshold_minutes")]
    pub overtime_threshold_minutes: i64,
    #[serde(default = "default_working_days")]
    pub working_days: WorkingDays,
}

impl ShiftDraft {
    pub fn validate(&self) -> Result<(), ShiftError> {
        if self.name.trim().is_empty() {
            return Err(ShiftError::EmptyName);
        }
        if self.start == self.end {
            return Err(ShiftError::ZeroLength(self.start));
        }
        for (field, value) in [
            ("grace_minutes", self.grace_minutes),
            (
                "early_departure_grace_minutes",
                self.early_departure_grace_minutes,
            ),
            (
                "early_arrival_window_minutes",
                self.early_arrival_window_minutes,
            ),
            ("overtime_threshold_minutes", self.overtime_threshold_minutes),
        ] {
            if value < 0 {
                return Err(ShiftError::NegativeMinutes { field, value });
            }
        }
        if self.working_days.is_empty() {
            return Err(ShiftError::NoWorkingDays);
        }
        Ok(())
    }

    pub fn into_shift(self, id: ShiftId) -> Shift {
        Shift {
            id,
            name: self.name.trim().to_string(),
            start: self.start,
            end: self.end,
            grace_minutes: self.grace_minutes,
            early_departure_grace_minutes: self.early_departure_grace_minutes,
            early_arrival_window_minutes: self.early_arrival_window_minutes,
            overtime_threshold_minutes: self.overtime_threshold_minutes,
            working_days: self.working_days,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShiftAssignment {
    #[serde(default)]
    pub id: i64,
    pub emp_code: String,
    pub shift_id: ShiftId,
    pub effective_from: NaiveDate,
    #[serde(default)]
    pub effective_to: Option<NaiveDate>,
}

impl ShiftAssignment {
    pub fn validate(&self) -> Result<(), ShiftError> {
        if let Some(effective_to) = self.effective_to {
            if effective_to < self.effective_from {
                return Err(ShiftError::InvertedAssignment {
                    effective_from: self.effective_from,
                    effective_to,
                });
            }
        }
        Ok(())
    }

    pub fn covers(&self, date: NaiveDate) -> bool {
        date >= self.effective_from && self.effective_to.map_or(true, |to| date <= to)
    }
}
