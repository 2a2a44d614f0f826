// src/attendance.rs
use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::shift::ShiftId;

/// Punch direction as reported by the terminal (`punch_state` in BioTime).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PunchState {
    CheckIn,
    CheckOut,
    BreakOut,
    BreakIn,
    OvertimeIn,
    OvertimeOut,
    Unknown,
}

impl PunchState {
    pub fn from_biotime_code(code: &str) -> Self {
        match code.trim() {
            "0" => PunchState::CheckIn,
            "1" => PunchState::CheckOut,
            "2" => PunchState::BreakOut,
            "3" => PunchState::BreakIn,
            "4" => PunchState::OvertimeIn,
            "5" => PunchState::OvertimeOut,
            _ => PunchState::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PunchState::CheckIn => "check_in",
            PunchState::CheckOut => "check_out",
            PunchState::BreakOut => "break_out",
            PunchState::BreakIn => "break_in",
            PunchState::OvertimeIn => "overtime_in",
            PunchState::OvertimeOut => "overtime_out",
            PunchState::Unknown => "unknown",
        }
    }
}

/// A punch as held in the staging table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedPunch {
    pub id: i64,
    pub biotime_id: Option<i64>,
    pub emp_code: String,
    pub punch_time: NaiveDateTime,
    pub punch_state: PunchState,
    pub terminal_sn: Option<String>,
    pub verify_type: Option<i64>,
    pub fingerprint: String,
    pub processed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArrivalStatus {
    Early,
    OnTime,
    WithinGrace,
    Late,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepartureStatus {
    Missing,
    EarlyDeparture,
    OnTime,
    Overtime,
    AutoPunchedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    /// Checked in, punch-out not seen yet.
    Incomplete,
    Present,
    /// Punch-out credited by the anti-overbilling processor.
    AutoPunchedOut,
    Absent,
    /// Punched without an assigned shift; hours only, no timing.
    Unscheduled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentReason {
    MissingPunchOut,
    ExcessiveHours,
}

macro_rules! text_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(format!("unknown {} value '{}'", stringify!($ty), other)),
                }
            }
        }
    };
}

text_enum!(ArrivalStatus {
    Early => "early",
    OnTime => "on_time",
    WithinGrace => "within_grace",
    Late => "late",
});

text_enum!(DepartureStatus {
    Missing => "missing",
    EarlyDeparture => "early_departure",
    OnTime => "on_time",
    Overtime => "overtime",
    AutoPunchedOut => "auto_punched_out",
});

text_enum!(AttendanceStatus {
    Incomplete => "incomplete",
    Present => "present",
    AutoPunchedOut => "auto_punched_out",
    Absent => "absent",
    Unscheduled => "unscheduled",
});

text_enum!(AdjustmentReason {
    MissingPunchOut => "missing_punch_out",
    ExcessiveHours => "excessive_hours",
});

impl FromStr for PunchState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "check_in" => PunchState::CheckIn,
            "check_out" => PunchState::CheckOut,
            "break_out" => PunchState::BreakOut,
            "break_in" => PunchState::BreakIn,
            "overtime_in" => PunchState::OvertimeIn,
            "overtime_out" => PunchState::OvertimeOut,
            "unknown" => PunchState::Unknown,
            other => return Err(format!("unknown PunchState value '{}'", other)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Adjustment {
    pub reason: AdjustmentReason,
    pub original_hours: Decimal,
    pub adjusted_hours: Decimal,
    pub applied_at: NaiveDateTime,
}

/// Canonical attendance row, one per `(emp_code, attendance_date)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub emp_code: String,
    pub attendance_date: NaiveDate,
    pub check_in: Option<NaiveDateTime>,
    pub check_out: Option<NaiveDateTime>,
    pub punch_count: i64,
    pub hours_worked: Decimal,
    pub shift_id: Option<ShiftId>,
    pub arrival: Option<ArrivalStatus>,
    pub departure: Option<DepartureStatus>,
    pub late_minutes: i64,
    pub early_departure_minutes: i64,
    pub overtime_minutes: i64,
    pub deduction_minutes: i64,
    pub status: AttendanceStatus,
    pub adjustment: Option<Adjustment>,
    pub updated_at: NaiveDateTime,
}

impl AttendanceRecord {
    pub fn new(emp_code: &str, attendance_date: NaiveDate, updated_at: NaiveDateTime) -> Self {
        Self {
            emp_code: emp_code.to_string(),
            attendance_date,
            check_in: None,
            check_out: None,
            punch_count: 0,
            hours_worked: dec!(0),
            shift_id: None,
            arrival: None,
            departure: None,
            late_minutes: 0,
            early_departure_minutes: 0,
            overtime_minutes: 0,
            deduction_minutes: 0,
            status: AttendanceStatus::Incomplete,
            adjustment: None,
            updated_at,
        }
    }

    pub fn absent(emp_code: &str, attendance_date: NaiveDate, shift_id: ShiftId, now: NaiveDateTime) -> Self {
        Self {
            shift_id: Some(shift_id),
            status: AttendanceStatus::Absent,
            ..Self::new(emp_code, attendance_date, now)
        }
    }

    pub fn is_open(&self) -> bool {
        self.check_in.is_some() && self.check_out.is_none()
    }
}

/// Hours between two instants, rounded to two decimals; never negative.
pub fn hours_between(start: NaiveDateTime, end: NaiveDateTime) -> Decimal {
    let minutes = (end - start).num_minutes().max(0);
    minutes_to_hours(minutes)
}

pub fn minutes_to_hours(minutes: i64) -> Decimal {
    (Decimal::from(minutes) / dec!(60)).round_dp(2)
}
