// src/classifier.rs
use chrono::{Duration, NaiveDate, NaiveDateTime};
use tracing::{debug, info};

use crate::attendance::{
    hours_between, ArrivalStatus, AttendanceRecord, AttendanceStatus, DepartureStatus,
};
use crate::normalizer::DaySummary;
use crate::shift::Shift;
use crate::store::{AttendanceStore, StoreError};

/// The shift that applies to `date`, if any: assigned and scheduled on that weekday.
pub fn effective_shift(shift: Option<Shift>, date: NaiveDate) -> Option<Shift> {
    shift.filter(|s| s.is_working_day(date))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrivalTiming {
    pub status: ArrivalStatus,
    /// Minutes after shift start, zero when not after it.
    pub late_minutes: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepartureTiming {
    pub status: DepartureStatus,
    pub early_departure_minutes: i64,
    pub overtime_minutes: i64,
}

/// Whole minutes in `d`, counting a started minute as a full one.
fn minutes_rounded_up(d: Duration) -> i64 {
    (d.num_seconds().max(0) + 59) / 60
}

pub fn classify_arrival(check_in: NaiveDateTime, shift: &Shift, date: NaiveDate) -> ArrivalTiming {
    let window = shift.window_for(date);
    let offset = check_in - window.start;

    let status = if offset < -Duration::minutes(shift.early_arrival_window_minutes) {
        ArrivalStatus::Early
    } else if offset <= Duration::zero() {
        ArrivalStatus::OnTime
    } else if offset <= Duration::minutes(shift.grace_minutes) {
        ArrivalStatus::WithinGrace
    } else {
        ArrivalStatus::Late
    };

    ArrivalTiming {
        status,
        late_minutes: minutes_rounded_up(offset),
    }
}

pub fn classify_departure(check_out: Option<NaiveDateTime>, shift: &Shift, date: NaiveDate) -> DepartureTiming {
    let Some(check_out) = check_out else {
        return DepartureTiming {
            status: DepartureStatus::Missing,
            early_departure_minutes: 0,
            overtime_minutes: 0,
        };
    };

    let window = shift.window_for(date);
    let early = window.end - check_out;
    if early > Duration::minutes(shift.early_departure_grace_minutes) {
        return DepartureTiming {
            status: DepartureStatus::EarlyDeparture,
            early_departure_minutes: minutes_rounded_up(early),
            overtime_minutes: 0,
        };
    }

    // Overtime is paid, so only completed minutes count.
    let overtime = check_out - window.end;
    if overtime > Duration::minutes(shift.overtime_threshold_minutes) {
        DepartureTiming {
            status: DepartureStatus::Overtime,
            early_departure_minutes: 0,
            overtime_minutes: overtime.num_minutes(),
        }
    } else {
        DepartureTiming {
            status: DepartureStatus::OnTime,
            early_departure_minutes: 0,
            overtime_minutes: 0,
        }
    }
}

/// Builds the canonical record for one employee-day.
///
/// `shift` must already be the effective shift for the day; `None` yields an
/// `Unscheduled` record carrying hours only.
pub fn classify(summary: &DaySummary, shift: Option<&Shift>, now: NaiveDateTime) -> AttendanceRecord {
    let mut record = AttendanceRecord::new(&summary.emp_code, summary.attendance_date, now);
    record.check_in = Some(summary.check_in);
    record.check_out = summary.check_out;
    record.punch_count = summary.punch_count;
    record.hours_worked = summary
        .check_out
        .map(|out| hours_between(summary.check_in, out))
        .unwrap_or_default();

    let Some(shift) = shift else {
        record.status = AttendanceStatus::Unscheduled;
        return record;
    };

    let arrival = classify_arrival(summary.check_in, shift, summary.attendance_date);
    let departure = classify_departure(summary.check_out, shift, summary.attendance_date);

    record.shift_id = Some(shift.id);
    record.arrival = Some(arrival.status);
    record.departure = Some(departure.status);
    record.late_minutes = arrival.late_minutes;
    record.early_departure_minutes = departure.early_departure_minutes;
    record.overtime_minutes = departure.overtime_minutes;
    record.deduction_minutes = deduction_minutes(&record);
    record.status = if record.check_out.is_some() {
        AttendanceStatus::Present
    } else {
        AttendanceStatus::Incomplete
    };

    debug!(
        "Classified {} on {}: {:?}/{:?}, deduction {} min",
        record.emp_code, record.attendance_date, record.arrival, record.departure, record.deduction_minutes
    );
    record
}

/// Late minutes count only when late; early-departure minutes only when leaving early.
pub fn deduction_minutes(record: &AttendanceRecord) -> i64 {
    let late = match record.arrival {
        Some(ArrivalStatus::Late) => record.late_minutes,
        _ => 0,
    };
    let early = match record.departure {
        Some(DepartureStatus::EarlyDeparture) => record.early_departure_minutes,
        _ => 0,
    };
    late + early
}

/// Writes `Absent` rows for active employees scheduled on `date` who have no record.
pub fn mark_absences(store: &AttendanceStore, date: NaiveDate, now: NaiveDateTime) -> Result<usize, StoreError> {
    let mut marked = 0;
    for employee in store.list_employees()?.into_iter().filter(|e| e.is_active) {
        let Some(shift) = effective_shift(store.shift_for(&employee.emp_code, date)?, date) else {
            continue;
        };
        if store.get_attendance(&employee.emp_code, date)?.is_some() {
            continue;
        }
        store.upsert_attendance(&AttendanceRecord::absent(&employee.emp_code, date, shift.id, now))?;
        marked += 1;
    }

    if marked > 0 {
        info!("Marked {} employees absent on {}", marked, date);
    }
    Ok(marked)
}
