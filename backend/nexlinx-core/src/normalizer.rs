// src/normalizer.rs
use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::attendance::StagedPunch;
use crate::config::PipelineConfig;
use crate::shift::Shift;
use crate::store::{AttendanceStore, StoreError};

/// Natural key of a canonical attendance row.
pub type AttendanceKey = (String, NaiveDate);

/// What the punches of one employee-day boil down to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaySummary {
    pub emp_code: String,
    pub attendance_date: NaiveDate,
    pub check_in: NaiveDateTime,
    pub check_out: Option<NaiveDateTime>,
    /// Punches left after repeat scans were collapsed.
    pub punch_count: i64,
}

/// Attendance date for a punch, given the shift of the calendar day before it.
///
/// A punch shortly after an overnight shift ends belongs to the day the shift started.
pub fn attribute_date(
    punch_time: NaiveDateTime,
    previous_day_shift: Option<&Shift>,
    overnight_checkout_window_minutes: i64,
) -> NaiveDate {
    let date = punch_time.date();
    let Some(previous) = date.pred_opt() else {
        return date;
    };

    match previous_day_shift {
        Some(shift) if shift.is_overnight() && shift.is_working_day(previous) => {
            let cutoff = shift.window_for(previous).end
                + Duration::minutes(overnight_checkout_window_minutes);
            if punch_time <= cutoff {
                previous
            } else {
                date
            }
        }
        _ => date,
    }
}

/// Keeps a punch only when it is at least `window_secs` after the last kept one.
pub fn collapse_duplicates(punches: &[StagedPunch], window_secs: i64) -> Vec<NaiveDateTime> {
    let mut times: Vec<NaiveDateTime> = punches.iter().map(|p| p.punch_time).collect();
    times.sort();

    let mut kept: Vec<NaiveDateTime> = Vec::with_capacity(times.len());
    for time in times {
        match kept.last() {
            Some(last) if (time - *last).num_seconds() < window_secs => {
                debug!("Collapsing repeat scan at {} onto {}", time, last);
            }
            _ => kept.push(time),
        }
    }
    kept
}

/// First kept punch is the check-in; the last one is the check-out once there are two.
pub fn summarize(
    emp_code: &str,
    attendance_date: NaiveDate,
    punches: &[StagedPunch],
    window_secs: i64,
) -> Option<DaySummary> {
    let kept = collapse_duplicates(punches, window_secs);
    let check_in = *kept.first()?;
    let check_out = if kept.len() >= 2 { kept.last().copied() } else { None };

    Some(DaySummary {
        emp_code: emp_code.to_string(),
        attendance_date,
        check_in,
        check_out,
        punch_count: kept.len() as i64,
    })
}

pub struct Normalizer<'a> {
    store: &'a AttendanceStore,
    config: &'a PipelineConfig,
    shift_cache: HashMap<AttendanceKey, Option<Shift>>,
}

impl<'a> Normalizer<'a> {
    pub fn new(store: &'a AttendanceStore, config: &'a PipelineConfig) -> Self {
        Self {
            store,
            config,
            shift_cache: HashMap::new(),
        }
    }

    fn shift_on(&mut self, emp_code: &str, date: NaiveDate) -> Result<Option<Shift>, StoreError> {
        let key = (emp_code.to_string(), date);
        if let Some(shift) = self.shift_cache.get(&key) {
            return Ok(shift.clone());
        }
        let shift = self.store.shift_for(emp_code, date)?;
        self.shift_cache.insert(key, shift.clone());
        Ok(shift)
    }

    pub fn attendance_date_of(&mut self, punch: &StagedPunch) -> Result<NaiveDate, StoreError> {
        let date = punch.punch_time.date();
        let previous_shift = match date.pred_opt() {
            Some(previous) => self.shift_on(&punch.emp_code, previous)?,
            None => None,
        };
        Ok(attribute_date(
            punch.punch_time,
            previous_shift.as_ref(),
            self.config.overnight_checkout_window_minutes,
        ))
    }

    /// Every natural key touched by `punches`.
    pub fn affected_keys(&mut self, punches: &[StagedPunch]) -> Result<BTreeSet<AttendanceKey>, StoreError> {
        let mut keys = BTreeSet::new();
        for punch in punches {
            let date = self.attendance_date_of(punch)?;
            keys.insert((punch.emp_code.clone(), date));
        }
        Ok(keys)
    }

    /// Reloads every staged punch attributed to the key and summarizes them.
    ///
    /// Candidates are the key's own calendar day plus the next one, which may
    /// hold the check-out of an overnight shift.
    pub fn recompute(&mut self, emp_code: &str, date: NaiveDate) -> Result<Option<DaySummary>, StoreError> {
        let start = date.and_time(NaiveTime::MIN);
        let end = start + Duration::days(2);
        let candidates = self.store.punches_between(emp_code, start, end)?;

        let mut attributed = Vec::with_capacity(candidates.len());
        for punch in candidates {
            if self.attendance_date_of(&punch)? == date {
                attributed.push(punch);
            }
        }

        let summary = summarize(emp_code, date, &attributed, self.config.duplicate_window_secs);
        debug!(
            "Recomputed {} on {}: {} staged punches -> {:?}",
            emp_code,
            date,
            attributed.len(),
            summary
        );
        Ok(summary)
    }
}
