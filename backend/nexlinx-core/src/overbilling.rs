// src/overbilling.rs
use chrono::{Duration, NaiveDateTime};
use tracing::{info, warn};

use crate::attendance::{
    minutes_to_hours, Adjustment, AdjustmentReason, AttendanceRecord, AttendanceStatus, DepartureStatus,
};
use crate::config::PipelineConfig;
use crate::shift::Shift;

/// Caps on hours credited when punches are missing or implausible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverbillingPolicy {
    pub missing_punchout_grace_minutes: i64,
    pub auto_punchout_after_minutes: i64,
    pub missing_punchout_cap_minutes: i64,
    pub max_overtime_minutes: i64,
    pub max_daily_minutes: i64,
}

impl From<&PipelineConfig> for OverbillingPolicy {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            missing_punchout_grace_minutes: config.missing_punchout_grace_minutes,
            auto_punchout_after_minutes: config.auto_punchout_after_minutes,
            missing_punchout_cap_minutes: config.missing_punchout_cap_minutes,
            max_overtime_minutes: config.max_overtime_minutes,
            max_daily_minutes: config.max_daily_minutes,
        }
    }
}

impl OverbillingPolicy {
    /// When an open record stops waiting for its punch-out.
    pub fn punchout_deadline(&self, record: &AttendanceRecord, shift: Option<&Shift>) -> Option<NaiveDateTime> {
        let check_in = record.check_in?;
        Some(match shift {
            Some(shift) => {
                shift.window_for(record.attendance_date).end
                    + Duration::minutes(self.missing_punchout_grace_minutes)
            }
            None => check_in + Duration::minutes(self.auto_punchout_after_minutes),
        })
    }

    /// Most minutes a completed day may be credited with.
    pub fn daily_cap_minutes(&self, shift: Option<&Shift>) -> i64 {
        match shift {
            Some(shift) => shift.scheduled_minutes() + self.max_overtime_minutes,
            None => self.max_daily_minutes,
        }
    }

    /// Applies at most one adjustment; records already adjusted are left alone.
    ///
    /// `shift` must be the effective shift for the record's date.
    pub fn apply(
        &self,
        record: &mut AttendanceRecord,
        shift: Option<&Shift>,
        now: NaiveDateTime,
    ) -> Option<AdjustmentReason> {
        if record.adjustment.is_some() {
            return None;
        }
        let check_in = record.check_in?;

        match record.check_out {
            None => {
                let deadline = self.punchout_deadline(record, shift)?;
                if now <= deadline {
                    return None;
                }
                self.auto_punch_out(record, check_in, shift, now);
                Some(AdjustmentReason::MissingPunchOut)
            }
            Some(check_out) => {
                let worked = (check_out - check_in).num_minutes();
                let cap = self.daily_cap_minutes(shift);
                if worked <= cap {
                    return None;
                }
                self.cap_hours(record, worked, cap, now);
                Some(AdjustmentReason::ExcessiveHours)
            }
        }
    }

    fn auto_punch_out(
        &self,
        record: &mut AttendanceRecord,
        check_in: NaiveDateTime,
        shift: Option<&Shift>,
        now: NaiveDateTime,
    ) {
        let (credited_out, cap) = match shift {
            Some(shift) => (
                shift.window_for(record.attendance_date).end.max(check_in),
                shift.scheduled_minutes(),
            ),
            None => (
                check_in + Duration::minutes(self.missing_punchout_cap_minutes),
                self.missing_punchout_cap_minutes,
            ),
        };
        let credited_minutes = (credited_out - check_in).num_minutes().clamp(0, cap);
        let original_hours = record.hours_worked;
        let adjusted_hours = minutes_to_hours(credited_minutes);

        warn!(
            "Auto punch-out for {} on {}: crediting {} h (check-in {})",
            record.emp_code, record.attendance_date, adjusted_hours, check_in
        );

        record.check_out = Some(credited_out);
        record.hours_worked = adjusted_hours;
        record.status = AttendanceStatus::AutoPunchedOut;
        if shift.is_some() {
            record.departure = Some(DepartureStatus::AutoPunchedOut);
            record.early_departure_minutes = 0;
            record.overtime_minutes = 0;
        }
        record.adjustment = Some(Adjustment {
            reason: AdjustmentReason::MissingPunchOut,
            original_hours,
            adjusted_hours,
            applied_at: now,
        });
        record.updated_at = now;
    }

    fn cap_hours(&self, record: &mut AttendanceRecord, worked: i64, cap: i64, now: NaiveDateTime) {
        let original_hours = record.hours_worked;
        let adjusted_hours = minutes_to_hours(cap);

        info!(
            "Capping {} on {} from {} min to {} min",
            record.emp_code, record.attendance_date, worked, cap
        );

        record.hours_worked = adjusted_hours;
        record.overtime_minutes = record.overtime_minutes.min(self.max_overtime_minutes);
        record.adjustment = Some(Adjustment {
            reason: AdjustmentReason::ExcessiveHours,
            original_hours,
            adjusted_hours,
            applied_at: now,
        });
        record.updated_at = now;
    }
}
