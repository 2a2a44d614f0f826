// src/pipeline.rs
use chrono::{Duration, NaiveDate, NaiveTime};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::attendance::AdjustmentReason;
use crate::classifier::{classify, effective_shift, mark_absences};
use crate::clock::Clock;
use crate::config::PipelineConfig;
use crate::normalizer::{AttendanceKey, Normalizer};
use crate::overbilling::OverbillingPolicy;
use crate::store::{AttendanceStore, StoreError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineReport {
    pub punches_processed: usize,
    pub records_written: usize,
    pub records_removed: usize,
    pub auto_punched_out: usize,
    pub hours_capped: usize,
    pub absences_marked: usize,
}

impl PipelineReport {
    fn count_adjustment(&mut self, reason: Option<AdjustmentReason>) {
        match reason {
            Some(AdjustmentReason::MissingPunchOut) => self.auto_punched_out += 1,
            Some(AdjustmentReason::ExcessiveHours) => self.hours_capped += 1,
            None => {}
        }
    }

    pub fn merge(&mut self, other: PipelineReport) {
        self.punches_processed += other.punches_processed;
        self.records_written += other.records_written;
        self.records_removed += other.records_removed;
        self.auto_punched_out += other.auto_punched_out;
        self.hours_capped += other.hours_capped;
        self.absences_marked += other.absences_marked;
    }
}

/// Staged punches in, classified and capped attendance rows out.
pub struct Pipeline {
    store: Arc<AttendanceStore>,
    clock: Arc<dyn Clock>,
    config: PipelineConfig,
    policy: OverbillingPolicy,
}

impl Pipeline {
    pub fn new(store: Arc<AttendanceStore>, clock: Arc<dyn Clock>, config: PipelineConfig) -> Self {
        let policy = OverbillingPolicy::from(&config);
        Self {
            store,
            clock,
            config,
            policy,
        }
    }

    pub fn process_pending(&self) -> Result<PipelineReport, StoreError> {
        let pending = self.store.pending_punches()?;
        let mut report = PipelineReport::default();

        if !pending.is_empty() {
            let mut normalizer = Normalizer::new(&self.store, &self.config);
            let keys = normalizer.affected_keys(&pending)?;
            debug!("{} pending punches touch {} attendance keys", pending.len(), keys.len());

            self.rebuild_keys(&mut normalizer, &keys, &mut report)?;

            let ids: Vec<i64> = pending.iter().map(|p| p.id).collect();
            report.punches_processed = self.store.mark_processed(&ids)?;
        }

        report.merge(self.sweep_open_records()?);

        if let Some(yesterday) = self.clock.today().pred_opt() {
            report.absences_marked += mark_absences(&self.store, yesterday, self.clock.now())?;
        }

        if report != PipelineReport::default() {
            info!("Pipeline run: {:?}", report);
        }
        Ok(report)
    }

    /// Recomputes every key in `[from, to]` from staging, processed or not.
    pub fn reprocess_range(&self, from: NaiveDate, to: NaiveDate) -> Result<PipelineReport, StoreError> {
        let mut report = PipelineReport::default();
        let start = from.and_time(NaiveTime::MIN);
        // One extra day holds check-outs of overnight shifts starting on `to`.
        let end = to.and_time(NaiveTime::MIN) + Duration::days(2);
        let punches = self.store.punches_in_range(start, end)?;

        let mut normalizer = Normalizer::new(&self.store, &self.config);
        let mut keys: BTreeSet<AttendanceKey> = normalizer
            .affected_keys(&punches)?
            .into_iter()
            .filter(|(_, date)| *date >= from && *date <= to)
            .collect();
        // Rows whose punches now belong to another day must be revisited too.
        keys.extend(self.store.punched_attendance_keys(from, to)?);
        info!("Reprocessing {} attendance keys between {} and {}", keys.len(), from, to);

        self.rebuild_keys(&mut normalizer, &keys, &mut report)?;

        let pending: Vec<i64> = punches.iter().filter(|p| !p.processed).map(|p| p.id).collect();
        report.punches_processed = self.store.mark_processed(&pending)?;

        report.merge(self.sweep_open_records()?);

        let today = self.clock.today();
        let mut date = from;
        while date <= to && date < today {
            report.absences_marked += mark_absences(&self.store, date, self.clock.now())?;
            match date.succ_opt() {
                Some(next) => date = next,
                None => break,
            }
        }
        Ok(report)
    }

    fn rebuild_keys<'k>(
        &self,
        normalizer: &mut Normalizer<'_>,
        keys: impl IntoIterator<Item = &'k AttendanceKey>,
        report: &mut PipelineReport,
    ) -> Result<(), StoreError> {
        let now = self.clock.now();
        for (emp_code, date) in keys {
            let Some(summary) = normalizer.recompute(emp_code, *date)? else {
                if self.store.delete_punched_attendance(emp_code, *date)? {
                    report.records_removed += 1;
                }
                continue;
            };
            let shift = effective_shift(self.store.shift_for(emp_code, *date)?, *date);
            let mut record = classify(&summary, shift.as_ref(), now);
            report.count_adjustment(self.policy.apply(&mut record, shift.as_ref(), now));
            self.store.upsert_attendance(&record)?;
            report.records_written += 1;
        }
        Ok(())
    }

    /// Auto punches out open records whose deadline has passed.
    pub fn sweep_open_records(&self) -> Result<PipelineReport, StoreError> {
        let now = self.clock.now();
        let mut report = PipelineReport::default();
        for mut record in self.store.open_attendance()? {
            let shift = effective_shift(
                self.store.shift_for(&record.emp_code, record.attendance_date)?,
                record.attendance_date,
            );
            let reason = self.policy.apply(&mut record, shift.as_ref(), now);
            if reason.is_some() {
                self.store.upsert_attendance(&record)?;
                report.records_written += 1;
                report.count_adjustment(reason);
            }
        }
        Ok(report)
    }
}
