// src/poller.rs
use async_trait::async_trait;
use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use rand::Rng;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::attendance::PunchState;
use crate::biotime_client::{BioTimeEmployee, BioTimeError, RawPunch, TokenStatus};
use crate::classifier::effective_shift;
use crate::clock::Clock;
use crate::config::PollerConfig;
use crate::pipeline::{Pipeline, PipelineReport};
use crate::store::{AttendanceStore, NewPunch, PollRun, PollStatus, StoreError};

/// Where punches and the employee directory come from.
#[async_trait]
pub trait PunchSource: Send + Sync {
    async fn fetch_punches(&self, start: NaiveDateTime, end: NaiveDateTime) -> Result<Vec<RawPunch>, BioTimeError>;

    async fn fetch_employees(&self) -> Result<Vec<BioTimeEmployee>, BioTimeError>;

    async fn token_status(&self) -> Option<TokenStatus> {
        None
    }
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("BioTime error: {0}")]
    Source(#[from] BioTimeError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid range: {from} is after {to}")]
    InvalidRange { from: NaiveDate, to: NaiveDate },
}

impl NewPunch {
    pub fn from_raw(raw: &RawPunch) -> Result<Self, BioTimeError> {
        let emp_code = raw.emp_code.trim();
        if emp_code.is_empty() {
            return Err(BioTimeError::InvalidPunch {
                id: raw.id,
                detail: "empty emp_code".to_string(),
            });
        }
        Ok(Self {
            biotime_id: Some(raw.id),
            emp_code: emp_code.to_string(),
            punch_time: raw.parsed_punch_time()?,
            punch_state: PunchState::from_biotime_code(&raw.punch_state),
            terminal_sn: raw
                .terminal_sn
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            verify_type: raw.verify_type,
        })
    }
}

/// Delay before retry number `attempt` (0-based): doubling, capped, plus up to 50% jitter.
pub fn backoff_delay(config: &PollerConfig, attempt: u32) -> std::time::Duration {
    let exp = config
        .retry_base_delay_ms
        .saturating_mul(1u64 << attempt.min(20))
        .min(config.retry_max_delay_ms);
    let jitter = if exp > 1 {
        rand::thread_rng().gen_range(0..=exp / 2)
    } else {
        0
    };
    std::time::Duration::from_millis(exp + jitter)
}

/// Runs `op`, retrying retryable failures up to `max_retries` more times.
pub async fn with_retry<T, F, Fut>(config: &PollerConfig, what: &str, mut op: F) -> Result<T, BioTimeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BioTimeError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < config.max_retries => {
                let delay = backoff_delay(config, attempt);
                attempt += 1;
                warn!(
                    "{} failed (attempt {}/{}): {}. Retrying in {:?}",
                    what,
                    attempt,
                    config.max_retries + 1,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                error!("{} failed after {} attempts: {}", what, attempt + 1, e);
                return Err(e);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollOutcome {
    pub window_start: NaiveDateTime,
    pub window_end: NaiveDateTime,
    pub fetched: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub pipeline: PipelineReport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedChunk {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub chunks: usize,
    pub fetched: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub failed_chunks: Vec<FailedChunk>,
    pub pipeline: PipelineReport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GapRecovery {
    pub gaps: Vec<NaiveDate>,
    pub backfill: BackfillReport,
}

struct StagedBatch {
    fetched: usize,
    inserted: usize,
    duplicates: usize,
    rejected: usize,
}

pub struct Poller {
    source: Arc<dyn PunchSource>,
    store: Arc<AttendanceStore>,
    pipeline: Arc<Pipeline>,
    clock: Arc<dyn Clock>,
    config: PollerConfig,
    // Keeps the background loop and manual triggers from overlapping.
    run_lock: Mutex<()>,
}

impl Poller {
    pub fn new(
        source: Arc<dyn PunchSource>,
        store: Arc<AttendanceStore>,
        pipeline: Arc<Pipeline>,
        clock: Arc<dyn Clock>,
        config: PollerConfig,
    ) -> Self {
        Self {
            source,
            store,
            pipeline,
            clock,
            config,
            run_lock: Mutex::new(()),
        }
    }

    fn stage(&self, raw: &[RawPunch]) -> Result<StagedBatch, StoreError> {
        let mut punches = Vec::with_capacity(raw.len());
        let mut rejected = 0;
        for punch in raw {
            match NewPunch::from_raw(punch) {
                Ok(p) => punches.push(p),
                Err(e) => {
                    warn!("Rejecting BioTime punch: {}", e);
                    rejected += 1;
                }
            }
        }
        let outcome = self.store.stage_punches(&punches, self.clock.now())?;
        Ok(StagedBatch {
            fetched: raw.len(),
            inserted: outcome.inserted,
            duplicates: outcome.duplicates,
            rejected,
        })
    }

    async fn fetch_window(&self, start: NaiveDateTime, end: NaiveDateTime) -> Result<Vec<RawPunch>, BioTimeError> {
        let what = format!("Fetch punches {} .. {}", start, end);
        with_retry(&self.config, &what, || self.source.fetch_punches(start, end)).await
    }

    fn record_failed_run(
        &self,
        started_at: NaiveDateTime,
        window_start: NaiveDateTime,
        window_end: NaiveDateTime,
        fetched: usize,
        error: &dyn std::fmt::Display,
    ) -> Result<i64, StoreError> {
        self.store.record_poll_run(&PollRun {
            id: 0,
            started_at,
            window_start,
            window_end,
            fetched: fetched as i64,
            inserted: 0,
            duplicates: 0,
            status: PollStatus::Failed,
            error: Some(error.to_string()),
        })
    }

    /// Pulls `[watermark - overlap, now]`, stages it and runs the pipeline.
    pub async fn poll_once(&self) -> Result<PollOutcome, SyncError> {
        let _guard = self.run_lock.lock().await;
        let started_at = self.clock.now();
        let window_end = started_at;
        let window_start = match self.store.get_watermark()? {
            Some(watermark) => watermark - Duration::minutes(self.config.overlap_minutes),
            None => window_end - Duration::hours(self.config.initial_lookback_hours),
        };
        info!("Polling BioTime window {} .. {}", window_start, window_end);

        let raw = match self.fetch_window(window_start, window_end).await {
            Ok(raw) => raw,
            Err(e) => {
                self.record_failed_run(started_at, window_start, window_end, 0, &e)?;
                return Err(e.into());
            }
        };

        let batch = match self.stage(&raw) {
            Ok(batch) => batch,
            Err(e) => {
                error!("Staging {} punches failed: {}", raw.len(), e);
                self.record_failed_run(started_at, window_start, window_end, raw.len(), &e)?;
                return Err(e.into());
            }
        };
        self.store.set_watermark(window_end)?;
        self.store.record_poll_run(&PollRun {
            id: 0,
            started_at,
            window_start,
            window_end,
            fetched: batch.fetched as i64,
            inserted: batch.inserted as i64,
            duplicates: batch.duplicates as i64,
            status: PollStatus::Success,
            error: None,
        })?;

        let pipeline = self.pipeline.process_pending()?;
        info!(
            "Poll complete: fetched {}, inserted {}, duplicates {}, rejected {}",
            batch.fetched, batch.inserted, batch.duplicates, batch.rejected
        );
        Ok(PollOutcome {
            window_start,
            window_end,
            fetched: batch.fetched,
            inserted: batch.inserted,
            duplicates: batch.duplicates,
            rejected: batch.rejected,
            pipeline,
        })
    }

    /// Re-pulls `[from, to]` in chunks; the watermark is left untouched.
    pub async fn backfill(&self, from: NaiveDate, to: NaiveDate) -> Result<BackfillReport, SyncError> {
        if from > to {
            return Err(SyncError::InvalidRange { from, to });
        }
        let _guard = self.run_lock.lock().await;
        let report = self.backfill_days(&[(from, to)]).await?;
        Ok(report)
    }

    async fn backfill_days(&self, ranges: &[(NaiveDate, NaiveDate)]) -> Result<BackfillReport, SyncError> {
        let mut report = BackfillReport::default();
        let chunk = Duration::hours(self.config.backfill_chunk_hours);

        for (from, to) in ranges {
            let range_end = to.and_time(NaiveTime::MIN) + Duration::days(1);
            let mut start = from.and_time(NaiveTime::MIN);
            while start < range_end {
                // BioTime's end_time is inclusive; stop a second short of the next chunk.
                let end = (start + chunk).min(range_end);
                let fetch_end = end - Duration::seconds(1);
                report.chunks += 1;

                match self.fetch_window(start, fetch_end).await {
                    Ok(raw) => {
                        let batch = self.stage(&raw)?;
                        report.fetched += batch.fetched;
                        report.inserted += batch.inserted;
                        report.duplicates += batch.duplicates;
                        report.rejected += batch.rejected;
                    }
                    Err(e) => {
                        error!("Backfill chunk {} .. {} failed: {}", start, fetch_end, e);
                        report.failed_chunks.push(FailedChunk {
                            start,
                            end: fetch_end,
                            error: e.to_string(),
                        });
                    }
                }
                start = end;
            }
        }

        if report.inserted > 0 {
            report.pipeline = self.pipeline.process_pending()?;
        }
        info!(
            "Backfill done: {} chunks, {} inserted, {} failed",
            report.chunks,
            report.inserted,
            report.failed_chunks.len()
        );
        Ok(report)
    }

    fn is_scheduled_day(&self, date: NaiveDate, employees: &[String]) -> Result<bool, StoreError> {
        for emp_code in employees {
            if effective_shift(self.store.shift_for(emp_code, date)?, date).is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Working days in `[from, to]` with no staged punches at all.
    ///
    /// A day is a working day when some active employee is scheduled on it;
    /// with no known employees every day counts.
    pub fn find_gaps(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<NaiveDate>, SyncError> {
        if from > to {
            return Err(SyncError::InvalidRange { from, to });
        }
        let staged = self.store.staged_dates_between(from, to)?;
        let employees: Vec<String> = self
            .store
            .list_employees()?
            .into_iter()
            .filter(|e| e.is_active)
            .map(|e| e.emp_code)
            .collect();

        let mut gaps = Vec::new();
        let mut date = from;
        loop {
            if !staged.contains(&date) && (employees.is_empty() || self.is_scheduled_day(date, &employees)?) {
                gaps.push(date);
            }
            match date.succ_opt() {
                Some(next) if next <= to => date = next,
                _ => break,
            }
        }
        debug!("Found {} gap days between {} and {}", gaps.len(), from, to);
        Ok(gaps)
    }

    pub async fn recover_gaps(&self, from: NaiveDate, to: NaiveDate) -> Result<GapRecovery, SyncError> {
        let _guard = self.run_lock.lock().await;
        let gaps = self.find_gaps(from, to)?;
        if gaps.is_empty() {
            info!("No gaps to recover between {} and {}", from, to);
            return Ok(GapRecovery {
                gaps,
                backfill: BackfillReport::default(),
            });
        }
        warn!("Recovering {} gap days between {} and {}", gaps.len(), from, to);
        let ranges: Vec<(NaiveDate, NaiveDate)> = gaps.iter().map(|d| (*d, *d)).collect();
        let backfill = self.backfill_days(&ranges).await?;
        Ok(GapRecovery { gaps, backfill })
    }

    pub async fn run(self: Arc<Self>) {
        let interval = std::time::Duration::from_secs(self.config.poll_interval_secs);
        info!("Starting BioTime poller. Interval: {:?}", interval);
        loop {
            match self.poll_once().await {
                Ok(outcome) => debug!("Poll outcome: {:?}", outcome),
                Err(e) => error!("BioTime poll failed: {}. Will retry next interval.", e),
            }
            tokio::time::sleep(interval).await;
        }
    }
}
