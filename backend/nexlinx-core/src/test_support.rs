// src/test_support.rs
// Shared fakes for unit tests.
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use reqwest::StatusCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::biotime_client::{BioTimeEmployee, BioTimeError, RawPunch, BIOTIME_TIME_FORMAT};
use crate::clock::{Clock, TestClock};
use crate::config::{PipelineConfig, PollerConfig};
use crate::pipeline::Pipeline;
use crate::poller::{Poller, PunchSource};
use crate::shift::{Shift, ShiftAssignment, ShiftDraft, WorkingDays};
use crate::store::{AttendanceStore, Employee};

pub fn dt(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, BIOTIME_TIME_FORMAT).unwrap()
}

pub fn d(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

pub fn raw_punch(id: i64, emp_code: &str, time: &str, state: &str) -> RawPunch {
    RawPunch {
        id,
        emp_code: emp_code.to_string(),
        punch_time: time.to_string(),
        punch_state: state.to_string(),
        verify_type: Some(1),
        terminal_sn: Some("CQZ7224460247".to_string()),
        first_name: None,
        last_name: None,
        upload_time: None,
    }
}

pub fn biotime_employee(id: i64, emp_code: &str, ssn: Option<&str>) -> BioTimeEmployee {
    BioTimeEmployee {
        id,
        emp_code: emp_code.to_string(),
        first_name: Some(format!("Employee {}", emp_code)),
        last_name: None,
        department: None,
        ssn: ssn.map(str::to_string),
        is_active: Some(true),
    }
}

/// In-memory BioTime stand-in. Serves punches whose time falls in the requested window.
#[derive(Default)]
pub struct FakeSource {
    punches: Mutex<Vec<RawPunch>>,
    employees: Mutex<Vec<BioTimeEmployee>>,
    failures_left: AtomicUsize,
    permanent_failure: Mutex<bool>,
    pub calls: Mutex<Vec<(NaiveDateTime, NaiveDateTime)>>,
}

impl FakeSource {
    pub fn with_punches(punches: Vec<RawPunch>) -> Self {
        let source = Self::default();
        *source.punches.lock().unwrap() = punches;
        source
    }

    pub fn push(&self, punch: RawPunch) {
        self.punches.lock().unwrap().push(punch);
    }

    pub fn set_employees(&self, employees: Vec<BioTimeEmployee>) {
        *self.employees.lock().unwrap() = employees;
    }

    /// The next `n` fetches fail with a retryable 503.
    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Every fetch fails with a non-retryable 400 until cleared.
    pub fn set_permanent_failure(&self, fail: bool) {
        *self.permanent_failure.lock().unwrap() = fail;
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl PunchSource for FakeSource {
    async fn fetch_punches(&self, start: NaiveDateTime, end: NaiveDateTime) -> Result<Vec<RawPunch>, BioTimeError> {
        self.calls.lock().unwrap().push((start, end));
        if *self.permanent_failure.lock().unwrap() {
            return Err(BioTimeError::ApiError {
                status: StatusCode::BAD_REQUEST,
                message: "bad filter".to_string(),
            });
        }
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(BioTimeError::ApiError {
                status: StatusCode::SERVICE_UNAVAILABLE,
                message: "maintenance".to_string(),
            });
        }
        Ok(self
            .punches
            .lock()
            .unwrap()
            .iter()
            .filter(|p| {
                NaiveDateTime::parse_from_str(&p.punch_time, BIOTIME_TIME_FORMAT)
                    .map(|t| t >= start && t <= end)
                    .unwrap_or(true)
            })
            .cloned()
            .collect())
    }

    async fn fetch_employees(&self) -> Result<Vec<BioTimeEmployee>, BioTimeError> {
        Ok(self.employees.lock().unwrap().clone())
    }
}

pub fn fast_poller_config() -> PollerConfig {
    PollerConfig {
        max_retries: 2,
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 2,
        ..PollerConfig::default()
    }
}

pub fn day_shift_draft() -> ShiftDraft {
    ShiftDraft {
        name: "Day".to_string(),
        start: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
        end: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
        grace_minutes: 15,
        early_departure_grace_minutes: 0,
        early_arrival_window_minutes: 30,
        overtime_threshold_minutes: 30,
        working_days: WorkingDays::weekdays(),
    }
}

pub fn night_shift_draft() -> ShiftDraft {
    ShiftDraft {
        name: "Night".to_string(),
        start: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
        end: NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
        ..day_shift_draft()
    }
}

/// Everything a pipeline or poller test needs, wired to one in-memory store.
pub struct Harness {
    pub store: Arc<AttendanceStore>,
    pub clock: TestClock,
    pub source: Arc<FakeSource>,
    pub pipeline: Arc<Pipeline>,
    pub poller: Arc<Poller>,
}

impl Harness {
    pub fn new(now: &str, source: FakeSource) -> Self {
        let store = Arc::new(AttendanceStore::open_in_memory().unwrap());
        let clock = TestClock::new(now);
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let source = Arc::new(source);
        let pipeline = Arc::new(Pipeline::new(store.clone(), shared_clock.clone(), PipelineConfig::default()));
        let poller = Arc::new(Poller::new(
            source.clone(),
            store.clone(),
            pipeline.clone(),
            shared_clock,
            fast_poller_config(),
        ));
        Self {
            store,
            clock,
            source,
            pipeline,
            poller,
        }
    }

    pub fn add_employee(&self, emp_code: &str, shift: Option<&Shift>) {
        self.store
            .upsert_employee(&Employee {
                emp_code: emp_code.to_string(),
                biotime_id: None,
                first_name: None,
                last_name: None,
                department: None,
                cnic: None,
                is_active: true,
                updated_at: dt("2024-01-01 00:00:00"),
            })
            .unwrap();
        if let Some(shift) = shift {
            self.store
                .create_assignment(&ShiftAssignment {
                    id: 0,
                    emp_code: emp_code.to_string(),
                    shift_id: shift.id,
                    effective_from: d("2024-01-01"),
                    effective_to: None,
                })
                .unwrap();
        }
    }
}
