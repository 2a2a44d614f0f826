// src/store.rs
use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info};

use crate::attendance::{Adjustment, AttendanceRecord, AttendanceStatus, PunchState, StagedPunch};
use crate::shift::{Shift, ShiftAssignment, ShiftDraft, ShiftError, ShiftId};

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const TIME_FORMAT: &str = "%H:%M:%S";
const WATERMARK_KEY: &str = "transactions_watermark";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Store lock poisoned")]
    LockPoisoned,

    #[error("A shift named '{0}' already exists")]
    DuplicateShiftName(String),

    #[error("Shift {0} does not exist")]
    UnknownShift(ShiftId),

    #[error(transparent)]
    InvalidShift(#[from] ShiftError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Employee {
    pub emp_code: String,
    pub biotime_id: Option<i64>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub department: Option<String>,
    pub cnic: Option<String>,
    pub is_active: bool,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityConflict {
    pub id: i64,
    pub cnic: String,
    pub emp_code: String,
    pub existing_emp_code: String,
    pub detected_at: NaiveDateTime,
}

/// A punch ready to be staged; the fingerprint is derived, not supplied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPunch {
    pub biotime_id: Option<i64>,
    pub emp_code: String,
    pub punch_time: NaiveDateTime,
    pub punch_state: PunchState,
    pub terminal_sn: Option<String>,
    pub verify_type: Option<i64>,
}

impl NewPunch {
    pub fn fingerprint(&self) -> String {
        punch_fingerprint(&self.emp_code, self.punch_time, self.terminal_sn.as_deref())
    }
}

/// `sha256(emp_code|punch_time|terminal_sn)`, hex encoded.
pub fn punch_fingerprint(emp_code: &str, punch_time: NaiveDateTime, terminal_sn: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(emp_code.trim().as_bytes());
    hasher.update(b"|");
    hasher.update(punch_time.format(DATETIME_FORMAT).to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(terminal_sn.unwrap_or_default().trim().as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub inserted: usize,
    pub duplicates: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollStatus {
    Success,
    Failed,
}

impl PollStatus {
    fn as_str(&self) -> &'static str {
        match self {
            PollStatus::Success => "success",
            PollStatus::Failed => "failed",
        }
    }
}

impl FromStr for PollStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(PollStatus::Success),
            "failed" => Ok(PollStatus::Failed),
            other => Err(format!("unknown poll status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollRun {
    #[serde(default)]
    pub id: i64,
    pub started_at: NaiveDateTime,
    pub window_start: NaiveDateTime,
    pub window_end: NaiveDateTime,
    pub fetched: i64,
    pub inserted: i64,
    pub duplicates: i64,
    pub status: PollStatus,
    pub error: Option<String>,
}

// --- Column helpers ---

fn conversion_error(idx: usize, detail: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, detail.into())
}

fn parse_text<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|e| conversion_error(idx, format!("'{}': {}", raw, e)))
}

fn parse_opt_text<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| conversion_error(idx, format!("'{}': {}", raw, e))),
        None => Ok(None),
    }
}

fn datetime_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDateTime> {
    let raw: String = row.get(idx)?;
    NaiveDateTime::parse_from_str(&raw, DATETIME_FORMAT)
        .map_err(|e| conversion_error(idx, format!("'{}': {}", raw, e)))
}

fn opt_datetime_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<NaiveDateTime>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) => NaiveDateTime::parse_from_str(&raw, DATETIME_FORMAT)
            .map(Some)
            .map_err(|e| conversion_error(idx, format!("'{}': {}", raw, e))),
        None => Ok(None),
    }
}

fn date_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDate> {
    let raw: String = row.get(idx)?;
    NaiveDate::parse_from_str(&raw, DATE_FORMAT)
        .map_err(|e| conversion_error(idx, format!("'{}': {}", raw, e)))
}

fn time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveTime> {
    let raw: String = row.get(idx)?;
    NaiveTime::parse_from_str(&raw, TIME_FORMAT)
        .map_err(|e| conversion_error(idx, format!("'{}': {}", raw, e)))
}

fn fmt_dt(dt: NaiveDateTime) -> String {
    dt.format(DATETIME_FORMAT).to_string()
}

fn fmt_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

fn day_start(date: NaiveDate) -> NaiveDateTime {
    date.and_time(NaiveTime::MIN)
}

// --- Row mappers ---

const EMPLOYEE_COLUMNS: &str =
    "emp_code, biotime_id, first_name, last_name, department, cnic, is_active, updated_at";

fn employee_from_row(row: &Row<'_>) -> rusqlite::Result<Employee> {
    Ok(Employee {
        emp_code: row.get(0)?,
        biotime_id: row.get(1)?,
        first_name: row.get(2)?,
        last_name: row.get(3)?,
        department: row.get(4)?,
        cnic: row.get(5)?,
        is_active: row.get(6)?,
        updated_at: datetime_col(row, 7)?,
    })
}

const SHIFT_COLUMNS: &str = "s.id, s.name, s.start_time, s.end_time, s.grace_minutes, \
     s.early_departure_grace_minutes, s.early_arrival_window_minutes, \
     s.overtime_threshold_minutes, s.working_days";

fn shift_from_row(row: &Row<'_>) -> rusqlite::Result<Shift> {
    Ok(Shift {
        id: row.get(0)?,
        name: row.get(1)?,
        start: time_col(row, 2)?,
        end: time_col(row, 3)?,
        grace_minutes: row.get(4)?,
        early_departure_grace_minutes: row.get(5)?,
        early_arrival_window_minutes: row.get(6)?,
        overtime_threshold_minutes: row.get(7)?,
        working_days: parse_text(row, 8)?,
    })
}

const PUNCH_COLUMNS: &str =
    "id, biotime_id, emp_code, punch_time, punch_state, terminal_sn, verify_type, fingerprint, processed";

fn punch_from_row(row: &Row<'_>) -> rusqlite::Result<StagedPunch> {
    Ok(StagedPunch {
        id: row.get(0)?,
        biotime_id: row.get(1)?,
        emp_code: row.get(2)?,
        punch_time: datetime_col(row, 3)?,
        punch_state: parse_text(row, 4)?,
        terminal_sn: row.get(5)?,
        verify_type: row.get(6)?,
        fingerprint: row.get(7)?,
        processed: row.get(8)?,
    })
}

const ATTENDANCE_COLUMNS: &str = "emp_code, attendance_date, check_in, check_out, punch_count, \
     hours_worked, shift_id, arrival, departure, late_minutes, early_departure_minutes, \
     overtime_minutes, deduction_minutes, status, adjustment_reason, original_hours, \
     adjusted_hours, adjusted_at, updated_at";

fn attendance_from_row(row: &Row<'_>) -> rusqlite::Result<AttendanceRecord> {
    let adjustment = match parse_opt_text(row, 14)? {
        Some(reason) => Some(Adjustment {
            reason,
            original_hours: parse_text::<Decimal>(row, 15)?,
            adjusted_hours: parse_text::<Decimal>(row, 16)?,
            applied_at: datetime_col(row, 17)?,
        }),
        None => None,
    };

    Ok(AttendanceRecord {
        emp_code: row.get(0)?,
        attendance_date: date_col(row, 1)?,
        check_in: opt_datetime_col(row, 2)?,
        check_out: opt_datetime_col(row, 3)?,
        punch_count: row.get(4)?,
        hours_worked: parse_text(row, 5)?,
        shift_id: row.get(6)?,
        arrival: parse_opt_text(row, 7)?,
        departure: parse_opt_text(row, 8)?,
        late_minutes: row.get(9)?,
        early_departure_minutes: row.get(10)?,
        overtime_minutes: row.get(11)?,
        deduction_minutes: row.get(12)?,
        status: parse_text(row, 13)?,
        adjustment,
        updated_at: datetime_col(row, 18)?,
    })
}

fn poll_run_from_row(row: &Row<'_>) -> rusqlite::Result<PollRun> {
    Ok(PollRun {
        id: row.get(0)?,
        started_at: datetime_col(row, 1)?,
        window_start: datetime_col(row, 2)?,
        window_end: datetime_col(row, 3)?,
        fetched: row.get(4)?,
        inserted: row.get(5)?,
        duplicates: row.get(6)?,
        status: parse_text(row, 7)?,
        error: row.get(8)?,
    })
}

/// SQLite-backed staging area and canonical attendance tables.
pub struct AttendanceStore {
    conn: Mutex<Connection>,
}

impl AttendanceStore {
    const SCHEMA: &'static str = r"
        CREATE TABLE IF NOT EXISTS employees (
            emp_code TEXT PRIMARY KEY,
            biotime_id INTEGER,
            first_name TEXT,
            last_name TEXT,
            department TEXT,
            cnic TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_employees_cnic ON employees(cnic);

        CREATE TABLE IF NOT EXISTS identity_conflicts (
            id INTEGER PRIMARY KEY,
            cnic TEXT NOT NULL,
            emp_code TEXT NOT NULL,
            existing_emp_code TEXT NOT NULL,
            detected_at TEXT NOT NULL,
            UNIQUE (cnic, emp_code, existing_emp_code)
        );

        CREATE TABLE IF NOT EXISTS shifts (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            start_time TEXT NOT NULL,
            end_time TEXT NOT NULL,
            grace_minutes INTEGER NOT NULL,
            early_departure_grace_minutes INTEGER NOT NULL,
            early_arrival_window_minutes INTEGER NOT NULL,
            overtime_threshold_minutes INTEGER NOT NULL,
            working_days TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS shift_assignments (
            id INTEGER PRIMARY KEY,
            emp_code TEXT NOT NULL,
            shift_id INTEGER NOT NULL REFERENCES shifts(id),
            effective_from TEXT NOT NULL,
            effective_to TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_shift_assignments_emp
        ON shift_assignments(emp_code, effective_from);

        -- Raw punches as pulled from BioTime
        CREATE TABLE IF NOT EXISTS staged_punches (
            id INTEGER PRIMARY KEY,
            biotime_id INTEGER UNIQUE,
            emp_code TEXT NOT NULL,
            punch_time TEXT NOT NULL,
            punch_state TEXT NOT NULL,
            terminal_sn TEXT,
            verify_type INTEGER,
            fingerprint TEXT NOT NULL UNIQUE,
            processed INTEGER NOT NULL DEFAULT 0,
            pulled_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_staged_punches_emp_time
        ON staged_punches(emp_code, punch_time);

        CREATE INDEX IF NOT EXISTS idx_staged_punches_pending
        ON staged_punches(processed);

        CREATE TABLE IF NOT EXISTS attendance_records (
            emp_code TEXT NOT NULL,
            attendance_date TEXT NOT NULL,
            check_in TEXT,
            check_out TEXT,
            punch_count INTEGER NOT NULL,
            hours_worked TEXT NOT NULL,
            shift_id INTEGER,
            arrival TEXT,
            departure TEXT,
            late_minutes INTEGER NOT NULL,
            early_departure_minutes INTEGER NOT NULL,
            overtime_minutes INTEGER NOT NULL,
            deduction_minutes INTEGER NOT NULL,
            status TEXT NOT NULL,
            adjustment_reason TEXT,
            original_hours TEXT,
            adjusted_hours TEXT,
            adjusted_at TEXT,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (emp_code, attendance_date)
        );

        CREATE INDEX IF NOT EXISTS idx_attendance_date
        ON attendance_records(attendance_date);

        CREATE TABLE IF NOT EXISTS sync_state (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS poll_runs (
            id INTEGER PRIMARY KEY,
            started_at TEXT NOT NULL,
            window_start TEXT NOT NULL,
            window_end TEXT NOT NULL,
            fetched INTEGER NOT NULL,
            inserted INTEGER NOT NULL,
            duplicates INTEGER NOT NULL,
            status TEXT NOT NULL,
            error TEXT
        );
    ";

    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        info!("Opening attendance store at {}", path.display());
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::initialize(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(Self::SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    // --- Employees ---

    pub fn upsert_employee(&self, employee: &Employee) -> Result<(), StoreError> {
        self.conn()?.execute(
            "INSERT INTO employees (emp_code, biotime_id, first_name, last_name, department, cnic, is_active, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(emp_code) DO UPDATE SET
                biotime_id = excluded.biotime_id,
                first_name = excluded.first_name,
                last_name = excluded.last_name,
                department = excluded.department,
                cnic = excluded.cnic,
                is_active = excluded.is_active,
                updated_at = excluded.updated_at",
            params![
                employee.emp_code,
                employee.biotime_id,
                employee.first_name,
                employee.last_name,
                employee.department,
                employee.cnic,
                employee.is_active,
                fmt_dt(employee.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_employee(&self, emp_code: &str) -> Result<Option<Employee>, StoreError> {
        let conn = self.conn()?;
        let employee = conn
            .query_row(
                &format!("SELECT {} FROM employees WHERE emp_code = ?1", EMPLOYEE_COLUMNS),
                params![emp_code],
                employee_from_row,
            )
            .optional()?;
        Ok(employee)
    }

    pub fn list_employees(&self) -> Result<Vec<Employee>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM employees ORDER BY emp_code",
            EMPLOYEE_COLUMNS
        ))?;
        let employees = stmt
            .query_map([], employee_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(employees)
    }

    pub fn find_employees_by_cnic(&self, cnic: &str) -> Result<Vec<Employee>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM employees WHERE cnic = ?1 ORDER BY emp_code",
            EMPLOYEE_COLUMNS
        ))?;
        let employees = stmt
            .query_map(params![cnic], employee_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(employees)
    }

    /// Returns false when the pair was already on record, in either order.
    pub fn record_identity_conflict(
        &self,
        cnic: &str,
        emp_code: &str,
        existing_emp_code: &str,
        detected_at: NaiveDateTime,
    ) -> Result<bool, StoreError> {
        let changed = self.conn()?.execute(
            "INSERT OR IGNORE INTO identity_conflicts (cnic, emp_code, existing_emp_code, detected_at)
             SELECT ?1, ?2, ?3, ?4
             WHERE NOT EXISTS (
                SELECT 1 FROM identity_conflicts
                WHERE cnic = ?1 AND emp_code = ?3 AND existing_emp_code = ?2
             )",
            params![cnic, emp_code, existing_emp_code, fmt_dt(detected_at)],
        )?;
        Ok(changed == 1)
    }

    pub fn list_identity_conflicts(&self) -> Result<Vec<IdentityConflict>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, cnic, emp_code, existing_emp_code, detected_at
             FROM identity_conflicts ORDER BY id",
        )?;
        let conflicts = stmt
            .query_map([], |row| {
                Ok(IdentityConflict {
                    id: row.get(0)?,
                    cnic: row.get(1)?,
                    emp_code: row.get(2)?,
                    existing_emp_code: row.get(3)?,
                    detected_at: datetime_col(row, 4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(conflicts)
    }

    // --- Shifts ---

    pub fn create_shift(&self, draft: ShiftDraft) -> Result<Shift, StoreError> {
        draft.validate()?;
        let conn = self.conn()?;
        let name = draft.name.trim().to_string();
        let taken: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM shifts WHERE name = ?1)",
            params![name],
            |row| row.get(0),
        )?;
        if taken {
            return Err(StoreError::DuplicateShiftName(name));
        }

        conn.execute(
            "INSERT INTO shifts (name, start_time, end_time, grace_minutes, early_departure_grace_minutes,
                                 early_arrival_window_minutes, overtime_threshold_minutes, working_days)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                name,
                draft.start.format(TIME_FORMAT).to_string(),
                draft.end.format(TIME_FORMAT).to_string(),
                draft.grace_minutes,
                draft.early_departure_grace_minutes,
                draft.early_arrival_window_minutes,
                draft.overtime_threshold_minutes,
                draft.working_days.to_string(),
            ],
        )?;
        let shift = draft.into_shift(conn.last_insert_rowid());
        info!("Created shift {} '{}'", shift.id, shift.name);
        Ok(shift)
    }

    pub fn get_shift(&self, id: ShiftId) -> Result<Option<Shift>, StoreError> {
        let conn = self.conn()?;
        let shift = conn
            .query_row(
                &format!("SELECT {} FROM shifts s WHERE s.id = ?1", SHIFT_COLUMNS),
                params![id],
                shift_from_row,
            )
            .optional()?;
        Ok(shift)
    }

    pub fn list_shifts(&self) -> Result<Vec<Shift>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM shifts s ORDER BY s.id", SHIFT_COLUMNS))?;
        let shifts = stmt
            .query_map([], shift_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(shifts)
    }

    pub fn create_assignment(&self, assignment: &ShiftAssignment) -> Result<ShiftAssignment, StoreError> {
        assignment.validate()?;
        if self.get_shift(assignment.shift_id)?.is_none() {
            return Err(StoreError::UnknownShift(assignment.shift_id));
        }

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO shift_assignments (emp_code, shift_id, effective_from, effective_to)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                assignment.emp_code,
                assignment.shift_id,
                fmt_date(assignment.effective_from),
                assignment.effective_to.map(fmt_date),
            ],
        )?;
        Ok(ShiftAssignment {
            id: conn.last_insert_rowid(),
            ..assignment.clone()
        })
    }

    /// The shift from the latest assignment effective on `date`.
    pub fn shift_for(&self, emp_code: &str, date: NaiveDate) -> Result<Option<Shift>, StoreError> {
        let conn = self.conn()?;
        let day = fmt_date(date);
        let shift = conn
            .query_row(
                &format!(
                    "SELECT {} FROM shift_assignments a
                     JOIN shifts s ON s.id = a.shift_id
                     WHERE a.emp_code = ?1
                       AND a.effective_from <= ?2
                       AND (a.effective_to IS NULL OR a.effective_to >= ?2)
                     ORDER BY a.effective_from DESC, a.id DESC
                     LIMIT 1",
                    SHIFT_COLUMNS
                ),
                params![emp_code, day],
                shift_from_row,
            )
            .optional()?;
        Ok(shift)
    }

    // --- Staging ---

    pub fn stage_punches(&self, punches: &[NewPunch], pulled_at: NaiveDateTime) -> Result<StageOutcome, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut outcome = StageOutcome::default();
        let pulled_at = fmt_dt(pulled_at);

        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO staged_punches
                    (biotime_id, emp_code, punch_time, punch_state, terminal_sn, verify_type, fingerprint, processed, pulled_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8)",
            )?;
            for punch in punches {
                let changed = stmt.execute(params![
                    punch.biotime_id,
                    punch.emp_code.trim(),
                    fmt_dt(punch.punch_time),
                    punch.punch_state.as_str(),
                    punch.terminal_sn,
                    punch.verify_type,
                    punch.fingerprint(),
                    pulled_at,
                ])?;
                if changed == 1 {
                    outcome.inserted += 1;
                } else {
                    debug!(
                        "Skipping duplicate punch {:?} for {} at {}",
                        punch.biotime_id, punch.emp_code, punch.punch_time
                    );
                    outcome.duplicates += 1;
                }
            }
        }

        tx.commit()?;
        Ok(outcome)
    }

    pub fn pending_punches(&self) -> Result<Vec<StagedPunch>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM staged_punches WHERE processed = 0 ORDER BY punch_time, id",
            PUNCH_COLUMNS
        ))?;
        let punches = stmt
            .query_map([], punch_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(punches)
    }

    /// Punches for one employee in `[start, end)`.
    pub fn punches_between(
        &self,
        emp_code: &str,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<StagedPunch>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM staged_punches
             WHERE emp_code = ?1 AND punch_time >= ?2 AND punch_time < ?3
             ORDER BY punch_time, id",
            PUNCH_COLUMNS
        ))?;
        let punches = stmt
            .query_map(params![emp_code, fmt_dt(start), fmt_dt(end)], punch_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(punches)
    }

    /// Punches for every employee in `[start, end)`.
    pub fn punches_in_range(&self, start: NaiveDateTime, end: NaiveDateTime) -> Result<Vec<StagedPunch>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM staged_punches
             WHERE punch_time >= ?1 AND punch_time < ?2
             ORDER BY punch_time, id",
            PUNCH_COLUMNS
        ))?;
        let punches = stmt
            .query_map(params![fmt_dt(start), fmt_dt(end)], punch_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(punches)
    }

    pub fn mark_processed(&self, ids: &[i64]) -> Result<usize, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut updated = 0;
        {
            let mut stmt = tx.prepare("UPDATE staged_punches SET processed = 1 WHERE id = ?1")?;
            for id in ids {
                updated += stmt.execute(params![id])?;
            }
        }
        tx.commit()?;
        Ok(updated)
    }

    /// Calendar dates in `[from, to]` that have at least one staged punch.
    pub fn staged_dates_between(&self, from: NaiveDate, to: NaiveDate) -> Result<BTreeSet<NaiveDate>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT substr(punch_time, 1, 10) FROM staged_punches
             WHERE punch_time >= ?1 AND punch_time < ?2",
        )?;
        let end = day_start(to) + Duration::days(1);
        let dates = stmt
            .query_map(params![fmt_dt(day_start(from)), fmt_dt(end)], |row| date_col(row, 0))?
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(dates)
    }

    // --- Canonical attendance ---

    pub fn upsert_attendance(&self, record: &AttendanceRecord) -> Result<(), StoreError> {
        let adjustment = record.adjustment.as_ref();
        self.conn()?.execute(
            &format!(
                "INSERT INTO attendance_records ({})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
                 ON CONFLICT(emp_code, attendance_date) DO UPDATE SET
                    check_in = excluded.check_in,
                    check_out = excluded.check_out,
                    punch_count = excluded.punch_count,
                    hours_worked = excluded.hours_worked,
                    shift_id = excluded.shift_id,
                    arrival = excluded.arrival,
                    departure = excluded.departure,
                    late_minutes = excluded.late_minutes,
                    early_departure_minutes = excluded.early_departure_minutes,
                    overtime_minutes = excluded.overtime_minutes,
                    deduction_minutes = excluded.deduction_minutes,
                    status = excluded.status,
                    adjustment_reason = excluded.adjustment_reason,
                    original_hours = excluded.original_hours,
                    adjusted_hours = excluded.adjusted_hours,
                    adjusted_at = excluded.adjusted_at,
                    updated_at = excluded.updated_at",
                ATTENDANCE_COLUMNS
            ),
            params![
                record.emp_code,
                fmt_date(record.attendance_date),
                record.check_in.map(fmt_dt),
                record.check_out.map(fmt_dt),
                record.punch_count,
                record.hours_worked.to_string(),
                record.shift_id,
                record.arrival.map(|a| a.as_str()),
                record.departure.map(|d| d.as_str()),
                record.late_minutes,
                record.early_departure_minutes,
                record.overtime_minutes,
                record.deduction_minutes,
                record.status.as_str(),
                adjustment.map(|a| a.reason.as_str()),
                adjustment.map(|a| a.original_hours.to_string()),
                adjustment.map(|a| a.adjusted_hours.to_string()),
                adjustment.map(|a| fmt_dt(a.applied_at)),
                fmt_dt(record.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_attendance(&self, emp_code: &str, date: NaiveDate) -> Result<Option<AttendanceRecord>, StoreError> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!(
                    "SELECT {} FROM attendance_records WHERE emp_code = ?1 AND attendance_date = ?2",
                    ATTENDANCE_COLUMNS
                ),
                params![emp_code, fmt_date(date)],
                attendance_from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn attendance_for_date(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM attendance_records WHERE attendance_date = ?1 ORDER BY emp_code",
            ATTENDANCE_COLUMNS
        ))?;
        let records = stmt
            .query_map(params![fmt_date(date)], attendance_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn attendance_for_employee(
        &self,
        emp_code: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM attendance_records
             WHERE emp_code = ?1 AND attendance_date >= ?2 AND attendance_date <= ?3
             ORDER BY attendance_date",
            ATTENDANCE_COLUMNS
        ))?;
        let records = stmt
            .query_map(params![emp_code, fmt_date(from), fmt_date(to)], attendance_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Records with a check-in, no check-out and no adjustment yet.
    pub fn open_attendance(&self) -> Result<Vec<AttendanceRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM attendance_records
             WHERE check_in IS NOT NULL AND check_out IS NULL AND adjustment_reason IS NULL
             ORDER BY attendance_date, emp_code",
            ATTENDANCE_COLUMNS
        ))?;
        let records = stmt
            .query_map([], attendance_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Keys of punch-derived rows in `[from, to]`; absence rows are left out.
    pub fn punched_attendance_keys(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<(String, NaiveDate)>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT emp_code, attendance_date FROM attendance_records
             WHERE attendance_date >= ?1 AND attendance_date <= ?2 AND status != ?3
             ORDER BY attendance_date, emp_code",
        )?;
        let keys = stmt
            .query_map(
                params![fmt_date(from), fmt_date(to), AttendanceStatus::Absent.as_str()],
                |row| Ok((row.get::<_, String>(0)?, date_col(row, 1)?)),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    /// Drops a punch-derived row that no longer has punches behind it.
    pub fn delete_punched_attendance(&self, emp_code: &str, date: NaiveDate) -> Result<bool, StoreError> {
        let removed = self.conn()?.execute(
            "DELETE FROM attendance_records WHERE emp_code = ?1 AND attendance_date = ?2 AND status != ?3",
            params![emp_code, fmt_date(date), AttendanceStatus::Absent.as_str()],
        )?;
        if removed > 0 {
            info!("Removed stale attendance for {} on {}", emp_code, date);
        }
        Ok(removed > 0)
    }

    /// Test hook for breaking the schema under a running pipeline.
    #[cfg(test)]
    pub(crate) fn execute_sql(&self, sql: &str) -> Result<(), StoreError> {
        self.conn()?.execute_batch(sql)?;
        Ok(())
    }

    // --- Sync state ---

    pub fn get_watermark(&self) -> Result<Option<NaiveDateTime>, StoreError> {
        let conn = self.conn()?;
        let watermark = conn
            .query_row(
                "SELECT value FROM sync_state WHERE key = ?1",
                params![WATERMARK_KEY],
                |row| datetime_col(row, 0),
            )
            .optional()?;
        Ok(watermark)
    }

    pub fn set_watermark(&self, watermark: NaiveDateTime) -> Result<(), StoreError> {
        self.conn()?.execute(
            "INSERT INTO sync_state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![WATERMARK_KEY, fmt_dt(watermark)],
        )?;
        Ok(())
    }

    pub fn record_poll_run(&self, run: &PollRun) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO poll_runs (started_at, window_start, window_end, fetched, inserted, duplicates, status, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                fmt_dt(run.started_at),
                fmt_dt(run.window_start),
                fmt_dt(run.window_end),
                run.fetched,
                run.inserted,
                run.duplicates,
                run.status.as_str(),
                run.error,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent first.
    pub fn recent_poll_runs(&self, limit: usize) -> Result<Vec<PollRun>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, started_at, window_start, window_end, fetched, inserted, duplicates, status, error
             FROM poll_runs ORDER BY id DESC LIMIT ?1",
        )?;
        let runs = stmt
            .query_map(params![limit as i64], poll_run_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }
}
