// src/employee_sync.rs
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::{info, warn};

use crate::biotime_client::BioTimeEmployee;
use crate::clock::Clock;
use crate::poller::{PunchSource, SyncError};
use crate::store::{AttendanceStore, Employee};

static CNIC_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{5})[-\s]?(\d{7})[-\s]?(\d)$").expect("CNIC pattern is valid")
});

/// Normalizes a CNIC to `XXXXX-XXXXXXX-X`; `None` for blanks and anything malformed.
pub fn normalize_cnic(raw: &str) -> Option<String> {
    let caps = CNIC_PATTERN.captures(raw.trim())?;
    Some(format!("{}-{}-{}", &caps[1], &caps[2], &caps[3]))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EmployeeSyncReport {
    pub fetched: usize,
    pub upserted: usize,
    pub invalid_cnic: usize,
    pub new_conflicts: usize,
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Pulls the BioTime directory and upserts it by `emp_code`.
///
/// Two codes sharing a CNIC are flagged in `identity_conflicts`; neither row is merged.
pub async fn sync_employees(
    source: &dyn PunchSource,
    store: &AttendanceStore,
    clock: &dyn Clock,
) -> Result<EmployeeSyncReport, SyncError> {
    let employees = source.fetch_employees().await?;
    let now = clock.now();
    let mut report = EmployeeSyncReport {
        fetched: employees.len(),
        ..Default::default()
    };

    for remote in &employees {
        let emp_code = remote.emp_code.trim();
        if emp_code.is_empty() {
            warn!("Skipping BioTime employee {} with empty emp_code", remote.id);
            continue;
        }

        let cnic = match non_empty(&remote.ssn) {
            Some(raw) => match normalize_cnic(&raw) {
                Some(cnic) => Some(cnic),
                None => {
                    warn!("Dropping malformed CNIC '{}' for employee {}", raw, emp_code);
                    report.invalid_cnic += 1;
                    None
                }
            },
            None => None,
        };

        if let Some(cnic) = &cnic {
            for existing in store.find_employees_by_cnic(cnic)? {
                if existing.emp_code == emp_code {
                    continue;
                }
                if store.record_identity_conflict(cnic, emp_code, &existing.emp_code, now)? {
                    warn!(
                        "Identity conflict: CNIC {} held by both {} and {}",
                        cnic, existing.emp_code, emp_code
                    );
                    report.new_conflicts += 1;
                }
            }
        }

        store.upsert_employee(&to_employee(remote, emp_code, cnic, now))?;
        report.upserted += 1;
    }

    info!(
        "Employee sync: {} fetched, {} upserted, {} bad CNICs, {} new conflicts",
        report.fetched, report.upserted, report.invalid_cnic, report.new_conflicts
    );
    Ok(report)
}

fn to_employee(
    remote: &BioTimeEmployee,
    emp_code: &str,
    cnic: Option<String>,
    now: chrono::NaiveDateTime,
) -> Employee {
    Employee {
        emp_code: emp_code.to_string(),
        biotime_id: Some(remote.id),
        first_name: non_empty(&remote.first_name),
        last_name: non_empty(&remote.last_name),
        department: remote
            .department
            .as_ref()
            .and_then(|d| non_empty(&d.dept_name)),
        cnic,
        is_active: remote.is_active.unwrap_or(true),
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cnic_accepts_common_spellings() {
        assert_eq!(normalize_cnic("35202-1234567-1").as_deref(), Some("35202-1234567-1"));
        assert_eq!(normalize_cnic("3520212345671").as_deref(), Some("35202-1234567-1"));
        assert_eq!(normalize_cnic(" 35202 1234567 1 ").as_deref(), Some("35202-1234567-1"));
    }

    #[test]
    fn cnic_rejects_malformed_values() {
        assert_eq!(normalize_cnic(""), None);
        assert_eq!(normalize_cnic("35202-123456-1"), None);
        assert_eq!(normalize_cnic("35202-1234567-12"), None);
        assert_eq!(normalize_cnic("ABCDE-1234567-1"), None);
    }
}
