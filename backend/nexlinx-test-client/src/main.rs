// src/main.rs

use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::error::Error;

#[derive(Debug, Deserialize)]
struct StatusResponse {
    server_time: String,
    token: Option<Value>,
    watermark: Option<String>,
    recent_poll_runs: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct AttendanceRow {
    emp_code: String,
    check_in: Option<String>,
    check_out: Option<String>,
    hours_worked: String,
    status: String,
    deduction_minutes: i64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let base_url = std::env::var("NEXLINX_URL").unwrap_or_else(|_| "http://localhost:8080".to_string());
    let client = Client::new();

    // Test 1: Status
    println!("\n🔍 Checking {}/status ...", base_url);
    let status = client
        .get(format!("{}/status", base_url))
        .send()
        .await?
        .error_for_status()?
        .json::<StatusResponse>()
        .await?;
    println!(
        "Server time {}, watermark {:?}, token {:?}, {} recent polls",
        status.server_time,
        status.watermark,
        status.token,
        status.recent_poll_runs.len()
    );

    // Test 2: Manual poll
    println!("\n🔍 Triggering a poll via POST /api/sync ...");
    let sync = client.post(format!("{}/api/sync", base_url)).send().await?;
    let sync_status = sync.status();
    let sync_body: Value = sync.json().await?;
    println!("Sync status {}: {}", sync_status, sync_body);

    // Test 3: Today's attendance
    let today = status.server_time.get(..10).unwrap_or_default().to_string();
    println!("\n🔍 Attendance for {} ...", today);
    let rows = client
        .get(format!("{}/api/attendance", base_url))
        .query(&[("date", today.as_str())])
        .send()
        .await?
        .error_for_status()?
        .json::<Vec<AttendanceRow>>()
        .await?;
    for row in &rows {
        println!(
            "{:>8} {:<16} in={:<20} out={:<20} hours={:>6} deduction={}",
            row.emp_code,
            row.status,
            row.check_in.as_deref().unwrap_or("-"),
            row.check_out.as_deref().unwrap_or("-"),
            row.hours_worked,
            row.deduction_minutes
        );
    }
    println!("{} records", rows.len());

    // Test 4: Input validation
    println!("\n🔍 Sending an inverted backfill range (expect 400) ...");
    let bad = client
        .post(format!("{}/api/backfill", base_url))
        .json(&json!({ "from": "2024-03-10", "to": "2024-03-01" }))
        .send()
        .await?;
    println!("Backfill status {}: {}", bad.status(), bad.text().await?);

    println!("\n✅ Smoke test finished.");
    Ok(())
}
