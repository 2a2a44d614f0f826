// src/api.rs
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::attendance::AttendanceRecord;
use crate::biotime_client::TokenStatus;
use crate::clock::Clock;
use crate::employee_sync::{sync_employees, EmployeeSyncReport};
use crate::pipeline::{Pipeline, PipelineReport};
use crate::poller::{BackfillReport, GapRecovery, PollOutcome, Poller, PunchSource};
use crate::shift::{Shift, ShiftAssignment, ShiftDraft};
use crate::store::{AttendanceStore, Employee, IdentityConflict, PollRun};
use crate::AppError;

const DEFAULT_HISTORY_DAYS: i64 = 30;
const STATUS_POLL_RUNS: usize = 5;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<AttendanceStore>,
    pub pipeline: Arc<Pipeline>,
    pub poller: Arc<Poller>,
    pub source: Arc<dyn PunchSource>,
    pub clock: Arc<dyn Clock>,
}

pub fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/employees", get(handle_list_employees))
        .route("/employees/sync", post(handle_sync_employees))
        .route("/identity-conflicts", get(handle_list_conflicts))
        .route("/shifts", get(handle_list_shifts).post(handle_create_shift))
        .route("/shift-assignments", post(handle_create_assignment))
        .route("/attendance", get(handle_attendance_for_date))
        .route("/attendance/{emp_code}", get(handle_attendance_for_employee))
        .route("/sync", post(handle_sync))
        .route("/backfill", post(handle_backfill))
        .route("/recover-gaps", post(handle_recover_gaps))
        .route("/process", post(handle_process));

    Router::new()
        .nest("/api", api_routes)
        .route("/status", get(handle_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    server_time: NaiveDateTime,
    token: Option<TokenStatus>,
    watermark: Option<NaiveDateTime>,
    recent_poll_runs: Vec<PollRun>,
}

async fn handle_status(State(state): State<AppState>) -> Result<Json<StatusResponse>, AppError> {
    Ok(Json(StatusResponse {
        server_time: state.clock.now(),
        token: state.source.token_status().await,
        watermark: state.store.get_watermark()?,
        recent_poll_runs: state.store.recent_poll_runs(STATUS_POLL_RUNS)?,
    }))
}

async fn handle_list_employees(State(state): State<AppState>) -> Result<Json<Vec<Employee>>, AppError> {
    Ok(Json(state.store.list_employees()?))
}

async fn handle_sync_employees(State(state): State<AppState>) -> Result<Json<EmployeeSyncReport>, AppError> {
    info!("Manual employee sync requested");
    let report = sync_employees(state.source.as_ref(), &state.store, state.clock.as_ref()).await?;
    Ok(Json(report))
}

async fn handle_list_conflicts(State(state): State<AppState>) -> Result<Json<Vec<IdentityConflict>>, AppError> {
    Ok(Json(state.store.list_identity_conflicts()?))
}

async fn handle_list_shifts(State(state): State<AppState>) -> Result<Json<Vec<Shift>>, AppError> {
    Ok(Json(state.store.list_shifts()?))
}

async fn handle_create_shift(
    State(state): State<AppState>,
    Json(draft): Json<ShiftDraft>,
) -> Result<(StatusCode, Json<Shift>), AppError> {
    let shift = state.store.create_shift(draft)?;
    Ok((StatusCode::CREATED, Json(shift)))
}

async fn handle_create_assignment(
    State(state): State<AppState>,
    Json(assignment): Json<ShiftAssignment>,
) -> Result<(StatusCode, Json<ShiftAssignment>), AppError> {
    let created = state.store.create_assignment(&assignment)?;
    info!(
        "Assigned shift {} to {} from {}",
        created.shift_id, created.emp_code, created.effective_from
    );
    Ok((StatusCode::CREATED, Json(created)))
}

#[derive(Debug, Deserialize)]
struct DateQuery {
    date: Option<NaiveDate>,
}

async fn handle_attendance_for_date(
    State(state): State<AppState>,
    Query(query): Query<DateQuery>,
) -> Result<Json<Vec<AttendanceRecord>>, AppError> {
    let date = query.date.unwrap_or_else(|| state.clock.today());
    Ok(Json(state.store.attendance_for_date(date)?))
}

#[derive(Debug, Deserialize)]
struct RangeQuery {
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
}

async fn handle_attendance_for_employee(
    State(state): State<AppState>,
    Path(emp_code): Path<String>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<Vec<AttendanceRecord>>, AppError> {
    let to = query.to.unwrap_or_else(|| state.clock.today());
    let from = query.from.unwrap_or(to - Duration::days(DEFAULT_HISTORY_DAYS));
    if from > to {
        return Err(AppError::BadRequest(format!("'from' ({}) is after 'to' ({})", from, to)));
    }
    Ok(Json(state.store.attendance_for_employee(&emp_code, from, to)?))
}

async fn handle_sync(State(state): State<AppState>) -> Result<Json<PollOutcome>, AppError> {
    info!("Manual poll requested");
    Ok(Json(state.poller.poll_once().await?))
}

#[derive(Debug, Deserialize)]
struct DateRange {
    from: NaiveDate,
    to: NaiveDate,
}

async fn handle_backfill(
    State(state): State<AppState>,
    Json(range): Json<DateRange>,
) -> Result<Json<BackfillReport>, AppError> {
    info!("Backfill requested for {} .. {}", range.from, range.to);
    Ok(Json(state.poller.backfill(range.from, range.to).await?))
}

async fn handle_recover_gaps(
    State(state): State<AppState>,
    Json(range): Json<DateRange>,
) -> Result<Json<GapRecovery>, AppError> {
    Ok(Json(state.poller.recover_gaps(range.from, range.to).await?))
}

/// Without a range, processes pending punches; with one, recomputes it.
async fn handle_process(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<PipelineReport>, AppError> {
    let report = match (query.from, query.to) {
        (Some(from), Some(to)) if from > to => {
            return Err(AppError::BadRequest(format!("'from' ({}) is after 'to' ({})", from, to)));
        }
        (Some(from), Some(to)) => state.pipeline.reprocess_range(from, to)?,
        (None, None) => state.pipeline.process_pending()?,
        _ => {
            return Err(AppError::BadRequest(
                "'from' and 'to' must be given together".to_string(),
            ))
        }
    };
    Ok(Json(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attendance::AttendanceStatus;
    use crate::test_support::{raw_punch, FakeSource, Harness};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn app(harness: &Harness) -> Router {
        build_router(AppState {
            store: harness.store.clone(),
            pipeline: harness.pipeline.clone(),
            poller: harness.poller.clone(),
            source: harness.source.clone(),
            clock: Arc::new(harness.clock.clone()),
        })
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn status_reports_empty_state() {
        let harness = Harness::new("2024-03-04 12:00:00", FakeSource::default());
        let (status, body) = send(&app(&harness), "GET", "/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["server_time"], "2024-03-04T12:00:00");
        assert_eq!(body["watermark"], Value::Null);
        assert_eq!(body["recent_poll_runs"], json!([]));
    }

    #[tokio::test]
    async fn shifts_are_created_listed_and_validated() {
        let harness = Harness::new("2024-03-04 12:00:00", FakeSource::default());
        let app = app(&harness);
        let draft = json!({"name": "Morning", "start": "08:00:00", "end": "16:00:00"});

        let (status, created) = send(&app, "POST", "/api/shifts", Some(draft.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["working_days"], "Mon,Tue,Wed,Thu,Fri");

        let (status, body) = send(&app, "POST", "/api/shifts", Some(draft)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("Morning"));

        let (status, _) = send(
            &app,
            "POST",
            "/api/shifts",
            Some(json!({"name": "Broken", "start": "08:00:00", "end": "08:00:00"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (_, list) = send(&app, "GET", "/api/shifts", None).await;
        assert_eq!(list.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn assignment_to_unknown_shift_is_not_found() {
        let harness = Harness::new("2024-03-04 12:00:00", FakeSource::default());
        let (status, _) = send(
            &app(&harness),
            "POST",
            "/api/shift-assignments",
            Some(json!({"emp_code": "1001", "shift_id": 99, "effective_from": "2024-03-01"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn manual_sync_feeds_attendance_queries() {
        let source = FakeSource::with_punches(vec![
            raw_punch(1, "1001", "2024-03-04 09:02:00", "0"),
            raw_punch(2, "1001", "2024-03-04 11:30:00", "1"),
        ]);
        let harness = Harness::new("2024-03-04 12:00:00", source);
        let app = app(&harness);

        let (status, outcome) = send(&app, "POST", "/api/sync", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(outcome["inserted"], 2);

        let (_, records) = send(&app, "GET", "/api/attendance?date=2024-03-04", None).await;
        let records = records.as_array().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["emp_code"], "1001");
        assert_eq!(records[0]["status"], AttendanceStatus::Unscheduled.as_str());

        let (_, history) = send(&app, "GET", "/api/attendance/1001?from=2024-03-01&to=2024-03-31", None).await;
        assert_eq!(history.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn bad_ranges_are_rejected() {
        let harness = Harness::new("2024-03-04 12:00:00", FakeSource::default());
        let app = app(&harness);

        let (status, _) = send(&app, "GET", "/api/attendance/1001?from=2024-03-10&to=2024-03-01", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &app,
            "POST",
            "/api/backfill",
            Some(json!({"from": "2024-03-10", "to": "2024-03-01"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, "POST", "/api/process?from=2024-03-01", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
