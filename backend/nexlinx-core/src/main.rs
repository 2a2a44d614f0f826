use anyhow::Context;
use axum::http::StatusCode as AxumStatusCode;
use axum::{response::IntoResponse, Json};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use axum_server::tls_rustls::RustlsConfig;

mod api;
mod attendance;
mod biotime_client;
mod classifier;
mod clock;
mod config;
mod employee_sync;
mod normalizer;
mod overbilling;
mod pipeline;
mod poller;
mod shift;
mod store;

#[cfg(test)]
mod pipeline_tests;
#[cfg(test)]
mod test_support;

use api::{build_router, AppState};
use biotime_client::{BioTimeClient, BioTimeError};
use clock::{Clock, SystemClock};
use config::AppConfig;
use pipeline::Pipeline;
use poller::{Poller, PunchSource, SyncError};
use shift::ShiftError;
use store::{AttendanceStore, StoreError};

// --- Error Handling ---

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] envy::Error),
    #[error("BioTime error: {0}")]
    BioTime(#[from] BioTimeError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),
    #[error("Invalid shift: {0}")]
    Shift(#[from] ShiftError),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TLS configuration error: {0}")]
    TlsConfig(String),
}

fn biotime_status(e: &BioTimeError) -> (AxumStatusCode, String) {
    match e {
        BioTimeError::RateLimitExceeded => (
            AxumStatusCode::TOO_MANY_REQUESTS,
            "BioTime rate limit exceeded; try again later.".to_string(),
        ),
        BioTimeError::Request(inner) if inner.is_timeout() => (
            AxumStatusCode::GATEWAY_TIMEOUT,
            "BioTime did not respond in time.".to_string(),
        ),
        BioTimeError::AuthFailed { .. } | BioTimeError::Unauthorized => (
            AxumStatusCode::BAD_GATEWAY,
            "BioTime rejected our credentials. Details logged.".to_string(),
        ),
        BioTimeError::ApiError { status, .. } => (
            AxumStatusCode::BAD_GATEWAY,
            format!("BioTime API returned status {}. Details logged.", status.as_u16()),
        ),
        _ => (
            AxumStatusCode::BAD_GATEWAY,
            "Failed to communicate with BioTime. Details logged.".to_string(),
        ),
    }
}

fn store_status(e: &StoreError) -> (AxumStatusCode, String) {
    match e {
        StoreError::DuplicateShiftName(_) => (AxumStatusCode::CONFLICT, e.to_string()),
        StoreError::UnknownShift(_) => (AxumStatusCode::NOT_FOUND, e.to_string()),
        StoreError::InvalidShift(_) => (AxumStatusCode::UNPROCESSABLE_ENTITY, e.to_string()),
        StoreError::Sqlite(_) | StoreError::LockPoisoned => (
            AxumStatusCode::INTERNAL_SERVER_ERROR,
            "Internal server error (storage). Check logs.".to_string(),
        ),
    }
}

// Map AppError to Axum's IntoResponse
impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        error!("Error occurred: {}", self); // Log the original error

        let (status_code, error_message) = match &self {
            AppError::BioTime(e) | AppError::Sync(SyncError::Source(e)) => biotime_status(e),
            AppError::Store(e) | AppError::Sync(SyncError::Store(e)) => store_status(e),
            AppError::Sync(e @ SyncError::InvalidRange { .. }) => (AxumStatusCode::BAD_REQUEST, e.to_string()),
            AppError::Shift(e) => (AxumStatusCode::UNPROCESSABLE_ENTITY, e.to_string()),
            AppError::BadRequest(msg) => (AxumStatusCode::BAD_REQUEST, msg.clone()),
            AppError::Config(_) => (
                AxumStatusCode::INTERNAL_SERVER_ERROR,
                "Configuration error.".to_string(),
            ),
            AppError::Io(_) => (
                AxumStatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error (File I/O). Check logs.".to_string(),
            ),
            AppError::TlsConfig(msg) => (
                AxumStatusCode::INTERNAL_SERVER_ERROR,
                format!("Internal server error (TLS Setup: {}). Check logs.", msg),
            ),
        };

        (status_code, Json(json!({ "error": error_message }))).into_response()
    }
}

// --- CLI ---

#[derive(Parser, Debug)]
#[command(name = "nexlinx-core", about = "BioTime attendance reconciliation service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API and the background poller (default)
    Serve,
    /// Pull one window from BioTime and process it
    PollOnce,
    /// Re-pull an inclusive date range from BioTime
    Backfill {
        #[arg(long)]
        from: NaiveDate,
        #[arg(long)]
        to: NaiveDate,
    },
    /// Backfill only working days that have no punches at all
    RecoverGaps {
        #[arg(long)]
        from: NaiveDate,
        #[arg(long)]
        to: NaiveDate,
    },
    /// Process pending punches, or recompute a date range
    Process {
        #[arg(long, requires = "to")]
        from: Option<NaiveDate>,
        #[arg(long, requires = "from")]
        to: Option<NaiveDate>,
    },
    /// Pull the employee directory and check CNICs
    SyncEmployees,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- Setup ---
    dotenv::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    // --- Load Configuration ---
    let app_config = AppConfig::from_env().context("failed to read configuration from environment")?;
    info!("App configuration loaded. Database: {}", app_config.database_path);

    let store = Arc::new(
        AttendanceStore::open(&app_config.database_path)
            .with_context(|| format!("failed to open database {}", app_config.database_path))?,
    );
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let client = BioTimeClient::new(app_config.biotime()).context("failed to build BioTime client")?;
    let source: Arc<dyn PunchSource> = Arc::new(client);
    let pipeline = Arc::new(Pipeline::new(store.clone(), clock.clone(), app_config.pipeline()));
    let poller = Arc::new(Poller::new(
        source.clone(),
        store.clone(),
        pipeline.clone(),
        clock.clone(),
        app_config.poller(),
    ));

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            let state = AppState {
                store,
                pipeline,
                poller,
                source,
                clock,
            };
            serve(app_config, state).await?;
        }
        Command::PollOnce => {
            let outcome = poller.poll_once().await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Command::Backfill { from, to } => {
            let report = poller.backfill(from, to).await?;
            if !report.failed_chunks.is_empty() {
                warn!("{} chunks failed; rerun the backfill for those windows", report.failed_chunks.len());
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::RecoverGaps { from, to } => {
            let recovery = poller.recover_gaps(from, to).await?;
            println!("{}", serde_json::to_string_pretty(&recovery)?);
        }
        Command::Process { from, to } => {
            let report = match (from, to) {
                (Some(from), Some(to)) => pipeline.reprocess_range(from, to)?,
                _ => pipeline.process_pending()?,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::SyncEmployees => {
            let report = employee_sync::sync_employees(source.as_ref(), &store, clock.as_ref()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

async fn serve(app_config: AppConfig, state: AppState) -> Result<(), AppError> {
    if app_config.poller_enabled {
        let poller = state.poller.clone();
        tokio::spawn(poller.run());
    } else {
        warn!("Background poller disabled; use POST /api/sync to pull punches.");
    }

    let app = build_router(state);
    let addr = app_config.bind_addr;

    // --- Configure TLS ---
    match app_config.tls_paths() {
        Some((cert_path, key_path)) => {
            let tls_config = RustlsConfig::from_pem_file(PathBuf::from(cert_path), PathBuf::from(key_path))
                .await
                .map_err(|e| {
                    let err_msg = format!("Failed to load TLS cert/key: {}", e);
                    error!("{}", err_msg);
                    AppError::TlsConfig(err_msg)
                })?;
            info!("Starting server on https://{}", addr);
            axum_server::bind_rustls(addr, tls_config)
                .serve(app.into_make_service())
                .await?;
        }
        None => {
            info!("Starting server on http://{} (no CERT_PATH/KEY_PATH set)", addr);
            axum_server::bind(addr).serve(app.into_make_service()).await?;
        }
    }

    Ok(())
}
