// src/config.rs
use serde::Deserialize;
use std::net::SocketAddr;

use crate::biotime_client::{BioTimeConfig, DEFAULT_PAGE_SIZE, DEFAULT_TOKEN_TTL_SECS};

/// Knobs for the normalizer, classifier and anti-overbilling steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Punches closer than this to the previously kept punch are repeat scans.
    pub duplicate_window_secs: i64,
    /// How long after an overnight shift's end a next-day punch still belongs to it.
    pub overnight_checkout_window_minutes: i64,
    pub missing_punchout_grace_minutes: i64,
    /// Deadline for open records without a shift, counted from check-in.
    pub auto_punchout_after_minutes: i64,
    /// Hours credited for an unscheduled missing punch-out.
    pub missing_punchout_cap_minutes: i64,
    pub max_overtime_minutes: i64,
    pub max_daily_minutes: i64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            duplicate_window_secs: default_duplicate_window_secs(),
            overnight_checkout_window_minutes: default_overnight_checkout_window_minutes(),
            missing_punchout_grace_minutes: default_missing_punchout_grace_minutes(),
            auto_punchout_after_minutes: default_auto_punchout_after_minutes(),
            missing_punchout_cap_minutes: default_missing_punchout_cap_minutes(),
            max_overtime_minutes: default_max_overtime_minutes(),
            max_daily_minutes: default_max_daily_minutes(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerConfig {
    pub poll_interval_secs: u64,
    pub overlap_minutes: i64,
    pub initial_lookback_hours: i64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub backfill_chunk_hours: i64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            overlap_minutes: default_poll_overlap_minutes(),
            initial_lookback_hours: default_initial_lookback_hours(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            backfill_chunk_hours: default_backfill_chunk_hours(),
        }
    }
}

// --- General App Configuration ---
// Flat so every field maps to one environment variable (BIOTIME_BASE_URL, POLL_INTERVAL_SECS, ...).
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
    #[serde(default = "default_true")]
    pub poller_enabled: bool,

    pub biotime_base_url: String,
    pub biotime_username: String,
    pub biotime_password: String,
    #[serde(default = "default_page_size")]
    pub biotime_page_size: u32,
    #[serde(default = "default_token_ttl_secs")]
    pub biotime_token_ttl_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub biotime_request_timeout_secs: u64,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_poll_overlap_minutes")]
    pub poll_overlap_minutes: i64,
    #[serde(default = "default_initial_lookback_hours")]
    pub initial_lookback_hours: i64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_backfill_chunk_hours")]
    pub backfill_chunk_hours: i64,

    #[serde(default = "default_duplicate_window_secs")]
    pub duplicate_window_secs: i64,
    #[serde(default = "default_overnight_checkout_window_minutes")]
    pub overnight_checkout_window_minutes: i64,
    #[serde(default = "default_missing_punchout_grace_minutes")]
    pub missing_punchout_grace_minutes: i64,
    #[serde(default = "default_auto_punchout_after_minutes")]
    pub auto_punchout_after_minutes: i64,
    #[serde(default = "default_missing_punchout_cap_minutes")]
    pub missing_punchout_cap_minutes: i64,
    #[serde(default = "default_max_overtime_minutes")]
    pub max_overtime_minutes: i64,
    #[serde(default = "default_max_daily_minutes")]
    pub max_daily_minutes: i64,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::from_env::<AppConfig>()
    }

    pub fn tls_paths(&self) -> Option<(&str, &str)> {
        match (self.cert_path.as_deref(), self.key_path.as_deref()) {
            (Some(cert), Some(key)) if !cert.is_empty() && !key.is_empty() => Some((cert, key)),
            _ => None,
        }
    }

    pub fn biotime(&self) -> BioTimeConfig {
        BioTimeConfig {
            base_url: self.biotime_base_url.clone(),
            username: self.biotime_username.clone(),
            password: self.biotime_password.clone(),
            page_size: self.biotime_page_size.max(1),
            token_ttl_secs: self.biotime_token_ttl_secs,
            request_timeout_secs: self.biotime_request_timeout_secs,
        }
    }

    pub fn poller(&self) -> PollerConfig {
        PollerConfig {
            poll_interval_secs: self.poll_interval_secs.max(1),
            overlap_minutes: self.poll_overlap_minutes.max(0),
            initial_lookback_hours: self.initial_lookback_hours.max(1),
            max_retries: self.max_retries,
            retry_base_delay_ms: self.retry_base_delay_ms,
            retry_max_delay_ms: self.retry_max_delay_ms.max(self.retry_base_delay_ms),
            backfill_chunk_hours: self.backfill_chunk_hours.max(1),
        }
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            duplicate_window_secs: self.duplicate_window_secs.max(0),
            overnight_checkout_window_minutes: self.overnight_checkout_window_minutes.max(0),
            missing_punchout_grace_minutes: self.missing_punchout_grace_minutes.max(0),
            auto_punchout_after_minutes: self.auto_punchout_after_minutes.max(0),
            missing_punchout_cap_minutes: self.missing_punchout_cap_minutes.max(0),
            max_overtime_minutes: self.max_overtime_minutes.max(0),
            max_daily_minutes: self.max_daily_minutes.max(0),
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_database_path() -> String {
    "nexlinx.db".to_string()
}

fn default_true() -> bool {
    true
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

fn default_token_ttl_secs() -> u64 {
    DEFAULT_TOKEN_TTL_SECS
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_poll_interval_secs() -> u64 {
    300
}

fn default_poll_overlap_minutes() -> i64 {
    10
}

fn default_initial_lookback_hours() -> i64 {
    24
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_backfill_chunk_hours() -> i64 {
    24
}

fn default_duplicate_window_secs() -> i64 {
    120
}

fn default_overnight_checkout_window_minutes() -> i64 {
    240
}

fn default_missing_punchout_grace_minutes() -> i64 {
    120
}

fn default_auto_punchout_after_minutes() -> i64 {
    14 * 60
}

fn default_missing_punchout_cap_minutes() -> i64 {
    8 * 60
}

fn default_max_overtime_minutes() -> i64 {
    4 * 60
}

fn default_max_daily_minutes() -> i64 {
    12 * 60
}
