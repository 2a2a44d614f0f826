// src/biotime_client.rs

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::poller::PunchSource;

pub const TOKEN_AUTH_PATH: &str = "/jwt-api-token-auth/";
pub const TRANSACTIONS_PATH: &str = "/iclock/api/transactions/";
pub const EMPLOYEES_PATH: &str = "/personnel/api/employees/";
pub const DEFAULT_PAGE_SIZE: u32 = 200;
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 60 * 60;
pub const BIOTIME_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const MAX_PAGES: u32 = 500;
const TOKEN_EXPIRY_BUFFER_SECS: u64 = 60;

// --- BioTime API Data Structures ---

/// One row of `/iclock/api/transactions/`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawPunch {
    pub id: i64,
    pub emp_code: String,
    pub punch_time: String,
    #[serde(default)]
    pub punch_state: String,
    #[serde(default)]
    pub verify_type: Option<i64>,
    #[serde(default)]
    pub terminal_sn: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub upload_time: Option<String>,
}

impl RawPunch {
    pub fn parsed_punch_time(&self) -> Result<NaiveDateTime, BioTimeError> {
        NaiveDateTime::parse_from_str(self.punch_time.trim(), BIOTIME_TIME_FORMAT).map_err(|e| {
            BioTimeError::InvalidPunch {
                id: self.id,
                detail: format!("punch_time '{}': {}", self.punch_time, e),
            }
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BioTimeDepartment {
    #[serde(default)]
    pub dept_code: Option<String>,
    #[serde(default)]
    pub dept_name: Option<String>,
}

/// One row of `/personnel/api/employees/`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BioTimeEmployee {
    pub id: i64,
    pub emp_code: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub department: Option<BioTimeDepartment>,
    /// National identity number; BioTime exposes it as `ssn`, some builds as `national`.
    #[serde(default, alias = "national")]
    pub ssn: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

/// BioTime's paging envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    #[serde(default)]
    pub count: i64,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub previous: Option<String>,
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
}

#[derive(Debug, Clone, Deserialize)]
struct TokenResponse {
    token: String,
}

#[derive(Debug, Clone, Serialize)]
struct TokenRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Clone)]
struct StoredToken {
    token: String,
    obtained_at_unix_secs: u64,
}

impl StoredToken {
    fn is_expired(&self, ttl_secs: u64, buffer_secs: u64) -> bool {
        unix_now().saturating_sub(self.obtained_at_unix_secs) + buffer_secs >= ttl_secs
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenStatus {
    pub has_token: bool,
    pub is_valid: bool,
    pub obtained_at: Option<String>,
    pub expires_in_secs: u64,
}

// --- Define Specific BioTime Error Type ---
#[derive(Error, Debug)]
pub enum BioTimeError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("JSON processing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("BioTime authentication failed: Status={status:?}, Message='{message}'")]
    AuthFailed {
        status: Option<StatusCode>,
        message: String,
    },

    #[error("BioTime rejected the token twice in a row")]
    Unauthorized,

    #[error("Rate limit exceeded (Status 429)")]
    RateLimitExceeded,

    #[error("BioTime API error: Status={status}, Message='{message}'")]
    ApiError { status: StatusCode, message: String },

    #[error("Malformed punch {id}: {detail}")]
    InvalidPunch { id: i64, detail: String },

    #[error("Stopped paging after {pages} pages")]
    PaginationLimit { pages: u32 },
}

impl BioTimeError {
    /// Whether the same request may succeed if tried again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            BioTimeError::Request(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            BioTimeError::RateLimitExceeded => true,
            BioTimeError::ApiError { status, .. } => status.is_server_error(),
            BioTimeError::AuthFailed { status, .. } => {
                status.map_or(true, |s| s.is_server_error())
            }
            _ => false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct BioTimeConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub page_size: u32,
    pub token_ttl_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for BioTimeConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8081".to_string(),
            username: String::new(),
            password: String::new(),
            page_size: DEFAULT_PAGE_SIZE,
            token_ttl_secs: DEFAULT_TOKEN_TTL_SECS,
            request_timeout_secs: 30,
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[derive(Clone)]
pub struct BioTimeClient {
    config: Arc<BioTimeConfig>,
    http_client: Client,
    token_data: Arc<Mutex<Option<StoredToken>>>,
}

impl BioTimeClient {
    pub fn new(config: BioTimeConfig) -> Result<Self, BioTimeError> {
        // Reject a bad base URL at startup rather than on the first poll.
        Url::parse(&config.base_url)?;
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            config: Arc::new(config),
            http_client,
            token_data: Arc::new(Mutex::new(None)),
        })
    }

    fn endpoint_url(&self, path: &str) -> Result<Url, BioTimeError> {
        let base = self.config.base_url.trim_end_matches('/');
        Ok(Url::parse(&format!("{}{}", base, path))?)
    }

    // --- Token handling ---

    pub async fn authenticate(&self) -> Result<String, BioTimeError> {
        info!("Authenticating against BioTime as '{}'", self.config.username);
        let url = self.endpoint_url(TOKEN_AUTH_PATH)?;
        let response = self
            .http_client
            .post(url)
            .header(ACCEPT, "application/json")
            .json(&TokenRequest {
                username: &self.config.username,
                password: &self.config.password,
            })
            .send()
            .await
            .map_err(|e| {
                error!("BioTime token request failed before a response: {}", e);
                BioTimeError::Request(e)
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|e| format!("Failed to read error body: {}", e));
            error!("BioTime authentication failed: Status={}, Body='{}'", status, message);
            return Err(BioTimeError::AuthFailed {
                status: Some(status),
                message,
            });
        }

        let token_response: TokenResponse = response.json().await?;
        if token_response.token.is_empty() {
            return Err(BioTimeError::AuthFailed {
                status: Some(status),
                message: "empty token in response".to_string(),
            });
        }

        *self.token_data.lock().await = Some(StoredToken {
            token: token_response.token.clone(),
            obtained_at_unix_secs: unix_now(),
        });
        info!("BioTime token acquired.");
        Ok(token_response.token)
    }

    pub async fn get_valid_token(&self) -> Result<String, BioTimeError> {
        let token_guard = self.token_data.lock().await;
        let cached = match &*token_guard {
            Some(data) if !data.is_expired(self.config.token_ttl_secs, TOKEN_EXPIRY_BUFFER_SECS) => {
                Some(data.token.clone())
            }
            _ => None,
        };
        drop(token_guard); // Release lock before authenticating

        match cached {
            Some(token) => Ok(token),
            None => self.authenticate().await,
        }
    }

    async fn clear_token(&self) {
        *self.token_data.lock().await = None;
    }

    pub async fn get_token_status(&self) -> TokenStatus {
        let token_guard = self.token_data.lock().await;
        match &*token_guard {
            Some(data) => {
                let age = unix_now().saturating_sub(data.obtained_at_unix_secs);
                let obtained_at = chrono::DateTime::<Utc>::from_timestamp(
                    data.obtained_at_unix_secs as i64,
                    0,
                )
                .map(|dt| dt.to_rfc3339());
                TokenStatus {
                    has_token: true,
                    is_valid: !data.is_expired(self.config.token_ttl_secs, TOKEN_EXPIRY_BUFFER_SECS),
                    obtained_at,
                    expires_in_secs: self.config.token_ttl_secs.saturating_sub(age),
                }
            }
            None => TokenStatus {
                has_token: false,
                is_valid: false,
                obtained_at: None,
                expires_in_secs: 0,
            },
        }
    }

    // --- Requests ---

    fn build_request(&self, method: Method, url: Url, token: &str) -> RequestBuilder {
        self.http_client
            .request(method, url)
            .header(AUTHORIZATION, format!("JWT {}", token))
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json")
    }

    /// GET with the current token; a 401 drops the token and retries once.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: Url,
        context_msg: &str,
    ) -> Result<T, BioTimeError> {
        let token = self.get_valid_token().await?;
        match self
            .send_and_deserialize(self.build_request(Method::GET, url.clone(), &token), context_msg)
            .await
        {
            Err(BioTimeError::Unauthorized) => {
                warn!("BioTime rejected token for '{}'; re-authenticating.", context_msg);
                self.clear_token().await;
                let token = self.authenticate().await?;
                self.send_and_deserialize(self.build_request(Method::GET, url, &token), context_msg)
                    .await
            }
            other => other,
        }
    }

    async fn send_and_deserialize<T: DeserializeOwned>(
        &self,
        request_builder: RequestBuilder,
        context_msg: &str,
    ) -> Result<T, BioTimeError> {
        let request = request_builder.build()?;
        let request_url = request.url().to_string();
        debug!("Sending request for '{}' to URL: {}", context_msg, request_url);

        let resp = self.http_client.execute(request).await.map_err(|e| {
            error!(
                "HTTP execution failed before receiving response for '{}' (URL: {}): {}",
                context_msg, request_url, e
            );
            BioTimeError::Request(e)
        })?;

        let status = resp.status();
        debug!("Received response for '{}': Status={}", context_msg, status);

        if status.is_success() {
            let bytes = resp.bytes().await?;
            return serde_json::from_slice::<T>(&bytes).map_err(|e| {
                error!(
                    "JSON deserialization failed for '{}' (URL: {}): {}; body starts with {}",
                    context_msg,
                    request_url,
                    e,
                    hex::encode(&bytes[..bytes.len().min(32)])
                );
                BioTimeError::Json(e)
            });
        }

        let error_body = resp
            .text()
            .await
            .unwrap_or_else(|e| format!("Failed to read error body: {}", e));
        match status {
            StatusCode::UNAUTHORIZED => Err(BioTimeError::Unauthorized),
            StatusCode::TOO_MANY_REQUESTS => {
                warn!("Rate limit exceeded for '{}' (URL: {})", context_msg, request_url);
                Err(BioTimeError::RateLimitExceeded)
            }
            _ => {
                error!(
                    "API Error Response: Status={}, Body='{}' for URL: {}",
                    status, error_body, request_url
                );
                Err(BioTimeError::ApiError {
                    status,
                    message: error_body,
                })
            }
        }
    }

    /// Follows `next` links until exhausted.
    async fn get_all_pages<T: DeserializeOwned>(
        &self,
        first_page: Url,
        context_msg: &str,
    ) -> Result<Vec<T>, BioTimeError> {
        let mut items = Vec::new();
        let mut next_url = Some(first_page);
        let mut pages = 0u32;

        while let Some(url) = next_url.take() {
            if pages >= MAX_PAGES {
                error!("'{}' exceeded {} pages; aborting.", context_msg, MAX_PAGES);
                return Err(BioTimeError::PaginationLimit { pages });
            }
            let page: Page<T> = self.get_json(url, context_msg).await?;
            pages += 1;
            debug!(
                "'{}' page {}: {} rows (total count {})",
                context_msg,
                pages,
                page.data.len(),
                page.count
            );
            let empty = page.data.is_empty();
            items.extend(page.data);
            if !empty {
                next_url = page.next.as_deref().map(Url::parse).transpose()?;
            }
        }

        Ok(items)
    }

    pub async fn fetch_transactions(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<RawPunch>, BioTimeError> {
        let mut url = self.endpoint_url(TRANSACTIONS_PATH)?;
        url.query_pairs_mut()
            .append_pair("start_time", &start.format(BIOTIME_TIME_FORMAT).to_string())
            .append_pair("end_time", &end.format(BIOTIME_TIME_FORMAT).to_string())
            .append_pair("page", "1")
            .append_pair("page_size", &self.config.page_size.to_string());

        let punches: Vec<RawPunch> = self.get_all_pages(url, "Get Transactions").await?;
        info!(
            "Fetched {} BioTime transactions between {} and {}",
            punches.len(),
            start,
            end
        );
        Ok(punches)
    }

    pub async fn fetch_employees(&self) -> Result<Vec<BioTimeEmployee>, BioTimeError> {
        let mut url = self.endpoint_url(EMPLOYEES_PATH)?;
        url.query_pairs_mut()
            .append_pair("page", "1")
            .append_pair("page_size", &self.config.page_size.to_string());

        let employees: Vec<BioTimeEmployee> = self.get_all_pages(url, "Get Employees").await?;
        info!("Fetched {} BioTime employees", employees.len());
        Ok(employees)
    }
}

#[async_trait]
impl PunchSource for BioTimeClient {
    async fn fetch_punches(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<RawPunch>, BioTimeError> {
        self.fetch_transactions(start, end).await
    }

    async fn fetch_employees(&self) -> Result<Vec<BioTimeEmployee>, BioTimeError> {
        BioTimeClient::fetch_employees(self).await
    }

    async fn token_status(&self) -> Option<TokenStatus> {
        Some(self.get_token_status().await)
    }
}
