//! Service client contracts + Fitbit/Omron/Garmin adapter implementations.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use ghb_core::{Measurement, MetricType, Source};
use ghb_storage::{classify_reqwest_error, classify_status, ErrorClass, RateLimitedError, RateLimiter};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "ghb-adapters";

/// Failure taxonomy shared by every client call.
///
/// `Auth` is fatal for the affected source's lanes only. `Transient` may be
/// retried by the orchestrator with bounded backoff; `Permanent` must not be
/// retried this run. `RateLimited` fails fast while a provider cool-down is
/// active.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{service} authentication failed: {reason}")]
    Auth { service: String, reason: String },
    #[error("{service} transient failure: {reason}")]
    Transient { service: String, reason: String },
    #[error("{service} permanent failure: {reason}")]
    Permanent { service: String, reason: String },
    #[error("{service} rate limited; retry in {retry_in:?}")]
    RateLimited { service: String, retry_in: Duration },
}

impl ClientError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn service(&self) -> &str {
        match self {
            Self::Auth { service, .. }
            | Self::Transient { service, .. }
            | Self::Permanent { service, .. }
            | Self::RateLimited { service, .. } => service,
        }
    }
}

impl From<RateLimitedError> for ClientError {
    fn from(err: RateLimitedError) -> Self {
        Self::RateLimited {
            service: err.service,
            retry_in: err.retry_in,
        }
    }
}

/// Result of handing one measurement to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    Accepted,
    /// The provider already holds this record; success for watermark
    /// purposes, but not a new upload.
    DuplicateRejected,
}

#[async_trait]
pub trait SourceClient: Send + Sync {
    fn source(&self) -> Source;

    async fn authenticate(&self) -> Result<(), ClientError>;

    /// Records with `recorded_at > since`, ordered ascending, provider
    /// pagination handled internally.
    async fn fetch_since(
        &self,
        metric_type: MetricType,
        since: DateTime<Utc>,
    ) -> Result<Vec<Measurement>, ClientError>;
}

#[async_trait]
pub trait SinkClient: Send + Sync {
    fn name(&self) -> &'static str;

    async fn authenticate(&self) -> Result<(), ClientError>;

    async fn upload(&self, measurement: &Measurement) -> Result<UploadOutcome, ClientError>;
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn snippet(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() > 160 {
        let cut: String = trimmed.chars().take(160).collect();
        format!("{cut}…")
    } else {
        trimmed.to_string()
    }
}

fn request_error(service: &str, err: &reqwest::Error) -> ClientError {
    match classify_reqwest_error(err) {
        ErrorClass::Transient => ClientError::Transient {
            service: service.to_string(),
            reason: err.to_string(),
        },
        _ => ClientError::Permanent {
            service: service.to_string(),
            reason: err.to_string(),
        },
    }
}

fn status_error(service: &str, status: StatusCode, body: &str) -> ClientError {
    let reason = format!("http {status}: {}", snippet(body));
    match classify_status(status) {
        ErrorClass::Transient => ClientError::Transient {
            service: service.to_string(),
            reason,
        },
        _ => ClientError::Permanent {
            service: service.to_string(),
            reason,
        },
    }
}

fn retry_after_from_headers(headers: &HeaderMap, extra_header: &str) -> Option<Duration> {
    for name in [extra_header, "retry-after"] {
        if let Some(secs) = headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
        {
            return Some(Duration::from_secs(secs));
        }
    }
    None
}

fn build_http_client(timeout: Duration, user_agent: &str) -> anyhow::Result<reqwest::Client> {
    use anyhow::Context;
    reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(timeout)
        .user_agent(user_agent.to_string())
        .build()
        .context("building reqwest client")
}

// ---------------------------------------------------------------------------
// Credentials (environment-driven, mirroring the container's variable set)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FitbitCredentials {
    pub client_id: String,
    pub client_secret: String,
}

impl FitbitCredentials {
    /// `None` when the Fitbit variables are not set; the source is then
    /// simply not part of the run.
    pub fn from_env() -> Option<Self> {
        let client_id = std::env::var("FITBIT_CLIENT_ID").ok()?;
        let client_secret = std::env::var("FITBIT_CLIENT_SECRET").ok()?;
        if client_id.is_empty() || client_secret.is_empty() {
            return None;
        }
        Some(Self {
            client_id,
            client_secret,
        })
    }
}

#[derive(Debug, Clone)]
pub struct OmronCredentials {
    pub email: String,
    pub password: String,
    pub country_code: String,
    /// Device slot to migrate; -1 accepts readings for any user number.
    pub user_number: i64,
}

impl OmronCredentials {
    pub fn from_env() -> Option<Self> {
        let email = std::env::var("OMRON_EMAIL").ok()?;
        let password = std::env::var("OMRON_PASSWORD").ok()?;
        let country_code = std::env::var("OMRON_COUNTRY_CODE").ok()?;
        if email.is_empty() || password.is_empty() || country_code.is_empty() {
            return None;
        }
        let user_number = std::env::var("OMRON_USER_NUMBER")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(-1);
        Some(Self {
            email,
            password,
            country_code,
            user_number,
        })
    }
}

#[derive(Debug, Clone)]
pub struct GarminCredentials {
    pub email: String,
    pub password: String,
}

impl GarminCredentials {
    pub fn from_env() -> Option<Self> {
        let email = std::env::var("GARMIN_EMAIL").ok()?;
        let password = std::env::var("GARMIN_PASSWORD").ok()?;
        if email.is_empty() || password.is_empty() {
            return None;
        }
        Some(Self { email, password })
    }
}

// ---------------------------------------------------------------------------
// Fitbit source
// ---------------------------------------------------------------------------

const FITBIT_BASE: &str = "https://api.fitbit.com";
const FITBIT_TOKEN_FILE: &str = "fitbit_tokens.json";
const FITBIT_RATE_LIMIT_RESET_HEADER: &str = "fitbit-rate-limit-reset";
const FITBIT_WINDOW_DAYS: i64 = 30;

/// Fitbit's body log has no data before the service existed; fetching from
/// epoch zero would sweep decades of empty windows.
fn fitbit_history_floor() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2009, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::UNIX_EPOCH)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FitbitTokens {
    access_token: String,
    refresh_token: String,
}

#[derive(Debug, Deserialize)]
struct FitbitWeightEntry {
    date: String,
    #[serde(default)]
    time: Option<String>,
    #[serde(rename = "logId")]
    log_id: Option<u64>,
    weight: Option<f64>,
    bmi: Option<f64>,
    fat: Option<f64>,
    #[serde(default)]
    body_fat: Option<f64>,
}

fn fitbit_entry_timestamp(entry: &FitbitWeightEntry) -> Option<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(&entry.date, "%Y-%m-%d").ok()?;
    let time = entry
        .time
        .as_deref()
        .and_then(|t| NaiveTime::parse_from_str(t, "%H:%M:%S").ok())
        .unwrap_or_else(|| NaiveTime::from_hms_opt(8, 0, 0).expect("valid default time"));
    Some(date.and_time(time).and_utc())
}

/// Project the raw weight log onto one metric stream. Entries missing the
/// requested field produce no record for that lane.
fn measurements_from_weight_log(
    entries: &[FitbitWeightEntry],
    metric_type: MetricType,
) -> Vec<Measurement> {
    let mut out = Vec::new();
    for entry in entries {
        let Some(recorded_at) = fitbit_entry_timestamp(entry) else {
            debug!(date = %entry.date, "skipping fitbit entry with unparseable timestamp");
            continue;
        };
        let value = match metric_type {
            MetricType::Weight => entry.weight,
            MetricType::Bmi => entry.bmi,
            MetricType::BodyFat => entry.fat.or(entry.body_fat),
            _ => None,
        };
        let Some(value) = value else { continue };
        out.push(Measurement {
            source: Source::Fitbit,
            metric_type,
            value,
            unit: metric_type.sink_unit(),
            recorded_at,
            source_record_id: entry.log_id.map(|id| id.to_string()),
        });
    }
    out
}

pub struct FitbitClient {
    http: reqwest::Client,
    credentials: FitbitCredentials,
    token_path: PathBuf,
    limiter: Arc<RateLimiter>,
    tokens: Mutex<Option<FitbitTokens>>,
}

impl FitbitClient {
    pub fn new(
        credentials: FitbitCredentials,
        data_dir: &Path,
        limiter: Arc<RateLimiter>,
        timeout: Duration,
        user_agent: &str,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            http: build_http_client(timeout, user_agent)?,
            credentials,
            token_path: data_dir.join(FITBIT_TOKEN_FILE),
            limiter,
            tokens: Mutex::new(None),
        })
    }

    fn auth_error(&self, reason: impl Into<String>) -> ClientError {
        ClientError::Auth {
            service: "fitbit".to_string(),
            reason: reason.into(),
        }
    }

    async fn load_tokens(&self) -> Result<FitbitTokens, ClientError> {
        let mut guard = self.tokens.lock().await;
        if let Some(tokens) = guard.as_ref() {
            return Ok(tokens.clone());
        }
        let bytes = tokio::fs::read(&self.token_path).await.map_err(|err| {
            self.auth_error(format!(
                "token file {} unreadable ({err}); run the OAuth bootstrap first",
                self.token_path.display()
            ))
        })?;
        let tokens: FitbitTokens = serde_json::from_slice(&bytes)
            .map_err(|err| self.auth_error(format!("token file is not valid JSON: {err}")))?;
        *guard = Some(tokens.clone());
        Ok(tokens)
    }

    async fn refresh_tokens(&self) -> Result<FitbitTokens, ClientError> {
        let current = self.load_tokens().await?;
        self.limiter.acquire().await.map_err(ClientError::from)?;

        let resp = self
            .http
            .post(format!("{FITBIT_BASE}/oauth2/token"))
            .basic_auth(&self.credentials.client_id, Some(&self.credentials.client_secret))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", current.refresh_token.as_str()),
                ("client_id", self.credentials.client_id.as_str()),
            ])
            .send()
            .await
            .map_err(|err| request_error("fitbit", &err))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(self.auth_error(format!("token refresh failed: http {status}: {}", snippet(&body))));
        }

        let tokens: FitbitTokens = resp
            .json()
            .await
            .map_err(|err| self.auth_error(format!("token refresh response unreadable: {err}")))?;

        if let Err(err) = tokio::fs::write(&self.token_path, serde_json::to_vec(&tokens).unwrap_or_default()).await {
            warn!(path = %self.token_path.display(), %err, "could not persist refreshed fitbit tokens");
        }
        *self.tokens.lock().await = Some(tokens.clone());
        info!("refreshed fitbit access token");
        Ok(tokens)
    }

    async fn get_json(&self, url: &str) -> Result<serde_json::Value, ClientError> {
        let mut tokens = self.load_tokens().await?;
        let mut refreshed = false;
        loop {
            self.limiter.acquire().await.map_err(ClientError::from)?;
            let resp = self
                .http
                .get(url)
                .bearer_auth(&tokens.access_token)
                .send()
                .await
                .map_err(|err| request_error("fitbit", &err))?;

            let status = resp.status();
            if status == StatusCode::UNAUTHORIZED && !refreshed {
                tokens = self.refresh_tokens().await?;
                refreshed = true;
                continue;
            }
            if status == StatusCode::TOO_MANY_REQUESTS {
                let retry_after =
                    retry_after_from_headers(resp.headers(), FITBIT_RATE_LIMIT_RESET_HEADER);
                let retry_in = self.limiter.note_throttled(retry_after).await;
                return Err(ClientError::RateLimited {
                    service: "fitbit".to_string(),
                    retry_in,
                });
            }
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(status_error("fitbit", status, &body));
            }
            return resp.json().await.map_err(|err| ClientError::Permanent {
                service: "fitbit".to_string(),
                reason: format!("invalid response body: {err}"),
            });
        }
    }
}

#[async_trait]
impl SourceClient for FitbitClient {
    fn source(&self) -> Source {
        Source::Fitbit
    }

    async fn authenticate(&self) -> Result<(), ClientError> {
        let profile = self
            .get_json(&format!("{FITBIT_BASE}/1/user/-/profile.json"))
            .await?;
        if profile.get("user").is_none() {
            return Err(self.auth_error("profile response has no user"));
        }
        debug!("fitbit profile check passed");
        Ok(())
    }

    async fn fetch_since(
        &self,
        metric_type: MetricType,
        since: DateTime<Utc>,
    ) -> Result<Vec<Measurement>, ClientError> {
        if !MetricType::for_source(Source::Fitbit).contains(&metric_type) {
            return Err(ClientError::Permanent {
                service: "fitbit".to_string(),
                reason: format!("unsupported metric {metric_type}"),
            });
        }

        let now = Utc::now();
        let mut window_start = since.max(fitbit_history_floor());
        let mut entries: Vec<FitbitWeightEntry> = Vec::new();

        while window_start < now {
            let window_end = (window_start + chrono::Duration::days(FITBIT_WINDOW_DAYS)).min(now);
            let url = format!(
                "{FITBIT_BASE}/1/user/-/body/log/weight/date/{}/{}.json",
                window_start.format("%Y-%m-%d"),
                window_end.format("%Y-%m-%d"),
            );
            let body = self.get_json(&url).await?;
            if let Some(page) = body.get("weight") {
                let page: Vec<FitbitWeightEntry> = serde_json::from_value(page.clone())
                    .map_err(|err| ClientError::Permanent {
                        service: "fitbit".to_string(),
                        reason: format!("unexpected weight log shape: {err}"),
                    })?;
                entries.extend(page);
            }
            // End dates are inclusive at day granularity.
            window_start = window_end + chrono::Duration::days(1);
        }

        let mut measurements: Vec<Measurement> = measurements_from_weight_log(&entries, metric_type)
            .into_iter()
            .filter(|m| m.recorded_at > since)
            .collect();
        measurements.sort_by_key(|m| m.recorded_at);
        measurements.dedup_by(|a, b| a.dedup_key() == b.dedup_key());
        Ok(measurements)
    }
}

// ---------------------------------------------------------------------------
// Omron source
// ---------------------------------------------------------------------------

const OMRON_APP_NAME: &str = "OCM";
const OMRON_APP_PATH: &str = "/app";
const OMRON_USER_AGENT: &str =
    "Foresight/7.20.0 (com.omronhealthcare.omronconnect; build:37; iOS 15.8.3) Alamofire/5.9.1";
const OMRON_SERVER_EU: &str = "https://oi-api.ohiomron.eu";
const OMRON_SERVER_NA: &str = "https://oi-api.ohiomron.com";

const OMRON_EUROPE_COUNTRY_CODES: [&str; 43] = [
    "AL", "AD", "AT", "BY", "BE", "BA", "BG", "HR", "CZ", "DK", "EE", "FI", "FR", "DE", "GR",
    "HU", "IS", "IE", "IT", "LV", "LI", "LT", "LU", "MT", "MC", "ME", "NL", "MK", "NO", "PL",
    "PT", "RO", "RU", "SM", "RS", "SK", "SI", "ES", "SE", "CH", "UA", "GB", "VA",
];

fn omron_server_for_country(country_code: &str) -> &'static str {
    if OMRON_EUROPE_COUNTRY_CODES.contains(&country_code) {
        OMRON_SERVER_EU
    } else {
        OMRON_SERVER_NA
    }
}

#[derive(Debug, Clone)]
struct OmronSession {
    access_token: String,
    refresh_token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OmronLoginResponse {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OmronBpReading {
    systolic: Option<f64>,
    diastolic: Option<f64>,
    pulse: Option<f64>,
    #[serde(default)]
    is_manual_entry: i64,
    #[serde(default = "default_user_number")]
    user_number_in_device: i64,
    measurement_date: i64,
}

fn default_user_number() -> i64 {
    -1
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OmronBpEnvelope {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    data: Vec<OmronBpReading>,
    #[serde(default)]
    next_pagination_key: Option<u64>,
}

/// Project one sync page onto a metric stream, skipping manually entered
/// readings and readings for a different device user.
fn measurements_from_bp_readings(
    readings: &[OmronBpReading],
    metric_type: MetricType,
    user_number: i64,
) -> Vec<Measurement> {
    let mut out = Vec::new();
    for reading in readings {
        if reading.is_manual_entry != 0 {
            debug!(ts = reading.measurement_date, "skipping manually entered omron reading");
            continue;
        }
        if user_number >= 0 && reading.user_number_in_device != user_number {
            continue;
        }
        let Some(recorded_at) = DateTime::from_timestamp_millis(reading.measurement_date) else {
            continue;
        };
        let value = match metric_type {
            MetricType::Systolic => reading.systolic,
            MetricType::Diastolic => reading.diastolic,
            MetricType::Pulse => reading.pulse,
            _ => None,
        };
        let Some(value) = value else { continue };
        out.push(Measurement {
            source: Source::Omron,
            metric_type,
            value,
            unit: metric_type.sink_unit(),
            recorded_at,
            source_record_id: None,
        });
    }
    out
}

pub struct OmronClient {
    http: reqwest::Client,
    credentials: OmronCredentials,
    server: &'static str,
    limiter: Arc<RateLimiter>,
    session: Mutex<Option<OmronSession>>,
}

impl OmronClient {
    pub fn new(
        credentials: OmronCredentials,
        limiter: Arc<RateLimiter>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let server = omron_server_for_country(&credentials.country_code);
        Ok(Self {
            http: build_http_client(timeout, OMRON_USER_AGENT)?,
            credentials,
            server,
            limiter,
            session: Mutex::new(None),
        })
    }

    fn auth_error(&self, reason: impl Into<String>) -> ClientError {
        ClientError::Auth {
            service: "omron".to_string(),
            reason: reason.into(),
        }
    }

    /// Login or refresh; the request body is checksummed the way the mobile
    /// app does it.
    async fn login(&self) -> Result<OmronSession, ClientError> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            if Utc::now() < session.expires_at {
                return Ok(session.clone());
            }
        }

        let body = match guard.as_ref() {
            Some(expired) => json!({
                "app": OMRON_APP_NAME,
                "emailAddress": self.credentials.email.clone(),
                "refreshToken": expired.refresh_token.clone(),
            }),
            None => json!({
                "emailAddress": self.credentials.email.clone(),
                "app": OMRON_APP_NAME,
                "country": self.credentials.country_code.clone(),
                "password": self.credentials.password.clone(),
            }),
        };
        let raw = serde_json::to_vec(&body).map_err(|err| ClientError::Permanent {
            service: "omron".to_string(),
            reason: format!("encoding login body: {err}"),
        })?;
        let checksum = sha256_hex(&raw);

        self.limiter.acquire().await.map_err(ClientError::from)?;
        let resp = self
            .http
            .post(format!("{}{}/login", self.server, OMRON_APP_PATH))
            .header("content-type", "application/json")
            .header("Cache-Control", "no-cache")
            .header("Checksum", checksum)
            .body(raw)
            .send()
            .await
            .map_err(|err| request_error("omron", &err))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(self.auth_error(format!("login failed: http {status}: {}", snippet(&text))));
        }

        let login: OmronLoginResponse = resp
            .json()
            .await
            .map_err(|err| self.auth_error(format!("login response unreadable: {err}")))?;
        if login.success == Some(false) {
            return Err(self.auth_error(format!(
                "login rejected: {} {}",
                login.message.unwrap_or_default(),
                login.error_code.unwrap_or_default()
            )));
        }
        let (Some(access_token), Some(refresh_token)) = (login.access_token, login.refresh_token)
        else {
            return Err(self.auth_error("login response missing tokens"));
        };

        let session = OmronSession {
            access_token,
            refresh_token,
            // Refresh one minute early rather than racing the expiry.
            expires_at: Utc::now() + chrono::Duration::seconds(login.expires_in.unwrap_or(0).max(60) - 60),
        };
        *guard = Some(session.clone());
        info!("omron login successful");
        Ok(session)
    }

    async fn fetch_bp_page(
        &self,
        session: &OmronSession,
        pagination_key: u64,
        since: DateTime<Utc>,
    ) -> Result<OmronBpEnvelope, ClientError> {
        let last_synced = if since <= DateTime::UNIX_EPOCH {
            String::new()
        } else {
            since.timestamp_millis().to_string()
        };
        let url = format!(
            "{}{}/v2/sync/bp?nextpaginationKey={pagination_key}&lastSyncedTime={last_synced}&phoneIdentifier=",
            self.server, OMRON_APP_PATH
        );

        self.limiter.acquire().await.map_err(ClientError::from)?;
        let resp = self
            .http
            .get(&url)
            .header("Authorization", &session.access_token)
            .send()
            .await
            .map_err(|err| request_error("omron", &err))?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = retry_after_from_headers(resp.headers(), "retry-after");
            let retry_in = self.limiter.note_throttled(retry_after).await;
            return Err(ClientError::RateLimited {
                service: "omron".to_string(),
                retry_in,
            });
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(status_error("omron", status, &text));
        }

        let envelope: OmronBpEnvelope = resp.json().await.map_err(|err| ClientError::Permanent {
            service: "omron".to_string(),
            reason: format!("invalid sync response: {err}"),
        })?;
        if envelope.success == Some(false) {
            return Err(ClientError::Permanent {
                service: "omron".to_string(),
                reason: format!(
                    "sync rejected: {} {}",
                    envelope.message.clone().unwrap_or_default(),
                    envelope.error_code.clone().unwrap_or_default()
                ),
            });
        }
        Ok(envelope)
    }
}

#[async_trait]
impl SourceClient for OmronClient {
    fn source(&self) -> Source {
        Source::Omron
    }

    async fn authenticate(&self) -> Result<(), ClientError> {
        self.login().await.map(|_| ())
    }

    async fn fetch_since(
        &self,
        metric_type: MetricType,
        since: DateTime<Utc>,
    ) -> Result<Vec<Measurement>, ClientError> {
        if !MetricType::for_source(Source::Omron).contains(&metric_type) {
            return Err(ClientError::Permanent {
                service: "omron".to_string(),
                reason: format!("unsupported metric {metric_type}"),
            });
        }

        let session = self.login().await?;
        let mut readings = Vec::new();
        let mut pagination_key = 0u64;
        loop {
            let envelope = self.fetch_bp_page(&session, pagination_key, since).await?;
            readings.extend(envelope.data);
            match envelope.next_pagination_key {
                Some(key) if key != 0 => pagination_key = key,
                _ => break,
            }
        }

        let mut measurements: Vec<Measurement> =
            measurements_from_bp_readings(&readings, metric_type, self.credentials.user_number)
                .into_iter()
                .filter(|m| m.recorded_at > since)
                .collect();
        measurements.sort_by_key(|m| m.recorded_at);
        Ok(measurements)
    }
}

// ---------------------------------------------------------------------------
// Garmin sink
// ---------------------------------------------------------------------------

const GARMIN_API_BASE: &str = "https://connectapi.garmin.com";
const GARMIN_SSO_LOGIN_URL: &str = "https://sso.garmin.com/sso/signin";
const GARMIN_TOKEN_FILE: &str = "garmin_tokens.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GarminSession {
    access_token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct GarminTokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Endpoint + payload for one measurement upload.
fn garmin_upload_request(m: &Measurement) -> (String, serde_json::Value) {
    let timestamp = m.recorded_at.format("%Y-%m-%dT%H:%M:%S").to_string();
    match m.metric_type {
        MetricType::Weight | MetricType::Bmi | MetricType::BodyFat => {
            let field = match m.metric_type {
                MetricType::Weight => "weight",
                MetricType::Bmi => "bmi",
                _ => "bodyFat",
            };
            let mut payload = json!({
                "timestampGMT": timestamp,
                "unitKey": m.unit.as_str(),
            });
            payload[field] = json!(m.value);
            (format!("{GARMIN_API_BASE}/weight-service/user-weight"), payload)
        }
        MetricType::Systolic | MetricType::Diastolic | MetricType::Pulse => {
            let field = match m.metric_type {
                MetricType::Systolic => "systolic",
                MetricType::Diastolic => "diastolic",
                _ => "pulse",
            };
            let mut payload = json!({
                "measurementTimestampGMT": timestamp,
                "sourceType": "MANUAL",
            });
            payload[field] = json!(m.value.round() as i64);
            (
                format!("{GARMIN_API_BASE}/bloodpressure-service/bloodpressure"),
                payload,
            )
        }
    }
}

pub struct GarminClient {
    http: reqwest::Client,
    credentials: GarminCredentials,
    token_path: PathBuf,
    limiter: Arc<RateLimiter>,
    session: Mutex<Option<GarminSession>>,
}

impl GarminClient {
    pub fn new(
        credentials: GarminCredentials,
        data_dir: &Path,
        limiter: Arc<RateLimiter>,
        timeout: Duration,
        user_agent: &str,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            http: build_http_client(timeout, user_agent)?,
            credentials,
            token_path: data_dir.join(GARMIN_TOKEN_FILE),
            limiter,
            session: Mutex::new(None),
        })
    }

    fn auth_error(&self, reason: impl Into<String>) -> ClientError {
        ClientError::Auth {
            service: "garmin".to_string(),
            reason: reason.into(),
        }
    }

    async fn login(&self, force: bool) -> Result<GarminSession, ClientError> {
        let mut guard = self.session.lock().await;
        if !force {
            if let Some(session) = guard.as_ref() {
                if Utc::now() < session.expires_at {
                    return Ok(session.clone());
                }
            }
            // Cached token from a previous process restart.
            if let Ok(bytes) = tokio::fs::read(&self.token_path).await {
                if let Ok(session) = serde_json::from_slice::<GarminSession>(&bytes) {
                    if Utc::now() < session.expires_at {
                        *guard = Some(session.clone());
                        return Ok(session);
                    }
                }
            }
        }

        self.limiter.acquire().await.map_err(ClientError::from)?;
        let resp = self
            .http
            .post(GARMIN_SSO_LOGIN_URL)
            .json(&json!({
                "username": self.credentials.email.clone(),
                "password": self.credentials.password.clone(),
            }))
            .send()
            .await
            .map_err(|err| request_error("garmin", &err))?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let text = resp.text().await.unwrap_or_default();
            return Err(self.auth_error(format!("login rejected: {}", snippet(&text))));
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(status_error("garmin", status, &text));
        }

        let tokens: GarminTokenResponse = resp
            .json()
            .await
            .map_err(|err| self.auth_error(format!("login response unreadable: {err}")))?;
        let session = GarminSession {
            access_token: tokens.access_token,
            expires_at: Utc::now() + chrono::Duration::seconds(tokens.expires_in.unwrap_or(3600).max(60)),
        };
        if let Err(err) =
            tokio::fs::write(&self.token_path, serde_json::to_vec(&session).unwrap_or_default()).await
        {
            warn!(path = %self.token_path.display(), %err, "could not persist garmin session");
        }
        *guard = Some(session.clone());
        info!("garmin login successful");
        Ok(session)
    }
}

#[async_trait]
impl SinkClient for GarminClient {
    fn name(&self) -> &'static str {
        "garmin"
    }

    async fn authenticate(&self) -> Result<(), ClientError> {
        self.login(false).await.map(|_| ())
    }

    async fn upload(&self, measurement: &Measurement) -> Result<UploadOutcome, ClientError> {
        let mut session = self.login(false).await?;
        let (url, payload) = garmin_upload_request(measurement);
        let mut relogged = false;

        loop {
            self.limiter.acquire().await.map_err(ClientError::from)?;
            let resp = self
                .http
                .post(&url)
                .bearer_auth(&session.access_token)
                .json(&payload)
                .send()
                .await
                .map_err(|err| request_error("garmin", &err))?;

            let status = resp.status();
            if status == StatusCode::UNAUTHORIZED && !relogged {
                session = self.login(true).await?;
                relogged = true;
                continue;
            }
            if status == StatusCode::CONFLICT {
                debug!(
                    metric = %measurement.metric_type,
                    at = %measurement.recorded_at,
                    "sink already holds this record"
                );
                return Ok(UploadOutcome::DuplicateRejected);
            }
            if status == StatusCode::TOO_MANY_REQUESTS {
                let retry_after = retry_after_from_headers(resp.headers(), "retry-after");
                let retry_in = self.limiter.note_throttled(retry_after).await;
                return Err(ClientError::RateLimited {
                    service: "garmin".to_string(),
                    retry_in,
                });
            }
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                return Err(status_error("garmin", status, &text));
            }
            return Ok(UploadOutcome::Accepted);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ghb_core::Unit;

    fn weight_entry(
        date: &str,
        time: Option<&str>,
        log_id: Option<u64>,
        weight: Option<f64>,
        bmi: Option<f64>,
        fat: Option<f64>,
    ) -> FitbitWeightEntry {
        FitbitWeightEntry {
            date: date.to_string(),
            time: time.map(str::to_string),
            log_id,
            weight,
            bmi,
            fat,
            body_fat: None,
        }
    }

    #[test]
    fn fitbit_weight_log_projects_one_metric_per_lane() {
        let entries = vec![
            weight_entry("2024-01-02", Some("07:15:00"), Some(11), Some(70.1), Some(22.4), None),
            weight_entry("2024-01-03", None, Some(12), Some(70.3), None, Some(18.2)),
        ];

        let weights = measurements_from_weight_log(&entries, MetricType::Weight);
        assert_eq!(weights.len(), 2);
        assert_eq!(weights[0].value, 70.1);
        assert_eq!(weights[0].unit, Unit::Kilograms);
        assert_eq!(weights[0].source_record_id.as_deref(), Some("11"));
        assert_eq!(
            weights[0].recorded_at,
            Utc.with_ymd_and_hms(2024, 1, 2, 7, 15, 0).single().unwrap()
        );

        // Missing time falls back to the provider's default 08:00:00.
        assert_eq!(
            weights[1].recorded_at,
            Utc.with_ymd_and_hms(2024, 1, 3, 8, 0, 0).single().unwrap()
        );

        let bmi = measurements_from_weight_log(&entries, MetricType::Bmi);
        assert_eq!(bmi.len(), 1);
        let fat = measurements_from_weight_log(&entries, MetricType::BodyFat);
        assert_eq!(fat.len(), 1);
        assert_eq!(fat[0].unit, Unit::Percent);
    }

    #[test]
    fn fitbit_unparseable_dates_are_dropped() {
        let entries = vec![weight_entry("not-a-date", None, None, Some(70.0), None, None)];
        assert!(measurements_from_weight_log(&entries, MetricType::Weight).is_empty());
    }

    #[test]
    fn omron_readings_skip_manual_and_foreign_users() {
        let readings = vec![
            OmronBpReading {
                systolic: Some(121.0),
                diastolic: Some(79.0),
                pulse: Some(64.0),
                is_manual_entry: 0,
                user_number_in_device: 1,
                measurement_date: 1_704_188_700_000,
            },
            OmronBpReading {
                systolic: Some(200.0),
                diastolic: Some(120.0),
                pulse: Some(99.0),
                is_manual_entry: 1,
                user_number_in_device: 1,
                measurement_date: 1_704_188_800_000,
            },
            OmronBpReading {
                systolic: Some(110.0),
                diastolic: Some(70.0),
                pulse: Some(60.0),
                is_manual_entry: 0,
                user_number_in_device: 2,
                measurement_date: 1_704_188_900_000,
            },
        ];

        let systolic = measurements_from_bp_readings(&readings, MetricType::Systolic, 1);
        assert_eq!(systolic.len(), 1);
        assert_eq!(systolic[0].value, 121.0);
        assert_eq!(systolic[0].unit, Unit::MmHg);
        assert!(systolic[0].source_record_id.is_none());

        // -1 accepts every device user but still drops manual entries.
        let any_user = measurements_from_bp_readings(&readings, MetricType::Pulse, -1);
        assert_eq!(any_user.len(), 2);
    }

    #[test]
    fn omron_server_selection_follows_country() {
        assert_eq!(omron_server_for_country("GB"), OMRON_SERVER_EU);
        assert_eq!(omron_server_for_country("DE"), OMRON_SERVER_EU);
        assert_eq!(omron_server_for_country("US"), OMRON_SERVER_NA);
        assert_eq!(omron_server_for_country("JP"), OMRON_SERVER_NA);
    }

    #[test]
    fn omron_login_checksum_matches_known_digest() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn garmin_body_composition_payload_targets_weight_service() {
        let m = Measurement {
            source: Source::Fitbit,
            metric_type: MetricType::Weight,
            value: 70.1,
            unit: Unit::Kilograms,
            recorded_at: Utc.with_ymd_and_hms(2024, 1, 2, 8, 0, 0).single().unwrap(),
            source_record_id: Some("11".to_string()),
        };
        let (url, payload) = garmin_upload_request(&m);
        assert!(url.ends_with("/weight-service/user-weight"));
        assert_eq!(payload["weight"], json!(70.1));
        assert_eq!(payload["unitKey"], json!("kg"));
        assert_eq!(payload["timestampGMT"], json!("2024-01-02T08:00:00"));
    }

    #[test]
    fn garmin_blood_pressure_payload_rounds_to_integers() {
        let m = Measurement {
            source: Source::Omron,
            metric_type: MetricType::Systolic,
            value: 120.6,
            unit: Unit::MmHg,
            recorded_at: Utc.with_ymd_and_hms(2024, 1, 2, 8, 0, 0).single().unwrap(),
            source_record_id: None,
        };
        let (url, payload) = garmin_upload_request(&m);
        assert!(url.ends_with("/bloodpressure-service/bloodpressure"));
        assert_eq!(payload["systolic"], json!(121));
        assert_eq!(payload["sourceType"], json!("MANUAL"));
    }

    #[test]
    fn omron_envelope_tolerates_missing_optional_fields() {
        let envelope: OmronBpEnvelope = serde_json::from_value(json!({
            "success": true,
            "data": [{
                "systolic": 118, "diastolic": 76, "pulse": 61,
                "isManualEntry": 0, "userNumberInDevice": 1,
                "measurementDate": 1704188700000i64
            }]
        }))
        .expect("envelope parses");
        assert_eq!(envelope.data.len(), 1);
        assert!(envelope.next_pagination_key.is_none());
    }
}
