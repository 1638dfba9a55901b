//! Durable watermark state + per-service rate limiting for the bridge.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use ghb_core::{MetricType, Source, Watermark};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "ghb-storage";

#[derive(Debug, Error)]
pub enum WatermarkError {
    #[error("watermark for {lane} would regress from {stored} to {attempted}")]
    Regression {
        lane: String,
        stored: DateTime<Utc>,
        attempted: DateTime<Utc>,
    },
    #[error("watermark state io: {0}")]
    Io(#[from] std::io::Error),
    #[error("watermark state encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

fn lane_key(source: Source, metric_type: MetricType) -> String {
    format!("{source}/{metric_type}")
}

/// Durable record of the last successfully migrated timestamp per
/// (source, metric) lane, backed by a single JSON document.
///
/// `advance` is flushed to disk before it returns, so a crash between a
/// sink upload and the advance loses at most the advance, never gains one.
#[derive(Debug)]
pub struct WatermarkStore {
    path: PathBuf,
    state: Mutex<BTreeMap<String, Watermark>>,
}

impl WatermarkStore {
    /// Open the store, loading any state persisted by a previous process.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, WatermarkError> {
        let path = path.into();
        let state = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current watermark for a lane; epoch zero when the lane has never
    /// migrated anything.
    pub async fn get(&self, source: Source, metric_type: MetricType) -> Watermark {
        let state = self.state.lock().await;
        state
            .get(&lane_key(source, metric_type))
            .cloned()
            .unwrap_or_else(|| Watermark::epoch(source, metric_type))
    }

    /// All persisted watermarks, ordered by lane key.
    pub async fn snapshot(&self) -> Vec<Watermark> {
        let state = self.state.lock().await;
        state.values().cloned().collect()
    }

    /// Advance a lane's watermark. `new_timestamp` must be >= the stored
    /// value: equal with the same record id is a no-op, strictly less is a
    /// caller bug and reported as `Regression`.
    pub async fn advance(
        &self,
        source: Source,
        metric_type: MetricType,
        new_timestamp: DateTime<Utc>,
        record_id: Option<&str>,
    ) -> Result<(), WatermarkError> {
        let key = lane_key(source, metric_type);
        let mut state = self.state.lock().await;

        if let Some(stored) = state.get(&key) {
            if new_timestamp < stored.last_migrated_at {
                return Err(WatermarkError::Regression {
                    lane: key,
                    stored: stored.last_migrated_at,
                    attempted: new_timestamp,
                });
            }
            if new_timestamp == stored.last_migrated_at
                && stored.last_source_record_id.as_deref() == record_id
            {
                return Ok(());
            }
        }

        state.insert(
            key.clone(),
            Watermark {
                source,
                metric_type,
                last_migrated_at: new_timestamp,
                last_source_record_id: record_id.map(str::to_string),
            },
        );
        self.persist(&state).await?;
        debug!(lane = %key, %new_timestamp, "advanced watermark");
        Ok(())
    }

    /// Atomic temp-file write + rename, fsynced before returning.
    async fn persist(&self, state: &BTreeMap<String, Watermark>) -> Result<(), WatermarkError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let bytes = serde_json::to_vec_pretty(state)?;
        let temp_path = self.path.with_extension("json.tmp");

        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)
            .await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }
}

/// Acquisition rejected because the provider put us in a cool-down window.
#[derive(Debug, Error)]
#[error("{service} is rate limited; retry in {retry_in:?}")]
pub struct RateLimitedError {
    pub service: String,
    pub retry_in: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimiterConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            refill_every: Duration::from_secs(1),
        }
    }
}

const BASE_COOLDOWN: Duration = Duration::from_secs(30);
const MAX_COOLDOWN: Duration = Duration::from_secs(900);

#[derive(Debug, Clone, Copy)]
struct LimiterState {
    tokens: u32,
    last_refill: Instant,
    cooldown_until: Option<Instant>,
    throttle_streak: u32,
}

/// Token-bucket guard consulted before every outbound call to one service.
///
/// Acquisition waits cooperatively for a token under normal load. After a
/// provider-reported throttle the limiter enters a cool-down window and
/// acquisition fails fast instead of queueing, to bound run duration.
#[derive(Debug)]
pub struct RateLimiter {
    service: String,
    capacity: u32,
    refill_every: Duration,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(service: impl Into<String>, config: RateLimiterConfig) -> Self {
        Self {
            service: service.into(),
            capacity: config.capacity.max(1),
            refill_every: config.refill_every,
            state: Mutex::new(LimiterState {
                tokens: config.capacity.max(1),
                last_refill: Instant::now(),
                cooldown_until: None,
                throttle_streak: 0,
            }),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Take one slot, waiting for the bucket to refill if necessary.
    /// Fails fast with `RateLimitedError` while a cool-down is active.
    pub async fn acquire(&self) -> Result<(), RateLimitedError> {
        loop {
            let mut state = self.state.lock().await;

            if let Some(until) = state.cooldown_until {
                let now = Instant::now();
                if now < until {
                    return Err(RateLimitedError {
                        service: self.service.clone(),
                        retry_in: until - now,
                    });
                }
                state.cooldown_until = None;
                state.tokens = self.capacity;
                state.last_refill = now;
            }

            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return Ok(());
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }

    /// Record a provider-reported throttle. The cool-down is the provider's
    /// `retry-after` when given, else exponential from 30s capped at 15min.
    pub async fn note_throttled(&self, retry_after: Option<Duration>) -> Duration {
        let mut state = self.state.lock().await;
        state.throttle_streak += 1;
        let cooldown = retry_after.unwrap_or_else(|| {
            let doublings = state.throttle_streak.saturating_sub(1).min(5);
            (BASE_COOLDOWN * 2u32.pow(doublings)).min(MAX_COOLDOWN)
        });
        state.cooldown_until = Some(Instant::now() + cooldown);
        state.tokens = 0;
        warn!(
            service = %self.service,
            cooldown_secs = cooldown.as_secs(),
            "provider throttled; entering cool-down"
        );
        cooldown
    }
}

/// How a provider response should be treated by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
    Throttled,
}

pub fn classify_status(status: StatusCode) -> ErrorClass {
    if status == StatusCode::TOO_MANY_REQUESTS {
        ErrorClass::Throttled
    } else if status.is_server_error() {
        ErrorClass::Transient
    } else {
        ErrorClass::Permanent
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> ErrorClass {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        ErrorClass::Transient
    } else {
        ErrorClass::Permanent
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}
