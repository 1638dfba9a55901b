//! Migration run orchestration: lanes, watermark advance, reporting, scheduling.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use ghb_adapters::{
    ClientError, FitbitClient, FitbitCredentials, GarminClient, GarminCredentials, OmronClient,
    OmronCredentials, SinkClient, SourceClient, UploadOutcome,
};
use ghb_core::{LaneKey, LaneOutcome, Measurement, MetricType, RunResult, Watermark};
use ghb_storage::{BackoffPolicy, RateLimiter, RateLimiterConfig, WatermarkStore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ghb-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("a migration run is already in progress")]
    RunAlreadyInProgress,
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("{metric} value {value} outside plausible range {min}..{max}")]
    OutOfRange {
        metric: MetricType,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("{metric} value in {from:?} cannot be converted to {to:?}")]
    UnitMismatch {
        metric: MetricType,
        from: ghb_core::Unit,
        to: ghb_core::Unit,
    },
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub services_file: PathBuf,
    pub interval_hours: u32,
    pub scheduler_enabled: bool,
    pub web_port: u16,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub timezone: Option<String>,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: std::env::var("GHB_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            services_file: std::env::var("GHB_SERVICES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./services.yaml")),
            interval_hours: std::env::var("SYNC_INTERVAL_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(6),
            scheduler_enabled: std::env::var("GHB_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(true),
            web_port: std::env::var("GHB_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5070),
            http_timeout_secs: std::env::var("GHB_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            user_agent: std::env::var("GHB_USER_AGENT")
                .unwrap_or_else(|_| "garmin-health-bridge/0.1".to_string()),
            // Only affects human-readable rendering; watermark comparisons
            // stay in UTC.
            timezone: std::env::var("TZ").ok(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceLimitEntry {
    pub service: String,
    pub capacity: u32,
    pub refill_millis: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricBoundEntry {
    pub metric: MetricType,
    pub min: f64,
    pub max: f64,
}

/// Per-service rate budgets + per-metric plausibility bounds, loaded from
/// `services.yaml` with compiled-in defaults when the file is absent.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceRegistry {
    #[serde(default)]
    pub services: Vec<ServiceLimitEntry>,
    #[serde(default)]
    pub bounds: Vec<MetricBoundEntry>,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self {
            services: vec![
                ServiceLimitEntry {
                    service: "fitbit".to_string(),
                    capacity: 30,
                    refill_millis: 1_000,
                },
                ServiceLimitEntry {
                    service: "omron".to_string(),
                    capacity: 20,
                    refill_millis: 1_000,
                },
                ServiceLimitEntry {
                    service: "garmin".to_string(),
                    capacity: 5,
                    refill_millis: 250,
                },
            ],
            bounds: vec![
                MetricBoundEntry { metric: MetricType::Weight, min: 20.0, max: 400.0 },
                MetricBoundEntry { metric: MetricType::Bmi, min: 10.0, max: 80.0 },
                MetricBoundEntry { metric: MetricType::BodyFat, min: 2.0, max: 75.0 },
                MetricBoundEntry { metric: MetricType::Systolic, min: 60.0, max: 260.0 },
                MetricBoundEntry { metric: MetricType::Diastolic, min: 30.0, max: 200.0 },
                MetricBoundEntry { metric: MetricType::Pulse, min: 25.0, max: 250.0 },
            ],
        }
    }
}

impl ServiceRegistry {
    pub async fn load_or_default(path: &Path) -> Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => {
                serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no service registry file; using defaults");
                Ok(Self::default())
            }
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    pub fn limiter_for(&self, service: &str) -> RateLimiterConfig {
        self.services
            .iter()
            .find(|entry| entry.service == service)
            .map(|entry| RateLimiterConfig {
                capacity: entry.capacity,
                refill_every: Duration::from_millis(entry.refill_millis),
            })
            .unwrap_or_default()
    }

    pub fn bounds(&self) -> PlausibilityBounds {
        let mut by_metric = BTreeMap::new();
        for entry in &self.bounds {
            by_metric.insert(entry.metric, (entry.min, entry.max));
        }
        PlausibilityBounds { by_metric }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PlausibilityBounds {
    by_metric: BTreeMap<MetricType, (f64, f64)>,
}

impl PlausibilityBounds {
    pub fn check(&self, measurement: &Measurement) -> Result<(), ValidationError> {
        let Some(&(min, max)) = self.by_metric.get(&measurement.metric_type) else {
            return Ok(());
        };
        if measurement.value < min || measurement.value > max {
            return Err(ValidationError::OutOfRange {
                metric: measurement.metric_type,
                value: measurement.value,
                min,
                max,
            });
        }
        Ok(())
    }
}

/// Normalize a fetched record to the sink's unit and reject implausible
/// values rather than propagating garbage.
pub fn normalize_measurement(
    measurement: Measurement,
    bounds: &PlausibilityBounds,
) -> Result<Measurement, ValidationError> {
    let target = measurement.metric_type.sink_unit();
    let value = ghb_core::convert(measurement.value, measurement.unit, target).ok_or(
        ValidationError::UnitMismatch {
            metric: measurement.metric_type,
            from: measurement.unit,
            to: target,
        },
    )?;
    let normalized = Measurement {
        value,
        unit: target,
        ..measurement
    };
    bounds.check(&normalized)?;
    Ok(normalized)
}

/// Retains the most recent run's outcome for the status surface.
/// Pure aggregator: no retry or mutation logic lives here.
#[derive(Debug, Default)]
pub struct RunReporter {
    latest: RwLock<Option<RunResult>>,
}

impl RunReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, result: RunResult) {
        *self.latest.write().await = Some(result);
    }

    pub async fn latest(&self) -> Option<RunResult> {
        self.latest.read().await.clone()
    }
}

/// Read-only payload served by the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub last_run: Option<RunResult>,
    pub watermarks: Vec<Watermark>,
}

pub async fn status_snapshot(reporter: &RunReporter, store: &WatermarkStore) -> StatusSnapshot {
    StatusSnapshot {
        last_run: reporter.latest().await,
        watermarks: store.snapshot().await,
    }
}

struct LaneContext {
    source: Arc<dyn SourceClient>,
    sink: Arc<dyn SinkClient>,
    store: Arc<WatermarkStore>,
    bounds: PlausibilityBounds,
    backoff: BackoffPolicy,
    shutdown: watch::Receiver<bool>,
}

/// Drives one (source, metric) lane to completion. Failures are contained
/// here and surfaced only through the returned counts.
async fn run_lane(ctx: LaneContext, lane: LaneKey) -> LaneOutcome {
    let mut outcome = LaneOutcome::default();

    if let Err(err) = ctx.source.authenticate().await {
        warn!(%lane, %err, "source authentication failed; skipping lane");
        outcome.record_failure(err.to_string());
        return outcome;
    }
    if let Err(err) = ctx.sink.authenticate().await {
        warn!(%lane, %err, "sink authentication failed; skipping lane");
        outcome.record_failure(err.to_string());
        return outcome;
    }

    let watermark = ctx.store.get(lane.source, lane.metric_type).await;
    let mut attempt = 0usize;
    let records = loop {
        match ctx
            .source
            .fetch_since(lane.metric_type, watermark.last_migrated_at)
            .await
        {
            Ok(records) => break records,
            Err(err) if err.is_transient() && attempt < ctx.backoff.max_retries => {
                debug!(%lane, attempt, %err, "transient fetch failure; backing off");
                tokio::time::sleep(ctx.backoff.delay_for_attempt(attempt)).await;
                attempt += 1;
            }
            Err(err) => {
                warn!(%lane, %err, "fetch failed");
                outcome.record_failure(err.to_string());
                return outcome;
            }
        }
    };

    outcome.fetched = records.len();
    debug!(%lane, fetched = records.len(), since = %watermark.last_migrated_at, "fetched records");

    let mut seen_keys: HashSet<String> = HashSet::new();
    let mut current_watermark = watermark.last_migrated_at;

    for record in records {
        if *ctx.shutdown.borrow() {
            info!(%lane, "shutdown requested; stopping lane after in-flight record");
            break;
        }

        // Guards against provider clock skew / re-delivery: anything at or
        // before the run's starting watermark was migrated by an earlier run.
        if record.recorded_at <= watermark.last_migrated_at {
            outcome.skipped_duplicate += 1;
            continue;
        }
        if !seen_keys.insert(record.dedup_key()) {
            outcome.skipped_duplicate += 1;
            continue;
        }

        let normalized = match normalize_measurement(record, &ctx.bounds) {
            Ok(normalized) => normalized,
            Err(err) => {
                debug!(%lane, %err, "dropping implausible record");
                outcome.record_failure(err.to_string());
                continue;
            }
        };

        let mut attempt = 0usize;
        let upload_result = loop {
            match ctx.sink.upload(&normalized).await {
                Ok(result) => break Ok(result),
                Err(err) if err.is_transient() && attempt < ctx.backoff.max_retries => {
                    debug!(%lane, attempt, %err, "transient upload failure; backing off");
                    tokio::time::sleep(ctx.backoff.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
                Err(err) => break Err(err),
            }
        };

        match upload_result {
            Ok(UploadOutcome::Accepted) => outcome.uploaded += 1,
            Ok(UploadOutcome::DuplicateRejected) => outcome.skipped_duplicate += 1,
            Err(err) => {
                let exhausted_retries = err.is_transient();
                outcome.record_failure(err.to_string());
                if exhausted_retries {
                    warn!(%lane, %err, "transient upload failures exhausted retries; failing lane");
                    break;
                }
                warn!(%lane, %err, "upload failed; continuing with later records");
                continue;
            }
        }

        // Watermark tracks the highest successfully uploaded timestamp.
        if normalized.recorded_at > current_watermark {
            match ctx
                .store
                .advance(
                    lane.source,
                    lane.metric_type,
                    normalized.recorded_at,
                    normalized.source_record_id.as_deref(),
                )
                .await
            {
                Ok(()) => current_watermark = normalized.recorded_at,
                Err(err) => {
                    error!(%lane, %err, "watermark advance failed; stopping lane");
                    outcome.record_failure(err.to_string());
                    break;
                }
            }
        }
    }

    outcome
}

/// Drives one end-to-end migration run across all configured lanes.
///
/// Runs are mutually exclusive: concurrent triggers are rejected with
/// `SyncError::RunAlreadyInProgress` rather than interleaved, because two
/// writers on the same lane would break the watermark's monotonic advance.
pub struct Migrator {
    sources: Vec<Arc<dyn SourceClient>>,
    sink: Arc<dyn SinkClient>,
    store: Arc<WatermarkStore>,
    reporter: Arc<RunReporter>,
    bounds: PlausibilityBounds,
    backoff: BackoffPolicy,
    run_lock: Mutex<()>,
    shutdown: watch::Receiver<bool>,
}

impl Migrator {
    pub fn new(
        sources: Vec<Arc<dyn SourceClient>>,
        sink: Arc<dyn SinkClient>,
        store: Arc<WatermarkStore>,
        reporter: Arc<RunReporter>,
        bounds: PlausibilityBounds,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            sources,
            sink,
            store,
            reporter,
            bounds,
            backoff: BackoffPolicy::default(),
            run_lock: Mutex::new(()),
            shutdown,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn store(&self) -> &Arc<WatermarkStore> {
        &self.store
    }

    pub fn reporter(&self) -> &Arc<RunReporter> {
        &self.reporter
    }

    /// One complete run. Lanes for distinct (source, metric) pairs execute
    /// concurrently; they touch disjoint watermark rows.
    pub async fn run(&self) -> Result<RunResult, SyncError> {
        let _guard = self
            .run_lock
            .try_lock()
            .map_err(|_| SyncError::RunAlreadyInProgress)?;

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, sources = self.sources.len(), "migration run started");

        let mut lanes: JoinSet<(LaneKey, LaneOutcome)> = JoinSet::new();
        for source in &self.sources {
            for &metric_type in MetricType::for_source(source.source()) {
                let lane = LaneKey {
                    source: source.source(),
                    metric_type,
                };
                let ctx = LaneContext {
                    source: source.clone(),
                    sink: self.sink.clone(),
                    store: self.store.clone(),
                    bounds: self.bounds.clone(),
                    backoff: self.backoff,
                    shutdown: self.shutdown.clone(),
                };
                lanes.spawn(async move { (lane, run_lane(ctx, lane).await) });
            }
        }

        let mut per_metric = BTreeMap::new();
        while let Some(joined) = lanes.join_next().await {
            match joined {
                Ok((lane, outcome)) => {
                    per_metric.insert(lane.metric_type, outcome);
                }
                Err(err) => warn!(%err, "lane task aborted"),
            }
        }

        let result = RunResult {
            run_id,
            started_at,
            finished_at: Utc::now(),
            per_metric,
        };
        self.reporter.record(result.clone()).await;

        let totals = result.totals();
        info!(
            %run_id,
            uploaded = totals.uploaded,
            skipped_duplicate = totals.skipped_duplicate,
            failed = totals.failed,
            "migration run finished"
        );
        Ok(result)
    }

    /// Authenticate against every configured service without moving data.
    pub async fn check_connectivity(&self) -> Vec<(String, Result<(), ClientError>)> {
        let mut results = vec![(
            self.sink.name().to_string(),
            self.sink.authenticate().await,
        )];
        for source in &self.sources {
            results.push((
                source.source().to_string(),
                source.authenticate().await,
            ));
        }
        results
    }
}

/// Fully wired bridge: configuration, durable state, clients, orchestrator.
pub struct SyncRuntime {
    pub config: SyncConfig,
    pub store: Arc<WatermarkStore>,
    pub reporter: Arc<RunReporter>,
    pub migrator: Arc<Migrator>,
    pub shutdown: watch::Sender<bool>,
}

impl SyncRuntime {
    pub async fn from_env() -> Result<Self> {
        Self::build(SyncConfig::from_env()).await
    }

    pub async fn build(config: SyncConfig) -> Result<Self> {
        let registry = ServiceRegistry::load_or_default(&config.services_file).await?;
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .with_context(|| format!("creating data dir {}", config.data_dir.display()))?;

        let store = Arc::new(
            WatermarkStore::open(config.data_dir.join("watermarks.json"))
                .await
                .context("opening watermark store")?,
        );
        let reporter = Arc::new(RunReporter::new());
        let timeout = Duration::from_secs(config.http_timeout_secs);

        let garmin_credentials = GarminCredentials::from_env()
            .context("GARMIN_EMAIL and GARMIN_PASSWORD must be set")?;
        let sink: Arc<dyn SinkClient> = Arc::new(GarminClient::new(
            garmin_credentials,
            &config.data_dir,
            Arc::new(RateLimiter::new("garmin", registry.limiter_for("garmin"))),
            timeout,
            &config.user_agent,
        )?);

        let mut sources: Vec<Arc<dyn SourceClient>> = Vec::new();
        if let Some(credentials) = FitbitCredentials::from_env() {
            sources.push(Arc::new(FitbitClient::new(
                credentials,
                &config.data_dir,
                Arc::new(RateLimiter::new("fitbit", registry.limiter_for("fitbit"))),
                timeout,
                &config.user_agent,
            )?));
        } else {
            info!("fitbit credentials not configured; fitbit lanes disabled");
        }
        if let Some(credentials) = OmronCredentials::from_env() {
            sources.push(Arc::new(OmronClient::new(
                credentials,
                Arc::new(RateLimiter::new("omron", registry.limiter_for("omron"))),
                timeout,
            )?));
        } else {
            info!("omron credentials not configured; omron lanes disabled");
        }
        if sources.is_empty() {
            warn!("no source services configured; runs will migrate nothing");
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let migrator = Arc::new(Migrator::new(
            sources,
            sink,
            store.clone(),
            reporter.clone(),
            registry.bounds(),
            shutdown_rx,
        ));

        Ok(Self {
            config,
            store,
            reporter,
            migrator,
            shutdown,
        })
    }
}

pub async fn run_sync_once_from_env() -> Result<RunResult> {
    let runtime = SyncRuntime::from_env().await?;
    let result = runtime.migrator.run().await?;
    Ok(result)
}

fn cron_for_interval(interval_hours: u32) -> String {
    format!("0 0 */{} * * *", interval_hours.max(1))
}

/// Interval trigger. Overlapping fires are rejected by the run lock, never
/// interleaved.
pub async fn maybe_build_scheduler(
    migrator: Arc<Migrator>,
    config: &SyncConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let expr = cron_for_interval(config.interval_hours);
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job_migrator = migrator.clone();
    let job = Job::new_async(expr.as_str(), move |_uuid, _lock| {
        let migrator = job_migrator.clone();
        Box::pin(async move {
            match migrator.run().await {
                Ok(result) => {
                    let totals = result.totals();
                    info!(
                        run_id = %result.run_id,
                        uploaded = totals.uploaded,
                        failed = totals.failed,
                        "scheduled migration run finished"
                    );
                }
                Err(SyncError::RunAlreadyInProgress) => {
                    warn!("scheduled trigger overlapped a run in progress; skipping");
                }
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {expr}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    info!(cron = %expr, "migration scheduler armed");
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ghb_core::{Source, Unit};

    fn weight(value: f64, unit: Unit) -> Measurement {
        Measurement {
            source: Source::Fitbit,
            metric_type: MetricType::Weight,
            value,
            unit,
            recorded_at: Utc.with_ymd_and_hms(2024, 1, 2, 8, 0, 0).single().unwrap(),
            source_record_id: None,
        }
    }

    #[test]
    fn normalization_converts_pounds_to_kilograms() {
        let bounds = ServiceRegistry::default().bounds();
        let normalized = normalize_measurement(weight(154.324, Unit::Pounds), &bounds).unwrap();
        assert_eq!(normalized.unit, Unit::Kilograms);
        assert!((normalized.value - 70.0).abs() < 0.01);
    }

    #[test]
    fn normalization_rejects_implausible_values() {
        let bounds = ServiceRegistry::default().bounds();
        let err = normalize_measurement(weight(900.0, Unit::Kilograms), &bounds).unwrap_err();
        assert!(matches!(err, ValidationError::OutOfRange { .. }));
        let err = normalize_measurement(weight(120.0, Unit::MmHg), &bounds).unwrap_err();
        assert!(matches!(err, ValidationError::UnitMismatch { .. }));
    }

    #[test]
    fn registry_yaml_overrides_defaults() {
        let registry: ServiceRegistry = serde_yaml::from_str(
            r#"
services:
  - service: garmin
    capacity: 2
    refill_millis: 500
bounds:
  - metric: weight
    min: 30.0
    max: 250.0
"#,
        )
        .expect("registry parses");

        let garmin = registry.limiter_for("garmin");
        assert_eq!(garmin.capacity, 2);
        assert_eq!(garmin.refill_every, Duration::from_millis(500));
        // Unlisted services fall back to the limiter default.
        assert_eq!(registry.limiter_for("fitbit").capacity, RateLimiterConfig::default().capacity);

        let bounds = registry.bounds();
        let err = normalize_measurement(weight(260.0, Unit::Kilograms), &bounds).unwrap_err();
        assert!(matches!(err, ValidationError::OutOfRange { .. }));
    }

    #[test]
    fn cron_expression_follows_interval() {
        assert_eq!(cron_for_interval(6), "0 0 */6 * * *");
        assert_eq!(cron_for_interval(0), "0 0 */1 * * *");
    }

    #[tokio::test]
    async fn reporter_keeps_only_the_latest_run() {
        let reporter = RunReporter::new();
        assert!(reporter.latest().await.is_none());

        let first = RunResult {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            per_metric: BTreeMap::new(),
        };
        let second = RunResult {
            run_id: Uuid::new_v4(),
            ..first.clone()
        };
        reporter.record(first).await;
        reporter.record(second.clone()).await;
        assert_eq!(reporter.latest().await.unwrap().run_id, second.run_id);
    }
}
