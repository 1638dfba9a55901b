//! Core domain model for the Garmin Health Bridge.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ghb-core";

/// Measurement origin. Garmin is the sink and never appears here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Fitbit,
    Omron,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fitbit => "fitbit",
            Self::Omron => "omron",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Weight,
    Bmi,
    BodyFat,
    Systolic,
    Diastolic,
    Pulse,
}

impl MetricType {
    pub const ALL: [Self; 6] = [
        Self::Weight,
        Self::Bmi,
        Self::BodyFat,
        Self::Systolic,
        Self::Diastolic,
        Self::Pulse,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Weight => "weight",
            Self::Bmi => "bmi",
            Self::BodyFat => "body_fat",
            Self::Systolic => "systolic",
            Self::Diastolic => "diastolic",
            Self::Pulse => "pulse",
        }
    }

    /// Metric streams a given source is able to produce.
    pub fn for_source(source: Source) -> &'static [Self] {
        match source {
            Source::Fitbit => &[Self::Weight, Self::Bmi, Self::BodyFat],
            Source::Omron => &[Self::Systolic, Self::Diastolic, Self::Pulse],
        }
    }

    /// Unit the Garmin sink expects for this metric.
    pub fn sink_unit(self) -> Unit {
        match self {
            Self::Weight => Unit::Kilograms,
            Self::Bmi => Unit::BmiIndex,
            Self::BodyFat => Unit::Percent,
            Self::Systolic | Self::Diastolic => Unit::MmHg,
            Self::Pulse => Unit::Bpm,
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    Kilograms,
    Pounds,
    Percent,
    BmiIndex,
    MmHg,
    Bpm,
}

impl Unit {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Kilograms => "kg",
            Self::Pounds => "lb",
            Self::Percent => "%",
            Self::BmiIndex => "bmi",
            Self::MmHg => "mmHg",
            Self::Bpm => "bpm",
        }
    }
}

const POUNDS_PER_KILOGRAM: f64 = 2.204_622_621_848_776;

/// Convert a value between units. `None` when the units are incompatible.
pub fn convert(value: f64, from: Unit, to: Unit) -> Option<f64> {
    if from == to {
        return Some(value);
    }
    match (from, to) {
        (Unit::Pounds, Unit::Kilograms) => Some(value / POUNDS_PER_KILOGRAM),
        (Unit::Kilograms, Unit::Pounds) => Some(value * POUNDS_PER_KILOGRAM),
        _ => None,
    }
}

/// A single normalized reading fetched from a source provider.
///
/// Immutable once fetched; `source_record_id` is the provider's native
/// identifier when the provider supplies one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub source: Source,
    pub metric_type: MetricType,
    pub value: f64,
    pub unit: Unit,
    pub recorded_at: DateTime<Utc>,
    pub source_record_id: Option<String>,
}

impl Measurement {
    /// Key used to recognize a measurement already processed in a run:
    /// the native record id, else metric + timestamp rounded to the minute.
    pub fn dedup_key(&self) -> String {
        match &self.source_record_id {
            Some(id) => id.clone(),
            None => {
                let minute = self
                    .recorded_at
                    .with_second(0)
                    .and_then(|t| t.with_nanosecond(0))
                    .unwrap_or(self.recorded_at);
                format!("{}@{}", self.metric_type, minute.format("%Y-%m-%dT%H:%M"))
            }
        }
    }
}

/// Durable marker of the last successfully migrated record per lane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Watermark {
    pub source: Source,
    pub metric_type: MetricType,
    pub last_migrated_at: DateTime<Utc>,
    pub last_source_record_id: Option<String>,
}

impl Watermark {
    /// Starting watermark for a lane that has never migrated anything.
    pub fn epoch(source: Source, metric_type: MetricType) -> Self {
        Self {
            source,
            metric_type,
            last_migrated_at: DateTime::UNIX_EPOCH,
            last_source_record_id: None,
        }
    }
}

/// One independent (source, metric) processing pipeline within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LaneKey {
    pub source: Source,
    pub metric_type: MetricType,
}

impl fmt::Display for LaneKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source, self.metric_type)
    }
}

const MAX_ERROR_SAMPLES: usize = 5;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneOutcome {
    pub fetched: usize,
    pub uploaded: usize,
    pub skipped_duplicate: usize,
    pub failed: usize,
    pub error_samples: Vec<String>,
}

impl LaneOutcome {
    /// Count a failure, keeping a bounded sample of error messages.
    pub fn record_failure(&mut self, message: impl Into<String>) {
        self.failed += 1;
        if self.error_samples.len() < MAX_ERROR_SAMPLES {
            self.error_samples.push(message.into());
        }
    }
}

/// Outcome of one complete migration run. Superseded, never merged,
/// by the next run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub per_metric: BTreeMap<MetricType, LaneOutcome>,
}

impl RunResult {
    pub fn totals(&self) -> LaneOutcome {
        let mut total = LaneOutcome::default();
        for outcome in self.per_metric.values() {
            total.fetched += outcome.fetched;
            total.uploaded += outcome.uploaded;
            total.skipped_duplicate += outcome.skipped_duplicate;
            total.failed += outcome.failed;
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn measurement(record_id: Option<&str>) -> Measurement {
        Measurement {
            source: Source::Fitbit,
            metric_type: MetricType::Weight,
            value: 70.1,
            unit: Unit::Kilograms,
            recorded_at: Utc.with_ymd_and_hms(2024, 1, 2, 8, 30, 42).single().unwrap(),
            source_record_id: record_id.map(str::to_string),
        }
    }

    #[test]
    fn dedup_key_prefers_native_record_id() {
        assert_eq!(measurement(Some("log-123")).dedup_key(), "log-123");
    }

    #[test]
    fn dedup_key_falls_back_to_minute_rounded_timestamp() {
        assert_eq!(measurement(None).dedup_key(), "weight@2024-01-02T08:30");
    }

    #[test]
    fn pound_conversion_round_trips() {
        let kg = convert(154.324, Unit::Pounds, Unit::Kilograms).unwrap();
        assert!((kg - 70.0).abs() < 0.01);
        assert!(convert(120.0, Unit::MmHg, Unit::Kilograms).is_none());
    }

    #[test]
    fn every_metric_belongs_to_exactly_one_source() {
        let fitbit = MetricType::for_source(Source::Fitbit);
        let omron = MetricType::for_source(Source::Omron);
        for metric in MetricType::ALL {
            let hits = fitbit.contains(&metric) as usize + omron.contains(&metric) as usize;
            assert_eq!(hits, 1, "{metric} must map to one source");
        }
    }

    #[test]
    fn failure_samples_are_bounded() {
        let mut outcome = LaneOutcome::default();
        for i in 0..10 {
            outcome.record_failure(format!("boom {i}"));
        }
        assert_eq!(outcome.failed, 10);
        assert_eq!(outcome.error_samples.len(), MAX_ERROR_SAMPLES);
    }
}
