use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::histogram::LatencyHistogram;

pub type RampStage = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl From<&str> for NodeId {
    fn from(v: &str) -> Self {
        Self(v.to_string())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SampleError {
    #[error("`nodeId` must be a non-empty string")]
    EmptyNode,

    #[error("`sampleName` must be a non-empty string")]
    EmptySampleName,

    #[error("`durationSecs` must be a finite, non-negative number (got {0})")]
    InvalidDuration(f64),

    #[error("latency `{field}` must be a finite, non-negative number (got {value})")]
    InvalidLatency { field: &'static str, value: f64 },

    #[error("latency `min` ({min}) is greater than `max` ({max})")]
    LatencyBounds { min: f64, max: f64 },

    #[error("upload progress `completed` ({completed}) exceeds `total` ({total})")]
    UploadOverflow { completed: u64, total: u64 },
}

/// Monotonic counters reported by a node since it started the sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Counters {
    pub errors: u64,
    pub operations: u64,
    pub transactions: u64,
    pub iterations: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

impl Counters {
    #[must_use]
    pub fn saturating_add(self, other: Self) -> Self {
        Self {
            errors: self.errors.saturating_add(other.errors),
            operations: self.operations.saturating_add(other.operations),
            transactions: self.transactions.saturating_add(other.transactions),
            iterations: self.iterations.saturating_add(other.iterations),
            bytes_read: self.bytes_read.saturating_add(other.bytes_read),
            bytes_written: self.bytes_written.saturating_add(other.bytes_written),
        }
    }

    /// Field-wise maximum.
    #[must_use]
    pub fn max(self, other: Self) -> Self {
        Self {
            errors: self.errors.max(other.errors),
            operations: self.operations.max(other.operations),
            transactions: self.transactions.max(other.transactions),
            iterations: self.iterations.max(other.iterations),
            bytes_read: self.bytes_read.max(other.bytes_read),
            bytes_written: self.bytes_written.max(other.bytes_written),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Throughput {
    pub ops_per_sec: f64,
    pub tps: f64,
    pub read_bytes_per_sec: f64,
    pub written_bytes_per_sec: f64,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::AsRefStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum Percentile {
    P50,
    P75,
    P90,
    P95,
    P99,
    P999,
}

impl Percentile {
    pub const ALL: [Percentile; 6] = [
        Percentile::P50,
        Percentile::P75,
        Percentile::P90,
        Percentile::P95,
        Percentile::P99,
        Percentile::P999,
    ];

    pub fn quantile(self) -> f64 {
        match self {
            Percentile::P50 => 0.50,
            Percentile::P75 => 0.75,
            Percentile::P90 => 0.90,
            Percentile::P95 => 0.95,
            Percentile::P99 => 0.99,
            Percentile::P999 => 0.999,
        }
    }
}

/// Latency aggregates in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Latency {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub p999: f64,
}

impl Latency {
    pub fn percentile(&self, p: Percentile) -> f64 {
        match p {
            Percentile::P50 => self.p50,
            Percentile::P75 => self.p75,
            Percentile::P90 => self.p90,
            Percentile::P95 => self.p95,
            Percentile::P99 => self.p99,
            Percentile::P999 => self.p999,
        }
    }

    pub fn set_percentile(&mut self, p: Percentile, value: f64) {
        let slot = match p {
            Percentile::P50 => &mut self.p50,
            Percentile::P75 => &mut self.p75,
            Percentile::P90 => &mut self.p90,
            Percentile::P95 => &mut self.p95,
            Percentile::P99 => &mut self.p99,
            Percentile::P999 => &mut self.p999,
        };
        *slot = value;
    }

    fn fields(&self) -> [(&'static str, f64); 9] {
        [
            ("mean", self.mean),
            ("min", self.min),
            ("max", self.max),
            ("p50", self.p50),
            ("p75", self.p75),
            ("p90", self.p90),
            ("p95", self.p95),
            ("p99", self.p99),
            ("p999", self.p999),
        ]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ThreadPool {
    pub size: u64,
    pub active: u64,
    pub running: bool,
    pub terminated: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UploadProgress {
    pub total: u64,
    pub completed: u64,
}

impl UploadProgress {
    #[must_use]
    pub fn saturating_add(self, other: Self) -> Self {
        Self {
            total: self.total.saturating_add(other.total),
            completed: self.completed.saturating_add(other.completed),
        }
    }

    #[must_use]
    pub fn max(self, other: Self) -> Self {
        Self {
            total: self.total.max(other.total),
            completed: self.completed.max(other.completed),
        }
    }
}

/// One node's telemetry snapshot for one (execution, sample, ramp stage).
///
/// Samples are cumulative: each one fully supersedes the previous sample from the same
/// node, so re-delivery and replays never double count.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawSample {
    pub execution_id: ExecutionId,
    pub node_id: NodeId,
    pub sample_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ramp_stage: Option<RampStage>,
    /// Milliseconds since the Unix epoch on the reporting node.
    pub source_timestamp: u64,

    #[serde(default)]
    pub counters: Counters,
    #[serde(default)]
    pub duration_secs: f64,
    /// Node-local rates. Informational only; merged rates are recomputed from counters.
    #[serde(default)]
    pub throughput: Throughput,
    #[serde(default)]
    pub latency: Latency,
    #[serde(default)]
    pub threads: ThreadPool,
    #[serde(default)]
    pub upload: UploadProgress,
    #[serde(default)]
    pub finish: bool,

    #[serde(skip)]
    pub histogram: Option<LatencyHistogram>,
}

impl RawSample {
    pub fn new(
        execution_id: ExecutionId,
        node_id: impl Into<NodeId>,
        sample_name: impl Into<String>,
        source_timestamp: u64,
    ) -> Self {
        Self {
            execution_id,
            node_id: node_id.into(),
            sample_name: sample_name.into(),
            ramp_stage: None,
            source_timestamp,
            counters: Counters::default(),
            duration_secs: 0.0,
            throughput: Throughput::default(),
            latency: Latency::default(),
            threads: ThreadPool::default(),
            upload: UploadProgress::default(),
            finish: false,
            histogram: None,
        }
    }

    #[must_use]
    pub fn with_ramp_stage(mut self, stage: RampStage) -> Self {
        self.ramp_stage = Some(stage);
        self
    }

    /// Trims identifiers and rejects samples that would corrupt a merged summary.
    pub fn normalized(mut self) -> Result<Self, SampleError> {
        let trimmed = self.node_id.0.trim();
        if trimmed.is_empty() {
            return Err(SampleError::EmptyNode);
        }
        if trimmed.len() != self.node_id.0.len() {
            self.node_id = NodeId(trimmed.to_string());
        }

        let trimmed = self.sample_name.trim();
        if trimmed.is_empty() {
            return Err(SampleError::EmptySampleName);
        }
        if trimmed.len() != self.sample_name.len() {
            self.sample_name = trimmed.to_string();
        }

        if !self.duration_secs.is_finite() || self.duration_secs < 0.0 {
            return Err(SampleError::InvalidDuration(self.duration_secs));
        }

        for (field, value) in self.latency.fields() {
            if !value.is_finite() || value < 0.0 {
                return Err(SampleError::InvalidLatency { field, value });
            }
        }
        if self.latency.min > self.latency.max {
            return Err(SampleError::LatencyBounds {
                min: self.latency.min,
                max: self.latency.max,
            });
        }

        if self.upload.completed > self.upload.total {
            return Err(SampleError::UploadOverflow {
                completed: self.upload.completed,
                total: self.upload.total,
            });
        }

        Ok(self)
    }
}
