use hdrhistogram::Histogram;
use serde::Serialize;

use crate::histogram::{merge_histograms, summarize_histogram};
use crate::rate::{per_sec, ratio, round2};
use crate::sample::{
    Counters, ExecutionId, Latency, Percentile, RampStage, RawSample, ThreadPool, Throughput,
    UploadProgress,
};

/// Sample name reported by [`crate::SampleAggregator::summary_total`].
pub const TOTAL_SAMPLE: &str = "Total";

/// Canonical cross-node view of one (execution, sample[, ramp stage]).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergedSampleSummary {
    pub execution_id: ExecutionId,
    pub sample_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ramp_stage: Option<RampStage>,

    pub node_count: usize,
    pub last_timestamp: u64,

    pub counters: Counters,
    pub upload: UploadProgress,
    pub duration_secs: f64,
    pub throughput: Throughput,
    /// `errors / operations`, two decimals.
    pub error_rate: f64,
    pub latency: Latency,
    /// Percentiles were computed from merged histograms rather than estimated.
    pub exact_percentiles: bool,
    pub threads: ThreadPool,
    pub finish: bool,
}

impl MergedSampleSummary {
    pub fn iterations(&self) -> u64 {
        self.counters.iterations
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Combine {
    Sum,
    Max,
}

/// How the parts of a reduction relate to each other.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FoldRules {
    iterations: Combine,
    duration: Combine,
    nodes: Combine,
}

impl FoldRules {
    /// Nodes run concurrently: their elapsed time overlaps.
    pub(crate) const ACROSS_NODES: Self = Self {
        iterations: Combine::Sum,
        duration: Combine::Max,
        nodes: Combine::Sum,
    };

    /// Ramp stages are consecutive segments of one run.
    pub(crate) const ACROSS_STAGES: Self = Self {
        iterations: Combine::Sum,
        duration: Combine::Sum,
        nodes: Combine::Max,
    };

    /// Every sample name of one iteration reports that same iteration.
    pub(crate) const ACROSS_SAMPLES: Self = Self {
        iterations: Combine::Max,
        duration: Combine::Max,
        nodes: Combine::Max,
    };
}

#[derive(Debug, Clone)]
pub(crate) struct Identity {
    pub execution_id: ExecutionId,
    pub sample_name: String,
    pub ramp_stage: Option<RampStage>,
}

/// Borrowed view over whatever is being reduced (a node sample or a summary).
#[derive(Clone, Copy)]
pub(crate) struct Part<'a> {
    counters: Counters,
    upload: UploadProgress,
    duration_secs: f64,
    latency: &'a Latency,
    histogram: Option<&'a Histogram<u64>>,
    threads: ThreadPool,
    finish: bool,
    timestamp: u64,
    node_count: usize,
}

impl<'a> From<&'a RawSample> for Part<'a> {
    fn from(s: &'a RawSample) -> Self {
        Self {
            counters: s.counters,
            upload: s.upload,
            duration_secs: s.duration_secs,
            latency: &s.latency,
            histogram: s.histogram.as_ref().map(|h| h.inner()),
            threads: s.threads,
            finish: s.finish,
            timestamp: s.source_timestamp,
            node_count: 1,
        }
    }
}

impl<'a> From<&'a MergedSampleSummary> for Part<'a> {
    fn from(s: &'a MergedSampleSummary) -> Self {
        Self {
            counters: s.counters,
            upload: s.upload,
            duration_secs: s.duration_secs,
            latency: &s.latency,
            histogram: None,
            threads: s.threads,
            finish: s.finish,
            timestamp: s.last_timestamp,
            node_count: s.node_count,
        }
    }
}

/// Reduces `parts` into one summary.
///
/// `previous` is the last summary published for the same key; counters and duration are
/// clamped against it so a node restarting with lower totals never regresses the view.
/// Parts must be passed in a stable order (the aggregator keeps nodes sorted by id) so
/// float accumulation does not depend on arrival order.
pub(crate) fn fold(
    identity: Identity,
    parts: &[Part<'_>],
    rules: FoldRules,
    previous: Option<&MergedSampleSummary>,
) -> MergedSampleSummary {
    let mut counters = Counters::default();
    let mut iterations_max = 0u64;
    let mut upload = UploadProgress::default();
    let mut duration_secs = 0.0f64;
    let mut node_count = 0usize;
    let mut last_timestamp = 0u64;
    let mut finish = !parts.is_empty();

    for p in parts {
        counters = counters.saturating_add(p.counters);
        iterations_max = iterations_max.max(p.counters.iterations);
        upload = upload.saturating_add(p.upload);
        duration_secs = match rules.duration {
            Combine::Sum => duration_secs + p.duration_secs,
            Combine::Max => duration_secs.max(p.duration_secs),
        };
        node_count = match rules.nodes {
            Combine::Sum => node_count.saturating_add(p.node_count),
            Combine::Max => node_count.max(p.node_count),
        };
        last_timestamp = last_timestamp.max(p.timestamp);
        finish &= p.finish;
    }
    if rules.iterations == Combine::Max {
        counters.iterations = iterations_max;
    }

    if let Some(prev) = previous {
        counters = counters.max(prev.counters);
        upload = upload.max(prev.upload);
        duration_secs = duration_secs.max(prev.duration_secs);
    }

    let (latency, exact_percentiles) = merge_latency(parts);

    let throughput = Throughput {
        ops_per_sec: per_sec(counters.operations, duration_secs),
        tps: per_sec(counters.transactions, duration_secs),
        read_bytes_per_sec: per_sec(counters.bytes_read, duration_secs),
        written_bytes_per_sec: per_sec(counters.bytes_written, duration_secs),
    };

    MergedSampleSummary {
        execution_id: identity.execution_id,
        sample_name: identity.sample_name,
        ramp_stage: identity.ramp_stage,
        node_count,
        last_timestamp,
        counters,
        upload,
        duration_secs,
        throughput,
        error_rate: round2(ratio(counters.errors, counters.operations)),
        latency,
        exact_percentiles,
        threads: merge_threads(parts),
        finish,
    }
}

fn merge_latency(parts: &[Part<'_>]) -> (Latency, bool) {
    if parts.is_empty() {
        return (Latency::default(), false);
    }

    if parts.iter().all(|p| p.histogram.is_some()) {
        let merged = merge_histograms(parts.iter().filter_map(|p| p.histogram));
        return (summarize_histogram(&merged), true);
    }

    let total_tx: u64 = parts
        .iter()
        .fold(0u64, |acc, p| acc.saturating_add(p.counters.transactions));

    let mean = if total_tx > 0 {
        let weighted: f64 = parts
            .iter()
            .map(|p| p.latency.mean * p.counters.transactions as f64)
            .sum();
        weighted / total_tx as f64
    } else {
        parts.iter().map(|p| p.latency.mean).sum::<f64>() / parts.len() as f64
    };

    // A part that has not completed a transaction yet reports min=0; ignore it when
    // anybody else has real data.
    let min = parts
        .iter()
        .filter(|p| total_tx == 0 || p.counters.transactions > 0)
        .map(|p| p.latency.min)
        .fold(f64::INFINITY, f64::min);

    let mut out = Latency {
        mean,
        min: if min.is_finite() { min } else { 0.0 },
        max: parts.iter().map(|p| p.latency.max).fold(0.0, f64::max),
        ..Latency::default()
    };

    // No mergeable form exists for already-reduced percentiles; the max across parts is
    // a conservative upper bound.
    for pct in Percentile::ALL {
        let v = parts
            .iter()
            .map(|p| p.latency.percentile(pct))
            .fold(0.0, f64::max);
        out.set_percentile(pct, v);
    }

    (out, false)
}

fn merge_threads(parts: &[Part<'_>]) -> ThreadPool {
    let Some(widest) = parts
        .iter()
        .reduce(|best, p| if p.threads.active > best.threads.active { p } else { best })
    else {
        return ThreadPool::default();
    };

    ThreadPool {
        size: widest.threads.size,
        active: widest.threads.active,
        running: parts.iter().any(|p| p.threads.running),
        terminated: parts.iter().all(|p| p.threads.terminated),
    }
}
