use std::str::FromStr;

use tallyr_metrics::{MergedSampleSummary, Percentile};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
}

impl CompareOp {
    fn holds(self, observed: f64, expected: f64) -> bool {
        match self {
            CompareOp::Lt => observed < expected,
            CompareOp::Lte => observed <= expected,
            CompareOp::Gt => observed > expected,
            CompareOp::Gte => observed >= expected,
            CompareOp::Eq => (observed - expected).abs() < f64::EPSILON,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CriterionMetric {
    ErrorRate,
    Tps,
    OpsPerSec,
    Mean,
    Min,
    Max,
    Errors,
    Transactions,
    Iterations,
    Percentile(Percentile),
}

impl CriterionMetric {
    fn parse(raw: &str) -> Option<Self> {
        if let Ok(p) = Percentile::from_str(&raw.to_ascii_lowercase()) {
            return Some(Self::Percentile(p));
        }
        let metric = match raw.to_ascii_lowercase().as_str() {
            "error_rate" => Self::ErrorRate,
            "tps" => Self::Tps,
            "ops_per_sec" => Self::OpsPerSec,
            "mean" | "avg" => Self::Mean,
            "min" => Self::Min,
            "max" => Self::Max,
            "errors" => Self::Errors,
            "transactions" => Self::Transactions,
            "iterations" => Self::Iterations,
            _ => return None,
        };
        Some(metric)
    }

    pub fn observe(self, s: &MergedSampleSummary) -> f64 {
        match self {
            Self::ErrorRate => s.error_rate,
            Self::Tps => s.throughput.tps,
            Self::OpsPerSec => s.throughput.ops_per_sec,
            Self::Mean => s.latency.mean,
            Self::Min => s.latency.min,
            Self::Max => s.latency.max,
            Self::Errors => s.counters.errors as f64,
            Self::Transactions => s.counters.transactions as f64,
            Self::Iterations => s.counters.iterations as f64,
            Self::Percentile(p) => s.latency.percentile(p),
        }
    }
}

/// One pass/fail rule, e.g. `error_rate <= 0.05` or `p95 < 500`.
#[derive(Debug, Clone, PartialEq)]
pub struct Criterion {
    pub raw: String,
    pub metric: CriterionMetric,
    pub op: CompareOp,
    pub value: f64,
}

impl FromStr for Criterion {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        parse_criterion(raw)
    }
}

pub fn parse_criterion(raw: &str) -> Result<Criterion> {
    let invalid = |reason: &str| Error::InvalidCriterion {
        expr: raw.to_string(),
        reason: reason.to_string(),
    };

    let s: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if s.is_empty() {
        return Err(invalid("empty criterion"));
    }

    let ops = [
        ("<=", CompareOp::Lte),
        (">=", CompareOp::Gte),
        ("==", CompareOp::Eq),
        ("<", CompareOp::Lt),
        (">", CompareOp::Gt),
    ];
    let (pos, len, op) = ops
        .iter()
        .find_map(|(tok, op)| s.find(tok).map(|pos| (pos, tok.len(), *op)))
        .ok_or_else(|| invalid("missing operator"))?;

    let (left, rest) = s.split_at(pos);
    let right = &rest[len..];
    if left.is_empty() || right.is_empty() {
        return Err(invalid("expected `<metric> <op> <value>`"));
    }

    let metric = CriterionMetric::parse(left)
        .ok_or_else(|| invalid(&format!("unknown metric `{left}`")))?;
    let value: f64 = right
        .parse()
        .map_err(|_| invalid("value is not a number"))?;
    if !value.is_finite() {
        return Err(invalid("value must be finite"));
    }

    Ok(Criterion {
        raw: raw.trim().to_string(),
        metric,
        op,
        value,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    pub criterion: String,
    /// `None` when there was nothing to observe yet.
    pub observed: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub passed: bool,
    pub violations: Vec<Violation>,
}

/// Checks every criterion against `summary`. A missing summary fails every criterion.
pub fn evaluate(summary: Option<&MergedSampleSummary>, criteria: &[Criterion]) -> Verdict {
    let violations: Vec<Violation> = criteria
        .iter()
        .filter_map(|c| {
            let observed = summary.map(|s| c.metric.observe(s));
            let passed = observed.is_some_and(|v| c.op.holds(v, c.value));
            (!passed).then(|| Violation {
                criterion: c.raw.clone(),
                observed,
            })
        })
        .collect();

    Verdict {
        passed: summary.is_some() && violations.is_empty(),
        violations,
    }
}
