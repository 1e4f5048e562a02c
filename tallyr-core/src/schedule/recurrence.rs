use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use cron::Schedule;

use crate::error::{Error, Result};

/// How a periodic schedule repeats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recurrence {
    /// Fixed interval; occurrences keep the phase of the first one.
    Every(Duration),
    /// Cron expression, 5 fields (minute precision) or 6 fields (with seconds).
    Cron(String),
}

impl Recurrence {
    pub fn validate(&self) -> Result<()> {
        match self {
            Recurrence::Every(d) => interval_millis(*d).map(|_| ()),
            Recurrence::Cron(expr) => parse_cron(expr).map(|_| ()),
        }
    }

    /// First occurrence strictly after `now`.
    pub fn first_after(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        match self {
            Recurrence::Every(d) => {
                let step = interval_millis(*d)?;
                add_millis(now, step)
            }
            Recurrence::Cron(expr) => cron_after(expr, now),
        }
    }

    /// Next occurrence strictly after both `prev` and `now`.
    ///
    /// Occurrences that were missed while nothing was ticking are skipped.
    pub fn next_occurrence(
        &self,
        prev: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        match self {
            Recurrence::Every(d) => {
                let step = interval_millis(*d)?;
                let behind = (now - prev).num_milliseconds();
                let steps = if behind < 0 { 1 } else { behind / step + 1 };
                let offset = steps.checked_mul(step).ok_or_else(overflow)?;
                add_millis(prev, offset)
            }
            Recurrence::Cron(expr) => cron_after(expr, prev.max(now)),
        }
    }
}

impl std::fmt::Display for Recurrence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Recurrence::Every(d) => write!(f, "every {}ms", d.as_millis()),
            Recurrence::Cron(expr) => write!(f, "cron `{expr}`"),
        }
    }
}

fn interval_millis(d: Duration) -> Result<i64> {
    let millis = i64::try_from(d.as_millis())
        .map_err(|_| Error::InvalidSchedule("interval is too large".to_string()))?;
    if millis < 1_000 {
        return Err(Error::InvalidSchedule(
            "interval must be at least one second".to_string(),
        ));
    }
    Ok(millis)
}

fn add_millis(at: DateTime<Utc>, millis: i64) -> Result<DateTime<Utc>> {
    TimeDelta::try_milliseconds(millis)
        .and_then(|delta| at.checked_add_signed(delta))
        .ok_or_else(overflow)
}

fn overflow() -> Error {
    Error::InvalidSchedule("next occurrence overflows".to_string())
}

// The cron crate wants a seconds field; plain 5-field expressions fire at second 0.
fn normalize_cron(expr: &str) -> String {
    let expr = expr.trim();
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

fn parse_cron(expr: &str) -> Result<Schedule> {
    Schedule::from_str(&normalize_cron(expr)).map_err(|e| Error::InvalidCron {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

fn cron_after(expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    parse_cron(expr)?
        .after(&after)
        .next()
        .ok_or_else(|| Error::InvalidCron {
            expr: expr.to_string(),
            reason: "no upcoming occurrence".to_string(),
        })
}
