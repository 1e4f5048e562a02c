use serde::Serialize;
use std::io::Write as _;

use tallyr_core::tallyr_metrics::MergedSampleSummary;
use tallyr_core::{ScheduledEntity, Target, Trigger};

use super::OutputFormatter;
use crate::replay::ReplayReport;
use crate::schedule::ScheduleReport;

pub(crate) struct JsonOutput;

impl OutputFormatter for JsonOutput {
    fn print_replay(&self, report: &ReplayReport) -> anyhow::Result<()> {
        emit_json_line(&build_replay_line(report))
    }

    fn print_schedules(&self, report: &ScheduleReport) -> anyhow::Result<()> {
        emit_json_line(&build_schedules_line(report))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct JsonReplayLine<'a> {
    pub kind: &'static str,
    pub execution_id: String,
    pub tenant: &'a str,
    pub name: &'a str,
    pub status: String,
    pub target_iterations: Option<u64>,
    pub target_duration_secs: Option<f64>,

    pub samples_read: usize,
    pub samples_applied: usize,
    pub samples_discarded: usize,

    pub progress: &'a str,
    pub elapsed: &'a str,
    pub samples: &'a [MergedSampleSummary],
    pub total: Option<&'a MergedSampleSummary>,
    pub verdict: Option<JsonVerdict>,
}

#[derive(Debug, Serialize)]
pub(crate) struct JsonVerdict {
    pub passed: bool,
    pub violations: Vec<JsonViolation>,
}

#[derive(Debug, Serialize)]
pub(crate) struct JsonViolation {
    pub criterion: String,
    pub observed: Option<f64>,
}

fn build_replay_line(report: &ReplayReport) -> JsonReplayLine<'_> {
    let e = &report.execution;
    let (target_iterations, target_duration_secs) = match e.target {
        Target::Iterations(n) => (Some(n), None),
        Target::Duration(d) => (None, Some(d.as_secs_f64())),
    };

    JsonReplayLine {
        kind: "replay",
        execution_id: e.id.to_string(),
        tenant: &e.tenant.0,
        name: &e.name,
        status: e.status.to_string(),
        target_iterations,
        target_duration_secs,
        samples_read: report.lines,
        samples_applied: report.ingest.applied,
        samples_discarded: report.ingest.discarded,
        progress: &report.progress,
        elapsed: &report.elapsed,
        samples: &report.samples,
        total: report.total.as_ref(),
        verdict: report.verdict.as_ref().map(|v| JsonVerdict {
            passed: v.passed,
            violations: v
                .violations
                .iter()
                .map(|x| JsonViolation {
                    criterion: x.criterion.clone(),
                    observed: x.observed,
                })
                .collect(),
        }),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct JsonSchedulesLine {
    pub kind: &'static str,
    pub owner: String,
    pub ticks: u64,
    pub running: u64,
    pub schedules: Vec<JsonSchedule>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct JsonSchedule {
    pub id: String,
    pub kind: String,
    pub tenant: String,
    pub name: String,
    pub status: String,
    pub trigger: String,
    pub next_run_at: Option<String>,
    pub last_run_id: Option<String>,
    pub last_run_at: Option<String>,
    pub failure_message: Option<String>,
}

impl From<&ScheduledEntity> for JsonSchedule {
    fn from(s: &ScheduledEntity) -> Self {
        Self {
            id: s.id.to_string(),
            kind: s.kind.to_string(),
            tenant: s.tenant.to_string(),
            name: s.name.clone(),
            status: s.status.to_string(),
            trigger: match &s.trigger {
                Trigger::Now => "now".to_string(),
                Trigger::AtSomeDate => "atSomeDate".to_string(),
                Trigger::Periodically(r) => r.to_string(),
            },
            next_run_at: s.next_run_at.map(|t| t.to_rfc3339()),
            last_run_id: s.last_run_id.map(|id| id.to_string()),
            last_run_at: s.last_run_at.map(|t| t.to_rfc3339()),
            failure_message: s.failure_message.clone(),
        }
    }
}

fn build_schedules_line(report: &ScheduleReport) -> JsonSchedulesLine {
    JsonSchedulesLine {
        kind: "schedules",
        owner: report.owner.clone(),
        ticks: report.ticks,
        running: report.running,
        schedules: report.schedules.iter().map(JsonSchedule::from).collect(),
    }
}

fn emit_json_line<T: Serialize>(line: &T) -> anyhow::Result<()> {
    let mut out = std::io::stdout().lock();
    serde_json::to_writer(&mut out, line)?;
    writeln!(out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn schedules_line_has_kind_and_camel_case_fields() -> anyhow::Result<()> {
        let line = build_schedules_line(&ScheduleReport {
            owner: "node-1".to_string(),
            ticks: 2,
            running: 1,
            schedules: Vec::new(),
        });
        let v: Value = serde_json::to_value(&line)?;
        assert_eq!(v["kind"], "schedules");
        assert_eq!(v["ticks"], 2);
        assert!(v["schedules"].as_array().is_some_and(Vec::is_empty));
        Ok(())
    }

    #[test]
    fn violations_serialize_missing_observations_as_null() -> anyhow::Result<()> {
        let v = serde_json::to_value(JsonViolation {
            criterion: "p95 < 200".to_string(),
            observed: None,
        })?;
        assert_eq!(v["criterion"], "p95 < 200");
        assert!(v["observed"].is_null());
        Ok(())
    }
}
