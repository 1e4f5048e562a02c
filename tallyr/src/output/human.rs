use std::fmt::Write as _;

mod format;

use format::{format_bytes, format_ms, format_rate};
use tallyr_core::tallyr_metrics::MergedSampleSummary;
use tallyr_core::{Target, Trigger};

use super::OutputFormatter;
use crate::replay::ReplayReport;
use crate::schedule::ScheduleReport;

pub(crate) struct HumanReadableOutput;

impl OutputFormatter for HumanReadableOutput {
    fn print_replay(&self, report: &ReplayReport) -> anyhow::Result<()> {
        print!("{}", render_replay(report));
        Ok(())
    }

    fn print_schedules(&self, report: &ScheduleReport) -> anyhow::Result<()> {
        print!("{}", render_schedules(report));
        Ok(())
    }
}

pub(crate) fn render_replay(report: &ReplayReport) -> String {
    let mut out = String::new();
    let e = &report.execution;

    writeln!(&mut out, "execution: {} ({})", e.name, e.id).ok();
    writeln!(&mut out, "  tenant: {}", e.tenant).ok();
    writeln!(&mut out, "  target: {}", format_target(&e.target)).ok();
    writeln!(&mut out, "  status: {}", e.status).ok();
    writeln!(
        &mut out,
        "  samples: {} read, {} applied, {} discarded",
        report.lines, report.ingest.applied, report.ingest.discarded
    )
    .ok();
    writeln!(&mut out, "  progress: {}%", report.progress).ok();
    writeln!(&mut out, "  elapsed: {}", report.elapsed).ok();

    if report.samples.is_empty() {
        out.push_str("\nsummary: no samples\n");
    } else {
        out.push('\n');
        for s in &report.samples {
            render_summary(s, &mut out);
        }
    }

    if let Some(total) = &report.total {
        out.push('\n');
        render_summary(total, &mut out);
    }

    if let Some(verdict) = &report.verdict {
        out.push('\n');
        if verdict.passed {
            out.push_str("verdict: PASS\n");
        } else {
            out.push_str("verdict: FAIL\n");
            for v in &verdict.violations {
                match v.observed {
                    Some(observed) => {
                        writeln!(&mut out, "  {} (observed {observed})", v.criterion).ok();
                    }
                    None => {
                        writeln!(&mut out, "  {} (no samples)", v.criterion).ok();
                    }
                }
            }
        }
    }

    out
}

fn render_summary(s: &MergedSampleSummary, out: &mut String) {
    match s.ramp_stage {
        Some(stage) => writeln!(out, "sample: {} [stage {stage}]", s.sample_name).ok(),
        None => writeln!(out, "sample: {}", s.sample_name).ok(),
    };
    writeln!(
        out,
        "  nodes: {}  duration: {:.2}s{}",
        s.node_count,
        s.duration_secs,
        if s.finish { "  (finished)" } else { "" }
    )
    .ok();
    writeln!(
        out,
        "  transactions: {}  operations: {}  iterations: {}  errors: {} ({:.2}%)",
        s.counters.transactions,
        s.counters.operations,
        s.counters.iterations,
        s.counters.errors,
        s.error_rate * 100.0
    )
    .ok();
    writeln!(
        out,
        "  tps: {}  ops/s: {}  read: {}  written: {}",
        format_rate(s.throughput.tps),
        format_rate(s.throughput.ops_per_sec),
        format_bytes(s.counters.bytes_read),
        format_bytes(s.counters.bytes_written)
    )
    .ok();
    let l = &s.latency;
    writeln!(
        out,
        "  latency: mean {} min {} max {} p50 {} p90 {} p95 {} p99 {}{}",
        format_ms(l.mean),
        format_ms(l.min),
        format_ms(l.max),
        format_ms(l.p50),
        format_ms(l.p90),
        format_ms(l.p95),
        format_ms(l.p99),
        if s.exact_percentiles { "" } else { " (estimated)" }
    )
    .ok();
}

pub(crate) fn render_schedules(report: &ScheduleReport) -> String {
    let mut out = String::new();
    writeln!(
        &mut out,
        "scheduler {}: {} tick(s), {} execution(s) running",
        report.owner, report.ticks, report.running
    )
    .ok();

    if report.schedules.is_empty() {
        out.push_str("schedules: none\n");
        return out;
    }

    for s in &report.schedules {
        writeln!(&mut out, "{} {} ({})", s.kind, s.name, s.id).ok();
        writeln!(&mut out, "  tenant: {}", s.tenant).ok();
        writeln!(&mut out, "  trigger: {}", format_trigger(&s.trigger)).ok();
        writeln!(&mut out, "  status: {}", s.status).ok();
        if let Some(next) = s.next_run_at {
            writeln!(&mut out, "  next run: {}", next.to_rfc3339()).ok();
        }
        if let (Some(run), Some(at)) = (s.last_run_id, s.last_run_at) {
            writeln!(&mut out, "  last run: {run} at {}", at.to_rfc3339()).ok();
        }
        if let Some(msg) = &s.failure_message {
            writeln!(&mut out, "  failure: {msg}").ok();
        }
    }
    out
}

fn format_target(target: &Target) -> String {
    match target {
        Target::Iterations(n) => format!("{n} iterations"),
        Target::Duration(d) => humantime::format_duration(*d).to_string(),
    }
}

fn format_trigger(trigger: &Trigger) -> String {
    match trigger {
        Trigger::Now => "now".to_string(),
        Trigger::AtSomeDate => "once".to_string(),
        Trigger::Periodically(r) => format!("periodically ({r})"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn targets_read_naturally() {
        assert_eq!(format_target(&Target::Iterations(50)), "50 iterations");
        assert_eq!(
            format_target(&Target::Duration(Duration::from_secs(90))),
            "1m 30s"
        );
    }

    #[test]
    fn empty_schedule_report_says_so() {
        let report = ScheduleReport {
            owner: "node-1".to_string(),
            ticks: 3,
            running: 0,
            schedules: Vec::new(),
        };
        let out = render_schedules(&report);
        assert!(out.starts_with("scheduler node-1: 3 tick(s), 0 execution(s) running\n"));
        assert!(out.ends_with("schedules: none\n"));
    }
}
