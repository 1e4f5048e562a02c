use tallyr_metrics::MergedSampleSummary;

use crate::execution::Target;

/// Completion percentage in `[0, 100]`.
///
/// Progress is derived from monotonic counters and duration, so for a fixed target it
/// never decreases over the life of an execution.
pub fn progress_percent(target: &Target, summary: Option<&MergedSampleSummary>) -> f64 {
    let Some(summary) = summary else {
        return 0.0;
    };

    let (done, bound) = match target {
        Target::Iterations(n) => (summary.counters.iterations as f64, *n as f64),
        Target::Duration(d) => (summary.duration_secs, d.as_secs_f64()),
    };

    if bound <= 0.0 || !done.is_finite() {
        return 0.0;
    }
    (done * 100.0 / bound).clamp(0.0, 100.0)
}

/// Two-decimal progress string; `"0"` until the first summary exists.
pub fn format_progress(target: &Target, summary: Option<&MergedSampleSummary>) -> String {
    match summary {
        None => "0".to_string(),
        Some(s) => format!("{:.2}", progress_percent(target, Some(s))),
    }
}

/// Merged run time as `HH:MM:SS`.
pub fn elapsed_display(summary: Option<&MergedSampleSummary>) -> String {
    let secs = summary.map_or(0.0, |s| s.duration_secs);
    let total = if secs.is_finite() && secs > 0.0 {
        secs.floor() as u64
    } else {
        0
    };
    format!(
        "{:02}:{:02}:{:02}",
        total / 3_600,
        (total % 3_600) / 60,
        total % 60
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tallyr_metrics::{ExecutionId, RawSample, SampleAggregator};

    use super::*;

    fn summary(iterations: u64, secs: f64) -> MergedSampleSummary {
        let agg = SampleAggregator::new();
        let exec = ExecutionId::generate();
        let mut s = RawSample::new(exec, "node", "login", 1);
        s.counters.iterations = iterations;
        s.duration_secs = secs;
        agg.ingest(s).unwrap_or_else(|e| panic!("{e}"));
        agg.latest(exec, "login")
            .unwrap_or_else(|| panic!("expected summary"))
    }

    #[test]
    fn iteration_progress_is_capped_at_100() {
        let s = summary(133, 1.0);
        assert_eq!(format_progress(&Target::Iterations(100), Some(&s)), "100.00");
    }

    #[test]
    fn duration_progress_is_proportional() {
        let s = summary(0, 30.0);
        let target = Target::Duration(Duration::from_secs(60));
        assert_eq!(format_progress(&target, Some(&s)), "50.00");
    }

    #[test]
    fn missing_summary_reads_as_zero() {
        assert_eq!(format_progress(&Target::Iterations(10), None), "0");
        assert_eq!(progress_percent(&Target::Iterations(10), None), 0.0);
    }

    #[test]
    fn fractional_progress_keeps_two_decimals() {
        let s = summary(1, 0.0);
        assert_eq!(format_progress(&Target::Iterations(3), Some(&s)), "33.33");
    }

    #[test]
    fn elapsed_display_formats_hours_minutes_seconds() {
        assert_eq!(elapsed_display(None), "00:00:00");
        assert_eq!(elapsed_display(Some(&summary(0, 3_725.9))), "01:02:05");
    }
}
