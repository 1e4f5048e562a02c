use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use tallyr_core::tallyr_metrics::{ExecutionId, MergedSampleSummary, RawSample};
use tallyr_core::{
    Criterion, Execution, IngestReport, QuotaConfig, QuotaGuard, TelemetryService, Verdict,
    parse_criterion,
};

use crate::cli::ReplayArgs;
use crate::cli_error::CliError;
use crate::exit_codes::ExitCode;
use crate::output;

type JsonObject = serde_json::Map<String, serde_json::Value>;

/// Everything a replay prints.
#[derive(Debug)]
pub(crate) struct ReplayReport {
    pub execution: Execution,
    pub lines: usize,
    pub ingest: IngestReport,
    pub progress: String,
    pub elapsed: String,
    /// Latest summary per sample name; staged samples contribute one entry per stage.
    pub samples: Vec<MergedSampleSummary>,
    pub total: Option<MergedSampleSummary>,
    /// `None` when no criteria were given.
    pub verdict: Option<Verdict>,
}

pub(crate) async fn replay(args: ReplayArgs) -> Result<ExitCode, CliError> {
    let criteria = args
        .criteria
        .iter()
        .map(String::as_str)
        .map(parse_criterion)
        .collect::<Result<Vec<Criterion>, _>>()
        .map_err(|e| CliError::InvalidInput(e.into()))?;

    let config = crate::config_yaml::load_execution(&args.execution)
        .await
        .map_err(CliError::InvalidInput)?;
    let lines = read_lines(&args.samples).await?;

    let quota = QuotaGuard::new(QuotaConfig {
        default_max_running: 1,
        ..QuotaConfig::default()
    });
    let svc = TelemetryService::new(Arc::new(quota));
    let exec = svc.launch(config).map_err(CliError::from_core)?;

    let samples = bind_samples(lines, exec)
        .with_context(|| format!("invalid samples: {}", args.samples.display()))
        .map_err(CliError::InvalidInput)?;
    let line_count = samples.len();

    let mut ingest = IngestReport::default();
    for batch in node_batches(samples) {
        let r = svc.ingest(batch).map_err(CliError::from_core)?;
        ingest.applied += r.applied;
        ingest.discarded += r.discarded;
    }
    tracing::debug!(
        execution_id = %exec,
        applied = ingest.applied,
        discarded = ingest.discarded,
        "replay ingested"
    );

    let verdict = if criteria.is_empty() {
        None
    } else {
        Some(svc.verdict(exec, &criteria).map_err(CliError::from_core)?)
    };
    let code = verdict
        .as_ref()
        .map_or(ExitCode::Success, |v| ExitCode::from_verdict(v.passed));

    let execution = svc
        .execution(exec)
        .ok_or_else(|| CliError::RuntimeError(anyhow::anyhow!("execution {exec} vanished")))?;
    let report = ReplayReport {
        execution,
        lines: line_count,
        ingest,
        progress: svc.progress(exec).map_err(CliError::from_core)?,
        elapsed: svc.elapsed(exec).map_err(CliError::from_core)?,
        samples: latest_per_sample(&svc, exec),
        total: svc.summary_total(exec),
        verdict,
    };

    output::formatter(args.output)
        .print_replay(&report)
        .map_err(CliError::RuntimeError)?;
    Ok(code)
}

/// Parses each non-blank line as a JSON object. Line numbers in errors are 1-based.
async fn read_lines(path: &Path) -> Result<Vec<JsonObject>, CliError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read samples: {}", path.display()))
        .map_err(CliError::InvalidInput)?;

    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str::<JsonObject>(line)
                .with_context(|| format!("{}:{}: not a JSON object", path.display(), idx + 1))
        })
        .collect::<anyhow::Result<Vec<_>>>()
        .map_err(CliError::InvalidInput)
}

/// Points every sample at `exec`, so recorded files replay under a fresh execution.
fn bind_samples(lines: Vec<JsonObject>, exec: ExecutionId) -> anyhow::Result<Vec<RawSample>> {
    lines
        .into_iter()
        .enumerate()
        .map(|(idx, mut obj)| {
            obj.insert(
                "executionId".to_string(),
                serde_json::Value::String(exec.to_string()),
            );
            serde_json::from_value::<RawSample>(serde_json::Value::Object(obj))
                .with_context(|| format!("sample #{}", idx + 1))
        })
        .collect()
}

/// Splits samples into runs of consecutive samples from the same node, keeping file order.
fn node_batches(samples: Vec<RawSample>) -> Vec<Vec<RawSample>> {
    let mut out: Vec<Vec<RawSample>> = Vec::new();
    for s in samples {
        match out.last_mut() {
            Some(batch) if batch.first().is_some_and(|f| f.node_id == s.node_id) => {
                batch.push(s);
            }
            _ => out.push(vec![s]),
        }
    }
    out
}

fn latest_per_sample(svc: &TelemetryService, exec: ExecutionId) -> Vec<MergedSampleSummary> {
    let mut out = Vec::new();
    for name in svc.sample_names(exec) {
        out.extend(svc.latest(exec, &name));
        out.extend(svc.latest_by_ramp_stage(exec, &name));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(json: &str) -> JsonObject {
        serde_json::from_str(json).unwrap_or_else(|e| panic!("{e}"))
    }

    #[test]
    fn bind_samples_overrides_the_recorded_execution() -> anyhow::Result<()> {
        let exec = ExecutionId::generate();
        let samples = bind_samples(
            vec![
                obj(r#"{"nodeId":"a","sampleName":"login","sourceTimestamp":1}"#),
                obj(
                    r#"{"executionId":"00000000-0000-0000-0000-000000000000","nodeId":"b","sampleName":"login","sourceTimestamp":2}"#,
                ),
            ],
            exec,
        )?;
        assert!(samples.iter().all(|s| s.execution_id == exec));
        Ok(())
    }

    #[test]
    fn bind_samples_names_the_bad_sample() {
        let err = bind_samples(vec![obj(r#"{"nodeId":"a"}"#)], ExecutionId::generate())
            .err()
            .unwrap_or_else(|| panic!("expected an error"));
        assert!(format!("{err:#}").contains("sample #1"));
    }

    #[test]
    fn node_batches_keep_file_order_per_node() {
        let exec = ExecutionId::generate();
        let s = |node: &str, ts| RawSample::new(exec, node, "login", ts);
        let batches = node_batches(vec![s("a", 1), s("a", 2), s("b", 1), s("a", 3)]);

        let shape: Vec<(String, Vec<u64>)> = batches
            .iter()
            .map(|b| {
                (
                    b[0].node_id.to_string(),
                    b.iter().map(|s| s.source_timestamp).collect(),
                )
            })
            .collect();
        assert_eq!(
            shape,
            vec![
                ("a".to_string(), vec![1, 2]),
                ("b".to_string(), vec![1]),
                ("a".to_string(), vec![3]),
            ]
        );
    }
}
