use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable summary.
    HumanReadable,
    /// Emit one JSON document per line (NDJSON) to stdout.
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "tallyr",
    author,
    version,
    about = "Execution telemetry aggregation and due scheduling",
    long_about = "tallyr merges cumulative per-node telemetry samples into canonical summaries, derives progress and pass/fail verdicts, and fires due monitor/report schedules under per-tenant quotas.\n\nLogs go to stderr (`RUST_LOG` overrides the level); results go to stdout.",
    after_help = "Examples:\n  tallyr replay samples.ndjson --execution exec.yaml\n  tallyr replay samples.ndjson --execution exec.yaml --criteria 'error_rate <= 0.01' --criteria 'p95 < 250'\n  tallyr replay samples.ndjson --execution exec.yaml --output json\n  tallyr schedule --config tallyr.yaml --ticks 10"
)]
pub struct Cli {
    /// Log at debug level (unless `RUST_LOG` is set)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Ingest an NDJSON sample file and report summaries, progress and a verdict
    #[command(
        long_about = "Launch an execution described by the execution YAML, ingest every sample in the NDJSON file (one sample per line) in file order, then print the merged summaries.\n\nThe `executionId` field of each sample is replaced with the launched execution's id, so recorded sample files can be replayed as-is.\n\nExit codes: 0 when every criterion holds, 11 when any criterion fails, 30 on invalid input, 40 on runtime errors."
    )]
    Replay(ReplayArgs),

    /// Run the due scheduler over a YAML-configured schedule set
    #[command(
        long_about = "Load scheduler, quota and schedule definitions from YAML, then fire due schedules every poll interval until Ctrl-C (or until `--ticks` ticks have run). The final schedule table is printed on exit."
    )]
    Schedule(ScheduleArgs),
}

#[derive(Debug, Args)]
pub struct ReplayArgs {
    /// Path to the sample file (NDJSON, one sample per line)
    pub samples: PathBuf,

    /// Execution definition (YAML: tenant, name, iterations or duration, threads, stages)
    #[arg(long, value_name = "FILE", env = "TALLYR_EXECUTION")]
    pub execution: PathBuf,

    /// Pass/fail criterion evaluated against the total (repeatable, e.g. 'p95 < 250')
    #[arg(long = "criteria", value_name = "EXPR")]
    pub criteria: Vec<String>,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::HumanReadable)]
    pub output: OutputFormat,
}

#[derive(Debug, Args)]
pub struct ScheduleArgs {
    /// Scheduler configuration (YAML: scheduler, quota, schedules)
    #[arg(long, value_name = "FILE", env = "TALLYR_CONFIG")]
    pub config: PathBuf,

    /// Stop after this many scheduler ticks (runs until Ctrl-C otherwise)
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub ticks: Option<u64>,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::HumanReadable)]
    pub output: OutputFormat,
}
