use std::sync::Arc;

use anyhow::Context as _;
use chrono::Utc;
use tallyr_core::{
    DueScheduler, MemoryScheduleStore, QuotaConfig, QuotaGuard, ScheduleStore, ScheduledEntity,
    TelemetryService,
};
use tokio_util::sync::CancellationToken;

use crate::cli::ScheduleArgs;
use crate::cli_error::CliError;
use crate::config_yaml::{ScheduleYaml, load_config};
use crate::exit_codes::ExitCode;
use crate::output;

#[derive(Debug)]
pub(crate) struct ScheduleReport {
    pub owner: String,
    pub ticks: u64,
    /// Executions launched by this process that are still holding a quota slot.
    pub running: u64,
    pub schedules: Vec<ScheduledEntity>,
}

pub(crate) async fn schedule(args: ScheduleArgs) -> Result<ExitCode, CliError> {
    let doc = load_config(&args.config)
        .await
        .map_err(CliError::InvalidInput)?;

    let scheduler_config = doc
        .scheduler
        .into_config()
        .context("invalid `scheduler` section")
        .map_err(CliError::InvalidInput)?;
    let quota = QuotaConfig::from(doc.quota);
    let schedules = doc
        .schedules
        .into_iter()
        .map(ScheduleYaml::into_new_schedule)
        .collect::<anyhow::Result<Vec<_>>>()
        .map_err(CliError::InvalidInput)?;

    let store = MemoryScheduleStore::new();
    let now = Utc::now();
    for new in schedules {
        let name = new.name.clone();
        store
            .insert(new, now)
            .await
            .with_context(|| format!("schedule `{name}`"))
            .map_err(CliError::InvalidInput)?;
    }

    let svc = Arc::new(TelemetryService::new(Arc::new(QuotaGuard::new(quota))));
    let scheduler = DueScheduler::new(store.clone(), svc.clone(), scheduler_config)
        .map_err(CliError::from_core)?;

    let shutdown = CancellationToken::new();
    let ctrl_c = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, stopping scheduler");
                shutdown.cancel();
            }
        }
    });

    let ticks = scheduler.run_ticks(shutdown, args.ticks).await;
    ctrl_c.abort();

    let report = ScheduleReport {
        owner: scheduler.config().owner.clone(),
        ticks,
        running: svc.quota().global_running(),
        schedules: store.list().await.map_err(CliError::from_core)?,
    };
    output::formatter(args.output)
        .print_schedules(&report)
        .map_err(CliError::RuntimeError)?;
    Ok(ExitCode::Success)
}
