use std::sync::Arc;

use async_trait::async_trait;
use tallyr_metrics::{Applied, ExecutionId, MergedSampleSummary, RawSample, SampleAggregator};

use crate::error::{Error, Result};
use crate::execution::{Execution, ExecutionConfig, ExecutionRegistry, ExecutionStatus};
use crate::progress::{elapsed_display, format_progress, progress_percent};
use crate::quota::{QuotaCollaborator, QuotaGuard};
use crate::schedule::{ExecutionLauncher, LaunchRequest};
use crate::verdict::{Criterion, Verdict, evaluate};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub applied: usize,
    /// Samples that were not newer than their node's last-known sample.
    pub discarded: usize,
}

/// Ingest and read facade over the execution registry, the sample aggregator and the
/// tenant quota.
#[derive(Debug)]
pub struct TelemetryService {
    executions: ExecutionRegistry,
    aggregator: SampleAggregator,
    quota: Arc<QuotaGuard>,
}

impl TelemetryService {
    pub fn new(quota: Arc<QuotaGuard>) -> Self {
        Self {
            executions: ExecutionRegistry::default(),
            aggregator: SampleAggregator::new(),
            quota,
        }
    }

    pub fn quota(&self) -> &Arc<QuotaGuard> {
        &self.quota
    }

    pub fn aggregator(&self) -> &SampleAggregator {
        &self.aggregator
    }

    /// Validates `config`, takes a running slot for its tenant and registers a `Pending`
    /// execution.
    pub fn launch(&self, config: ExecutionConfig) -> Result<ExecutionId> {
        let execution = Execution::new(config)?;
        self.quota.admit(&execution.tenant, 1)?;

        let id = execution.id;
        tracing::info!(
            execution_id = %id,
            tenant = %execution.tenant,
            name = %execution.name,
            "execution launched"
        );
        self.executions.insert(execution);
        Ok(id)
    }

    pub fn execution(&self, id: ExecutionId) -> Option<Execution> {
        self.executions.get(id)
    }

    /// Moves `id` to `next`. Entering a terminal status frees the tenant's slot; since
    /// terminal statuses have no way out this happens at most once per execution.
    pub fn transition(&self, id: ExecutionId, next: ExecutionStatus) -> Result<ExecutionStatus> {
        let tenant = self
            .executions
            .get(id)
            .ok_or(Error::UnknownExecution(id))?
            .tenant;
        let prev = self.executions.transition(id, next)?;
        if next.is_terminal() {
            self.quota.release(&tenant, 1);
        }
        tracing::info!(execution_id = %id, from = %prev, to = %next, "execution status changed");
        Ok(prev)
    }

    /// Applies a batch of samples from one node of one execution.
    ///
    /// The whole batch is validated before anything is applied.
    pub fn ingest(&self, batch: Vec<RawSample>) -> Result<IngestReport> {
        let batch = batch
            .into_iter()
            .map(RawSample::normalized)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let Some(first) = batch.first() else {
            return Ok(IngestReport::default());
        };

        let execution_id = first.execution_id;
        let node = first.node_id.clone();
        for sample in &batch[1..] {
            if sample.execution_id != execution_id {
                return Err(Error::mixed_batch(
                    format!("execution {execution_id}"),
                    format!("execution {}", sample.execution_id),
                ));
            }
            if sample.node_id != node {
                return Err(Error::node_mismatch(&node, &sample.node_id));
            }
        }

        let execution = self
            .executions
            .get(execution_id)
            .ok_or(Error::UnknownExecution(execution_id))?;

        let mut report = IngestReport::default();
        for sample in batch {
            match self.aggregator.ingest(sample)? {
                Applied::Merged => report.applied += 1,
                Applied::Discarded => report.discarded += 1,
            }
        }
        tracing::debug!(
            execution_id = %execution_id,
            node = %node,
            applied = report.applied,
            discarded = report.discarded,
            "ingested batch"
        );

        if report.applied > 0 {
            self.follow_samples(&execution);
        }
        Ok(report)
    }

    // The first sample marks an execution running; a total reporting `finish` completes it.
    fn follow_samples(&self, execution: &Execution) {
        let id = execution.id;
        if execution.status == ExecutionStatus::Pending {
            self.follow(id, ExecutionStatus::Running);
        }

        let finished = self.aggregator.summary_total(id).is_some_and(|s| s.finish);
        let running = self
            .executions
            .get(id)
            .is_some_and(|e| e.status == ExecutionStatus::Running);
        if finished && running {
            self.follow(id, ExecutionStatus::Completed);
        }
    }

    // Concurrent batches may race to the same transition; the loser is a no-op.
    fn follow(&self, id: ExecutionId, next: ExecutionStatus) {
        if let Err(e) = self.transition(id, next) {
            tracing::debug!(execution_id = %id, to = %next, error = %e, "transition skipped");
        }
    }

    pub fn summary_total(&self, id: ExecutionId) -> Option<MergedSampleSummary> {
        self.aggregator.summary_total(id)
    }

    pub fn latest(&self, id: ExecutionId, sample_name: &str) -> Option<MergedSampleSummary> {
        self.aggregator.latest(id, sample_name)
    }

    pub fn latest_by_ramp_stage(
        &self,
        id: ExecutionId,
        sample_name: &str,
    ) -> Vec<MergedSampleSummary> {
        self.aggregator.latest_by_ramp_stage(id, sample_name)
    }

    pub fn sample_names(&self, id: ExecutionId) -> Vec<String> {
        self.aggregator.sample_names(id)
    }

    /// Two-decimal completion percentage of the execution's target.
    pub fn progress(&self, id: ExecutionId) -> Result<String> {
        let execution = self.known(id)?;
        Ok(format_progress(
            &execution.target,
            self.summary_total(id).as_ref(),
        ))
    }

    pub fn progress_percent(&self, id: ExecutionId) -> Result<f64> {
        let execution = self.known(id)?;
        Ok(progress_percent(
            &execution.target,
            self.summary_total(id).as_ref(),
        ))
    }

    pub fn elapsed(&self, id: ExecutionId) -> Result<String> {
        self.ensure_known(id)?;
        Ok(elapsed_display(self.summary_total(id).as_ref()))
    }

    pub fn verdict(&self, id: ExecutionId, criteria: &[Criterion]) -> Result<Verdict> {
        self.ensure_known(id)?;
        Ok(evaluate(self.summary_total(id).as_ref(), criteria))
    }

    /// Forgets an execution and its summaries. A still-active execution is stopped first.
    pub fn archive(&self, id: ExecutionId) -> Result<usize> {
        let execution = self.known(id)?;
        if !execution.status.is_terminal() {
            self.transition(id, ExecutionStatus::Stopped)?;
        }
        self.executions.remove(id);
        let removed = self.aggregator.remove_execution(id);
        tracing::info!(execution_id = %id, summaries = removed, "execution archived");
        Ok(removed)
    }

    fn known(&self, id: ExecutionId) -> Result<Execution> {
        self.executions.get(id).ok_or(Error::UnknownExecution(id))
    }

    fn ensure_known(&self, id: ExecutionId) -> Result<()> {
        if self.executions.contains(id) {
            Ok(())
        } else {
            Err(Error::UnknownExecution(id))
        }
    }
}

#[async_trait]
impl ExecutionLauncher for TelemetryService {
    async fn create_execution(&self, request: LaunchRequest) -> Result<ExecutionId> {
        tracing::debug!(
            schedule_id = %request.schedule_id,
            kind = %request.kind,
            "launching scheduled execution"
        );
        self.launch(request.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{Target, TenantId};
    use crate::quota::QuotaConfig;

    fn service(limit: u64) -> TelemetryService {
        TelemetryService::new(Arc::new(QuotaGuard::new(QuotaConfig {
            default_max_running: limit,
            ..QuotaConfig::default()
        })))
    }

    fn launch(svc: &TelemetryService, iterations: u64) -> ExecutionId {
        svc.launch(ExecutionConfig::new(
            "acme",
            "checkout",
            Target::Iterations(iterations),
        ))
        .unwrap_or_else(|e| panic!("{e}"))
    }

    fn sample(exec: ExecutionId, node: &str, ts: u64, iterations: u64) -> RawSample {
        let mut s = RawSample::new(exec, node, "checkout", ts);
        s.counters.iterations = iterations;
        s.counters.transactions = iterations;
        s.counters.operations = iterations;
        s.duration_secs = ts as f64;
        s
    }

    #[test]
    fn launch_admits_and_terminal_transition_releases_once() {
        let svc = service(1);
        let tenant = TenantId::from("acme");
        let id = launch(&svc, 10);

        assert!(matches!(
            svc.launch(ExecutionConfig::new("acme", "x", Target::Iterations(1))),
            Err(Error::QuotaExceeded { .. })
        ));

        svc.transition(id, ExecutionStatus::Stopped)
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(svc.quota().running(&tenant), 0);
        assert!(svc.transition(id, ExecutionStatus::Failed).is_err());
        assert_eq!(svc.quota().running(&tenant), 0);
    }

    #[test]
    fn invalid_config_never_takes_a_slot() {
        let svc = service(1);
        assert!(matches!(
            svc.launch(ExecutionConfig::new("acme", "x", Target::Iterations(0))),
            Err(Error::InvalidTarget)
        ));
        assert_eq!(svc.quota().running(&TenantId::from("acme")), 0);
    }

    #[test]
    fn mixed_or_invalid_batches_apply_nothing() {
        let svc = service(5);
        let a = launch(&svc, 10);
        let b = launch(&svc, 10);

        let err = svc
            .ingest(vec![sample(a, "n1", 1, 1), sample(b, "n1", 1, 1)])
            .err()
            .unwrap_or_else(|| panic!("expected mixed batch"));
        assert!(matches!(err, Error::MixedBatch { .. }));

        let err = svc
            .ingest(vec![sample(a, "n1", 1, 1), sample(a, "n2", 1, 1)])
            .err()
            .unwrap_or_else(|| panic!("expected mixed batch"));
        assert!(matches!(err, Error::MixedBatch { .. }));

        let mut bad = sample(a, "n1", 2, 1);
        bad.duration_secs = f64::NAN;
        let err = svc
            .ingest(vec![sample(a, "n1", 1, 1), bad])
            .err()
            .unwrap_or_else(|| panic!("expected invalid sample"));
        assert!(err.is_validation());

        assert!(svc.summary_total(a).is_none());
        assert!(matches!(
            svc.ingest(vec![sample(ExecutionId::generate(), "n1", 1, 1)]),
            Err(Error::UnknownExecution(_))
        ));
    }

    #[test]
    fn ingest_drives_progress_and_status() {
        let svc = service(5);
        let id = launch(&svc, 100);
        assert_eq!(svc.progress(id).unwrap_or_else(|e| panic!("{e}")), "0");

        let report = svc
            .ingest(vec![sample(id, "n1", 1, 20), sample(id, "n1", 2, 30)])
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(report, IngestReport { applied: 2, discarded: 0 });
        assert_eq!(
            svc.execution(id).map(|e| e.status),
            Some(ExecutionStatus::Running)
        );

        let report = svc
            .ingest(vec![sample(id, "n1", 2, 99)])
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(report.discarded, 1);
        assert_eq!(svc.progress(id).unwrap_or_else(|e| panic!("{e}")), "30.00");

        let mut last = sample(id, "n2", 3, 70);
        last.finish = true;
        svc.ingest(vec![last]).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(svc.progress(id).unwrap_or_else(|e| panic!("{e}")), "100.00");
        // n1 has not finished yet.
        assert_eq!(
            svc.execution(id).map(|e| e.status),
            Some(ExecutionStatus::Running)
        );

        let mut done = sample(id, "n1", 4, 30);
        done.finish = true;
        svc.ingest(vec![done]).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(
            svc.execution(id).map(|e| e.status),
            Some(ExecutionStatus::Completed)
        );
        assert_eq!(svc.quota().running(&TenantId::from("acme")), 0);
    }

    #[test]
    fn archive_forgets_summaries() {
        let svc = service(5);
        let id = launch(&svc, 10);
        svc.ingest(vec![sample(id, "n1", 1, 1)])
            .unwrap_or_else(|e| panic!("{e}"));

        assert_eq!(svc.archive(id).unwrap_or_else(|e| panic!("{e}")), 1);
        assert!(svc.execution(id).is_none());
        assert!(svc.summary_total(id).is_none());
        assert_eq!(svc.quota().running(&TenantId::from("acme")), 0);
        assert!(matches!(svc.progress(id), Err(Error::UnknownExecution(_))));
        assert!(matches!(svc.elapsed(id), Err(Error::UnknownExecution(_))));
        assert!(matches!(svc.verdict(id, &[]), Err(Error::UnknownExecution(_))));
    }
}
