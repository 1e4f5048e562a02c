//! Background loop that fires due monitors and reports.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::launcher::{ExecutionLauncher, LaunchRequest};
use super::store::{ClaimRequest, Completion, ScheduleStore};
use super::types::{ScheduledEntity, Trigger};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    /// Rows selected per tick.
    pub batch_size: usize,
    /// How long a claim stays exclusive. Must exceed `dispatch_timeout`.
    pub lease_ttl: Duration,
    pub dispatch_timeout: Duration,
    /// Lease owner written on claimed rows; unique per scheduler instance.
    pub owner: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
            lease_ttl: Duration::from_secs(60),
            dispatch_timeout: Duration::from_secs(30),
            owner: format!("scheduler-{}", Uuid::new_v4()),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(Error::InvalidSchedulerConfig(msg.to_string()));
        if self.batch_size == 0 {
            return invalid("`batchSize` must be positive");
        }
        if self.poll_interval.is_zero() {
            return invalid("`pollInterval` must be positive");
        }
        if self.dispatch_timeout.is_zero() {
            return invalid("`dispatchTimeout` must be positive");
        }
        if self.lease_ttl <= self.dispatch_timeout {
            return invalid("`leaseTtl` must exceed `dispatchTimeout`");
        }
        if TimeDelta::from_std(self.lease_ttl).is_err() {
            return invalid("`leaseTtl` is too large");
        }
        if self.owner.trim().is_empty() {
            return invalid("`owner` must be a non-empty string");
        }
        Ok(())
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Expired leases swept back to claimable.
    pub released: usize,
    pub selected: usize,
    pub claimed: usize,
    /// Selected rows another instance claimed first.
    pub lost: usize,
    pub dispatched: usize,
    pub failed: usize,
}

pub struct DueScheduler<S, L> {
    store: S,
    launcher: L,
    config: SchedulerConfig,
    lease_ttl: TimeDelta,
}

impl<S, L> DueScheduler<S, L>
where
    S: ScheduleStore,
    L: ExecutionLauncher,
{
    pub fn new(store: S, launcher: L, config: SchedulerConfig) -> Result<Self> {
        config.validate()?;
        let lease_ttl = TimeDelta::from_std(config.lease_ttl)
            .map_err(|e| Error::InvalidSchedulerConfig(e.to_string()))?;
        Ok(Self {
            store,
            launcher,
            config,
            lease_ttl,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Ticks every `poll_interval` until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        self.run_ticks(shutdown, None).await;
    }

    /// Like [`DueScheduler::run`], stopping after `max_ticks` ticks when given. Returns
    /// the number of ticks performed.
    pub async fn run_ticks(&self, shutdown: CancellationToken, max_ticks: Option<u64>) -> u64 {
        info!(
            owner = %self.config.owner,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "scheduler started"
        );

        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut ticks = 0u64;

        loop {
            if max_ticks.is_some_and(|max| ticks >= max) {
                break;
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    ticks += 1;
                    match self.tick(Utc::now()).await {
                        Ok(report) if report.selected > 0 || report.released > 0 => {
                            debug!(?report, "scheduler tick");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "scheduler tick failed"),
                    }
                }
            }
        }

        info!(owner = %self.config.owner, ticks, "scheduler stopped");
        ticks
    }

    /// One pass: sweep expired leases, select due rows, claim and fire each.
    ///
    /// Rows are fired one after another, so each claim takes its lease from the clock at
    /// claim time rather than from `now`. Only store failures while sweeping or selecting
    /// are returned; a failing row is recorded on the row and the tick moves on.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let started = Instant::now();
        let mut report = TickReport {
            released: self.store.release_expired(now).await?,
            ..TickReport::default()
        };

        let due = self.store.find_due(now, self.config.batch_size).await?;
        report.selected = due.len();

        for entity in due {
            let claimed_at = advanced(now, started);
            let lease_until = claimed_at
                .checked_add_signed(self.lease_ttl)
                .unwrap_or(claimed_at);
            let claim =
                ClaimRequest::for_snapshot(&entity, &self.config.owner, claimed_at, lease_until);
            match self.store.claim(&claim).await {
                Ok(true) => report.claimed += 1,
                Ok(false) => {
                    debug!(schedule_id = %entity.id, "claim lost");
                    report.lost += 1;
                    continue;
                }
                Err(e) => {
                    error!(schedule_id = %entity.id, error = %e, "claim failed");
                    report.failed += 1;
                    continue;
                }
            }

            match self.fire(&entity, claimed_at, started, now).await {
                Ok(true) => report.dispatched += 1,
                Ok(false) => report.failed += 1,
                Err(e) => {
                    error!(
                        schedule_id = %entity.id,
                        error = %e,
                        "recording schedule outcome failed"
                    );
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Dispatches a claimed row and writes the outcome. `Ok(true)` when an execution was
    /// created.
    async fn fire(
        &self,
        entity: &ScheduledEntity,
        claimed_at: DateTime<Utc>,
        started: Instant,
        tick_now: DateTime<Utc>,
    ) -> Result<bool> {
        let request = LaunchRequest {
            schedule_id: entity.id,
            kind: entity.kind,
            config: entity.template.clone(),
        };

        let timeout = self.config.dispatch_timeout;
        let launched = tokio::time::timeout(timeout, self.launcher.create_execution(request))
            .await
            .unwrap_or_else(|_| Err(Error::DispatchTimeout(timeout)));
        let now = advanced(tick_now, started);

        let (completion, fired) = match launched {
            Ok(run_id) => match next_run_at(entity, claimed_at) {
                Ok(next_run_at) => {
                    info!(
                        schedule_id = %entity.id,
                        kind = %entity.kind,
                        tenant = %entity.tenant,
                        execution_id = %run_id,
                        "schedule fired"
                    );
                    let completion = Completion::Fired {
                        run_id,
                        at: now,
                        next_run_at,
                    };
                    (completion, true)
                }
                Err(e) => {
                    let message = format!("launched {run_id} but the next run is unknown: {e}");
                    (Completion::Failed { message, at: now }, true)
                }
            },
            Err(e) => {
                if e.is_transient_dispatch() {
                    warn!(
                        schedule_id = %entity.id,
                        tenant = %entity.tenant,
                        error = %e,
                        "schedule dispatch failed"
                    );
                } else {
                    error!(
                        schedule_id = %entity.id,
                        tenant = %entity.tenant,
                        error = %e,
                        "schedule template rejected by the launcher"
                    );
                }
                let completion = Completion::Failed {
                    message: e.to_string(),
                    at: now,
                };
                (completion, false)
            }
        };

        if !self
            .store
            .complete(entity.id, &self.config.owner, completion)
            .await?
        {
            warn!(schedule_id = %entity.id, "lease lost before completion was recorded");
        }
        Ok(fired)
    }
}

/// `now` moved forward by the time elapsed since `started`.
fn advanced(now: DateTime<Utc>, started: Instant) -> DateTime<Utc> {
    TimeDelta::from_std(started.elapsed())
        .ok()
        .and_then(|elapsed| now.checked_add_signed(elapsed))
        .unwrap_or(now)
}

fn next_run_at(entity: &ScheduledEntity, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    match &entity.trigger {
        Trigger::Periodically(recurrence) => {
            let prev = entity.next_run_at.unwrap_or(now);
            recurrence.next_occurrence(prev, now).map(Some)
        }
        Trigger::Now | Trigger::AtSomeDate => Ok(None),
    }
}
