use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tallyr_metrics::ExecutionId;

use super::types::{Lease, NewSchedule, ScheduleId, ScheduleStatus, ScheduledEntity, Trigger};
use crate::error::{Error, Result};

/// Conditional claim of one row selected by a tick.
///
/// Succeeds only while the row still has the selected status and `next_run_at` and no
/// live lease exists.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub id: ScheduleId,
    pub expected_status: ScheduleStatus,
    pub expected_next_run_at: Option<DateTime<Utc>>,
    pub owner: String,
    pub now: DateTime<Utc>,
    pub lease_until: DateTime<Utc>,
}

impl ClaimRequest {
    pub fn for_snapshot(
        entity: &ScheduledEntity,
        owner: impl Into<String>,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Self {
        Self {
            id: entity.id,
            expected_status: entity.status,
            expected_next_run_at: entity.next_run_at,
            owner: owner.into(),
            now,
            lease_until,
        }
    }
}

/// Outcome written back by the lease holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Fired {
        run_id: ExecutionId,
        at: DateTime<Utc>,
        /// Next occurrence for periodic rows; ignored for one-shot rows.
        next_run_at: Option<DateTime<Utc>>,
    },
    Failed {
        message: String,
        at: DateTime<Utc>,
    },
}

impl Completion {
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            Completion::Fired { at, .. } | Completion::Failed { at, .. } => *at,
        }
    }
}

/// Persistence seam for scheduled monitors and reports.
///
/// `claim` and `complete` must each be a single atomic conditional write.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn insert(&self, new: NewSchedule, now: DateTime<Utc>) -> Result<ScheduleId>;
    async fn get(&self, id: ScheduleId) -> Result<ScheduledEntity>;
    async fn list(&self) -> Result<Vec<ScheduledEntity>>;
    async fn delete(&self, id: ScheduleId) -> Result<bool>;

    /// Due, unleased rows ordered by `next_run_at`, at most `limit`.
    async fn find_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduledEntity>>;
    async fn claim(&self, request: &ClaimRequest) -> Result<bool>;
    /// Applies `completion` if `owner` still holds a lease that is live at the completion
    /// time; returns whether it did.
    async fn complete(&self, id: ScheduleId, owner: &str, completion: Completion) -> Result<bool>;
    /// Drops every lease that expired at or before `now`.
    async fn release_expired(&self, now: DateTime<Utc>) -> Result<usize>;

    /// Failed periodic row back to `Pending` with a fresh `next_run_at`.
    async fn rearm(&self, id: ScheduleId, now: DateTime<Utc>) -> Result<()>;
    /// Failed one-shot row back to `Pending`.
    async fn retry(&self, id: ScheduleId) -> Result<()>;
}

/// Builds the initial row for `new`.
pub(crate) fn materialize(new: NewSchedule, now: DateTime<Utc>) -> Result<ScheduledEntity> {
    if new.name.trim().is_empty() {
        return Err(Error::InvalidSchedule("`name` must be a non-empty string".to_string()));
    }
    if new.tenant != new.template.tenant {
        return Err(Error::InvalidSchedule(format!(
            "tenant `{}` does not match the launch template tenant `{}`",
            new.tenant, new.template.tenant
        )));
    }
    new.template.validate()?;

    let next_run_at = match &new.trigger {
        Trigger::Now => new.run_at,
        Trigger::AtSomeDate => Some(new.run_at.ok_or_else(|| {
            Error::InvalidSchedule("`AtSomeDate` schedules need a run time".to_string())
        })?),
        Trigger::Periodically(recurrence) => {
            recurrence.validate()?;
            match new.run_at {
                Some(at) => Some(at),
                None => Some(recurrence.first_after(now)?),
            }
        }
    };

    Ok(ScheduledEntity {
        id: ScheduleId::generate(),
        kind: new.kind,
        tenant: new.tenant,
        name: new.name,
        status: ScheduleStatus::Pending,
        trigger: new.trigger,
        next_run_at,
        last_run_id: None,
        last_run_at: None,
        failure_message: None,
        template: new.template,
        lease: None,
    })
}

/// In-process [`ScheduleStore`]. Clones share the same rows.
#[derive(Debug, Clone, Default)]
pub struct MemoryScheduleStore {
    rows: Arc<Mutex<HashMap<ScheduleId, ScheduledEntity>>>,
}

impl MemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }
}

#[async_trait]
impl ScheduleStore for MemoryScheduleStore {
    async fn insert(&self, new: NewSchedule, now: DateTime<Utc>) -> Result<ScheduleId> {
        let entity = materialize(new, now)?;
        let id = entity.id;
        tracing::debug!(
            schedule_id = %id,
            tenant = %entity.tenant,
            name = %entity.name,
            "schedule inserted"
        );
        self.rows.lock().insert(id, entity);
        Ok(id)
    }

    async fn get(&self, id: ScheduleId) -> Result<ScheduledEntity> {
        self.rows
            .lock()
            .get(&id)
            .cloned()
            .ok_or(Error::UnknownSchedule(id))
    }

    async fn list(&self) -> Result<Vec<ScheduledEntity>> {
        let mut rows: Vec<_> = self.rows.lock().values().cloned().collect();
        rows.sort_by(|a, b| (&a.tenant, &a.name, a.id).cmp(&(&b.tenant, &b.name, b.id)));
        Ok(rows)
    }

    async fn delete(&self, id: ScheduleId) -> Result<bool> {
        Ok(self.rows.lock().remove(&id).is_some())
    }

    async fn find_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduledEntity>> {
        let mut due: Vec<_> = self
            .rows
            .lock()
            .values()
            .filter(|row| row.is_due(now) && !row.is_leased(now))
            .cloned()
            .collect();
        due.sort_by_key(|row| (row.next_run_at, row.id));
        due.truncate(limit);
        Ok(due)
    }

    async fn claim(&self, request: &ClaimRequest) -> Result<bool> {
        let mut rows = self.rows.lock();
        let Some(row) = rows.get_mut(&request.id) else {
            return Ok(false);
        };

        if row.status != request.expected_status
            || row.next_run_at != request.expected_next_run_at
            || row.is_leased(request.now)
        {
            return Ok(false);
        }

        row.lease = Some(Lease {
            owner: request.owner.clone(),
            expires_at: request.lease_until,
        });
        Ok(true)
    }

    async fn complete(&self, id: ScheduleId, owner: &str, completion: Completion) -> Result<bool> {
        let mut rows = self.rows.lock();
        let Some(row) = rows.get_mut(&id) else {
            return Ok(false);
        };
        let at = completion.at();
        if row
            .lease
            .as_ref()
            .is_none_or(|l| l.owner != owner || !l.is_live(at))
        {
            return Ok(false);
        }

        match completion {
            Completion::Fired {
                run_id,
                at,
                next_run_at,
            } => {
                row.status = ScheduleStatus::Success;
                row.last_run_id = Some(run_id);
                row.last_run_at = Some(at);
                row.failure_message = None;
                if row.trigger.is_periodic() {
                    row.next_run_at = next_run_at;
                }
            }
            Completion::Failed { message, at } => {
                row.status = ScheduleStatus::Failure;
                row.last_run_at = Some(at);
                row.failure_message = Some(message);
            }
        }
        row.lease = None;
        Ok(true)
    }

    async fn release_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut released = 0;
        for row in self.rows.lock().values_mut() {
            if row.lease.as_ref().is_some_and(|l| !l.is_live(now)) {
                tracing::warn!(schedule_id = %row.id, "lease expired; row is claimable again");
                row.lease = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn rearm(&self, id: ScheduleId, now: DateTime<Utc>) -> Result<()> {
        let mut rows = self.rows.lock();
        let row = rows.get_mut(&id).ok_or(Error::UnknownSchedule(id))?;
        let Trigger::Periodically(recurrence) = &row.trigger else {
            return Err(Error::InvalidSchedule(format!(
                "schedule `{id}` is not periodic; use retry"
            )));
        };
        if row.status != ScheduleStatus::Failure {
            return Err(Error::InvalidSchedule(format!(
                "schedule `{id}` is `{}`; only failed schedules can be rearmed",
                row.status
            )));
        }

        row.next_run_at = Some(recurrence.first_after(now)?);
        row.status = ScheduleStatus::Pending;
        row.failure_message = None;
        row.lease = None;
        Ok(())
    }

    async fn retry(&self, id: ScheduleId) -> Result<()> {
        let mut rows = self.rows.lock();
        let row = rows.get_mut(&id).ok_or(Error::UnknownSchedule(id))?;
        if row.trigger.is_periodic() {
            return Err(Error::InvalidSchedule(format!(
                "schedule `{id}` is periodic; use rearm"
            )));
        }
        if row.status != ScheduleStatus::Failure {
            return Err(Error::InvalidSchedule(format!(
                "schedule `{id}` is `{}`; only failed schedules can be retried",
                row.status
            )));
        }

        row.status = ScheduleStatus::Pending;
        row.failure_message = None;
        row.lease = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;
    use crate::execution::{ExecutionConfig, Target};
    use crate::schedule::{EntityKind, Recurrence};

    fn template() -> ExecutionConfig {
        ExecutionConfig::new("acme", "checkout", Target::Iterations(10))
    }

    fn secs(n: i64) -> TimeDelta {
        TimeDelta::seconds(n)
    }

    async fn insert(
        store: &MemoryScheduleStore,
        new: NewSchedule,
        now: DateTime<Utc>,
    ) -> ScheduleId {
        store.insert(new, now).await.unwrap_or_else(|e| panic!("{e}"))
    }

    #[tokio::test]
    async fn insert_validates_triggers_and_template() {
        let store = MemoryScheduleStore::new();
        let now = Utc::now();

        let missing_date =
            NewSchedule::new(EntityKind::Report, "r", Trigger::AtSomeDate, template());
        assert!(matches!(
            store.insert(missing_date, now).await,
            Err(Error::InvalidSchedule(_))
        ));

        let bad_cron = NewSchedule::new(
            EntityKind::Monitor,
            "m",
            Trigger::Periodically(Recurrence::Cron("every tuesday".to_string())),
            template(),
        );
        assert!(matches!(
            store.insert(bad_cron, now).await,
            Err(Error::InvalidCron { .. })
        ));

        let mut bad_target = template();
        bad_target.target = None;
        let bad = NewSchedule::new(EntityKind::Monitor, "m", Trigger::Now, bad_target);
        assert!(matches!(store.insert(bad, now).await, Err(Error::InvalidTarget)));

        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn periodic_insert_computes_first_run() {
        let store = MemoryScheduleStore::new();
        let now = Utc::now();
        let every = Trigger::Periodically(Recurrence::Every(std::time::Duration::from_secs(30)));
        let id = insert(
            &store,
            NewSchedule::new(EntityKind::Monitor, "m", every, template()),
            now,
        )
        .await;

        let row = store.get(id).await.unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(row.next_run_at, Some(now + secs(30)));
        assert_eq!(row.status, ScheduleStatus::Pending);
    }

    #[tokio::test]
    async fn claim_is_conditional_on_snapshot_and_lease() {
        let store = MemoryScheduleStore::new();
        let now = Utc::now();
        let id = insert(
            &store,
            NewSchedule::new(EntityKind::Report, "r", Trigger::AtSomeDate, template())
                .at(now - secs(5)),
            now,
        )
        .await;

        let due = store.find_due(now, 10).await.unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(due.len(), 1);

        let first = ClaimRequest::for_snapshot(&due[0], "a", now, now + secs(60));
        let second = ClaimRequest::for_snapshot(&due[0], "b", now, now + secs(60));
        assert!(store.claim(&first).await.unwrap_or_else(|e| panic!("{e}")));
        assert!(!store.claim(&second).await.unwrap_or_else(|e| panic!("{e}")));

        // Leased rows are not selected again.
        assert!(store
            .find_due(now, 10)
            .await
            .unwrap_or_else(|e| panic!("{e}"))
            .is_empty());

        // Only the lease holder may complete.
        let fired = Completion::Fired {
            run_id: ExecutionId::generate(),
            at: now,
            next_run_at: None,
        };
        assert!(!store.complete(id, "b", fired.clone()).await.unwrap_or_else(|e| panic!("{e}")));
        assert!(store.complete(id, "a", fired).await.unwrap_or_else(|e| panic!("{e}")));

        let row = store.get(id).await.unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(row.status, ScheduleStatus::Success);
        assert!(row.lease.is_none());
        assert!(!row.is_due(now + secs(3600)));
    }

    #[tokio::test]
    async fn expired_leases_are_released() {
        let store = MemoryScheduleStore::new();
        let now = Utc::now();
        let id = insert(
            &store,
            NewSchedule::new(EntityKind::Monitor, "m", Trigger::Now, template()),
            now,
        )
        .await;

        let row = store.get(id).await.unwrap_or_else(|e| panic!("{e}"));
        let claim = ClaimRequest::for_snapshot(&row, "crashed", now, now + secs(10));
        assert!(store.claim(&claim).await.unwrap_or_else(|e| panic!("{e}")));

        let later = now + secs(5);
        assert_eq!(store.release_expired(later).await.unwrap_or_else(|e| panic!("{e}")), 0);
        assert!(store.find_due(later, 10).await.unwrap_or_else(|e| panic!("{e}")).is_empty());

        let after_expiry = now + secs(11);
        assert_eq!(
            store
                .release_expired(after_expiry)
                .await
                .unwrap_or_else(|e| panic!("{e}")),
            1
        );
        let due = store
            .find_due(after_expiry, 10)
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(due.len(), 1);
        assert!(due[0].lease.is_none());
    }

    #[tokio::test]
    async fn completion_after_lease_expiry_is_rejected() {
        let store = MemoryScheduleStore::new();
        let now = Utc::now();
        let id = insert(
            &store,
            NewSchedule::new(EntityKind::Report, "r", Trigger::Now, template()),
            now,
        )
        .await;

        let row = store.get(id).await.unwrap_or_else(|e| panic!("{e}"));
        let claim = ClaimRequest::for_snapshot(&row, "a", now, now + secs(10));
        assert!(store.claim(&claim).await.unwrap_or_else(|e| panic!("{e}")));

        let late = Completion::Fired {
            run_id: ExecutionId::generate(),
            at: now + secs(10),
            next_run_at: None,
        };
        assert!(!store.complete(id, "a", late).await.unwrap_or_else(|e| panic!("{e}")));

        // The row is untouched and the stale lease is left for the sweep.
        let row = store.get(id).await.unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(row.status, ScheduleStatus::Pending);
        assert!(row.last_run_id.is_none());
        assert_eq!(
            store
                .release_expired(now + secs(10))
                .await
                .unwrap_or_else(|e| panic!("{e}")),
            1
        );
    }

    #[tokio::test]
    async fn rearm_and_retry_only_apply_to_failed_rows() {
        let store = MemoryScheduleStore::new();
        let now = Utc::now();
        let every = Trigger::Periodically(Recurrence::Every(std::time::Duration::from_secs(60)));
        let periodic = insert(
            &store,
            NewSchedule::new(EntityKind::Monitor, "m", every, template()).at(now - secs(1)),
            now,
        )
        .await;
        let once = insert(
            &store,
            NewSchedule::new(EntityKind::Report, "r", Trigger::Now, template()),
            now,
        )
        .await;

        assert!(matches!(
            store.rearm(periodic, now).await,
            Err(Error::InvalidSchedule(_))
        ));
        assert!(matches!(store.retry(periodic).await, Err(Error::InvalidSchedule(_))));
        assert!(matches!(store.rearm(once, now).await, Err(Error::InvalidSchedule(_))));

        for id in [periodic, once] {
            let row = store.get(id).await.unwrap_or_else(|e| panic!("{e}"));
            let claim = ClaimRequest::for_snapshot(&row, "s", now, now + secs(60));
            assert!(store.claim(&claim).await.unwrap_or_else(|e| panic!("{e}")));
            let failed = Completion::Failed {
                message: "boom".to_string(),
                at: now,
            };
            assert!(store.complete(id, "s", failed).await.unwrap_or_else(|e| panic!("{e}")));
        }
        assert!(store.find_due(now, 10).await.unwrap_or_else(|e| panic!("{e}")).is_empty());

        let later = now + secs(90);
        store.rearm(periodic, later).await.unwrap_or_else(|e| panic!("{e}"));
        store.retry(once).await.unwrap_or_else(|e| panic!("{e}"));

        let row = store.get(periodic).await.unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(row.status, ScheduleStatus::Pending);
        assert_eq!(row.next_run_at, Some(later + secs(60)));
        assert_eq!(row.failure_message, None);

        let due = store.find_due(later, 10).await.unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, once);
    }
}
