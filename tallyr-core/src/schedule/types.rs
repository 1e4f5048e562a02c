use std::fmt;

use chrono::{DateTime, Utc};
use tallyr_metrics::ExecutionId;
use uuid::Uuid;

use super::recurrence::Recurrence;
use crate::execution::{ExecutionConfig, TenantId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScheduleId(pub Uuid);

impl ScheduleId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ScheduleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum EntityKind {
    Monitor,
    Report,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ScheduleStatus {
    Pending,
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// Fire on the next tick.
    Now,
    /// Fire once `next_run_at` has passed.
    AtSomeDate,
    Periodically(Recurrence),
}

impl Trigger {
    pub fn is_periodic(&self) -> bool {
        matches!(self, Trigger::Periodically(_))
    }
}

/// Exclusive claim on a row while its dispatch is in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Monitor or report that launches an execution when its trigger comes due.
#[derive(Debug, Clone)]
pub struct ScheduledEntity {
    pub id: ScheduleId,
    pub kind: EntityKind,
    pub tenant: TenantId,
    pub name: String,
    pub status: ScheduleStatus,
    pub trigger: Trigger,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_id: Option<ExecutionId>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub failure_message: Option<String>,
    pub template: ExecutionConfig,
    pub lease: Option<Lease>,
}

impl ScheduledEntity {
    pub fn is_leased(&self, now: DateTime<Utc>) -> bool {
        self.lease.as_ref().is_some_and(|l| l.is_live(now))
    }

    /// Whether the trigger evaluates to "run now", ignoring leases.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        let passed = self.next_run_at.is_some_and(|at| at < now);
        match self.trigger {
            Trigger::Now => self.status == ScheduleStatus::Pending,
            Trigger::AtSomeDate => self.status == ScheduleStatus::Pending && passed,
            Trigger::Periodically(_) => self.status != ScheduleStatus::Failure && passed,
        }
    }
}

/// Insert payload; the store assigns the id and the initial state.
#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub kind: EntityKind,
    pub tenant: TenantId,
    pub name: String,
    pub trigger: Trigger,
    /// Required for `AtSomeDate`; optional first occurrence for periodic rows.
    pub run_at: Option<DateTime<Utc>>,
    pub template: ExecutionConfig,
}

impl NewSchedule {
    pub fn new(
        kind: EntityKind,
        name: impl Into<String>,
        trigger: Trigger,
        template: ExecutionConfig,
    ) -> Self {
        Self {
            kind,
            tenant: template.tenant.clone(),
            name: name.into(),
            trigger,
            run_at: None,
            template,
        }
    }

    #[must_use]
    pub fn at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }
}
