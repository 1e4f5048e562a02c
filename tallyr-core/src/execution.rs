use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tallyr_metrics::ExecutionId;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TenantId(pub String);

impl From<&str> for TenantId {
    fn from(v: &str) -> Self {
        Self(v.to_string())
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What "done" means for an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Iterations(u64),
    Duration(Duration),
}

impl Target {
    pub fn is_positive(&self) -> bool {
        match self {
            Target::Iterations(n) => *n > 0,
            Target::Duration(d) => !d.is_zero(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RampStep {
    pub duration: Duration,
    /// Threads added (or removed, when negative) when the stage begins.
    pub thread_delta: i64,
}

/// Stepwise ramp-up plan: stage `i` holds `start + sum(delta[0..=i])` threads, which
/// must stay at least 1 throughout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RampPlan {
    steps: Vec<RampStep>,
}

impl RampPlan {
    pub fn new(start: u64, steps: Vec<RampStep>) -> Result<Self> {
        let mut cur = start as i128;
        for (index, step) in steps.iter().enumerate() {
            if step.duration.is_zero() {
                return Err(Error::InvalidRampStage {
                    index,
                    reason: "duration must be positive",
                });
            }
            cur += step.thread_delta as i128;
            if cur < 1 {
                return Err(Error::InvalidRampStage {
                    index,
                    reason: "thread count would drop below 1",
                });
            }
        }

        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[RampStep] {
        &self.steps
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionConfig {
    pub tenant: TenantId,
    pub name: String,
    pub target: Option<Target>,
    pub threads: u64,
    pub ramp: Vec<RampStep>,
}

impl ExecutionConfig {
    pub fn new(tenant: impl Into<TenantId>, name: impl Into<String>, target: Target) -> Self {
        Self {
            tenant: tenant.into(),
            name: name.into(),
            target: Some(target),
            threads: 1,
            ramp: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_threads(mut self, threads: u64) -> Self {
        self.threads = threads;
        self
    }

    pub fn validate(&self) -> Result<(Target, RampPlan)> {
        if self.tenant.0.trim().is_empty() {
            return Err(Error::InvalidTenant);
        }
        let target = self
            .target
            .filter(Target::is_positive)
            .ok_or(Error::InvalidTarget)?;
        if self.threads == 0 {
            return Err(Error::InvalidThreads);
        }
        let ramp = RampPlan::new(self.threads, self.ramp.clone())?;
        Ok((target, ramp))
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::AsRefStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Running | Self::Failed | Self::Stopped),
            Self::Running => next.is_terminal(),
            Self::Completed | Self::Failed | Self::Stopped => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Execution {
    pub id: ExecutionId,
    pub tenant: TenantId,
    pub name: String,
    pub target: Target,
    pub threads: u64,
    pub ramp: RampPlan,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
}

impl Execution {
    /// Validates `config`; a zero or missing target never produces an execution.
    pub fn new(config: ExecutionConfig) -> Result<Self> {
        let (target, ramp) = config.validate()?;
        Ok(Self {
            id: ExecutionId::generate(),
            tenant: config.tenant,
            name: config.name,
            target,
            threads: config.threads,
            ramp,
            status: ExecutionStatus::Pending,
            created_at: Utc::now(),
        })
    }
}

#[derive(Debug, Default)]
pub struct ExecutionRegistry {
    executions: DashMap<ExecutionId, Execution>,
}

impl ExecutionRegistry {
    pub fn insert(&self, execution: Execution) {
        self.executions.insert(execution.id, execution);
    }

    pub fn get(&self, id: ExecutionId) -> Option<Execution> {
        self.executions.get(&id).map(|e| e.value().clone())
    }

    pub fn contains(&self, id: ExecutionId) -> bool {
        self.executions.contains_key(&id)
    }

    /// Moves `id` to `next`, returning the previous status.
    pub fn transition(&self, id: ExecutionId, next: ExecutionStatus) -> Result<ExecutionStatus> {
        let mut entry = self
            .executions
            .get_mut(&id)
            .ok_or(Error::UnknownExecution(id))?;

        let from = entry.status;
        if !from.can_transition_to(next) {
            return Err(Error::InvalidTransition { id, from, to: next });
        }
        entry.status = next;
        Ok(from)
    }

    pub fn remove(&self, id: ExecutionId) -> Option<Execution> {
        self.executions.remove(&id).map(|(_, e)| e)
    }

    pub fn len(&self) -> usize {
        self.executions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }
}
