use std::time::Duration;

use tallyr_metrics::{ExecutionId, NodeId, SampleError};

use crate::execution::{ExecutionStatus, TenantId};
use crate::schedule::ScheduleId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum QuotaScope {
    Tenant,
    Global,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid sample: {0}")]
    Sample(#[from] SampleError),

    #[error("`target` must be a positive iteration count or a positive duration")]
    InvalidTarget,

    #[error("`threads` must be a positive integer")]
    InvalidThreads,

    #[error("`tenant` must be a non-empty string")]
    InvalidTenant,

    #[error("ramp stage {index} is invalid: {reason}")]
    InvalidRampStage { index: usize, reason: &'static str },

    #[error("sample batch must target one execution and one node (expected {expected}, got {got})")]
    MixedBatch { expected: String, got: String },

    #[error("unknown execution `{0}`")]
    UnknownExecution(ExecutionId),

    #[error("execution `{id}` cannot move from `{from}` to `{to}`")]
    InvalidTransition {
        id: ExecutionId,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error("invalid criterion `{expr}`: {reason}")]
    InvalidCriterion { expr: String, reason: String },

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("invalid cron expression `{expr}`: {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("unknown schedule `{0}`")]
    UnknownSchedule(ScheduleId),

    #[error("{scope} limit of {limit} running executions reached for tenant `{tenant}`")]
    QuotaExceeded {
        tenant: TenantId,
        scope: QuotaScope,
        limit: u64,
    },

    #[error("admission denied for tenant `{0}`")]
    AdmissionDenied(TenantId),

    #[error("dispatch failed: {0}")]
    Dispatch(String),

    #[error("dispatch timed out after {0:?}")]
    DispatchTimeout(Duration),

    #[error("invalid scheduler config: {0}")]
    InvalidSchedulerConfig(String),
}

impl Error {
    pub(crate) fn mixed_batch(expected: impl ToString, got: impl ToString) -> Self {
        Self::MixedBatch {
            expected: expected.to_string(),
            got: got.to_string(),
        }
    }

    pub(crate) fn node_mismatch(expected: &NodeId, got: &NodeId) -> Self {
        Self::mixed_batch(format!("node {expected}"), format!("node {got}"))
    }

    /// Input rejected at the boundary; nothing was recorded.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Sample(_)
                | Self::InvalidTarget
                | Self::InvalidThreads
                | Self::InvalidTenant
                | Self::InvalidRampStage { .. }
                | Self::MixedBatch { .. }
                | Self::InvalidCriterion { .. }
                | Self::InvalidSchedule(_)
                | Self::InvalidCron { .. }
                | Self::InvalidSchedulerConfig(_)
        )
    }

    /// Launch failures expected in normal operation, such as quota denials or timeouts.
    /// Anything else means the stored template itself is bad.
    pub fn is_transient_dispatch(&self) -> bool {
        matches!(
            self,
            Self::QuotaExceeded { .. }
                | Self::AdmissionDenied(_)
                | Self::Dispatch(_)
                | Self::DispatchTimeout(_)
        )
    }
}
