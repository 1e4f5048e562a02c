use std::sync::Arc;

use async_trait::async_trait;
use tallyr_metrics::ExecutionId;

use super::types::{EntityKind, ScheduleId};
use crate::error::{Error, Result};
use crate::execution::ExecutionConfig;
use crate::quota::QuotaCollaborator;

#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub schedule_id: ScheduleId,
    pub kind: EntityKind,
    pub config: ExecutionConfig,
}

/// Creates the execution a due schedule asks for.
///
/// Dispatch is at-most-once. The scheduler drops the returned future once its dispatch
/// timeout passes and records the row as failed, even if the execution was already
/// created. Periodic rows then stay failed until rearmed. Launchers that must not lose
/// such a run can key on [`LaunchRequest::schedule_id`] to find it again.
#[async_trait]
pub trait ExecutionLauncher: Send + Sync {
    async fn create_execution(&self, request: LaunchRequest) -> Result<ExecutionId>;
}

#[async_trait]
impl<L: ExecutionLauncher + ?Sized> ExecutionLauncher for Arc<L> {
    async fn create_execution(&self, request: LaunchRequest) -> Result<ExecutionId> {
        (**self).create_execution(request).await
    }
}

/// Reserves a running slot for the tenant before delegating to `inner`.
///
/// The slot is handed back if `inner` fails; otherwise whoever owns the launched
/// execution releases it when the execution ends.
#[derive(Debug, Clone)]
pub struct AdmittingLauncher<L, Q> {
    inner: L,
    quota: Q,
}

impl<L, Q> AdmittingLauncher<L, Q> {
    pub fn new(inner: L, quota: Q) -> Self {
        Self { inner, quota }
    }

    pub fn inner(&self) -> &L {
        &self.inner
    }
}

#[async_trait]
impl<L, Q> ExecutionLauncher for AdmittingLauncher<L, Q>
where
    L: ExecutionLauncher,
    Q: QuotaCollaborator,
{
    async fn create_execution(&self, request: LaunchRequest) -> Result<ExecutionId> {
        let tenant = request.config.tenant.clone();
        if !self.quota.try_admit(&tenant, 1) {
            return Err(Error::AdmissionDenied(tenant));
        }

        match self.inner.create_execution(request).await {
            Ok(id) => Ok(id),
            Err(e) => {
                self.quota.release(&tenant, 1);
                Err(e)
            }
        }
    }
}
