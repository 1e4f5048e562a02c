use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::error::{Error, QuotaScope, Result};
use crate::execution::TenantId;

/// Admission seam consumed by launchers.
pub trait QuotaCollaborator: Send + Sync {
    fn try_admit(&self, tenant: &TenantId, delta: u64) -> bool;
    fn release(&self, tenant: &TenantId, delta: u64);
}

#[derive(Debug, Clone, Default)]
pub struct QuotaConfig {
    pub default_max_running: u64,
    /// Ceiling for tenants listed in `trial_tenants` (unless overridden per tenant).
    pub trial_max_running: Option<u64>,
    /// Bound on the sum of running executions across every tenant.
    pub global_max_running: Option<u64>,
    pub trial_tenants: HashSet<TenantId>,
    pub tenants: HashMap<TenantId, u64>,
}

impl QuotaConfig {
    pub fn limit_for(&self, tenant: &TenantId) -> u64 {
        if let Some(limit) = self.tenants.get(tenant) {
            return *limit;
        }
        match self.trial_max_running {
            Some(trial) if self.trial_tenants.contains(tenant) => trial,
            _ => self.default_max_running,
        }
    }
}

/// Per-tenant running-execution counters with race-free admission.
///
/// Each admission is a compare-and-increment against the limit, so concurrent callers at
/// the limit cannot both pass.
#[derive(Debug, Default)]
pub struct QuotaGuard {
    config: QuotaConfig,
    running: DashMap<TenantId, Arc<AtomicU64>>,
    global: AtomicU64,
}

impl QuotaGuard {
    pub fn new(config: QuotaConfig) -> Self {
        Self {
            config,
            running: DashMap::new(),
            global: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    pub fn admit(&self, tenant: &TenantId, delta: u64) -> Result<()> {
        if delta == 0 {
            return Ok(());
        }

        let limit = self.config.limit_for(tenant);
        let counter = self.counter(tenant);
        if !try_reserve(&counter, delta, limit) {
            tracing::debug!(%tenant, limit, "tenant quota exhausted");
            return Err(Error::QuotaExceeded {
                tenant: tenant.clone(),
                scope: QuotaScope::Tenant,
                limit,
            });
        }

        let global_limit = self.config.global_max_running.unwrap_or(u64::MAX);
        if !try_reserve(&self.global, delta, global_limit) {
            // Roll back the tenant reservation; the tenant never observably exceeded it.
            saturating_release(&counter, delta);
            tracing::debug!(%tenant, limit = global_limit, "global quota exhausted");
            return Err(Error::QuotaExceeded {
                tenant: tenant.clone(),
                scope: QuotaScope::Global,
                limit: global_limit,
            });
        }

        tracing::debug!(%tenant, delta, "admitted");
        Ok(())
    }

    pub fn running(&self, tenant: &TenantId) -> u64 {
        self.running
            .get(tenant)
            .map_or(0, |c| c.load(Ordering::Acquire))
    }

    pub fn global_running(&self) -> u64 {
        self.global.load(Ordering::Acquire)
    }

    fn counter(&self, tenant: &TenantId) -> Arc<AtomicU64> {
        if let Some(c) = self.running.get(tenant) {
            return c.value().clone();
        }
        self.running.entry(tenant.clone()).or_default().value().clone()
    }
}

impl QuotaCollaborator for QuotaGuard {
    fn try_admit(&self, tenant: &TenantId, delta: u64) -> bool {
        self.admit(tenant, delta).is_ok()
    }

    fn release(&self, tenant: &TenantId, delta: u64) {
        let Some(counter) = self.running.get(tenant).map(|c| c.value().clone()) else {
            return;
        };
        let released = saturating_release(&counter, delta);
        saturating_release(&self.global, released);
        tracing::debug!(%tenant, released, "released");
    }
}

impl<T: QuotaCollaborator + ?Sized> QuotaCollaborator for Arc<T> {
    fn try_admit(&self, tenant: &TenantId, delta: u64) -> bool {
        (**self).try_admit(tenant, delta)
    }

    fn release(&self, tenant: &TenantId, delta: u64) {
        (**self).release(tenant, delta)
    }
}

fn try_reserve(counter: &AtomicU64, delta: u64, limit: u64) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
            cur.checked_add(delta).filter(|next| *next <= limit)
        })
        .is_ok()
}

/// Subtracts up to `delta`, never below zero. Returns the amount actually subtracted.
fn saturating_release(counter: &AtomicU64, delta: u64) -> u64 {
    match counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
        Some(cur.saturating_sub(delta))
    }) {
        Ok(prev) | Err(prev) => prev.min(delta),
    }
}
