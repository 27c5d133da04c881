use std::collections::{HashMap, VecDeque};

use crate::job::{JobId, TenantId};

/// Ready queue that serves tenants round-robin, FIFO within a tenant.
#[derive(Debug, Default)]
pub(crate) struct FairQueue {
    per_tenant: HashMap<TenantId, VecDeque<JobId>>,
    /// Tenants with at least one queued job, in service order.
    rotation: VecDeque<TenantId>,
    len: usize,
}

impl FairQueue {
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn push(&mut self, tenant: TenantId, id: JobId) {
        let queue = self.per_tenant.entry(tenant.clone()).or_default();
        if queue.is_empty() {
            self.rotation.push_back(tenant);
        }
        queue.push_back(id);
        self.len += 1;
    }

    /// Next job from the tenant at the head of the rotation. That tenant
    /// moves to the back if it still has work.
    pub(crate) fn pop(&mut self) -> Option<(TenantId, JobId)> {
        let tenant = self.rotation.pop_front()?;
        let queue = self.per_tenant.get_mut(&tenant)?;
        let id = queue.pop_front()?;
        self.len -= 1;
        if queue.is_empty() {
            self.per_tenant.remove(&tenant);
        } else {
            self.rotation.push_back(tenant.clone());
        }
        Some((tenant, id))
    }

    /// Remove a queued job. Returns `false` if it was not queued.
    pub(crate) fn remove(&mut self, tenant: &TenantId, id: JobId) -> bool {
        let Some(queue) = self.per_tenant.get_mut(tenant) else {
            return false;
        };
        let Some(pos) = queue.iter().position(|queued| *queued == id) else {
            return false;
        };
        queue.remove(pos);
        self.len -= 1;
        if queue.is_empty() {
            self.per_tenant.remove(tenant);
            self.rotation.retain(|t| t != tenant);
        }
        true
    }

    /// Empty the queue, returning every job in service order.
    pub(crate) fn drain(&mut self) -> Vec<JobId> {
        let mut out = Vec::with_capacity(self.len);
        while let Some((_, id)) = self.pop() {
            out.push(id);
        }
        out
    }
}
