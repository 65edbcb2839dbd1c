//! Per-tenant rolling usage (spec §3 `QuotaCounter`). Increment-and-test is
//! atomic (spec §5); reset is the job of an external scheduler out of scope
//! here.

use std::sync::Arc;

use dashmap::DashMap;

#[derive(Debug, Clone, Copy)]
struct Counter {
    limit: u64,
    used: u64,
}

/// Process-wide quota tracker keyed by tenant. `DashMap`'s per-shard
/// locking gives the atomic test-and-increment spec §4.1 requires without a
/// single global mutex serializing unrelated tenants.
#[derive(Clone)]
pub struct QuotaTracker {
    counters: Arc<DashMap<String, Counter>>,
}

impl Default for QuotaTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl QuotaTracker {
    pub fn new() -> Self {
        Self { counters: Arc::new(DashMap::new()) }
    }

    pub fn set_limit(&self, tenant: &str, limit: u64) {
        self.counters
            .entry(tenant.to_string())
            .and_modify(|c| c.limit = limit)
            .or_insert(Counter { limit, used: 0 });
    }

    /// Atomically tests-and-increments; returns `true` when the call is
    /// within quota. A tenant with no registered limit is treated as
    /// unlimited.
    pub fn assert_within_quota(&self, tenant: &str) -> bool {
        let Some(mut entry) = self.counters.get_mut(tenant) else {
            return true;
        };
        if entry.used >= entry.limit {
            return false;
        }
        entry.used += 1;
        true
    }

    pub fn used(&self, tenant: &str) -> u64 {
        self.counters.get(tenant).map(|c| c.used).unwrap_or(0)
    }

    /// Reset hook for the external scheduler (spec §3 lifecycle).
    pub fn reset(&self, tenant: &str) {
        if let Some(mut entry) = self.counters.get_mut(tenant) {
            entry.used = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_tenant_always_passes() {
        let tracker = QuotaTracker::new();
        for _ in 0..100 {
            assert!(tracker.assert_within_quota("tenant_a"));
        }
    }

    #[test]
    fn quota_exhausts_after_limit_calls() {
        let tracker = QuotaTracker::new();
        tracker.set_limit("tenant_a", 2);
        assert!(tracker.assert_within_quota("tenant_a"));
        assert!(tracker.assert_within_quota("tenant_a"));
        assert!(!tracker.assert_within_quota("tenant_a"));
    }

    #[test]
    fn reset_restores_capacity() {
        let tracker = QuotaTracker::new();
        tracker.set_limit("tenant_a", 1);
        assert!(tracker.assert_within_quota("tenant_a"));
        assert!(!tracker.assert_within_quota("tenant_a"));
        tracker.reset("tenant_a");
        assert!(tracker.assert_within_quota("tenant_a"));
    }
}
