//! The tenant/API-key directory. Tenants and keys are "created via
//! seed/admin" and never persisted by this implementation; they
//! are loaded once at startup from [`crate::config::Config`] into a
//! process-wide concurrent map, the same pattern `toolgate_core`'s
//! `QuotaTracker`/`SessionStore` use for other process-scoped state.

use std::sync::Arc;

use dashmap::DashMap;

use toolgate_core::tenant::{ApiKey, Tenant, constant_time_eq};

use crate::config::SeedTenant;

#[derive(Clone)]
pub struct TenantDirectory {
    tenants: Arc<DashMap<String, Tenant>>,
    keys: Arc<Vec<ApiKey>>,
}

impl TenantDirectory {
    pub fn from_seed(seeds: &[SeedTenant]) -> Self {
        let tenants = Arc::new(DashMap::new());
        let mut keys = Vec::new();
        for seed in seeds {
            tenants.insert(seed.tenant.id.clone(), seed.tenant.clone());
            keys.extend(seed.api_keys.iter().cloned());
        }
        Self { tenants, keys: Arc::new(keys) }
    }

    pub fn tenant(&self, tenant_id: &str) -> Option<Tenant> {
        self.tenants.get(tenant_id).map(|entry| entry.clone())
    }

    /// Looks up the key whose `raw_key` constant-time-matches `token`
    /// Every candidate is compared to avoid a
    /// hashmap-bucket timing side channel leaking which prefix matched.
    pub fn find_by_raw_key(&self, token: &str) -> Option<ApiKey> {
        self.keys.iter().find(|key| constant_time_eq(&key.raw_key, token)).cloned()
    }
}
