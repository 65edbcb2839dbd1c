//! The Ingress Gate: resolves and authorizes every inbound
//! request before any downstream work. Kept framework-agnostic so it can be
//! unit tested without standing up an axum router, the way the teacher
//! separates `oauth_validate`'s token logic from the middleware plumbing
//! around it.

use std::collections::{HashMap, HashSet};

use toolgate_core::error::GatewayError;
use toolgate_core::quota::QuotaTracker;
use toolgate_core::tenant::ApiKey;

use crate::tenants::TenantDirectory;

/// Features a plan can disable. Absence from `disabled_features` means
/// allowed; an empty/missing plan entry means everything is allowed. This is
/// the simplest policy shape that satisfies "consults the tenant plan; on
/// violation fails with a status-coded error" without inventing pricing
/// logic that stays out of scope here.
#[derive(Debug, Clone, Default)]
pub struct PlanPolicy {
    pub disabled_features: HashSet<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PolicyEngine {
    plans: HashMap<String, PlanPolicy>,
}

impl PolicyEngine {
    pub fn new(plans: HashMap<String, PlanPolicy>) -> Self {
        Self { plans }
    }

    /// `enforcePolicy(tenant_id, route, {feature?})`. Routes with
    /// no associated feature always pass; only a route that names a feature
    /// can be denied.
    pub fn enforce(&self, plan: &str, route: &str, feature: Option<&str>) -> Result<(), GatewayError> {
        let Some(feature) = feature else { return Ok(()) };
        if let Some(policy) = self.plans.get(plan)
            && policy.disabled_features.contains(feature)
        {
            return Err(GatewayError::ForbiddenPolicy(format!(
                "feature '{feature}' is not available on plan '{plan}' for {route}"
            )));
        }
        Ok(())
    }
}

/// The gate itself: auth, policy, and quota, in the strict order callers
/// must apply them (RBAC scope is a separate, per-call check since it
/// needs the server_id/tool_name that only the route body carries).
pub struct IngressGate {
    tenants: TenantDirectory,
    policy: PolicyEngine,
    quota: QuotaTracker,
}

impl IngressGate {
    pub fn new(tenants: TenantDirectory, policy: PolicyEngine, quota: QuotaTracker) -> Self {
        Self { tenants, policy, quota }
    }

    /// `resolve(request) → ApiKey`. Takes the raw `Authorization` header
    /// value so callers aren't forced through a particular HTTP framework's
    /// typed-header extraction, which would reject a malformed header
    /// before this function gets to choose the exact error message.
    pub fn resolve(&self, authorization_header: Option<&str>) -> Result<ApiKey, GatewayError> {
        let Some(header) = authorization_header else {
            return Err(GatewayError::Unauthenticated("Missing API key".to_string()));
        };

        let mut parts = header.splitn(2, char::is_whitespace);
        let scheme = parts.next().unwrap_or("");
        let token = parts.next().unwrap_or("").trim();

        if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
            return Err(GatewayError::Unauthenticated("Missing API key".to_string()));
        }

        self.tenants
            .find_by_raw_key(token)
            .ok_or_else(|| GatewayError::Unauthenticated("Invalid API key".to_string()))
    }

    /// `enforceScope(key, server_id, tool_name) → bool`, raised to a
    /// `Result` so callers can `?` it straight into the error path.
    pub fn enforce_scope(&self, key: &ApiKey, server_id: &str, tool_name: &str) -> Result<(), GatewayError> {
        if key.allows(server_id, tool_name) {
            Ok(())
        } else {
            Err(GatewayError::ForbiddenScope(format!(
                "key {} is not scoped for {server_id}:{tool_name}",
                key.id
            )))
        }
    }

    pub fn enforce_policy(&self, tenant_id: &str, route: &str, feature: Option<&str>) -> Result<(), GatewayError> {
        let plan = self.tenants.tenant(tenant_id).map(|t| t.plan).unwrap_or_else(|| "free".to_string());
        self.policy.enforce(&plan, route, feature)
    }

    /// `assertWithinQuota(tenant_id) → void`.
    pub fn assert_within_quota(&self, tenant_id: &str) -> Result<(), GatewayError> {
        if self.quota.assert_within_quota(tenant_id) {
            Ok(())
        } else {
            Err(GatewayError::QuotaExceeded("Quota exceeded".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use toolgate_core::tenant::Tenant;

    use crate::config::SeedTenant;

    fn gate_with(quota_limit: Option<u64>, disabled: &[&str]) -> IngressGate {
        let seed = SeedTenant {
            tenant: Tenant { id: "tenant_a".into(), name: "Tenant A".into(), plan: "starter".into() },
            api_keys: vec![ApiKey {
                id: "key_1".into(),
                tenant_id: "tenant_a".into(),
                raw_key: "secret-key".into(),
                scopes: Some(vec!["github:*".into()]),
                created_at: Utc::now(),
            }],
            quota_limit: None,
        };
        let tenants = TenantDirectory::from_seed(&[seed]);

        let quota = QuotaTracker::new();
        if let Some(limit) = quota_limit {
            quota.set_limit("tenant_a", limit);
        }

        let mut plans = HashMap::new();
        plans.insert(
            "starter".to_string(),
            PlanPolicy { disabled_features: disabled.iter().map(|s| s.to_string()).collect() },
        );

        IngressGate::new(tenants, PolicyEngine::new(plans), quota)
    }

    #[test]
    fn resolve_rejects_a_missing_header() {
        let gate = gate_with(None, &[]);
        let err = gate.resolve(None).unwrap_err();
        assert_eq!(err, GatewayError::Unauthenticated("Missing API key".to_string()));
    }

    #[test]
    fn resolve_rejects_a_non_bearer_scheme() {
        let gate = gate_with(None, &[]);
        let err = gate.resolve(Some("Basic secret-key")).unwrap_err();
        assert_eq!(err, GatewayError::Unauthenticated("Missing API key".to_string()));
    }

    #[test]
    fn resolve_rejects_an_unknown_token() {
        let gate = gate_with(None, &[]);
        let err = gate.resolve(Some("Bearer nope")).unwrap_err();
        assert_eq!(err, GatewayError::Unauthenticated("Invalid API key".to_string()));
    }

    #[test]
    fn resolve_accepts_a_case_insensitive_bearer_scheme() {
        let gate = gate_with(None, &[]);
        let key = gate.resolve(Some("bearer   secret-key")).expect("valid key");
        assert_eq!(key.tenant_id, "tenant_a");
    }

    #[test]
    fn enforce_scope_delegates_to_the_key() {
        let gate = gate_with(None, &[]);
        let key = gate.resolve(Some("Bearer secret-key")).expect("valid key");
        assert!(gate.enforce_scope(&key, "github", "create_issue").is_ok());
        assert!(gate.enforce_scope(&key, "slack", "send_message").is_err());
    }

    #[test]
    fn enforce_policy_denies_a_disabled_feature_for_the_tenants_plan() {
        let gate = gate_with(None, &["chains"]);
        let err = gate.enforce_policy("tenant_a", "/v1/chains/execute", Some("chains")).unwrap_err();
        assert!(matches!(err, GatewayError::ForbiddenPolicy(_)));
    }

    #[test]
    fn enforce_policy_allows_routes_with_no_feature_gate() {
        let gate = gate_with(None, &["chains"]);
        assert!(gate.enforce_policy("tenant_a", "/v1/tools/call", None).is_ok());
    }

    #[test]
    fn quota_exhausts_with_the_exact_expected_message() {
        let gate = gate_with(Some(1), &[]);
        assert!(gate.assert_within_quota("tenant_a").is_ok());
        let err = gate.assert_within_quota("tenant_a").unwrap_err();
        assert_eq!(err, GatewayError::QuotaExceeded("Quota exceeded".to_string()));
    }
}
