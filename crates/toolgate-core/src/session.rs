//! Session budgets (spec §4.5). Held in-memory by design: a restart clears
//! sessions, which the spec calls acceptable since agents re-create them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Wire-level budget as received from `POST /v1/sessions`: `expires_at` is
/// an absolute timestamp there, since clients don't share our monotonic
/// clock. [`SessionStore::create`] converts it to an [`Instant`] deadline.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SessionBudgetInput {
    pub max_tool_calls: Option<u64>,
    pub max_duration_ms: Option<u64>,
    pub max_cost_usd: Option<f64>,
    pub allowed_servers: Option<Vec<String>>,
    pub denied_tools: Option<Vec<String>>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionBudget {
    pub max_tool_calls: Option<u64>,
    pub max_duration_ms: Option<u64>,
    pub max_cost_usd: Option<f64>,
    pub allowed_servers: Option<Vec<String>>,
    pub denied_tools: Option<Vec<String>>,
    pub expires_at: Option<Instant>,
}

impl From<SessionBudgetInput> for SessionBudget {
    fn from(input: SessionBudgetInput) -> Self {
        let expires_at = input.expires_at.map(|at| {
            let remaining = at.signed_duration_since(Utc::now());
            let remaining_ms = remaining.num_milliseconds().max(0) as u64;
            Instant::now() + Duration::from_millis(remaining_ms)
        });
        Self {
            max_tool_calls: input.max_tool_calls,
            max_duration_ms: input.max_duration_ms,
            max_cost_usd: input.max_cost_usd,
            allowed_servers: input.allowed_servers,
            denied_tools: input.denied_tools,
            expires_at,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SessionUsage {
    pub tool_calls: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Exhausted,
    Expired,
    Closed,
}

impl SessionStatus {
    fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Exhausted | SessionStatus::Expired | SessionStatus::Closed
        )
    }
}

/// Monotonic timestamps (`created_at`/`updated_at`/budget's `expires_at`)
/// make this type domain-internal, not wire-serializable; route handlers
/// translate it into a response DTO that carries ISO timestamps instead.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub tenant_id: String,
    pub agent_id: Option<String>,
    pub budget: SessionBudget,
    pub usage: SessionUsage,
    pub status: SessionStatus,
    pub created_at: Instant,
    pub updated_at: Instant,
}

/// The code returned on the first budget-gate violation (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialCode {
    SessionNotFound,
    SessionClosed,
    BudgetCallsExceeded,
    SessionExpired,
    BudgetDurationExceeded,
    BudgetCostExceeded,
    ServerNotAllowed,
    ToolDenied,
}

impl DenialCode {
    pub fn as_str(self) -> &'static str {
        match self {
            DenialCode::SessionNotFound => "SESSION_NOT_FOUND",
            DenialCode::SessionClosed => "SESSION_CLOSED",
            DenialCode::BudgetCallsExceeded => "BUDGET_CALLS_EXCEEDED",
            DenialCode::SessionExpired => "SESSION_EXPIRED",
            DenialCode::BudgetDurationExceeded => "BUDGET_DURATION_EXCEEDED",
            DenialCode::BudgetCostExceeded => "BUDGET_COST_EXCEEDED",
            DenialCode::ServerNotAllowed => "SERVER_NOT_ALLOWED",
            DenialCode::ToolDenied => "TOOL_DENIED",
        }
    }
}

pub struct EnforceResult {
    pub allowed: bool,
    pub code: Option<DenialCode>,
}

impl EnforceResult {
    fn allow() -> Self {
        Self { allowed: true, code: None }
    }

    fn deny(code: DenialCode) -> Self {
        Self { allowed: false, code: Some(code) }
    }
}

fn generate_session_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..16)
        .map(|_| {
            let n: u8 = rng.gen_range(0..16);
            std::char::from_digit(n as u32, 16).unwrap_or('0')
        })
        .collect();
    format!("sess_{suffix}")
}

/// Process-wide session store (spec §9: long-lived, injected singleton).
/// `enforce`/`record_usage` must be safe to call concurrently for distinct
/// sessions (spec §5); `DashMap` gives per-shard locking for that.
#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<DashMap<String, Session>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self { sessions: Arc::new(DashMap::new()) }
    }

    pub fn create(&self, tenant: &str, budget: SessionBudget, agent_id: Option<String>) -> Session {
        let now = Instant::now();
        let session = Session {
            session_id: generate_session_id(),
            tenant_id: tenant.to_string(),
            agent_id,
            budget,
            usage: SessionUsage::default(),
            status: SessionStatus::Active,
            created_at: now,
            updated_at: now,
        };
        self.sessions.insert(session.session_id.clone(), session.clone());
        session
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.sessions.get(session_id).map(|entry| entry.clone())
    }

    /// Checks the gates in the exact order mandated by spec §4.5.
    pub fn enforce(&self, session_id: &str, server_id: &str, tool_name: &str) -> EnforceResult {
        let Some(mut entry) = self.sessions.get_mut(session_id) else {
            return EnforceResult::deny(DenialCode::SessionNotFound);
        };

        if entry.status == SessionStatus::Closed {
            return EnforceResult::deny(DenialCode::SessionClosed);
        }
        if entry.status == SessionStatus::Exhausted {
            return EnforceResult::deny(DenialCode::BudgetCallsExceeded);
        }

        let now = Instant::now();

        if let Some(expires_at) = entry.budget.expires_at
            && now > expires_at
        {
            entry.status = SessionStatus::Expired;
            return EnforceResult::deny(DenialCode::SessionExpired);
        }

        if let Some(max_duration_ms) = entry.budget.max_duration_ms
            && now.duration_since(entry.created_at) > Duration::from_millis(max_duration_ms)
        {
            entry.status = SessionStatus::Expired;
            return EnforceResult::deny(DenialCode::BudgetDurationExceeded);
        }

        if let Some(max_tool_calls) = entry.budget.max_tool_calls
            && entry.usage.tool_calls >= max_tool_calls
        {
            entry.status = SessionStatus::Exhausted;
            return EnforceResult::deny(DenialCode::BudgetCallsExceeded);
        }

        if let Some(max_cost_usd) = entry.budget.max_cost_usd
            && entry.usage.cost_usd >= max_cost_usd
        {
            entry.status = SessionStatus::Exhausted;
            return EnforceResult::deny(DenialCode::BudgetCostExceeded);
        }

        if let Some(allowed_servers) = &entry.budget.allowed_servers
            && !allowed_servers.is_empty()
            && !allowed_servers.iter().any(|s| s == server_id)
        {
            return EnforceResult::deny(DenialCode::ServerNotAllowed);
        }

        if let Some(denied_tools) = &entry.budget.denied_tools
            && denied_tools.iter().any(|t| t == tool_name)
        {
            return EnforceResult::deny(DenialCode::ToolDenied);
        }

        EnforceResult::allow()
    }

    /// Called only on successful dispatch (spec §4.5).
    pub fn record_usage(&self, session_id: &str, cost: Option<f64>) {
        if let Some(mut entry) = self.sessions.get_mut(session_id) {
            entry.usage.tool_calls += 1;
            entry.usage.cost_usd += cost.unwrap_or(0.0);
            entry.updated_at = Instant::now();
        }
    }

    /// Idempotent.
    pub fn close(&self, session_id: &str) {
        if let Some(mut entry) = self.sessions.get_mut(session_id) {
            entry.status = SessionStatus::Closed;
            entry.updated_at = Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enforce_denies_unknown_session() {
        let store = SessionStore::new();
        let result = store.enforce("sess_missing", "s1", "t1");
        assert!(!result.allowed);
        assert_eq!(result.code, Some(DenialCode::SessionNotFound));
    }

    #[test]
    fn calls_budget_exhausts_after_n_calls() {
        let store = SessionStore::new();
        let session = store.create(
            "tenant_a",
            SessionBudget { max_tool_calls: Some(2), ..Default::default() },
            None,
        );

        for _ in 0..2 {
            let result = store.enforce(&session.session_id, "s1", "t1");
            assert!(result.allowed);
            store.record_usage(&session.session_id, None);
        }

        let result = store.enforce(&session.session_id, "s1", "t1");
        assert!(!result.allowed);
        assert_eq!(result.code, Some(DenialCode::BudgetCallsExceeded));
        assert_eq!(store.get(&session.session_id).unwrap().status, SessionStatus::Exhausted);
    }

    #[test]
    fn closed_session_refuses_all_further_calls() {
        let store = SessionStore::new();
        let session = store.create("tenant_a", SessionBudget::default(), None);
        store.close(&session.session_id);
        let result = store.enforce(&session.session_id, "s1", "t1");
        assert!(!result.allowed);
        assert_eq!(result.code, Some(DenialCode::SessionClosed));
    }

    #[test]
    fn close_is_idempotent() {
        let store = SessionStore::new();
        let session = store.create("tenant_a", SessionBudget::default(), None);
        store.close(&session.session_id);
        store.close(&session.session_id);
        assert_eq!(store.get(&session.session_id).unwrap().status, SessionStatus::Closed);
    }

    #[test]
    fn denied_tools_block_specific_tool_only() {
        let store = SessionStore::new();
        let session = store.create(
            "tenant_a",
            SessionBudget { denied_tools: Some(vec!["dangerous".into()]), ..Default::default() },
            None,
        );
        assert!(store.enforce(&session.session_id, "s1", "safe").allowed);
        let result = store.enforce(&session.session_id, "s1", "dangerous");
        assert!(!result.allowed);
        assert_eq!(result.code, Some(DenialCode::ToolDenied));
    }

    #[test]
    fn allowed_servers_restricts_to_the_listed_set() {
        let store = SessionStore::new();
        let session = store.create(
            "tenant_a",
            SessionBudget { allowed_servers: Some(vec!["s1".into()]), ..Default::default() },
            None,
        );
        assert!(store.enforce(&session.session_id, "s1", "t1").allowed);
        let result = store.enforce(&session.session_id, "s2", "t1");
        assert!(!result.allowed);
        assert_eq!(result.code, Some(DenialCode::ServerNotAllowed));
    }

    #[test]
    fn generated_ids_carry_the_session_prefix() {
        let store = SessionStore::new();
        let session = store.create("tenant_a", SessionBudget::default(), None);
        assert!(session.session_id.starts_with("sess_"));
        assert_eq!(session.session_id.len(), "sess_".len() + 16);
    }

    #[test]
    fn record_usage_is_noop_for_unknown_session() {
        let store = SessionStore::new();
        // Must not panic.
        store.record_usage("sess_missing", Some(1.0));
    }
}
