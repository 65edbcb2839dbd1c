//! Tenants and API keys (spec §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub plan: String,
}

/// `scopes == None` means allow-all (spec §3, §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    pub tenant_id: String,
    pub raw_key: String,
    pub scopes: Option<Vec<String>>,
    pub created_at: DateTime<Utc>,
}

impl ApiKey {
    /// Scope check per spec §4.1: any of exact `"server:tool"`, `"server:*"`,
    /// `"*:tool"`, or `"*"` authorizes the call.
    pub fn allows(&self, server_id: &str, tool_name: &str) -> bool {
        let Some(scopes) = &self.scopes else {
            return true;
        };
        let exact = format!("{server_id}:{tool_name}");
        let server_wildcard = format!("{server_id}:*");
        let tool_wildcard = format!("*:{tool_name}");
        scopes.iter().any(|pattern| {
            pattern == &exact || pattern == &server_wildcard || pattern == &tool_wildcard || pattern == "*"
        })
    }
}

/// Constant-time comparison of the bearer token against a candidate key's
/// `raw_key`, so string-length/timing side channels don't leak which
/// prefix of a key matched (spec §3: "compared by constant-time exact
/// match").
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(scopes: Option<Vec<&str>>) -> ApiKey {
        ApiKey {
            id: "key_1".into(),
            tenant_id: "tenant_a".into(),
            raw_key: "secret".into(),
            scopes: scopes.map(|s| s.into_iter().map(String::from).collect()),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn null_scopes_allow_everything() {
        let k = key(None);
        assert!(k.allows("server1", "tool1"));
        assert!(k.allows("anything", "goes"));
    }

    #[test]
    fn exact_scope_matches_only_that_pair() {
        let k = key(Some(vec!["server1:tool1"]));
        assert!(k.allows("server1", "tool1"));
        assert!(!k.allows("server1", "tool2"));
        assert!(!k.allows("server2", "tool1"));
    }

    #[test]
    fn server_wildcard_allows_any_tool_on_that_server() {
        let k = key(Some(vec!["server1:*"]));
        assert!(k.allows("server1", "anything"));
        assert!(!k.allows("server2", "tool1"));
    }

    #[test]
    fn tool_wildcard_allows_that_tool_on_any_server() {
        let k = key(Some(vec!["*:tool1"]));
        assert!(k.allows("anyserver", "tool1"));
        assert!(!k.allows("anyserver", "tool2"));
    }

    #[test]
    fn global_wildcard_allows_everything() {
        let k = key(Some(vec!["*"]));
        assert!(k.allows("server1", "tool1"));
    }

    #[test]
    fn constant_time_eq_matches_equal_strings() {
        assert!(constant_time_eq("abc123", "abc123"));
    }

    #[test]
    fn constant_time_eq_rejects_different_strings() {
        assert!(!constant_time_eq("abc123", "abc124"));
        assert!(!constant_time_eq("short", "muchlongerstring"));
    }
}
