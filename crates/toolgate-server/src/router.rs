//! The Tool Router — the hardest component in the system.
//! Ties together passport lookup, credential resolution, the client pool,
//! the circuit breaker, the rate limiter, and session budgets into a
//! single outbound dispatch path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use http::HeaderMap;
use secrecy::ExposeSecret;
use serde_json::Value;

use toolgate_core::credentials::{CredentialAdapter, TokenResult, TokenType};
use toolgate_core::error::GatewayError;
use toolgate_core::passport::Passport;
use toolgate_core::registry::{ToolRegistry, Transport};
use toolgate_core::session::SessionStore;
use toolgate_core::tenant::ApiKey;

use crate::builtin::{BuiltinRegistry, BuiltinToolInfo, extract_builtin_name, is_builtin_server};
use crate::circuit::CircuitBreaker;
use crate::health_tracker::HealthTracker;
use crate::pool::{ClientPool, McpServerConfig, TransportConfig};
use crate::ratelimit::RateLimiter;

#[derive(Debug, Clone)]
pub struct ToolCallOutcome {
    pub content: Vec<Value>,
    pub is_error: bool,
    pub server_id: String,
    pub tool_name: String,
    pub duration_ms: u64,
    pub tool_passport_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ServerToolList {
    pub server_id: String,
    pub server_name: String,
    pub tools: Vec<BuiltinToolInfo>,
}

/// Everything `route_tool_call`/`route_tool_list` need, assembled once at
/// startup and shared across every request: process-scoped singletons
/// injected into handlers, not globals.
pub struct ToolRouter {
    registry: Arc<ToolRegistry>,
    credentials: Arc<dyn CredentialAdapter>,
    builtins: Arc<BuiltinRegistry>,
    sessions: SessionStore,
    pool: Arc<ClientPool>,
    circuit: Arc<CircuitBreaker>,
    limiter: Arc<RateLimiter>,
    health: Arc<HealthTracker>,
}

impl ToolRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ToolRegistry>,
        credentials: Arc<dyn CredentialAdapter>,
        builtins: Arc<BuiltinRegistry>,
        sessions: SessionStore,
        pool: Arc<ClientPool>,
        circuit: Arc<CircuitBreaker>,
        limiter: Arc<RateLimiter>,
        health: Arc<HealthTracker>,
    ) -> Self {
        Self { registry, credentials, builtins, sessions, pool, circuit, limiter, health }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// The full outbound dispatch algorithm.
    pub async fn route_tool_call(
        &self,
        tenant: &str,
        server_id: &str,
        tool_name: &str,
        args: Value,
        session_id: Option<&str>,
    ) -> Result<ToolCallOutcome, GatewayError> {
        if let Some(sid) = session_id {
            let result = self.sessions.enforce(sid, server_id, tool_name);
            if !result.allowed {
                let code = result.code.map(|c| c.as_str()).unwrap_or("SESSION_ERROR");
                return Err(GatewayError::SessionError(code.to_string()));
            }
        }

        if is_builtin_server(server_id) {
            return self.call_builtin(server_id, tool_name, args, session_id).await;
        }

        let passport = self
            .registry
            .get(server_id)
            .await?
            .filter(|p| p.owner == tenant)
            .ok_or_else(|| GatewayError::NotFound(format!("server {server_id} not found")))?;

        // Gate through the circuit breaker and rate limiter before touching
        // the client pool at all.
        if !self.circuit.allow(server_id) {
            return Err(GatewayError::CircuitOpen { server_id: server_id.to_string() });
        }
        if let Err(limited) = self.limiter.consume(server_id) {
            return Err(GatewayError::RateLimited { retry_after_ms: limited.retry_after_ms });
        }

        let config = self.build_server_config(&passport).await?;
        let key = format!("{tenant}:{server_id}");
        let client = self.pool.get_or_create(&key, &config).await?;

        let start = Instant::now();
        let call_result = call_remote_tool(&client, tool_name, &args).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match call_result {
            Ok((content, is_error)) => {
                self.health.mark_healthy(server_id);
                self.circuit.record_success(server_id);
                if let Some(sid) = session_id {
                    self.sessions.record_usage(sid, None);
                }
                Ok(ToolCallOutcome {
                    content,
                    is_error,
                    server_id: server_id.to_string(),
                    tool_name: tool_name.to_string(),
                    duration_ms,
                    tool_passport_id: Some(passport.passport_id.clone()),
                })
            }
            Err(err) => {
                self.pool.remove(&key);
                self.health.mark_unhealthy(server_id, &err.to_string());
                self.circuit.record_failure(server_id);
                Err(err)
            }
        }
    }

    async fn call_builtin(
        &self,
        server_id: &str,
        tool_name: &str,
        args: Value,
        session_id: Option<&str>,
    ) -> Result<ToolCallOutcome, GatewayError> {
        let name = extract_builtin_name(server_id);
        let server = self
            .builtins
            .get(name)
            .ok_or_else(|| GatewayError::NotFound(format!("builtin server {name} not found")))?;

        let start = Instant::now();
        let result = server.call_tool(tool_name, args).await?;
        let duration_ms = start.elapsed().as_millis() as u64;

        if let Some(sid) = session_id {
            self.sessions.record_usage(sid, None);
        }

        Ok(ToolCallOutcome {
            content: result.content,
            is_error: result.is_error,
            server_id: server_id.to_string(),
            tool_name: tool_name.to_string(),
            duration_ms,
            tool_passport_id: None,
        })
    }

    async fn build_server_config(&self, passport: &Passport) -> Result<McpServerConfig, GatewayError> {
        let metadata = &passport.metadata;
        let transport_str = metadata.get("transport").and_then(Value::as_str).unwrap_or("");
        let transport = Transport::from_str(transport_str).ok_or_else(|| {
            GatewayError::Internal(format!(
                "passport {} has unsupported transport {transport_str}",
                passport.passport_id
            ))
        })?;

        let transport_config = match transport {
            Transport::StreamableHttp => TransportConfig::StreamableHttp { url: require_url(passport)? },
            Transport::Sse => TransportConfig::Sse { url: require_url(passport)? },
            Transport::Stdio => TransportConfig::Stdio {
                command: metadata
                    .get("command")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| {
                        GatewayError::Internal(format!("passport {} missing command", passport.passport_id))
                    })?,
                args: metadata
                    .get("args")
                    .and_then(Value::as_array)
                    .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                    .unwrap_or_default(),
                env: metadata
                    .get("env")
                    .and_then(Value::as_object)
                    .map(|o| o.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
                    .unwrap_or_default(),
            },
            Transport::Builtin => {
                return Err(GatewayError::Internal(
                    "builtin transport must be handled via the builtin registry".to_string(),
                ));
            }
        };

        let (auth_header, extra_headers) = match metadata.get("auth_provider").and_then(Value::as_str) {
            Some(provider) => match self.credentials.get_token(&passport.owner, provider).await? {
                Some(token) => (Some(format_auth_header(&token)), token.headers.clone().unwrap_or_default()),
                None => (None, HeaderMap::new()),
            },
            None => (None, HeaderMap::new()),
        };

        Ok(McpServerConfig { transport: transport_config, auth_header, extra_headers })
    }

    /// `routeToolList`: builtins first, then the tenant's own
    /// registered servers using their last-observed `tools_cache`.
    pub async fn route_tool_list(&self, tenant: &str) -> Result<Vec<ServerToolList>, GatewayError> {
        let mut out: Vec<ServerToolList> = self
            .builtins
            .list_all_tools()
            .await
            .into_iter()
            .map(|b| ServerToolList { server_id: b.server_id, server_name: b.server_name, tools: b.tools })
            .collect();

        let page = self.registry.list(tenant, 1, 10_000).await?;
        for passport in page.items {
            let tools = passport
                .metadata
                .get("tools_cache")
                .and_then(|v| serde_json::from_value::<Vec<String>>(v.clone()).ok())
                .unwrap_or_default()
                .into_iter()
                .map(|name| BuiltinToolInfo { name, description: None })
                .collect();
            out.push(ServerToolList { server_id: passport.passport_id, server_name: passport.name, tools });
        }
        Ok(out)
    }

    /// `routeToolListFiltered`: string-contains filters on
    /// server/tool, then RBAC scope filtering.
    pub async fn route_tool_list_filtered(
        &self,
        tenant: &str,
        server: Option<&str>,
        search: Option<&str>,
        key: &ApiKey,
    ) -> Result<Vec<ServerToolList>, GatewayError> {
        let search_lower = search.map(str::to_lowercase);
        let filtered = self
            .route_tool_list(tenant)
            .await?
            .into_iter()
            .filter(|entry| {
                server.is_none_or(|s| entry.server_id.contains(s) || entry.server_name.contains(s))
            })
            .filter_map(|mut entry| {
                if let Some(query) = &search_lower {
                    entry.tools.retain(|t| {
                        t.name.to_lowercase().contains(query)
                            || t.description.as_deref().unwrap_or_default().to_lowercase().contains(query)
                    });
                }
                entry.tools.retain(|t| key.allows(&entry.server_id, &t.name));
                if entry.tools.is_empty() { None } else { Some(entry) }
            })
            .collect();
        Ok(filtered)
    }
}

fn require_url(passport: &Passport) -> Result<String, GatewayError> {
    passport
        .metadata
        .get("url")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| GatewayError::Internal(format!("passport {} missing url", passport.passport_id)))
}

fn format_auth_header(token: &TokenResult) -> String {
    let raw = token.token.expose_secret();
    match token.token_type {
        TokenType::Bearer => format!("Bearer {raw}"),
        TokenType::Basic => format!("Basic {raw}"),
        TokenType::ApiKey => raw.to_string(),
    }
}

async fn call_remote_tool(
    client: &crate::pool::McpClient,
    tool_name: &str,
    args: &Value,
) -> Result<(Vec<Value>, bool), GatewayError> {
    let arguments = args.as_object().cloned();
    let params = rmcp::model::CallToolRequestParam { name: tool_name.to_string().into(), arguments };

    let result = client
        .call_tool(params)
        .await
        .map_err(|e| GatewayError::UpstreamError(format!("tool call failed: {e}")))?;

    let content =
        result.content.iter().map(|c| serde_json::to_value(c).unwrap_or(Value::Null)).collect::<Vec<_>>();
    Ok((content, result.is_error.unwrap_or(false)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use toolgate_core::passport::{ListFilter, Page, PassportPatch, PassportStatus, PassportStore, PassportType};

    #[derive(Default)]
    struct FakeStore {
        passports: std::sync::Mutex<HashMap<String, Passport>>,
    }

    impl FakeStore {
        fn with(passport: Passport) -> Self {
            let mut map = HashMap::new();
            map.insert(passport.passport_id.clone(), passport);
            Self { passports: std::sync::Mutex::new(map) }
        }
    }

    #[async_trait]
    impl PassportStore for FakeStore {
        async fn create(
            &self,
            _kind: PassportType,
            _owner: &str,
            _name: &str,
            _description: Option<&str>,
            _metadata: Value,
            _tags: Vec<String>,
        ) -> Result<Passport, GatewayError> {
            unimplemented!()
        }
        async fn get(&self, id: &str) -> Result<Option<Passport>, GatewayError> {
            Ok(self.passports.lock().expect("lock").get(id).cloned())
        }
        async fn list(&self, _filter: ListFilter) -> Result<Page<Passport>, GatewayError> {
            unimplemented!()
        }
        async fn update(&self, _id: &str, _patch: PassportPatch) -> Result<Passport, GatewayError> {
            unimplemented!()
        }
        async fn delete(&self, _id: &str) -> Result<(), GatewayError> {
            Ok(())
        }
    }

    struct NoCredentials;
    #[async_trait]
    impl CredentialAdapter for NoCredentials {
        async fn get_token(&self, _tenant: &str, _provider: &str) -> Result<Option<TokenResult>, GatewayError> {
            Ok(None)
        }
    }

    struct EchoBuiltin;
    #[async_trait]
    impl crate::builtin::BuiltinServer for EchoBuiltin {
        fn name(&self) -> &str {
            "echo"
        }
        async fn list_tools(&self) -> Result<Vec<BuiltinToolInfo>, GatewayError> {
            Ok(vec![BuiltinToolInfo { name: "echo".into(), description: None }])
        }
        async fn call_tool(&self, _tool_name: &str, args: Value) -> Result<crate::builtin::BuiltinCallResult, GatewayError> {
            Ok(crate::builtin::BuiltinCallResult { content: vec![args], is_error: false })
        }
    }

    fn passport(id: &str, owner: &str) -> Passport {
        Passport {
            passport_id: id.to_string(),
            kind: PassportType::Tool,
            owner: owner.to_string(),
            name: "Test Server".into(),
            description: None,
            metadata: serde_json::json!({"transport": "streamable-http", "url": "https://example.invalid/mcp"}),
            tags: vec![],
            status: PassportStatus::Active,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn router_with(store: FakeStore) -> ToolRouter {
        ToolRouter::new(
            Arc::new(ToolRegistry::new(Arc::new(store))),
            Arc::new(NoCredentials),
            Arc::new(BuiltinRegistry::new(vec![Arc::new(EchoBuiltin)])),
            SessionStore::new(),
            Arc::new(ClientPool::new(std::time::Duration::from_secs(1800))),
            Arc::new(CircuitBreaker::new(5, std::time::Duration::from_secs(30))),
            Arc::new(RateLimiter::new(crate::ratelimit::BucketConfig { rate: 10.0, burst: 20.0 })),
            Arc::new(HealthTracker::new()),
        )
    }

    #[tokio::test]
    async fn builtin_calls_dispatch_without_touching_the_registry() {
        let router = router_with(FakeStore::default());
        let outcome = router
            .route_tool_call("tenant_a", "builtin:echo", "echo", serde_json::json!({"x": 1}), None)
            .await
            .expect("builtin call succeeds");
        assert_eq!(outcome.server_id, "builtin:echo");
        assert!(!outcome.is_error);
    }

    #[tokio::test]
    async fn cross_tenant_call_is_not_found() {
        let router = router_with(FakeStore::with(passport("passport_x", "tenant_a")));
        let err = router
            .route_tool_call("tenant_b", "passport_x", "whatever", Value::Null, None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }

    #[tokio::test]
    async fn session_enforcement_short_circuits_before_any_dispatch() {
        let router = router_with(FakeStore::default());
        let err = router
            .route_tool_call("tenant_a", "builtin:echo", "echo", Value::Null, Some("sess_missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::SessionError(code) if code == "SESSION_NOT_FOUND"));
    }

    #[tokio::test]
    async fn open_circuit_fails_fast_without_attempting_a_connection() {
        let router = router_with(FakeStore::with(passport("passport_x", "tenant_a")));
        for _ in 0..5 {
            router.circuit.record_failure("passport_x");
        }
        let err = router
            .route_tool_call("tenant_a", "passport_x", "whatever", Value::Null, None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::CircuitOpen { .. }));
    }

    #[tokio::test]
    async fn exhausted_rate_limiter_denies_before_attempting_a_connection() {
        let router = router_with(FakeStore::with(passport("passport_x", "tenant_a")));
        for _ in 0..20 {
            let _ = router.limiter.consume("passport_x");
        }
        let err = router
            .route_tool_call("tenant_a", "passport_x", "whatever", Value::Null, None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn tool_list_filtered_hides_tools_outside_the_keys_scope() {
        let router = router_with(FakeStore::default());
        let key = ApiKey {
            id: "key_1".into(),
            tenant_id: "tenant_a".into(),
            raw_key: "secret".into(),
            scopes: Some(vec!["builtin:nope:*".into()]),
            created_at: Utc::now(),
        };
        let lists = router.route_tool_list_filtered("tenant_a", None, None, &key).await.unwrap();
        assert!(lists.is_empty());
    }
}
