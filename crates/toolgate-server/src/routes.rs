//! HTTP surface. Every handler follows the strict ingress
//! ordering — auth, policy, quota, body parsing, then RBAC — and
//! emits an audit entry on denial/success/error once the API key is known.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use toolgate_core::audit::{AuditEntry, AuditLog, AuditStatus, hash_args};
use toolgate_core::credentials::CredentialAdapter;
use toolgate_core::error::GatewayError;
use toolgate_core::metering::{LedgerEvent, Outbox, StatusBucket};
use toolgate_core::passport::PassportStatus;
use toolgate_core::registry::{RegisterToolInput, ToolRegistry};
use toolgate_core::session::{Session, SessionBudget, SessionBudgetInput};
use toolgate_core::tenant::ApiKey;
use uuid::Uuid;

use crate::builtin::BuiltinRegistry;
use crate::chain::{ChainExecutor, ChainRequest, ChainResult};
use crate::ingress::IngressGate;
use crate::response::{ApiError, ApiResult, ok};
use crate::router::ToolRouter;

#[derive(Clone)]
pub struct AppState {
    pub ingress: Arc<IngressGate>,
    pub registry: Arc<ToolRegistry>,
    pub router: Arc<ToolRouter>,
    pub builtins: Arc<BuiltinRegistry>,
    pub credentials: Arc<dyn CredentialAdapter>,
    pub audit: Option<Arc<AuditLog>>,
    pub outbox: Option<Arc<Outbox>>,
    pub service_name: String,
    pub environment: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/catalog", get(catalog))
        .route("/v1/servers/register", post(register_server))
        .route("/v1/servers", get(list_servers))
        .route("/v1/servers/{id}", delete(delete_server))
        .route("/v1/tools/call", post(call_tool))
        .route("/v1/tools/list", get(list_tools))
        .route("/v1/tools/discover", post(discover_tools))
        .route("/v1/chains/execute", post(execute_chain))
        .route("/v1/sessions", post(create_session))
        .route("/v1/sessions/{id}", get(get_session).delete(close_session))
        .route("/v1/auth/connect/{provider}", get(connect_oauth))
        .route("/v1/auth/callback", get(oauth_callback))
        .route("/v1/audit-logs", get(list_audit_logs))
        .with_state(state)
}

fn auth_header(headers: &HeaderMap) -> Option<&str> {
    headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok())
}

fn session_id_header(headers: &HeaderMap) -> Option<String> {
    headers.get("x-session-id").and_then(|v| v.to_str().ok()).map(str::to_string)
}

async fn audit(state: &AppState, tenant: &str, key_id: &str, server_id: &str, tool_name: &str, args: &Value, status: AuditStatus, duration_ms: Option<u64>, error_message: Option<String>) {
    if let Some(log) = &state.audit {
        log.record(AuditEntry {
            tenant_id: tenant.to_string(),
            api_key_id: key_id.to_string(),
            server_id: server_id.to_string(),
            tool_name: tool_name.to_string(),
            args_hash: hash_args(args),
            status,
            duration_ms,
            error_message,
        })
        .await;
    }
}

async fn enqueue_metering(state: &AppState, tenant: &str, server_id: &str, tool_name: &str, duration_ms: u64, bucket: StatusBucket) {
    if let Some(outbox) = &state.outbox {
        outbox
            .enqueue(&LedgerEvent {
                event_id: Uuid::new_v4(),
                org_id: tenant.to_string(),
                tool_name: tool_name.to_string(),
                mcp_server: server_id.to_string(),
                duration_ms,
                status_bucket: bucket,
                service: state.service_name.clone(),
                feature: "tool_call".to_string(),
                environment: state.environment.clone(),
                trace_id: None,
            })
            .await;
    }
}

/// An outbox row is only warranted for errors that actually reached an
/// outbound call to an upstream (I5: "errors that reach dispatch"). Every
/// other `GatewayError` variant is a refusal the router raised before
/// touching the client pool — session gate, ownership check, circuit
/// breaker, rate limiter — and must not be metered.
fn reached_dispatch(err: &GatewayError) -> bool {
    matches!(err, GatewayError::UpstreamError(_) | GatewayError::Timeout)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "ok": true, "service": state.service_name }))
}

async fn catalog(State(state): State<AppState>) -> Json<Value> {
    let servers: Vec<Value> = state
        .builtins
        .names()
        .into_iter()
        .map(|name| json!({ "id": format!("builtin:{name}"), "name": name }))
        .collect();
    Json(json!({ "builtin_servers": servers.len(), "servers": servers }))
}

fn resolve_key(state: &AppState, headers: &HeaderMap) -> Result<ApiKey, GatewayError> {
    state.ingress.resolve(auth_header(headers))
}

#[derive(Debug, Deserialize)]
struct RegisterBody {
    name: String,
    transport: String,
    url: Option<String>,
    command: Option<String>,
    args: Option<Vec<String>>,
    env: Option<serde_json::Map<String, Value>>,
    description: Option<String>,
    auth_provider: Option<String>,
}

async fn register_server(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RegisterBody>,
) -> ApiResult<axum::response::Response> {
    let key = resolve_key(&state, &headers)?;
    state.ingress.enforce_policy(&key.tenant_id, "/v1/servers/register", None)?;
    state.ingress.assert_within_quota(&key.tenant_id)?;

    let passport = state
        .registry
        .register(
            &key.tenant_id,
            RegisterToolInput {
                name: body.name,
                transport: body.transport,
                url: body.url,
                command: body.command,
                args: body.args,
                env: body.env,
                description: body.description,
                auth_provider: body.auth_provider,
            },
        )
        .await?;

    Ok(ok(StatusCode::CREATED, passport))
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    page: Option<u32>,
    per_page: Option<u32>,
}

async fn list_servers(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PageQuery>,
) -> ApiResult<axum::response::Response> {
    let key = resolve_key(&state, &headers)?;
    state.ingress.enforce_policy(&key.tenant_id, "/v1/servers", None)?;
    state.ingress.assert_within_quota(&key.tenant_id)?;

    let page = state
        .registry
        .list(&key.tenant_id, query.page.unwrap_or(1), query.per_page.unwrap_or(20))
        .await?;
    Ok(ok(StatusCode::OK, page))
}

async fn delete_server(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let key = resolve_key(&state, &headers)?;
    state.ingress.enforce_policy(&key.tenant_id, "/v1/servers/:id", None)?;

    // Cross-tenant existence must never leak: a passport owned by
    // another tenant, or missing entirely, both respond 404.
    let owned = state
        .registry
        .get(&id)
        .await?
        .map(|p| p.owner == key.tenant_id)
        .unwrap_or(false);
    if !owned {
        return Err(ApiError(GatewayError::NotFound(format!("server {id} not found"))));
    }

    state.registry.remove(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct ToolCallBody {
    server_id: String,
    tool_name: String,
    #[serde(default)]
    arguments: Value,
    session_id: Option<String>,
}

async fn call_tool(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ToolCallBody>,
) -> ApiResult<axum::response::Response> {
    let key = resolve_key(&state, &headers)?;
    state.ingress.enforce_policy(&key.tenant_id, "/v1/tools/call", None)?;

    if let Err(err) = state.ingress.assert_within_quota(&key.tenant_id) {
        audit(&state, &key.tenant_id, &key.id, &body.server_id, &body.tool_name, &body.arguments, AuditStatus::Denied, None, Some(err.to_string())).await;
        return Err(err.into());
    }

    if let Err(err) = state.ingress.enforce_scope(&key, &body.server_id, &body.tool_name) {
        audit(&state, &key.tenant_id, &key.id, &body.server_id, &body.tool_name, &body.arguments, AuditStatus::Denied, None, Some(err.to_string())).await;
        return Err(err.into());
    }

    let session_id = body.session_id.clone().or_else(|| session_id_header(&headers));

    match state
        .router
        .route_tool_call(&key.tenant_id, &body.server_id, &body.tool_name, body.arguments.clone(), session_id.as_deref())
        .await
    {
        Ok(outcome) => {
            let bucket = if outcome.is_error { StatusBucket::Error } else { StatusBucket::Success };
            audit(
                &state,
                &key.tenant_id,
                &key.id,
                &body.server_id,
                &body.tool_name,
                &body.arguments,
                if outcome.is_error { AuditStatus::Error } else { AuditStatus::Success },
                Some(outcome.duration_ms),
                None,
            )
            .await;
            enqueue_metering(&state, &key.tenant_id, &body.server_id, &body.tool_name, outcome.duration_ms, bucket).await;

            Ok(ok(
                StatusCode::OK,
                json!({
                    "content": outcome.content,
                    "isError": outcome.is_error,
                    "server_id": outcome.server_id,
                    "tool_name": outcome.tool_name,
                    "duration_ms": outcome.duration_ms,
                }),
            ))
        }
        Err(err) => {
            audit(&state, &key.tenant_id, &key.id, &body.server_id, &body.tool_name, &body.arguments, AuditStatus::Error, None, Some(err.to_string())).await;
            // Only errors that actually reached an outbound call belong on the
            // billing ledger — a circuit-open/rate-limited/not-found/session
            // refusal never touched an upstream and must not produce a row.
            if reached_dispatch(&err) {
                enqueue_metering(&state, &key.tenant_id, &body.server_id, &body.tool_name, 0, StatusBucket::Error).await;
            }
            Err(err.into())
        }
    }
}

#[derive(Debug, Deserialize)]
struct ToolListQuery {
    server: Option<String>,
    search: Option<String>,
}

async fn list_tools(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ToolListQuery>,
) -> ApiResult<axum::response::Response> {
    let key = resolve_key(&state, &headers)?;
    state.ingress.enforce_policy(&key.tenant_id, "/v1/tools/list", None)?;

    let lists = if query.server.is_some() || query.search.is_some() {
        state
            .router
            .route_tool_list_filtered(&key.tenant_id, query.server.as_deref(), query.search.as_deref(), &key)
            .await?
    } else {
        state.router.route_tool_list(&key.tenant_id).await?
    };

    let tools: Vec<Value> = lists
        .into_iter()
        .map(|entry| {
            json!({
                "server_id": entry.server_id,
                "server_name": entry.server_name,
                "tools": entry.tools.into_iter().map(|t| json!({"name": t.name, "description": t.description})).collect::<Vec<_>>(),
            })
        })
        .collect();

    Ok(ok(StatusCode::OK, json!({ "tools": tools })))
}

#[derive(Debug, Deserialize)]
struct DiscoverBody {
    query: String,
    #[serde(default = "default_top_k")]
    top_k: usize,
}

fn default_top_k() -> usize {
    10
}

async fn discover_tools(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<DiscoverBody>,
) -> ApiResult<axum::response::Response> {
    let key = resolve_key(&state, &headers)?;
    state.ingress.enforce_policy(&key.tenant_id, "/v1/tools/discover", None)?;

    if body.query.trim().is_empty() {
        return Err(ApiError(GatewayError::BadRequest("query must not be empty".to_string())));
    }
    let top_k = body.top_k.min(50);

    // Scoped to builtins and this tenant's own active tools, never a
    // cross-tenant corpus, rebuilt fresh per request since the catalog is
    // small and changes are infrequent.
    let mut entries = Vec::new();
    for listing in state.builtins.list_all_tools().await {
        for tool in listing.tools {
            entries.push(toolgate_discovery::ToolEntry {
                server_id: listing.server_id.clone(),
                server_name: listing.server_name.clone(),
                tool_name: tool.name,
                description: tool.description.unwrap_or_default(),
            });
        }
    }
    let owned = state.registry.list(&key.tenant_id, 1, 10_000).await?;
    for passport in owned.items {
        let names: Vec<String> = passport
            .metadata
            .get("tools_cache")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        for name in names {
            entries.push(toolgate_discovery::ToolEntry {
                server_id: passport.passport_id.clone(),
                server_name: passport.name.clone(),
                tool_name: name,
                description: String::new(),
            });
        }
    }

    let index = toolgate_discovery::ToolIndex::build(&entries);
    let hits = index.search(&body.query, top_k);
    Ok(ok(StatusCode::OK, json!({ "results": hits })))
}

async fn execute_chain(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ChainRequest>,
) -> ApiResult<axum::response::Response> {
    let key = resolve_key(&state, &headers)?;
    state.ingress.enforce_policy(&key.tenant_id, "/v1/chains/execute", Some("chains"))?;

    for step in &body.steps {
        state.ingress.enforce_scope(&key, &step.server, &step.tool)?;
    }

    let now_millis = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis()).unwrap_or(0);
    let chain_id = crate::chain::generate_chain_id(now_millis);

    let executor = ChainExecutor::new(&state.router);
    let result: ChainResult = executor.execute(&key.tenant_id, body, chain_id).await?;
    Ok(ok(StatusCode::OK, result))
}

#[derive(Debug, Deserialize)]
struct CreateSessionBody {
    #[serde(default)]
    budget: SessionBudgetInput,
    agent_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct SessionResponse {
    session_id: String,
    tenant_id: String,
    agent_id: Option<String>,
    status: String,
    tool_calls: u64,
    cost_usd: f64,
    created_at: chrono::DateTime<Utc>,
    updated_at: chrono::DateTime<Utc>,
}

fn session_response(session: &Session) -> SessionResponse {
    let now_wall = Utc::now();
    let age = chrono::Duration::from_std(session.created_at.elapsed()).unwrap_or_else(|_| chrono::Duration::zero());
    let staleness =
        chrono::Duration::from_std(session.updated_at.elapsed()).unwrap_or_else(|_| chrono::Duration::zero());
    SessionResponse {
        session_id: session.session_id.clone(),
        tenant_id: session.tenant_id.clone(),
        agent_id: session.agent_id.clone(),
        status: format!("{:?}", session.status).to_lowercase(),
        tool_calls: session.usage.tool_calls,
        cost_usd: session.usage.cost_usd,
        created_at: now_wall - age,
        updated_at: now_wall - staleness,
    }
}

async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateSessionBody>,
) -> ApiResult<axum::response::Response> {
    let key = resolve_key(&state, &headers)?;
    state.ingress.enforce_policy(&key.tenant_id, "/v1/sessions", None)?;

    let budget: SessionBudget = body.budget.into();
    let session = state.router.sessions().create(&key.tenant_id, budget, body.agent_id);
    Ok(ok(StatusCode::CREATED, session_response(&session)))
}

async fn get_session(State(state): State<AppState>, headers: HeaderMap, Path(id): Path<String>) -> ApiResult<axum::response::Response> {
    let key = resolve_key(&state, &headers)?;
    let session = state
        .router
        .sessions()
        .get(&id)
        .filter(|s| s.tenant_id == key.tenant_id)
        .ok_or_else(|| GatewayError::NotFound(format!("session {id} not found")))?;
    Ok(ok(StatusCode::OK, session_response(&session)))
}

async fn close_session(State(state): State<AppState>, headers: HeaderMap, Path(id): Path<String>) -> ApiResult<StatusCode> {
    let key = resolve_key(&state, &headers)?;
    let owned = state.router.sessions().get(&id).map(|s| s.tenant_id == key.tenant_id).unwrap_or(false);
    if !owned {
        return Err(ApiError(GatewayError::NotFound(format!("session {id} not found"))));
    }
    state.router.sessions().close(&id);
    Ok(StatusCode::NO_CONTENT)
}

async fn connect_oauth(State(state): State<AppState>, headers: HeaderMap, Path(provider): Path<String>) -> ApiResult<axum::response::Response> {
    let key = resolve_key(&state, &headers)?;
    state.ingress.enforce_policy(&key.tenant_id, "/v1/auth/connect/:provider", None)?;
    let url = state.credentials.initiate_oauth(&key.tenant_id, &provider).await?;
    Ok(ok(StatusCode::OK, json!({ "url": url })))
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    provider_config_key: Option<String>,
    connection_id: Option<String>,
}

async fn oauth_callback(State(state): State<AppState>, Query(query): Query<CallbackQuery>) -> ApiResult<axum::response::Response> {
    let (Some(provider_config_key), Some(connection_id)) = (query.provider_config_key, query.connection_id) else {
        return Err(ApiError(GatewayError::BadRequest(
            "provider_config_key and connection_id are both required".to_string(),
        )));
    };

    state.credentials.handle_oauth_callback(&provider_config_key, &connection_id).await?;
    Ok(ok(
        StatusCode::OK,
        json!({ "status": "connected", "provider": provider_config_key, "connection_id": connection_id }),
    ))
}

#[derive(Debug, Deserialize)]
struct AuditLogQuery {
    page: Option<u32>,
    per_page: Option<u32>,
}

async fn list_audit_logs(State(state): State<AppState>, headers: HeaderMap, Query(query): Query<AuditLogQuery>) -> ApiResult<axum::response::Response> {
    let key = resolve_key(&state, &headers)?;
    let Some(audit) = &state.audit else {
        return Err(ApiError(GatewayError::NotImplemented("no audit datastore configured".to_string())));
    };
    let page = audit.list(&key.tenant_id, query.page.unwrap_or(1), query.per_page.unwrap_or(20)).await?;
    Ok(ok(StatusCode::OK, page))
}
