//! Builtin Registry. The 80+ concrete builtin-server
//! implementations are treated as out of scope here — each is treated as an
//! opaque `name -> (listTools, callTool)` handle, the way
//! `pierre_mcp_server`'s `ToolDescriptor`/`ToolBundle` trait lets a tool
//! collection stay a thin dynamic-dispatch handle rather than a concrete
//! type the caller knows about.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;

use toolgate_core::error::GatewayError;
use toolgate_core::passport::BUILTIN_PREFIX;

#[derive(Debug, Clone)]
pub struct BuiltinToolInfo {
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BuiltinCallResult {
    pub content: Vec<Value>,
    pub is_error: bool,
}

/// One in-process MCP server. Concrete adapters for real integrations
/// (GitHub, Slack, Jira, …) live outside this crate's covered scope and
/// are registered through this same trait.
#[async_trait]
pub trait BuiltinServer: Send + Sync {
    fn name(&self) -> &str;
    async fn list_tools(&self) -> Result<Vec<BuiltinToolInfo>, GatewayError>;
    async fn call_tool(&self, tool_name: &str, args: Value) -> Result<BuiltinCallResult, GatewayError>;
}

pub fn is_builtin_server(id: &str) -> bool {
    id.starts_with(BUILTIN_PREFIX)
}

pub fn extract_builtin_name(id: &str) -> &str {
    id.strip_prefix(BUILTIN_PREFIX).unwrap_or(id)
}

#[derive(Debug, Clone)]
pub struct BuiltinServerTools {
    pub server_id: String,
    pub server_name: String,
    pub tools: Vec<BuiltinToolInfo>,
}

pub struct BuiltinRegistry {
    servers: HashMap<String, Arc<dyn BuiltinServer>>,
}

impl BuiltinRegistry {
    pub fn new(servers: Vec<Arc<dyn BuiltinServer>>) -> Self {
        let servers = servers.into_iter().map(|server| (server.name().to_string(), server)).collect();
        Self { servers }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn BuiltinServer>> {
        self.servers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.servers.keys().cloned().collect()
    }

    /// Parallel, failure-tolerant listing: a server whose
    /// `list_tools` fails contributes an empty tool array instead of
    /// failing the whole listing.
    pub async fn list_all_tools(&self) -> Vec<BuiltinServerTools> {
        let futures = self.servers.values().map(|server| async move {
            let tools = server.list_tools().await.unwrap_or_else(|err| {
                tracing::warn!(server = server.name(), error = %err, "builtin server failed to list tools");
                Vec::new()
            });
            BuiltinServerTools {
                server_id: format!("{BUILTIN_PREFIX}{}", server.name()),
                server_name: server.name().to_string(),
                tools,
            }
        });
        join_all(futures).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoBuiltin;

    #[async_trait]
    impl BuiltinServer for EchoBuiltin {
        fn name(&self) -> &str {
            "echo"
        }

        async fn list_tools(&self) -> Result<Vec<BuiltinToolInfo>, GatewayError> {
            Ok(vec![BuiltinToolInfo { name: "echo".into(), description: Some("Echoes the input back".into()) }])
        }

        async fn call_tool(&self, _tool_name: &str, args: Value) -> Result<BuiltinCallResult, GatewayError> {
            Ok(BuiltinCallResult { content: vec![args], is_error: false })
        }
    }

    struct FailingBuiltin;

    #[async_trait]
    impl BuiltinServer for FailingBuiltin {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn list_tools(&self) -> Result<Vec<BuiltinToolInfo>, GatewayError> {
            Err(GatewayError::UpstreamError("boom".into()))
        }

        async fn call_tool(&self, _tool_name: &str, _args: Value) -> Result<BuiltinCallResult, GatewayError> {
            Err(GatewayError::UpstreamError("boom".into()))
        }
    }

    #[test]
    fn id_helpers_round_trip_the_builtin_prefix() {
        assert!(is_builtin_server("builtin:github"));
        assert!(!is_builtin_server("passport_abc"));
        assert_eq!(extract_builtin_name("builtin:github"), "github");
    }

    #[tokio::test]
    async fn list_all_tools_tolerates_a_failing_server() {
        let registry = BuiltinRegistry::new(vec![Arc::new(EchoBuiltin), Arc::new(FailingBuiltin)]);
        let mut listings = registry.list_all_tools().await;
        listings.sort_by(|a, b| a.server_name.cmp(&b.server_name));

        assert_eq!(listings.len(), 2);
        assert_eq!(listings[0].server_name, "echo");
        assert_eq!(listings[0].tools.len(), 1);
        assert_eq!(listings[1].server_name, "flaky");
        assert!(listings[1].tools.is_empty());
    }
}
