//! The Tool Registry (spec §4.2) — domain semantics for `type=tool`
//! passports layered over the generic [`PassportStore`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::GatewayError;
use crate::passport::{
    ListFilter, Page, Passport, PassportPatch, PassportStatus, PassportStore, PassportType,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Transport {
    StreamableHttp,
    Sse,
    Stdio,
    Builtin,
}

impl Transport {
    pub fn as_str(self) -> &'static str {
        match self {
            Transport::StreamableHttp => "streamable-http",
            Transport::Sse => "sse",
            Transport::Stdio => "stdio",
            Transport::Builtin => "builtin",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "streamable-http" => Some(Transport::StreamableHttp),
            "sse" => Some(Transport::Sse),
            "stdio" => Some(Transport::Stdio),
            "builtin" => Some(Transport::Builtin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterToolInput {
    pub name: String,
    pub transport: String,
    pub url: Option<String>,
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    pub env: Option<serde_json::Map<String, Value>>,
    pub description: Option<String>,
    pub auth_provider: Option<String>,
}

/// Wraps [`PassportStore`] with the validation and shape rules for
/// `type=tool` passports (spec §4.2).
pub struct ToolRegistry {
    store: Arc<dyn PassportStore>,
}

impl ToolRegistry {
    pub fn new(store: Arc<dyn PassportStore>) -> Self {
        Self { store }
    }

    pub async fn register(&self, tenant: &str, input: RegisterToolInput) -> Result<Passport, GatewayError> {
        let transport = Transport::from_str(&input.transport)
            .ok_or_else(|| GatewayError::BadRequest(format!("unsupported transport {}", input.transport)))?;

        match transport {
            Transport::StreamableHttp | Transport::Sse if input.url.is_none() => {
                return Err(GatewayError::BadRequest(format!(
                    "url is required for transport {}",
                    transport.as_str()
                )));
            }
            Transport::Stdio if input.command.is_none() => {
                return Err(GatewayError::BadRequest(
                    "command is required for transport stdio".to_string(),
                ));
            }
            _ => {}
        }

        let mut metadata = json!({
            "transport": transport.as_str(),
        });
        let obj = metadata.as_object_mut().ok_or_else(|| {
            GatewayError::Internal("metadata object construction failed".to_string())
        })?;
        if let Some(url) = &input.url {
            obj.insert("url".to_string(), json!(url));
        }
        if let Some(command) = &input.command {
            obj.insert("command".to_string(), json!(command));
        }
        if let Some(args) = &input.args {
            obj.insert("args".to_string(), json!(args));
        }
        if let Some(env) = &input.env {
            obj.insert("env".to_string(), Value::Object(env.clone()));
        }
        if let Some(auth_provider) = &input.auth_provider {
            obj.insert("auth_provider".to_string(), json!(auth_provider));
        }

        self.store
            .create(
                PassportType::Tool,
                tenant,
                &input.name,
                input.description.as_deref(),
                metadata,
                Vec::new(),
            )
            .await
    }

    /// Returns the raw passport; the caller is responsible for the
    /// `owner == tenant` check (spec I3) since ownership rules differ
    /// between call paths (list/get/call).
    pub async fn get(&self, passport_id: &str) -> Result<Option<Passport>, GatewayError> {
        self.store.get(passport_id).await
    }

    pub async fn list(&self, tenant: &str, page: u32, per_page: u32) -> Result<Page<Passport>, GatewayError> {
        self.store
            .list(ListFilter {
                kind: Some(PassportType::Tool),
                owner: Some(tenant.to_string()),
                search: None,
                status: Some(PassportStatus::Active),
                page,
                per_page,
            })
            .await
    }

    /// Soft-delete; idempotent (spec §9 — repeated delete still returns ok).
    pub async fn remove(&self, passport_id: &str) -> Result<(), GatewayError> {
        self.store.delete(passport_id).await
    }

    /// Records the most recently observed tool list under
    /// `metadata.tools_cache`, used by discovery and display.
    pub async fn update_tools(&self, passport_id: &str, names: Vec<String>) -> Result<Passport, GatewayError> {
        let existing = self
            .store
            .get(passport_id)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("passport {passport_id} not found")))?;

        let mut metadata = existing.metadata.clone();
        if let Some(obj) = metadata.as_object_mut() {
            obj.insert("tools_cache".to_string(), json!(names));
        }

        self.store
            .update(
                passport_id,
                PassportPatch {
                    name: None,
                    description: None,
                    metadata: Some(metadata),
                    tags: None,
                    status: None,
                },
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeStore {
        created: Mutex<Vec<(String, String, Value)>>,
    }

    #[async_trait::async_trait]
    impl PassportStore for FakeStore {
        async fn create(
            &self,
            kind: PassportType,
            owner: &str,
            name: &str,
            _description: Option<&str>,
            metadata: Value,
            _tags: Vec<String>,
        ) -> Result<Passport, GatewayError> {
            self.created
                .lock()
                .expect("lock")
                .push((owner.to_string(), name.to_string(), metadata.clone()));
            Ok(Passport {
                passport_id: "passport_test".into(),
                kind,
                owner: owner.to_string(),
                name: name.to_string(),
                description: None,
                metadata,
                tags: vec![],
                status: PassportStatus::Active,
                created_at: chrono::Utc::now(),
                updated_at: chrono::Utc::now(),
            })
        }
        async fn get(&self, _id: &str) -> Result<Option<Passport>, GatewayError> {
            Ok(None)
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

    #[tokio::test]
    async fn register_rejects_streamable_http_without_url() {
        let registry = ToolRegistry::new(Arc::new(FakeStore::default()));
        let err = registry
            .register(
                "tenant_a",
                RegisterToolInput {
                    name: "GitHub MCP".into(),
                    transport: "streamable-http".into(),
                    url: None,
                    command: None,
                    args: None,
                    env: None,
                    description: None,
                    auth_provider: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::BadRequest(_)));
    }

    #[tokio::test]
    async fn register_rejects_stdio_without_command() {
        let registry = ToolRegistry::new(Arc::new(FakeStore::default()));
        let err = registry
            .register(
                "tenant_a",
                RegisterToolInput {
                    name: "Local".into(),
                    transport: "stdio".into(),
                    url: None,
                    command: None,
                    args: None,
                    env: None,
                    description: None,
                    auth_provider: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::BadRequest(_)));
    }

    #[tokio::test]
    async fn register_succeeds_with_url_for_streamable_http() {
        let store = Arc::new(FakeStore::default());
        let registry = ToolRegistry::new(store.clone());
        let passport = registry
            .register(
                "tenant_a",
                RegisterToolInput {
                    name: "GitHub MCP".into(),
                    transport: "streamable-http".into(),
                    url: Some("https://x/sse".into()),
                    command: None,
                    args: None,
                    env: None,
                    description: None,
                    auth_provider: None,
                },
            )
            .await
            .expect("register succeeds");
        assert_eq!(passport.owner, "tenant_a");
        assert_eq!(passport.metadata["transport"], "streamable-http");
        assert_eq!(passport.metadata["url"], "https://x/sse");
    }

    #[tokio::test]
    async fn register_rejects_unknown_transport() {
        let registry = ToolRegistry::new(Arc::new(FakeStore::default()));
        let err = registry
            .register(
                "tenant_a",
                RegisterToolInput {
                    name: "Weird".into(),
                    transport: "carrier-pigeon".into(),
                    url: None,
                    command: None,
                    args: None,
                    env: None,
                    description: None,
                    auth_provider: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::BadRequest(_)));
    }
}
