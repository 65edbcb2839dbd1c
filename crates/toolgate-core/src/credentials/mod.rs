//! The Credential Adapter chain (spec §4.3). Adapters implement a small
//! capability-probed contract rather than a fat interface: most adapters
//! only support `get_token`, a few also support OAuth and revocation.

pub mod database_adapter;
pub mod env_adapter;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use http::HeaderMap;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Bearer,
    ApiKey,
    Basic,
}

#[derive(Clone)]
pub struct TokenResult {
    pub token: SecretString,
    pub token_type: TokenType,
    pub expires_at: Option<DateTime<Utc>>,
    pub refresh_token: Option<SecretString>,
    pub headers: Option<HeaderMap>,
}

impl std::fmt::Debug for TokenResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResult")
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct OAuthConnection {
    pub provider: String,
    pub connected: bool,
    pub expired: bool,
}

/// The capability contract a single credential adapter implements. Every
/// method beyond `get_token` is optional; the composite chain probes
/// availability via the `*_capable` hooks before delegating.
#[async_trait]
pub trait CredentialAdapter: Send + Sync {
    async fn get_token(&self, tenant: &str, provider: &str) -> Result<Option<TokenResult>, GatewayError>;

    fn supports_oauth(&self) -> bool {
        false
    }

    async fn initiate_oauth(&self, _tenant: &str, _provider: &str) -> Result<String, GatewayError> {
        Err(GatewayError::NotImplemented("oauth not supported by this adapter".into()))
    }

    async fn handle_oauth_callback(
        &self,
        _provider_config_key: &str,
        _connection_id: &str,
    ) -> Result<(), GatewayError> {
        Err(GatewayError::NotImplemented("oauth not supported by this adapter".into()))
    }

    async fn revoke_token(&self, _tenant: &str, _provider: &str) -> Result<(), GatewayError> {
        Err(GatewayError::NotImplemented("revoke not supported by this adapter".into()))
    }

    async fn list_connections(&self, _tenant: &str) -> Result<Vec<OAuthConnection>, GatewayError> {
        Ok(Vec::new())
    }
}

/// The only top-level adapter type the router ever sees (spec §9): iterates
/// its members in declaration order for `get_token`, delegates capability
/// methods to the first adapter that implements them, and aggregates
/// `list_connections` with first-adapter-wins de-dup by provider.
pub struct CompositeCredentialAdapter {
    adapters: Vec<Arc<dyn CredentialAdapter>>,
}

impl CompositeCredentialAdapter {
    pub fn new(adapters: Vec<Arc<dyn CredentialAdapter>>) -> Self {
        Self { adapters }
    }
}

#[async_trait]
impl CredentialAdapter for CompositeCredentialAdapter {
    async fn get_token(&self, tenant: &str, provider: &str) -> Result<Option<TokenResult>, GatewayError> {
        for adapter in &self.adapters {
            if let Some(result) = adapter.get_token(tenant, provider).await? {
                return Ok(Some(result));
            }
        }
        Ok(None)
    }

    fn supports_oauth(&self) -> bool {
        self.adapters.iter().any(|a| a.supports_oauth())
    }

    async fn initiate_oauth(&self, tenant: &str, provider: &str) -> Result<String, GatewayError> {
        for adapter in &self.adapters {
            if adapter.supports_oauth() {
                return adapter.initiate_oauth(tenant, provider).await;
            }
        }
        Err(GatewayError::NotImplemented("no OAuth adapter configured".into()))
    }

    async fn handle_oauth_callback(
        &self,
        provider_config_key: &str,
        connection_id: &str,
    ) -> Result<(), GatewayError> {
        for adapter in &self.adapters {
            if adapter.supports_oauth() {
                return adapter
                    .handle_oauth_callback(provider_config_key, connection_id)
                    .await;
            }
        }
        Err(GatewayError::NotImplemented("no OAuth adapter configured".into()))
    }

    async fn revoke_token(&self, tenant: &str, provider: &str) -> Result<(), GatewayError> {
        for adapter in &self.adapters {
            if adapter.supports_oauth() {
                return adapter.revoke_token(tenant, provider).await;
            }
        }
        Err(GatewayError::NotImplemented("no OAuth adapter configured".into()))
    }

    async fn list_connections(&self, tenant: &str) -> Result<Vec<OAuthConnection>, GatewayError> {
        let mut seen = HashMap::new();
        for adapter in &self.adapters {
            for connection in adapter.list_connections(tenant).await? {
                seen.entry(connection.provider.clone()).or_insert(connection);
            }
        }
        Ok(seen.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysNone;
    #[async_trait]
    impl CredentialAdapter for AlwaysNone {
        async fn get_token(&self, _tenant: &str, _provider: &str) -> Result<Option<TokenResult>, GatewayError> {
            Ok(None)
        }
    }

    struct AlwaysSome(&'static str);
    #[async_trait]
    impl CredentialAdapter for AlwaysSome {
        async fn get_token(&self, _tenant: &str, _provider: &str) -> Result<Option<TokenResult>, GatewayError> {
            Ok(Some(TokenResult {
                token: SecretString::from(self.0.to_string()),
                token_type: TokenType::Bearer,
                expires_at: None,
                refresh_token: None,
                headers: None,
            }))
        }
    }

    #[tokio::test]
    async fn composite_returns_first_non_null_in_declaration_order() {
        let chain = CompositeCredentialAdapter::new(vec![
            Arc::new(AlwaysNone),
            Arc::new(AlwaysSome("from-second")),
            Arc::new(AlwaysSome("from-third")),
        ]);
        let result = chain.get_token("tenant_a", "github").await.unwrap().unwrap();
        use secrecy::ExposeSecret;
        assert_eq!(result.token.expose_secret(), "from-second");
    }

    #[tokio::test]
    async fn composite_returns_none_when_no_adapter_has_a_token() {
        let chain = CompositeCredentialAdapter::new(vec![Arc::new(AlwaysNone), Arc::new(AlwaysNone)]);
        assert!(chain.get_token("tenant_a", "github").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn composite_errors_on_oauth_with_no_capable_adapter() {
        let chain = CompositeCredentialAdapter::new(vec![Arc::new(AlwaysNone)]);
        let err = chain.initiate_oauth("tenant_a", "github").await.unwrap_err();
        assert!(matches!(err, GatewayError::NotImplemented(_)));
    }
}
