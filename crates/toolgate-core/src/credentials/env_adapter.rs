//! Deterministic environment-variable credential lookup (spec §4.3).

use async_trait::async_trait;
use secrecy::SecretString;
use std::env;

use crate::error::GatewayError;

use super::{CredentialAdapter, TokenResult, TokenType};

/// Looks up `<PROVIDER-UPPERCASED-WITH-DASHES-AS-UNDERSCORES>_TOKEN`, e.g.
/// `google-calendar` -> `GOOGLE_CALENDAR_TOKEN`.
pub struct EnvVarAdapter;

impl EnvVarAdapter {
    pub fn env_var_name(provider: &str) -> String {
        format!("{}_TOKEN", provider.to_uppercase().replace('-', "_"))
    }
}

#[async_trait]
impl CredentialAdapter for EnvVarAdapter {
    async fn get_token(&self, _tenant: &str, provider: &str) -> Result<Option<TokenResult>, GatewayError> {
        match env::var(Self::env_var_name(provider)) {
            Ok(value) if !value.is_empty() => Ok(Some(TokenResult {
                token: SecretString::from(value),
                token_type: TokenType::Bearer,
                expires_at: None,
                refresh_token: None,
                headers: None,
            })),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn env_var_name_follows_the_deterministic_pattern() {
        assert_eq!(EnvVarAdapter::env_var_name("google-calendar"), "GOOGLE_CALENDAR_TOKEN");
        assert_eq!(EnvVarAdapter::env_var_name("github"), "GITHUB_TOKEN");
    }

    #[tokio::test]
    async fn returns_none_when_env_var_is_unset() {
        let adapter = EnvVarAdapter;
        unsafe {
            env::remove_var("TOOLGATE_TEST_UNSET_PROVIDER_TOKEN");
        }
        let result = adapter
            .get_token("tenant_a", "toolgate-test-unset-provider")
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn returns_bearer_token_when_env_var_is_set() {
        let adapter = EnvVarAdapter;
        unsafe {
            env::set_var("TOOLGATE_TEST_PROVIDER_TOKEN", "secret-value");
        }
        let result = adapter
            .get_token("tenant_a", "toolgate-test-provider")
            .await
            .unwrap()
            .expect("token present");
        assert_eq!(result.token.expose_secret(), "secret-value");
        assert_eq!(result.token_type, TokenType::Bearer);
        unsafe {
            env::remove_var("TOOLGATE_TEST_PROVIDER_TOKEN");
        }
    }
}
