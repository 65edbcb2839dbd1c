//! Encrypted-at-rest credential storage (spec §4.3). Tokens are encrypted
//! with AES-256-GCM before they ever touch the `credential_store` table; the
//! on-disk ciphertext layout is `iv(12) || tag(16) || ct(n)`.

use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

use crate::datastore::{Datastore, SqlParam};
use crate::error::GatewayError;

use super::{CredentialAdapter, OAuthConnection, TokenResult, TokenType};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

pub struct DatabaseAdapter {
    datastore: Arc<dyn Datastore>,
    cipher: Aes256Gcm,
}

impl DatabaseAdapter {
    /// `encryption_key` must be exactly 32 bytes; construction fails
    /// otherwise (spec §4.3).
    pub fn new(datastore: Arc<dyn Datastore>, encryption_key: &[u8]) -> Result<Self, GatewayError> {
        if encryption_key.len() != 32 {
            return Err(GatewayError::Internal(
                "CREDENTIAL_ENCRYPTION_KEY must be exactly 32 bytes".to_string(),
            ));
        }
        let key = Key::<Aes256Gcm>::from_slice(encryption_key);
        Ok(Self { datastore, cipher: Aes256Gcm::new(key) })
    }

    fn encrypt(&self, plaintext: &str) -> Result<Vec<u8>, GatewayError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext_and_tag = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| GatewayError::Internal(format!("encryption failed: {e}")))?;

        // aes-gcm appends the tag to the ciphertext; re-slice into the
        // iv || tag || ct layout the spec mandates.
        let split = ciphertext_and_tag.len() - TAG_LEN;
        let (ct, tag) = ciphertext_and_tag.split_at(split);

        let mut out = Vec::with_capacity(NONCE_LEN + TAG_LEN + ct.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(tag);
        out.extend_from_slice(ct);
        Ok(out)
    }

    fn decrypt(&self, blob: &[u8]) -> Result<String, GatewayError> {
        if blob.len() < NONCE_LEN + TAG_LEN {
            return Err(GatewayError::Internal("ciphertext too short".to_string()));
        }
        let (iv, rest) = blob.split_at(NONCE_LEN);
        let (tag, ct) = rest.split_at(TAG_LEN);

        let mut ct_and_tag = Vec::with_capacity(ct.len() + tag.len());
        ct_and_tag.extend_from_slice(ct);
        ct_and_tag.extend_from_slice(tag);

        let nonce = Nonce::from_slice(iv);
        let plaintext = self
            .cipher
            .decrypt(nonce, ct_and_tag.as_ref())
            .map_err(|e| GatewayError::Internal(format!("decryption failed: {e}")))?;
        String::from_utf8(plaintext).map_err(|e| GatewayError::Internal(format!("invalid utf8: {e}")))
    }

    /// Upserts by `(tenant, provider)` (spec §4.3).
    pub async fn store_token(
        &self,
        tenant: &str,
        provider: &str,
        token: &TokenResult,
    ) -> Result<(), GatewayError> {
        let ciphertext = self.encrypt(token.token.expose_secret())?;
        let token_type = match token.token_type {
            TokenType::Bearer => "bearer",
            TokenType::ApiKey => "api_key",
            TokenType::Basic => "basic",
        };
        let metadata = serde_json::json!({
            "refresh_token": token.refresh_token.as_ref().map(|r| r.expose_secret()),
        });

        self.datastore
            .execute(
                "INSERT INTO credential_store (tenant_id, provider, encrypted_token, token_type, expires_at, metadata) \
                 VALUES ($1, $2, $3, $4, $5, $6) \
                 ON CONFLICT (tenant_id, provider) DO UPDATE SET \
                 encrypted_token = EXCLUDED.encrypted_token, token_type = EXCLUDED.token_type, \
                 expires_at = EXCLUDED.expires_at, metadata = EXCLUDED.metadata",
                &[
                    SqlParam::Text(tenant.to_string()),
                    SqlParam::Text(provider.to_string()),
                    SqlParam::Json(serde_json::Value::String(hex::encode(&ciphertext))),
                    SqlParam::Text(token_type.to_string()),
                    token
                        .expires_at
                        .map(SqlParam::Timestamp)
                        .unwrap_or(SqlParam::Null),
                    SqlParam::Json(metadata),
                ],
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl CredentialAdapter for DatabaseAdapter {
    async fn get_token(&self, tenant: &str, provider: &str) -> Result<Option<TokenResult>, GatewayError> {
        let rows = self
            .datastore
            .query(
                "SELECT encrypted_token, token_type, expires_at, metadata FROM credential_store \
                 WHERE tenant_id = $1 AND provider = $2",
                &[SqlParam::Text(tenant.to_string()), SqlParam::Text(provider.to_string())],
            )
            .await?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };

        let encoded: String = row.try_get("encrypted_token")?;
        let ciphertext = hex::decode(&encoded)
            .map_err(|e| GatewayError::Internal(format!("invalid ciphertext hex: {e}")))?;
        let token = self.decrypt(&ciphertext)?;

        let token_type_str: String = row.try_get("token_type")?;
        let token_type = match token_type_str.as_str() {
            "bearer" => TokenType::Bearer,
            "api_key" => TokenType::ApiKey,
            "basic" => TokenType::Basic,
            other => return Err(GatewayError::Internal(format!("unknown token_type {other}"))),
        };
        let expires_at: Option<DateTime<Utc>> = row.try_get("expires_at").ok();
        let metadata: Value = row.try_get("metadata")?;
        let refresh_token = metadata
            .get("refresh_token")
            .and_then(Value::as_str)
            .map(|s| SecretString::from(s.to_string()));

        Ok(Some(TokenResult {
            token: SecretString::from(token),
            token_type,
            expires_at,
            refresh_token,
            headers: None,
        }))
    }

    async fn revoke_token(&self, tenant: &str, provider: &str) -> Result<(), GatewayError> {
        self.datastore
            .execute(
                "DELETE FROM credential_store WHERE tenant_id = $1 AND provider = $2",
                &[SqlParam::Text(tenant.to_string()), SqlParam::Text(provider.to_string())],
            )
            .await?;
        Ok(())
    }

    async fn list_connections(&self, tenant: &str) -> Result<Vec<OAuthConnection>, GatewayError> {
        let rows = self
            .datastore
            .query(
                "SELECT provider, expires_at FROM credential_store WHERE tenant_id = $1",
                &[SqlParam::Text(tenant.to_string())],
            )
            .await?;

        let now = Utc::now();
        rows.iter()
            .map(|row| {
                let provider: String = row.try_get("provider")?;
                let expires_at: Option<DateTime<Utc>> = row.try_get("expires_at").ok();
                let expired = expires_at.map(|at| at < now).unwrap_or(false);
                Ok(OAuthConnection { provider, connected: true, expired })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::DataRow;

    fn key32() -> Vec<u8> {
        vec![7u8; 32]
    }

    #[test]
    fn construction_fails_with_wrong_key_length() {
        struct NoopStore;
        #[async_trait]
        impl Datastore for NoopStore {
            async fn query(&self, _sql: &str, _params: &[SqlParam]) -> Result<Vec<DataRow>, GatewayError> {
                Ok(Vec::new())
            }
            async fn execute(&self, _sql: &str, _params: &[SqlParam]) -> Result<u64, GatewayError> {
                Ok(0)
            }
        }
        let err = DatabaseAdapter::new(Arc::new(NoopStore), b"too-short").unwrap_err();
        assert!(matches!(err, GatewayError::Internal(_)));
    }

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        struct NoopStore;
        #[async_trait]
        impl Datastore for NoopStore {
            async fn query(&self, _sql: &str, _params: &[SqlParam]) -> Result<Vec<DataRow>, GatewayError> {
                Ok(Vec::new())
            }
            async fn execute(&self, _sql: &str, _params: &[SqlParam]) -> Result<u64, GatewayError> {
                Ok(0)
            }
        }
        let adapter = DatabaseAdapter::new(Arc::new(NoopStore), &key32()).unwrap();
        let ciphertext = adapter.encrypt("super-secret-token").unwrap();
        assert_eq!(ciphertext.len(), NONCE_LEN + TAG_LEN + "super-secret-token".len());
        let plaintext = adapter.decrypt(&ciphertext).unwrap();
        assert_eq!(plaintext, "super-secret-token");
    }

}
