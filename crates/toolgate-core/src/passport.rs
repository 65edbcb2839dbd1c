//! The Passport Store (spec §4.2) — the single persistence abstraction for
//! every registered asset: MCP servers, agents, plugins, mcp-identities.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::datastore::{Datastore, SqlParam};
use crate::error::GatewayError;

pub const BUILTIN_OWNER: &str = "system";
pub const BUILTIN_PREFIX: &str = "builtin:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PassportType {
    Tool,
    Mcp,
    Agent,
    Plugin,
}

impl PassportType {
    pub fn as_str(self) -> &'static str {
        match self {
            PassportType::Tool => "tool",
            PassportType::Mcp => "mcp",
            PassportType::Agent => "agent",
            PassportType::Plugin => "plugin",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PassportStatus {
    Active,
    Revoked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Passport {
    pub passport_id: String,
    #[serde(rename = "type")]
    pub kind: PassportType,
    pub owner: String,
    pub name: String,
    pub description: Option<String>,
    pub metadata: Value,
    pub tags: Vec<String>,
    pub status: PassportStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub kind: Option<PassportType>,
    pub owner: Option<String>,
    pub search: Option<String>,
    pub status: Option<PassportStatus>,
    pub page: u32,
    pub per_page: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct Pagination {
    pub page: u32,
    pub per_page: u32,
    pub total: u64,
    pub total_pages: u64,
    pub has_next: bool,
    pub has_prev: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub pagination: Pagination,
}

#[derive(Debug, Clone)]
pub struct PassportPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub metadata: Option<Value>,
    pub tags: Option<Vec<String>>,
    pub status: Option<PassportStatus>,
}

/// Generates the globally-unique `passport_` id (spec §6 ID formats).
pub fn generate_passport_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..24)
        .map(|_| {
            let n: u8 = rng.gen_range(0..16);
            std::char::from_digit(n as u32, 16).unwrap_or('0')
        })
        .collect();
    format!("passport_{suffix}")
}

/// The store's sole persistence contract (spec §4.2).
#[async_trait::async_trait]
pub trait PassportStore: Send + Sync {
    async fn create(
        &self,
        kind: PassportType,
        owner: &str,
        name: &str,
        description: Option<&str>,
        metadata: Value,
        tags: Vec<String>,
    ) -> Result<Passport, GatewayError>;

    /// Returns a passport regardless of status (spec I2: Get may return a
    /// revoked passport; only List filters it out).
    async fn get(&self, passport_id: &str) -> Result<Option<Passport>, GatewayError>;

    async fn list(&self, filter: ListFilter) -> Result<Page<Passport>, GatewayError>;

    async fn update(&self, passport_id: &str, patch: PassportPatch) -> Result<Passport, GatewayError>;

    /// Soft-delete: sets `status = revoked`. Idempotent (spec §9 design note).
    async fn delete(&self, passport_id: &str) -> Result<(), GatewayError>;
}

/// SQL-backed implementation against the `passports` table (spec §6).
pub struct SqlPassportStore {
    datastore: Arc<dyn Datastore>,
}

impl SqlPassportStore {
    pub fn new(datastore: Arc<dyn Datastore>) -> Self {
        Self { datastore }
    }

    fn row_to_passport(row: &crate::datastore::DataRow) -> Result<Passport, GatewayError> {
        let kind_str: String = row.try_get("type")?;
        let status_str: String = row.try_get("status")?;
        Ok(Passport {
            passport_id: row.try_get("passport_id")?,
            kind: match kind_str.as_str() {
                "tool" => PassportType::Tool,
                "mcp" => PassportType::Mcp,
                "agent" => PassportType::Agent,
                "plugin" => PassportType::Plugin,
                other => return Err(GatewayError::Internal(format!("unknown passport type {other}"))),
            },
            owner: row.try_get("owner")?,
            name: row.try_get("name")?,
            description: row.try_get("description").ok(),
            metadata: row.try_get("metadata")?,
            tags: serde_json::from_value(row.try_get::<Value>("tags")?).unwrap_or_default(),
            status: match status_str.as_str() {
                "active" => PassportStatus::Active,
                "revoked" => PassportStatus::Revoked,
                other => return Err(GatewayError::Internal(format!("unknown status {other}"))),
            },
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait::async_trait]
impl PassportStore for SqlPassportStore {
    async fn create(
        &self,
        kind: PassportType,
        owner: &str,
        name: &str,
        description: Option<&str>,
        metadata: Value,
        tags: Vec<String>,
    ) -> Result<Passport, GatewayError> {
        let passport_id = generate_passport_id();
        let now = Utc::now();
        self.datastore
            .execute(
                "INSERT INTO passports (passport_id, type, owner, name, description, metadata, tags, status, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, 'active', $8, $8)",
                &[
                    SqlParam::Text(passport_id.clone()),
                    SqlParam::Text(kind.as_str().to_string()),
                    SqlParam::Text(owner.to_string()),
                    SqlParam::Text(name.to_string()),
                    description.map(|d| SqlParam::Text(d.to_string())).unwrap_or(SqlParam::Null),
                    SqlParam::Json(metadata.clone()),
                    SqlParam::Json(serde_json::to_value(&tags).unwrap_or(Value::Null)),
                    SqlParam::Timestamp(now),
                ],
            )
            .await?;

        Ok(Passport {
            passport_id,
            kind,
            owner: owner.to_string(),
            name: name.to_string(),
            description: description.map(str::to_string),
            metadata,
            tags,
            status: PassportStatus::Active,
            created_at: now,
            updated_at: now,
        })
    }

    async fn get(&self, passport_id: &str) -> Result<Option<Passport>, GatewayError> {
        let rows = self
            .datastore
            .query(
                "SELECT * FROM passports WHERE passport_id = $1",
                &[SqlParam::Text(passport_id.to_string())],
            )
            .await?;
        rows.first().map(Self::row_to_passport).transpose()
    }

    async fn list(&self, filter: ListFilter) -> Result<Page<Passport>, GatewayError> {
        let mut sql = String::from("SELECT * FROM passports WHERE 1=1");
        let mut params = Vec::new();
        let mut idx = 1;

        if let Some(kind) = filter.kind {
            sql.push_str(&format!(" AND type = ${idx}"));
            params.push(SqlParam::Text(kind.as_str().to_string()));
            idx += 1;
        }
        if let Some(owner) = &filter.owner {
            sql.push_str(&format!(" AND owner = ${idx}"));
            params.push(SqlParam::Text(owner.clone()));
            idx += 1;
        }
        if let Some(search) = &filter.search {
            sql.push_str(&format!(" AND name ILIKE ${idx}"));
            params.push(SqlParam::Text(format!("%{search}%")));
            idx += 1;
        }
        let status = filter.status.unwrap_or(PassportStatus::Active);
        sql.push_str(&format!(
            " AND status = ${idx}",
        ));
        params.push(SqlParam::Text(
            match status {
                PassportStatus::Active => "active",
                PassportStatus::Revoked => "revoked",
            }
            .to_string(),
        ));

        sql.push_str(" ORDER BY created_at DESC");

        let all_rows = self.datastore.query(&sql, &params).await?;
        let total = all_rows.len() as u64;

        let page = filter.page.max(1);
        let per_page = filter.per_page.max(1);
        let start = ((page - 1) * per_page) as usize;
        let items: Vec<Passport> = all_rows
            .iter()
            .skip(start)
            .take(per_page as usize)
            .map(Self::row_to_passport)
            .collect::<Result<_, _>>()?;

        let total_pages = total.div_ceil(per_page as u64).max(1);
        Ok(Page {
            items,
            pagination: Pagination {
                page,
                per_page,
                total,
                total_pages,
                has_next: (page as u64) < total_pages,
                has_prev: page > 1,
            },
        })
    }

    async fn update(&self, passport_id: &str, patch: PassportPatch) -> Result<Passport, GatewayError> {
        let existing = self
            .get(passport_id)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("passport {passport_id} not found")))?;

        let name = patch.name.unwrap_or(existing.name);
        let description = patch.description.or(existing.description);
        let metadata = patch.metadata.unwrap_or(existing.metadata);
        let tags = patch.tags.unwrap_or(existing.tags);
        let status = patch.status.unwrap_or(existing.status);
        let now = Utc::now();

        self.datastore
            .execute(
                "UPDATE passports SET name = $1, description = $2, metadata = $3, tags = $4, status = $5, updated_at = $6 \
                 WHERE passport_id = $7",
                &[
                    SqlParam::Text(name.clone()),
                    description.clone().map(SqlParam::Text).unwrap_or(SqlParam::Null),
                    SqlParam::Json(metadata.clone()),
                    SqlParam::Json(serde_json::to_value(&tags).unwrap_or(Value::Null)),
                    SqlParam::Text(match status {
                        PassportStatus::Active => "active".to_string(),
                        PassportStatus::Revoked => "revoked".to_string(),
                    }),
                    SqlParam::Timestamp(now),
                    SqlParam::Text(passport_id.to_string()),
                ],
            )
            .await?;

        Ok(Passport {
            name,
            description,
            metadata,
            tags,
            status,
            updated_at: now,
            ..existing
        })
    }

    async fn delete(&self, passport_id: &str) -> Result<(), GatewayError> {
        self.datastore
            .execute(
                "UPDATE passports SET status = 'revoked', updated_at = $1 WHERE passport_id = $2",
                &[SqlParam::Timestamp(Utc::now()), SqlParam::Text(passport_id.to_string())],
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_carry_the_passport_prefix() {
        let id = generate_passport_id();
        assert!(id.starts_with("passport_"));
        assert_eq!(id.len(), "passport_".len() + 24);
    }

    #[test]
    fn generated_ids_are_not_trivially_repeated() {
        let a = generate_passport_id();
        let b = generate_passport_id();
        assert_ne!(a, b);
    }
}
