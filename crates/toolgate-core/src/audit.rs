//! Append-only audit log (spec §4.9). Writes are fire-and-forget: a
//! datastore failure here is logged but never fails the caller's request.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::datastore::{Datastore, SqlParam};
use crate::error::GatewayError;
use crate::passport::{Page, Pagination};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Success,
    Error,
    Denied,
}

impl AuditStatus {
    fn as_str(self) -> &'static str {
        match self {
            AuditStatus::Success => "success",
            AuditStatus::Error => "error",
            AuditStatus::Denied => "denied",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub tenant_id: String,
    pub api_key_id: String,
    pub server_id: String,
    pub tool_name: String,
    pub args_hash: String,
    pub status: AuditStatus,
    pub duration_ms: Option<u64>,
    pub error_message: Option<String>,
}

/// Stable hash of the call arguments, stored instead of the raw payload.
pub fn hash_args(args: &serde_json::Value) -> String {
    let canonical = args.to_string();
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(digest)
}

pub struct AuditLog {
    datastore: Arc<dyn Datastore>,
}

impl AuditLog {
    pub fn new(datastore: Arc<dyn Datastore>) -> Self {
        Self { datastore }
    }

    /// Never returns an error to the caller's request path; a write failure
    /// is logged and swallowed (spec §4.9, §7 propagation policy).
    pub async fn record(&self, entry: AuditEntry) {
        let result = self
            .datastore
            .execute(
                "INSERT INTO mcpgate_audit_log \
                 (tenant_id, api_key_id, server_id, tool_name, args_hash, status, error_message, duration_ms, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
                &[
                    SqlParam::Text(entry.tenant_id),
                    SqlParam::Text(entry.api_key_id),
                    SqlParam::Text(entry.server_id),
                    SqlParam::Text(entry.tool_name),
                    SqlParam::Text(entry.args_hash),
                    SqlParam::Text(entry.status.as_str().to_string()),
                    entry.error_message.map(SqlParam::Text).unwrap_or(SqlParam::Null),
                    entry
                        .duration_ms
                        .map(|d| SqlParam::Int(d as i64))
                        .unwrap_or(SqlParam::Null),
                    SqlParam::Timestamp(Utc::now()),
                ],
            )
            .await;

        if let Err(err) = result {
            tracing::warn!(error = %err, "failed to write audit log entry");
        }
    }

    /// Paginated read of a tenant's own audit trail, newest first
    /// (`GET /v1/audit-logs`, spec §6). Unlike [`Self::record`], a read
    /// failure here is propagated — there's no request to protect anymore.
    pub async fn list(&self, tenant_id: &str, page: u32, per_page: u32) -> Result<Page<AuditLogEntry>, GatewayError> {
        let all_rows = self
            .datastore
            .query(
                "SELECT * FROM mcpgate_audit_log WHERE tenant_id = $1 ORDER BY created_at DESC",
                &[SqlParam::Text(tenant_id.to_string())],
            )
            .await?;
        let total = all_rows.len() as u64;

        let page_num = page.max(1);
        let per_page = per_page.max(1);
        let start = ((page_num - 1) * per_page) as usize;
        let items: Vec<AuditLogEntry> = all_rows
            .iter()
            .skip(start)
            .take(per_page as usize)
            .map(row_to_audit_log_entry)
            .collect::<Result<_, _>>()?;

        let total_pages = total.div_ceil(per_page as u64).max(1);
        Ok(Page {
            items,
            pagination: Pagination {
                page: page_num,
                per_page,
                total,
                total_pages,
                has_next: (page_num as u64) < total_pages,
                has_prev: page_num > 1,
            },
        })
    }
}

/// Read-model for a stored audit row; distinct from [`AuditEntry`] since the
/// write path never needs `created_at` supplied by the caller.
#[derive(Debug, Clone, Serialize)]
pub struct AuditLogEntry {
    pub tenant_id: String,
    pub api_key_id: String,
    pub server_id: String,
    pub tool_name: String,
    pub args_hash: String,
    pub status: String,
    pub error_message: Option<String>,
    pub duration_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
}

fn row_to_audit_log_entry(row: &crate::datastore::DataRow) -> Result<AuditLogEntry, GatewayError> {
    Ok(AuditLogEntry {
        tenant_id: row.try_get("tenant_id")?,
        api_key_id: row.try_get("api_key_id")?,
        server_id: row.try_get("server_id")?,
        tool_name: row.try_get("tool_name")?,
        args_hash: row.try_get("args_hash")?,
        status: row.try_get("status")?,
        error_message: row.try_get("error_message").ok(),
        duration_ms: row.try_get("duration_ms").ok(),
        created_at: row.try_get("created_at")?,
    })
}
