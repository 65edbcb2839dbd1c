//! The metering outbox (spec §4.9): at-least-once delivery of usage events
//! to a downstream billing system, via claim-lease-emit-ack over the
//! `openmeter_event_ledger` table.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::datastore::{Datastore, SqlParam};
use crate::error::GatewayError;

const MAX_ATTEMPTS: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusBucket {
    Success,
    Error,
    Timeout,
}

impl StatusBucket {
    pub fn as_str(self) -> &'static str {
        match self {
            StatusBucket::Success => "success",
            StatusBucket::Error => "error",
            StatusBucket::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LedgerEvent {
    pub event_id: Uuid,
    pub org_id: String,
    pub tool_name: String,
    pub mcp_server: String,
    pub duration_ms: u64,
    pub status_bucket: StatusBucket,
    pub service: String,
    pub feature: String,
    pub environment: String,
    pub trace_id: Option<String>,
}

/// Emits a claimed batch of events to the downstream billing system. The
/// concrete sink (HTTP call to OpenMeter or similar) is external to this
/// crate; tests substitute a fake.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, events: &[LedgerEvent]) -> Result<(), String>;
}

/// Writes rows inline on the router's hot path (spec §4.9 step 1). Never
/// fails the request — a write failure here is logged, not propagated.
pub struct Outbox {
    datastore: Arc<dyn Datastore>,
}

impl Outbox {
    pub fn new(datastore: Arc<dyn Datastore>) -> Self {
        Self { datastore }
    }

    pub async fn enqueue(&self, event: &LedgerEvent) {
        let result = self
            .datastore
            .execute(
                "INSERT INTO openmeter_event_ledger \
                 (event_id, org_id, tool_name, mcp_server, duration_ms, status_bucket, service, feature, environment, trace_id, attempts, sent_at, lease_until, lease_owner, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 0, NULL, NULL, NULL, $11)",
                &[
                    SqlParam::Uuid(event.event_id),
                    SqlParam::Text(event.org_id.clone()),
                    SqlParam::Text(event.tool_name.clone()),
                    SqlParam::Text(event.mcp_server.clone()),
                    SqlParam::Int(event.duration_ms as i64),
                    SqlParam::Text(event.status_bucket.as_str().to_string()),
                    SqlParam::Text(event.service.clone()),
                    SqlParam::Text(event.feature.clone()),
                    SqlParam::Text(event.environment.clone()),
                    event.trace_id.clone().map(SqlParam::Text).unwrap_or(SqlParam::Null),
                    SqlParam::Timestamp(Utc::now()),
                ],
            )
            .await;

        if let Err(err) = result {
            tracing::warn!(error = %err, event_id = %event.event_id, "failed to enqueue metering event");
        }
    }
}

/// A background worker draining the outbox. Multiple instances MAY run
/// concurrently; mutual exclusion per row is via the lease (spec §5).
pub struct OutboxWorker {
    datastore: Arc<dyn Datastore>,
    sink: Arc<dyn EventSink>,
    worker_id: String,
    lease_window: Duration,
    batch_size: i64,
}

impl OutboxWorker {
    pub fn new(
        datastore: Arc<dyn Datastore>,
        sink: Arc<dyn EventSink>,
        worker_id: String,
        lease_window: Duration,
        batch_size: i64,
    ) -> Self {
        Self { datastore, sink, worker_id, lease_window, batch_size }
    }

    /// One claim-emit-ack cycle. Returns the number of events processed.
    pub async fn run_once(&self) -> Result<usize, GatewayError> {
        let now = Utc::now();
        let lease_until = now
            + chrono::Duration::from_std(self.lease_window).unwrap_or_else(|_| chrono::Duration::zero());

        // Claim: rows unsent, under the attempt cap, and not currently
        // leased by another worker.
        let claim_sql = format!(
            "UPDATE openmeter_event_ledger SET lease_until = $1, lease_owner = $2 \
             WHERE event_id IN ( \
               SELECT event_id FROM openmeter_event_ledger \
               WHERE sent_at IS NULL AND attempts < {MAX_ATTEMPTS} AND (lease_until IS NULL OR lease_until < $3) \
               ORDER BY created_at ASC LIMIT {} \
             ) RETURNING event_id, org_id, tool_name, mcp_server, duration_ms, status_bucket, service, feature, environment, trace_id, attempts",
            self.batch_size
        );

        let rows = self
            .datastore
            .query(&claim_sql, &[SqlParam::Timestamp(lease_until), SqlParam::Text(self.worker_id.clone()), SqlParam::Timestamp(now)])
            .await?;

        if rows.is_empty() {
            return Ok(0);
        }

        let mut events = Vec::with_capacity(rows.len());
        for row in &rows {
            events.push(LedgerEvent {
                event_id: row.try_get("event_id")?,
                org_id: row.try_get("org_id")?,
                tool_name: row.try_get("tool_name")?,
                mcp_server: row.try_get("mcp_server")?,
                duration_ms: row.try_get::<i64>("duration_ms")? as u64,
                status_bucket: match row.try_get::<String>("status_bucket")?.as_str() {
                    "success" => StatusBucket::Success,
                    "error" => StatusBucket::Error,
                    "timeout" => StatusBucket::Timeout,
                    other => return Err(GatewayError::Internal(format!("unknown status_bucket {other}"))),
                },
                service: row.try_get("service")?,
                feature: row.try_get("feature")?,
                environment: row.try_get("environment")?,
                trace_id: row.try_get("trace_id").ok(),
            });
        }

        match self.sink.emit(&events).await {
            Ok(()) => {
                for event in &events {
                    self.datastore
                        .execute(
                            "UPDATE openmeter_event_ledger SET sent_at = $1, lease_until = NULL, lease_owner = NULL WHERE event_id = $2",
                            &[SqlParam::Timestamp(Utc::now()), SqlParam::Uuid(event.event_id)],
                        )
                        .await?;
                }
            }
            Err(error) => {
                for event in &events {
                    self.datastore
                        .execute(
                            "UPDATE openmeter_event_ledger SET attempts = attempts + 1, last_error = $1, lease_until = NULL, lease_owner = NULL WHERE event_id = $2",
                            &[SqlParam::Text(error.clone()), SqlParam::Uuid(event.event_id)],
                        )
                        .await?;
                }
            }
        }

        Ok(events.len())
    }

    /// Releases this worker's held leases on graceful shutdown (spec §9).
    pub async fn release_leases(&self) -> Result<(), GatewayError> {
        self.datastore
            .execute(
                "UPDATE openmeter_event_ledger SET lease_until = NULL, lease_owner = NULL WHERE lease_owner = $1 AND sent_at IS NULL",
                &[SqlParam::Text(self.worker_id.clone())],
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_bucket_strings_match_spec_vocabulary() {
        assert_eq!(StatusBucket::Success.as_str(), "success");
        assert_eq!(StatusBucket::Error.as_str(), "error");
        assert_eq!(StatusBucket::Timeout.as_str(), "timeout");
    }
}
