//! `EventSink` implementations the outbox worker can be wired to. Modeled on
//! the thin `reqwest::Client` wrappers the pack's gateways use for outbound
//! webhook calls: build once, reuse across every `emit`, surface a string
//! error so the worker can record it against `last_error` without caring
//! about the transport.

use std::time::Duration;

use reqwest::Client;
use serde_json::json;
use toolgate_core::metering::{EventSink, LedgerEvent};

/// Posts a batch of ledger events as JSON to an OpenMeter-compatible
/// ingestion endpoint, bearer-authenticated.
pub struct OpenMeterSink {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl OpenMeterSink {
    pub fn new(endpoint: String, api_key: Option<String>) -> Self {
        let client = Client::builder().timeout(Duration::from_secs(10)).build().unwrap_or_default();
        Self { client, endpoint, api_key }
    }

    fn to_payload(events: &[LedgerEvent]) -> serde_json::Value {
        json!(
            events
                .iter()
                .map(|e| json!({
                    "event_id": e.event_id,
                    "org_id": e.org_id,
                    "tool_name": e.tool_name,
                    "mcp_server": e.mcp_server,
                    "duration_ms": e.duration_ms,
                    "status_bucket": e.status_bucket.as_str(),
                    "service": e.service,
                    "feature": e.feature,
                    "environment": e.environment,
                    "trace_id": e.trace_id,
                }))
                .collect::<Vec<_>>()
        )
    }
}

#[async_trait::async_trait]
impl EventSink for OpenMeterSink {
    async fn emit(&self, events: &[LedgerEvent]) -> Result<(), String> {
        let mut request = self.client.post(&self.endpoint).json(&Self::to_payload(events));
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await.map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("openmeter ingestion returned {}", response.status()));
        }
        Ok(())
    }
}

/// Fallback sink for deployments without a billing endpoint configured: logs
/// the batch and reports success so the outbox doesn't dead-letter events
/// nobody is ever going to collect.
#[derive(Default)]
pub struct LoggingEventSink;

#[async_trait::async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, events: &[LedgerEvent]) -> Result<(), String> {
        tracing::info!(count = events.len(), "metering events emitted (no downstream sink configured)");
        Ok(())
    }
}
