//! The outbound MCP Client Pool, grounded directly in the
//! connect/transport-dispatch shape of `McpManager::connect_server_impl`
//! from the `lightseekorg-smg` MCP gateway: one client per key,
//! lazily created, `stdio`/`sse`/`streamable-http` dispatched through
//! `rmcp`'s transport types.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use http::HeaderMap;
use rmcp::service::RunningService;
use rmcp::transport::sse_client::SseClientConfig;
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use rmcp::transport::{ConfigureCommandExt, SseClientTransport, StreamableHttpClientTransport, TokioChildProcess};
use rmcp::{RoleClient, ServiceExt};
use tokio::sync::Mutex;

use toolgate_core::error::GatewayError;

pub type McpClient = RunningService<RoleClient, ()>;

#[derive(Debug, Clone)]
pub enum TransportConfig {
    StreamableHttp { url: String },
    Sse { url: String },
    Stdio { command: String, args: Vec<String>, env: HashMap<String, String> },
}

/// Everything the pool needs to open a fresh connection. `auth_header` is
/// the fully-formed `Authorization` value the router already computed
/// (`"Bearer "+token`, `"Basic "+token`, or the raw token); `extra_headers`
/// are adapter-supplied headers merged on top.
#[derive(Debug, Clone)]
pub struct McpServerConfig {
    pub transport: TransportConfig,
    pub auth_header: Option<String>,
    pub extra_headers: HeaderMap,
}

struct PooledClient {
    client: Arc<McpClient>,
    last_used: Mutex<Instant>,
}

/// Keyed by `tenant:server_id`.
pub struct ClientPool {
    entries: DashMap<String, PooledClient>,
    ttl: Duration,
}

impl ClientPool {
    pub fn new(ttl: Duration) -> Self {
        Self { entries: DashMap::new(), ttl }
    }

    pub async fn get_or_create(&self, key: &str, config: &McpServerConfig) -> Result<Arc<McpClient>, GatewayError> {
        if let Some(entry) = self.entries.get(key) {
            *entry.last_used.lock().await = Instant::now();
            return Ok(Arc::clone(&entry.client));
        }

        let client = Arc::new(connect(config).await?);
        self.entries.insert(
            key.to_string(),
            PooledClient { client: Arc::clone(&client), last_used: Mutex::new(Instant::now()) },
        );
        Ok(client)
    }

    /// Drops a client so the next call reconnects from scratch; the router
    /// evicts a client on exception.
    pub fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Closes every entry idle longer than the configured TTL. Intended to
    /// run on a periodic ticker.
    pub async fn sweep(&self) {
        let mut expired = Vec::new();
        for entry in self.entries.iter() {
            if entry.last_used.lock().await.elapsed() >= self.ttl {
                expired.push(entry.key().clone());
            }
        }
        for key in expired {
            if let Some((_, entry)) = self.entries.remove(&key) {
                entry.client.cancel().await.ok();
            }
        }
    }

    /// Closes every pooled client, used on graceful shutdown.
    pub async fn close_all(&self) {
        let keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, entry)) = self.entries.remove(&key) {
                entry.client.cancel().await.ok();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

async fn connect(config: &McpServerConfig) -> Result<McpClient, GatewayError> {
    match &config.transport {
        TransportConfig::Stdio { command, args, env } => {
            let transport = TokioChildProcess::new(tokio::process::Command::new(command).configure(|cmd| {
                cmd.args(args).envs(env.iter());
            }))
            .map_err(|e| GatewayError::UpstreamError(format!("create stdio transport: {e}")))?;

            ().serve(transport)
                .await
                .map_err(|e| GatewayError::UpstreamError(format!("initialize stdio client: {e}")))
        }

        TransportConfig::Sse { url } => {
            let mut headers = config.extra_headers.clone();
            if let Some(auth) = &config.auth_header {
                let value = http::HeaderValue::from_str(auth)
                    .map_err(|e| GatewayError::UpstreamError(format!("invalid auth header: {e}")))?;
                headers.insert(http::header::AUTHORIZATION, value);
            }

            let client = reqwest::Client::builder()
                .default_headers(headers)
                .build()
                .map_err(|e| GatewayError::UpstreamError(format!("build HTTP client: {e}")))?;

            let cfg = SseClientConfig { sse_endpoint: url.clone().into(), ..Default::default() };
            let transport = SseClientTransport::start_with_client(client, cfg)
                .await
                .map_err(|e| GatewayError::UpstreamError(format!("create SSE transport: {e}")))?;

            ().serve(transport)
                .await
                .map_err(|e| GatewayError::UpstreamError(format!("initialize SSE client: {e}")))
        }

        TransportConfig::StreamableHttp { url } => {
            let transport = if let Some(auth) = &config.auth_header {
                let mut cfg = StreamableHttpClientTransportConfig::with_uri(url.as_str());
                cfg.auth_header = Some(auth.clone());
                StreamableHttpClientTransport::from_config(cfg)
            } else {
                StreamableHttpClientTransport::from_uri(url.as_str())
            };

            ().serve(transport)
                .await
                .map_err(|e| GatewayError::UpstreamError(format!("initialize streamable client: {e}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_surfaces_an_upstream_error_for_an_unreachable_stdio_command() {
        let config = McpServerConfig {
            transport: TransportConfig::Stdio {
                command: "definitely-not-a-real-binary-toolgate".into(),
                args: vec![],
                env: HashMap::new(),
            },
            auth_header: None,
            extra_headers: HeaderMap::new(),
        };
        let err = connect(&config).await.unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamError(_)));
    }

    #[test]
    fn pool_starts_empty() {
        let pool = ClientPool::new(Duration::from_secs(1800));
        assert_eq!(pool.len(), 0);
    }
}
