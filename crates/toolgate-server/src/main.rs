use std::collections::HashMap;
use std::sync::Arc;

use clap::Parser;
use clap::builder::Styles;
use clap::builder::styling::{AnsiColor, Effects};
use tokio::signal;
use tracing::{error, info, warn};

use toolgate_core::audit::AuditLog;
use toolgate_core::credentials::database_adapter::DatabaseAdapter;
use toolgate_core::credentials::{CompositeCredentialAdapter, CredentialAdapter};
use toolgate_core::credentials::env_adapter::EnvVarAdapter;
use toolgate_core::datastore::{Datastore, PgDatastore};
use toolgate_core::metering::{EventSink, Outbox, OutboxWorker};
use toolgate_core::passport::{PassportStore, SqlPassportStore};
use toolgate_core::quota::QuotaTracker;
use toolgate_core::registry::ToolRegistry;
use toolgate_core::session::SessionStore;

use toolgate_server::builtin::BuiltinRegistry;
use toolgate_server::circuit::CircuitBreaker;
use toolgate_server::config::Config;
use toolgate_server::health_tracker::HealthTracker;
use toolgate_server::ingress::{IngressGate, PolicyEngine};
use toolgate_server::meter_sink::{LoggingEventSink, OpenMeterSink};
use toolgate_server::pool::ClientPool;
use toolgate_server::ratelimit::{BucketConfig, RateLimiter};
use toolgate_server::router::ToolRouter;
use toolgate_server::routes::{self, AppState};
use toolgate_server::tenants::TenantDirectory;

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default());

#[derive(Debug, Parser)]
#[command(version, styles = STYLES, about = "toolgate - a multi-tenant MCP tool-call gateway")]
struct Args {
    /// Path to a YAML config file; TOOLGATE_-prefixed env vars override it.
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let config = Config::load(args.config.as_deref())?;
    info!(service = %config.service_name, environment = %config.environment, "toolgate starting");

    let database_url = config
        .database_url
        .clone()
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL (or config.database_url) is required"))?;
    let datastore: Arc<dyn Datastore> = Arc::new(PgDatastore::connect(&database_url).await?);

    let tenants = TenantDirectory::from_seed(&config.tenants);

    let quota = QuotaTracker::new();
    for seed in &config.tenants {
        if let Some(limit) = seed.quota_limit.or(config.default_quota) {
            quota.set_limit(&seed.tenant.id, limit);
        }
    }

    let ingress = Arc::new(IngressGate::new(tenants, PolicyEngine::new(HashMap::new()), quota));

    let passport_store: Arc<dyn PassportStore> = Arc::new(SqlPassportStore::new(datastore.clone()));
    let registry = Arc::new(ToolRegistry::new(passport_store));

    let mut adapters: Vec<Arc<dyn CredentialAdapter>> = Vec::new();
    if let Some(key_hex) = &config.credential_encryption_key {
        let key = hex::decode(key_hex).map_err(|e| anyhow::anyhow!("CREDENTIAL_ENCRYPTION_KEY is not valid hex: {e}"))?;
        adapters.push(Arc::new(DatabaseAdapter::new(datastore.clone(), &key)?));
    } else {
        warn!("no CREDENTIAL_ENCRYPTION_KEY configured; the database credential adapter is disabled");
    }
    adapters.push(Arc::new(EnvVarAdapter));
    let credentials: Arc<dyn CredentialAdapter> = Arc::new(CompositeCredentialAdapter::new(adapters));

    // Concrete builtin-server integrations (GitHub, Slack, Jira, ...) are
    // opaque plugins registered through `BuiltinServer`; none ship here.
    let builtins = Arc::new(BuiltinRegistry::new(Vec::new()));

    let sessions = SessionStore::new();
    let pool = Arc::new(ClientPool::new(config.client_ttl()));
    let circuit = Arc::new(CircuitBreaker::new(config.circuit_breaker_threshold, config.circuit_breaker_cooldown()));
    let limiter = Arc::new(RateLimiter::new(BucketConfig { rate: config.rate_limit_rps, burst: config.rate_limit_burst }));
    let health = Arc::new(HealthTracker::new());

    let router = Arc::new(ToolRouter::new(
        registry.clone(),
        credentials.clone(),
        builtins.clone(),
        sessions,
        pool.clone(),
        circuit,
        limiter,
        health,
    ));

    let audit = Arc::new(AuditLog::new(datastore.clone()));
    let outbox = Arc::new(Outbox::new(datastore.clone()));

    let sink: Arc<dyn EventSink> = if config.openmeter_enabled {
        match &config.openmeter_endpoint {
            Some(endpoint) => Arc::new(OpenMeterSink::new(endpoint.clone(), config.openmeter_api_key.clone())),
            None => {
                warn!("openmeter_enabled is set but openmeter_endpoint is missing; falling back to the logging sink");
                Arc::new(LoggingEventSink)
            }
        }
    } else {
        Arc::new(LoggingEventSink)
    };
    let worker = OutboxWorker::new(
        datastore.clone(),
        sink,
        format!("toolgate-{}", uuid::Uuid::new_v4()),
        config.outbox_lease_window(),
        config.outbox_batch_size,
    );

    let state = AppState {
        ingress,
        registry,
        router,
        builtins,
        credentials,
        audit: Some(audit),
        outbox: Some(outbox),
        service_name: config.service_name.clone(),
        environment: config.environment.clone(),
    };

    let app = routes::router(state).layer(
        tower_http::trace::TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
            tracing::info_span!(
                "toolgate_request",
                method = %request.method(),
                uri = %request.uri(),
                status_code = tracing::field::Empty,
            )
        }),
    );

    let sweep_pool = pool.clone();
    let sweep_interval = config.client_sweep_interval();
    let sweep_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            ticker.tick().await;
            sweep_pool.sweep().await;
        }
    });

    let poll_interval = config.outbox_poll_interval();
    let outbox_worker = Arc::new(worker);
    let outbox_task = {
        let outbox_worker = outbox_worker.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            loop {
                ticker.tick().await;
                if let Err(error) = outbox_worker.run_once().await {
                    error!(%error, "outbox worker cycle failed");
                }
            }
        })
    };

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!(addr = %config.bind_addr, "listening");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    info!("shutting down: stopping sweeper and outbox worker");
    sweep_task.abort();
    outbox_task.abort();
    if let Err(error) = outbox_worker.release_leases().await {
        error!(%error, "failed to release outbox leases on shutdown");
    }
    pool.close_all().await;

    Ok(())
}

/// Waits for either Ctrl+C or SIGTERM, the way the teacher's server binary
/// triggers `axum::serve`'s graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = signal::ctrl_c().await {
            error!(%error, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(error) => error!(%error, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
