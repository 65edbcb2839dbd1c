//! Layered configuration: a YAML file merged with `TOOLGATE_`-prefixed
//! environment variables, the way the teacher's `runtime::Config` loads
//! `apollo.config.yaml` and env overrides.

use std::net::SocketAddr;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};

use toolgate_core::tenant::{ApiKey, Tenant};

fn default_bind_addr() -> SocketAddr {
    "0.0.0.0:8080".parse().unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8080)))
}

fn default_service_name() -> String {
    "toolgate".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_circuit_threshold() -> u32 {
    5
}

fn default_circuit_cooldown_ms() -> u64 {
    30_000
}

fn default_rate_limit_rps() -> f64 {
    10.0
}

fn default_rate_limit_burst() -> f64 {
    20.0
}

fn default_client_ttl_ms() -> u64 {
    30 * 60 * 1000
}

fn default_client_sweep_interval_ms() -> u64 {
    5 * 60 * 1000
}

fn default_outbox_lease_window_ms() -> u64 {
    60_000
}

fn default_outbox_batch_size() -> i64 {
    50
}

fn default_outbox_poll_interval_ms() -> u64 {
    2_000
}

fn default_default_quota() -> Option<u64> {
    None
}

fn default_openmeter_enabled() -> bool {
    false
}

/// A statically-seeded tenant plus its API keys; tenant/key administration
/// is out of scope here, so this is the whole of the onboarding story.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SeedTenant {
    #[serde(flatten)]
    pub tenant: Tenant,
    #[serde(default)]
    pub api_keys: Vec<ApiKey>,
    #[serde(default)]
    pub quota_limit: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    #[serde(default)]
    pub database_url: Option<String>,

    #[serde(default)]
    pub credential_encryption_key: Option<String>,

    #[serde(default = "default_service_name")]
    pub service_name: String,

    #[serde(default = "default_environment")]
    pub environment: String,

    #[serde(default = "default_default_quota")]
    pub default_quota: Option<u64>,

    #[serde(default = "default_circuit_threshold")]
    pub circuit_breaker_threshold: u32,
    #[serde(default = "default_circuit_cooldown_ms")]
    pub circuit_breaker_cooldown_ms: u64,

    #[serde(default = "default_rate_limit_rps")]
    pub rate_limit_rps: f64,
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: f64,

    #[serde(default = "default_client_ttl_ms")]
    pub client_ttl_ms: u64,
    #[serde(default = "default_client_sweep_interval_ms")]
    pub client_sweep_interval_ms: u64,

    #[serde(default = "default_outbox_lease_window_ms")]
    pub outbox_lease_window_ms: u64,
    #[serde(default = "default_outbox_batch_size")]
    pub outbox_batch_size: i64,
    #[serde(default = "default_outbox_poll_interval_ms")]
    pub outbox_poll_interval_ms: u64,

    #[serde(default = "default_openmeter_enabled")]
    pub openmeter_enabled: bool,
    #[serde(default)]
    pub openmeter_endpoint: Option<String>,
    #[serde(default)]
    pub openmeter_api_key: Option<String>,

    #[serde(default)]
    pub tenants: Vec<SeedTenant>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            database_url: None,
            credential_encryption_key: None,
            service_name: default_service_name(),
            environment: default_environment(),
            default_quota: default_default_quota(),
            circuit_breaker_threshold: default_circuit_threshold(),
            circuit_breaker_cooldown_ms: default_circuit_cooldown_ms(),
            rate_limit_rps: default_rate_limit_rps(),
            rate_limit_burst: default_rate_limit_burst(),
            client_ttl_ms: default_client_ttl_ms(),
            client_sweep_interval_ms: default_client_sweep_interval_ms(),
            outbox_lease_window_ms: default_outbox_lease_window_ms(),
            outbox_batch_size: default_outbox_batch_size(),
            outbox_poll_interval_ms: default_outbox_poll_interval_ms(),
            openmeter_enabled: default_openmeter_enabled(),
            openmeter_endpoint: None,
            openmeter_api_key: None,
            tenants: Vec::new(),
        }
    }
}

impl Config {
    pub fn circuit_breaker_cooldown(&self) -> Duration {
        Duration::from_millis(self.circuit_breaker_cooldown_ms)
    }

    pub fn client_ttl(&self) -> Duration {
        Duration::from_millis(self.client_ttl_ms)
    }

    pub fn client_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.client_sweep_interval_ms)
    }

    pub fn outbox_lease_window(&self) -> Duration {
        Duration::from_millis(self.outbox_lease_window_ms)
    }

    pub fn outbox_poll_interval(&self) -> Duration {
        Duration::from_millis(self.outbox_poll_interval_ms)
    }

    /// Loads the layered config: built-in defaults, an optional YAML file,
    /// then `TOOLGATE_`-prefixed environment variables, in that order of
    /// increasing precedence.
    pub fn load(path: Option<&str>) -> Result<Self, figment::Error> {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        figment = figment.merge(Env::prefixed("TOOLGATE_").split("__"));
        figment.extract()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_without_a_config_file() {
        let config = Config::load(None).expect("defaults must be a valid config");
        assert_eq!(config.service_name, "toolgate");
        assert_eq!(config.circuit_breaker_threshold, 5);
    }

    #[test]
    fn env_override_wins_over_defaults() {
        // SAFETY: test-only, single-threaded access to the process environment.
        unsafe {
            std::env::set_var("TOOLGATE_SERVICE_NAME", "toolgate-test");
        }
        let config = Config::load(None).expect("config with env override");
        assert_eq!(config.service_name, "toolgate-test");
        unsafe {
            std::env::remove_var("TOOLGATE_SERVICE_NAME");
        }
    }
}
