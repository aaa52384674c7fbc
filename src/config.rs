use std::time::Duration;

use anyhow::{Context, Error};
use config::Config;
use serde::Deserialize;

/// Gateway configuration, loaded from flat environment variables
/// (`GATEWAY_PORT`, `FUNCTIONS_NETWORK`, ...). Every field has a default so
/// the gateway starts with no environment at all.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub gateway_port: u16,
    pub read_timeout: u64,
    pub write_timeout: u64,
    pub exec_timeout: u64,
    pub cors_allowed_origins: String,

    pub docker_host: String,
    pub functions_network: String,

    pub auth_enabled: bool,
    pub auth_user: String,
    pub auth_password: String,
    pub require_auth_for_functions: bool,
    pub auth_rate_limit: u32,
    pub auth_rate_window: u64,
    pub auth_token_ttl: u64,

    pub state_db_path: String,
    pub secrets_path: String,

    pub metrics_enabled: bool,
    pub metrics_port: u16,

    pub log_level: String,

    pub default_replicas: i64,
    pub max_replicas: i64,

    pub debug_bind_address: String,

    pub build_history_limit: usize,
    pub build_history_retention: u64,
    pub build_output_limit: usize,

    pub reconcile_interval: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            gateway_port: 8080,
            read_timeout: 60,
            write_timeout: 60,
            exec_timeout: 60,
            cors_allowed_origins: String::new(),
            docker_host: String::new(),
            functions_network: "docker-faas-net".to_string(),
            auth_enabled: true,
            auth_user: "admin".to_string(),
            auth_password: "admin".to_string(),
            require_auth_for_functions: true,
            auth_rate_limit: 10,
            auth_rate_window: 60,
            auth_token_ttl: 1800,
            state_db_path: "docker-faas.db".to_string(),
            secrets_path: "/var/openfaas/secrets".to_string(),
            metrics_enabled: true,
            metrics_port: 9090,
            log_level: "info".to_string(),
            default_replicas: 1,
            max_replicas: 10,
            debug_bind_address: "127.0.0.1".to_string(),
            build_history_limit: 100,
            build_history_retention: 0,
            build_output_limit: 200 * 1024,
            reconcile_interval: 30,
        }
    }
}

impl AppConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout)
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout)
    }

    pub fn auth_rate_window(&self) -> Duration {
        Duration::from_secs(self.auth_rate_window)
    }

    pub fn auth_token_ttl(&self) -> Duration {
        Duration::from_secs(self.auth_token_ttl)
    }

    pub fn build_history_retention(&self) -> Option<Duration> {
        if self.build_history_retention == 0 {
            None
        } else {
            Some(Duration::from_secs(self.build_history_retention))
        }
    }

    /// CORS origins as a list. Defaults to `*` only when auth is off, so an
    /// unauthenticated gateway stays usable from a browser UI.
    pub fn cors_origins(&self) -> Vec<String> {
        let origins: Vec<String> = self
            .cors_allowed_origins
            .split(',')
            .map(|part| part.trim().to_string())
            .filter(|part| !part.is_empty())
            .collect();
        if origins.is_empty() && !self.auth_enabled {
            return vec!["*".to_string()];
        }
        origins
    }
}

pub fn load_config() -> Result<AppConfig, Error> {
    let config = Config::builder()
        .add_source(config::Environment::default().try_parsing(true))
        .build()
        .context("Can't load configuration")?;

    config
        .try_deserialize()
        .context("Can't deserialize AppConfig from loaded configuration")
}
