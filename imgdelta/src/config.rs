use std::env;
use std::time::Duration;

use config::{Config, Environment, File, Map};
use serde::Deserialize;

use crate::error::{AppError, Result};

const DEFAULT_CHUNK_SIZE: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub port: u16,
    pub delta: DeltaConfig,
    pub registry: RegistryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeltaConfig {
    /// Repository prefix under which deltas are stored
    pub repository_prefix: String,
    pub lease_duration_secs: u64,
    pub shutdown_timeout_secs: u64,
    /// Reject requests that carry no client credentials
    pub require_auth: bool,
    /// Only store deltas on this registry host
    #[serde(default)]
    pub registry: Option<String>,
}

impl DeltaConfig {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Hosts contacted over plain http
    #[serde(default)]
    pub insecure: Vec<String>,
    pub upload_chunk_size: usize,
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        Self::load_with(None)
    }

    /// Load with `vars` standing in for the process environment.
    fn load_with(vars: Option<Map<String, String>>) -> Result<Self> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "dev".into());

        let config = Config::builder()
            // Start with default values
            .set_default("port", 8080)?
            .set_default("delta.repository_prefix", "deltas")?
            .set_default("delta.lease_duration_secs", 300)?
            .set_default("delta.shutdown_timeout_secs", 30)?
            .set_default("delta.require_auth", false)?
            .set_default("registry.insecure", Vec::<String>::new())?
            .set_default("registry.upload_chunk_size", DEFAULT_CHUNK_SIZE as i64)?

            // Add configuration from files
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))

            // Environment variables like IMGDELTA_DELTA__LEASE_DURATION_SECS
            .add_source(
                Environment::with_prefix("IMGDELTA")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("registry.insecure")
                    .try_parsing(true)
                    .source(vars),
            )

            .build()
            .map_err(|e| AppError::Config(e.to_string()))?;

        let config: AppConfig = config.try_deserialize().map_err(|e| AppError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.delta.lease_duration_secs == 0 {
            return Err(AppError::Config("delta.lease_duration_secs must be positive".to_string()));
        }
        if self.registry.upload_chunk_size == 0 {
            return Err(AppError::Config("registry.upload_chunk_size must be positive".to_string()));
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            delta: DeltaConfig {
                repository_prefix: "deltas".to_string(),
                lease_duration_secs: 300,
                shutdown_timeout_secs: 30,
                require_auth: false,
                registry: None,
            },
            registry: RegistryConfig {
                insecure: Vec::new(),
                upload_chunk_size: DEFAULT_CHUNK_SIZE,
            },
        }
    }
}
