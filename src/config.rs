//! Configuration management for Ratewall.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{LimiterError, Result};
use crate::ratelimit::{
    DistributedConfig, HealthConfig, LimitRule, LocalConfig, RateLimitConfig,
};
use crate::store::RedisStoreConfig;

/// Main configuration for the limiter service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Shared store configuration
    #[serde(default)]
    pub store: StoreSettings,

    /// Health probing configuration
    #[serde(default)]
    pub health: HealthSettings,

    /// Local fallback configuration
    #[serde(default)]
    pub local: LocalSettings,

    /// Named limits, keyed by use-case name
    #[serde(default)]
    pub limits: HashMap<String, LimitRule>,
}

/// Shared store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Redis connection URL
    #[serde(default = "default_url")]
    pub url: String,

    /// Prefix applied to every key this service writes
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Timeout for a single store command in milliseconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,

    /// Timeout for establishing the connection in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            url: default_url(),
            namespace: default_namespace(),
            command_timeout_ms: default_command_timeout(),
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

fn default_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_namespace() -> String {
    "ratelimit:".to_string()
}

fn default_command_timeout() -> u64 {
    250
}

fn default_connect_timeout() -> u64 {
    2000
}

/// Health probing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSettings {
    /// Seconds between scheduled probes
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,

    /// Probe timeout in milliseconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            probe_interval_secs: default_probe_interval(),
            probe_timeout_ms: default_probe_timeout(),
        }
    }
}

fn default_probe_interval() -> u64 {
    30
}

fn default_probe_timeout() -> u64 {
    500
}

/// Local fallback configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalSettings {
    /// Seconds between sweeps of idle keys
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Maximum number of keys tracked in memory
    #[serde(default = "default_max_keys")]
    pub max_keys: usize,
}

impl Default for LocalSettings {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
            max_keys: default_max_keys(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_max_keys() -> usize {
    100_000
}

impl ServiceConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading service configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: ServiceConfig = serde_yaml::from_str(yaml)
            .map_err(|e| LimiterError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the limiter misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.store.command_timeout_ms == 0 {
            return Err(LimiterError::Config(
                "store.command_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.store.connect_timeout_ms == 0 {
            return Err(LimiterError::Config(
                "store.connect_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.health.probe_timeout_ms == 0 {
            return Err(LimiterError::Config(
                "health.probe_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.health.probe_interval_secs == 0 {
            return Err(LimiterError::Config(
                "health.probe_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.local.sweep_interval_secs == 0 {
            return Err(LimiterError::Config(
                "local.sweep_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.local.max_keys == 0 {
            return Err(LimiterError::Config(
                "local.max_keys must be greater than zero".to_string(),
            ));
        }
        for (name, rule) in &self.limits {
            RateLimitConfig::try_from(rule)
                .map_err(|e| LimiterError::Config(format!("limit '{}': {}", name, e)))?;
        }
        Ok(())
    }

    pub fn redis_config(&self) -> RedisStoreConfig {
        RedisStoreConfig {
            url: self.store.url.clone(),
            connect_timeout: Duration::from_millis(self.store.connect_timeout_ms),
        }
    }

    pub fn distributed_config(&self) -> DistributedConfig {
        DistributedConfig {
            namespace: self.store.namespace.clone(),
            command_timeout: Duration::from_millis(self.store.command_timeout_ms),
        }
    }

    pub fn health_config(&self) -> HealthConfig {
        HealthConfig {
            probe_interval: Duration::from_secs(self.health.probe_interval_secs),
            probe_timeout: Duration::from_millis(self.health.probe_timeout_ms),
        }
    }

    pub fn local_config(&self) -> LocalConfig {
        LocalConfig {
            sweep_interval: Duration::from_secs(self.local.sweep_interval_secs),
            max_keys: self.local.max_keys,
        }
    }
}
