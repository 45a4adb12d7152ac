//! Configuration discovery and loading
//!
//! This module handles the configuration discovery hierarchy:
//! 1. Explicit file: $HACKENV_CONFIG
//! 2. Current directory: ./hackenv.toml or ./.hackenv/config.toml
//! 3. User config: ~/.hackenv/config.toml
//! 4. System config: /etc/hackenv/config.toml
//! 5. Built-in defaults

use crate::env;
use crate::instance::{LifecycleConfig, RetryPolicy};
use crate::mapper::{MapperConfig, PortPool};
use crate::orchestrator::OrchestratorConfig;
use crate::template::ValidationOptions;
use serde::{Deserialize, Serialize};
use std::env as std_env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to access {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Could not determine home directory")]
    NoHomeDir,
}

/// Host port range and advertised addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    pub range_start: u16,
    pub range_end: u16,
    /// Host advertised for public ports
    pub public_host: String,
    /// Host the probe and broker reach bound ports on
    pub internal_host: String,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            range_start: 10000,
            range_end: 20000,
            public_host: "127.0.0.1".to_string(),
            internal_host: "127.0.0.1".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleSection {
    pub startup_timeout_secs: u64,
    pub probe_interval_ms: u64,
    pub stop_timeout_secs: u64,
    pub stop_retry_interval_ms: u64,
    pub start_retry: RetryPolicy,
    pub crash_loop_restarts: i64,
}

impl Default for LifecycleSection {
    fn default() -> Self {
        Self {
            startup_timeout_secs: 120,
            probe_interval_ms: 500,
            stop_timeout_secs: 30,
            stop_retry_interval_ms: 1000,
            start_retry: RetryPolicy::default(),
            crash_loop_restarts: 3,
        }
    }
}

/// Which broker implementation the binary wires in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerMode {
    /// In-process session registry read by the gateway
    Embedded,
    /// Remote gateway reached over HTTP
    Http,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSection {
    pub mode: BrokerMode,
    pub gateway_url: String,
    pub session_timeout_secs: u64,
    /// Fail provisioning when no session can be opened
    pub required: bool,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            mode: BrokerMode::Embedded,
            gateway_url: "http://localhost:8080/guacamole".to_string(),
            session_timeout_secs: 15,
            required: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReclamationSection {
    pub enabled: bool,
    /// Instance lifetime; 0 disables expiry
    pub ttl_minutes: i64,
    /// Idle threshold; 0 disables idle reclamation
    pub idle_minutes: i64,
    pub sweep_interval_secs: u64,
    pub terminal_retention_minutes: i64,
}

impl Default for ReclamationSection {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_minutes: 60,
            idle_minutes: 30,
            sweep_interval_secs: 60,
            terminal_retention_minutes: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSection {
    pub auto_pull: bool,
    /// Grace period handed to the runtime's own stop, in seconds
    pub stop_grace_secs: i64,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            auto_pull: true,
            stop_grace_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    pub max_instances: usize,
    pub elevated_trust: bool,
    pub container_prefix: String,
    pub ports: PortsConfig,
    pub lifecycle: LifecycleSection,
    pub broker: BrokerSection,
    pub reclamation: ReclamationSection,
    pub runtime: RuntimeSection,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            max_instances: 100,
            elevated_trust: false,
            container_prefix: "hackenv".to_string(),
            ports: PortsConfig::default(),
            lifecycle: LifecycleSection::default(),
            broker: BrokerSection::default(),
            reclamation: ReclamationSection::default(),
            runtime: RuntimeSection::default(),
        }
    }
}

fn minutes(value: i64) -> Option<chrono::Duration> {
    (value > 0).then(|| chrono::Duration::try_minutes(value)).flatten()
}

impl ProvisioningConfig {
    /// Load from TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: ProvisioningConfig =
            toml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Save to TOML file
    pub fn to_toml_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ports.range_start > self.ports.range_end {
            return Err(ConfigError::Invalid(format!(
                "ports.range_start {} is above ports.range_end {}",
                self.ports.range_start, self.ports.range_end
            )));
        }
        if self.ports.range_start == 0 {
            return Err(ConfigError::Invalid(
                "ports.range_start must be at least 1".to_string(),
            ));
        }
        if self.max_instances == 0 {
            return Err(ConfigError::Invalid(
                "max_instances must be at least 1".to_string(),
            ));
        }
        if self.container_prefix.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "container_prefix must not be empty".to_string(),
            ));
        }
        for (key, value) in [
            ("reclamation.ttl_minutes", self.reclamation.ttl_minutes),
            ("reclamation.idle_minutes", self.reclamation.idle_minutes),
            (
                "reclamation.terminal_retention_minutes",
                self.reclamation.terminal_retention_minutes,
            ),
        ] {
            if value < 0 || chrono::Duration::try_minutes(value).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "{} {} is out of range",
                    key, value
                )));
            }
        }
        self.gateway_url()?;
        Ok(())
    }

    pub fn gateway_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.broker.gateway_url).map_err(|e| {
            ConfigError::Invalid(format!(
                "broker.gateway_url '{}' is not a URL: {}",
                self.broker.gateway_url, e
            ))
        })
    }

    pub fn port_pool(&self) -> PortPool {
        PortPool::new(self.ports.range_start, self.ports.range_end)
    }

    pub fn mapper_config(&self) -> MapperConfig {
        MapperConfig {
            public_host: self.ports.public_host.clone(),
            internal_host: self.ports.internal_host.clone(),
            broker_timeout: Duration::from_secs(self.broker.session_timeout_secs),
            broker_required: self.broker.required,
        }
    }

    pub fn lifecycle_config(&self) -> LifecycleConfig {
        LifecycleConfig {
            startup_timeout: Duration::from_secs(self.lifecycle.startup_timeout_secs),
            probe_interval: Duration::from_millis(self.lifecycle.probe_interval_ms),
            stop_timeout: Duration::from_secs(self.lifecycle.stop_timeout_secs),
            stop_retry_interval: Duration::from_millis(self.lifecycle.stop_retry_interval_ms),
            start_retry: self.lifecycle.start_retry.clone(),
            crash_loop_restarts: self.lifecycle.crash_loop_restarts,
            container_prefix: self.container_prefix.clone(),
        }
    }

    pub fn validation_options(&self) -> ValidationOptions {
        ValidationOptions {
            elevated_trust: self.elevated_trust,
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_instances: self.max_instances,
            default_ttl: minutes(self.reclamation.ttl_minutes),
            idle_timeout: minutes(self.reclamation.idle_minutes),
            terminal_retention: minutes(self.reclamation.terminal_retention_minutes)
                .unwrap_or_else(chrono::Duration::zero),
            validation: self.validation_options(),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.reclamation.sweep_interval_secs.max(1))
    }

    #[cfg(feature = "containers")]
    pub fn docker_runtime_config(&self) -> crate::runtime::DockerRuntimeConfig {
        crate::runtime::DockerRuntimeConfig {
            auto_pull: self.runtime.auto_pull,
            stop_timeout: self.runtime.stop_grace_secs,
        }
    }
}

/// Configuration discovery system
pub struct ConfigDiscovery;

impl ConfigDiscovery {
    /// Discover and load configuration using the hierarchy
    pub fn discover_config() -> Result<ProvisioningConfig, ConfigError> {
        if let Some(config_path) = Self::find_config_file() {
            info!("Loading configuration from: {:?}", config_path);
            return ProvisioningConfig::from_toml_file(config_path);
        }

        info!("No configuration file found, using defaults");
        Ok(ProvisioningConfig::default())
    }

    /// Find configuration file using discovery hierarchy
    pub fn find_config_file() -> Option<PathBuf> {
        for candidate in Self::config_candidates() {
            debug!("Checking for config file: {:?}", candidate);
            if candidate.is_file() {
                debug!("Found config file: {:?}", candidate);
                return Some(candidate);
            }
        }

        debug!("No config file found in discovery hierarchy");
        None
    }

    /// Configuration file candidates in priority order
    pub fn config_candidates() -> Vec<PathBuf> {
        let mut candidates = Vec::new();

        if let Some(explicit) = std_env::var_os(env::CONFIG_ENV_VAR) {
            candidates.push(PathBuf::from(explicit));
        }

        if let Ok(current_dir) = std_env::current_dir() {
            candidates.push(current_dir.join(env::LOCAL_CONFIG_FILE_NAME));
            candidates.push(env::local_config_file_path(&current_dir));
        }

        if let Some(home_dir) = Self::get_home_dir() {
            candidates.push(env::user_config_file_path(&home_dir));
        }

        #[cfg(unix)]
        candidates.push(PathBuf::from(env::SYSTEM_CONFIG_FILE));

        candidates
    }

    fn get_home_dir() -> Option<PathBuf> {
        std_env::var("HOME")
            .ok()
            .or_else(|| std_env::var("USERPROFILE").ok())
            .map(PathBuf::from)
    }

    /// Create a default config file in the user's home directory
    pub fn create_default_user_config() -> Result<PathBuf, ConfigError> {
        let home_dir = Self::get_home_dir().ok_or(ConfigError::NoHomeDir)?;

        let config_dir = env::user_config_dir_path(&home_dir);
        let config_path = env::user_config_file_path(&home_dir);

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir).map_err(|source| ConfigError::Io {
                path: config_dir.clone(),
                source,
            })?;
            info!("Created configuration directory: {:?}", config_dir);
        }

        if !config_path.exists() {
            ProvisioningConfig::default().to_toml_file(&config_path)?;
            info!("Created default configuration file: {:?}", config_path);
        } else {
            warn!("Configuration file already exists: {:?}", config_path);
        }

        Ok(config_path)
    }

    /// Show configuration discovery information for debugging
    pub fn show_discovery_info() {
        println!("Configuration Discovery Hierarchy:");
        println!();

        for (i, candidate) in Self::config_candidates().iter().enumerate() {
            let status = if candidate.exists() {
                if candidate.is_file() {
                    "✓ EXISTS"
                } else {
                    "✗ NOT A FILE"
                }
            } else {
                "✗ NOT FOUND"
            };

            println!("  {}. {:?} - {}", i + 1, candidate, status);
        }

        println!();
        if let Some(found) = Self::find_config_file() {
            println!("Active configuration: {:?}", found);
        } else {
            println!("Active configuration: Built-in defaults");
        }
    }
}
