//! CLI-specific functionality
//!
//! Argument parsing for the operator binary and configuration discovery.

pub mod args;
pub mod config;

pub use args::{Args, ExecutionMode, ProvisionConfig, ValidateConfig};
pub use config::{BrokerMode, ConfigDiscovery, ConfigError, ProvisioningConfig};
