//! Container runtime collaborator.
//!
//! The instance manager only talks to a [`ContainerRuntime`]; the Docker
//! implementation lives behind the `containers` feature.
//!
//! - [`probe`]: TCP reachability probe used during start-up
//! - `config`: builder turning a [`ResolvedSpec`] into a Docker create request
//! - `docker`: bollard-backed [`ContainerRuntime`]

pub mod probe;

#[cfg(feature = "containers")]
mod config;
#[cfg(feature = "containers")]
mod docker;

#[cfg(feature = "containers")]
pub use config::{ContainerConfig, ContainerConfigBuilder};
#[cfg(feature = "containers")]
pub use docker::{DockerRuntime, DockerRuntimeConfig};
pub use probe::{ReachabilityProbe, TcpProbe};

use crate::env::labels;
use crate::error::RuntimeError;
use crate::instance::InstanceId;
use crate::mapper::ResolvedPort;
use crate::template::model::{EnvironmentSpec, Provider};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Reference to a created container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeHandle {
    pub id: String,
    pub name: String,
}

/// Container state as reported by `inspect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuntimeStatus {
    pub running: bool,
    pub exit_code: Option<i64>,
    pub restart_count: i64,
}

/// Everything the runtime needs to create one container.
#[derive(Debug, Clone)]
pub struct ResolvedSpec {
    pub instance_id: InstanceId,
    pub template_name: String,
    pub container_name: String,
    pub spec: Arc<EnvironmentSpec>,
    pub ports: Vec<ResolvedPort>,
    pub labels: BTreeMap<String, String>,
}

impl ResolvedSpec {
    /// Combine a validated spec with its host bindings. Template labels are
    /// kept; the management labels always win.
    pub fn new(
        instance_id: InstanceId,
        template_name: &str,
        spec: Arc<EnvironmentSpec>,
        ports: Vec<ResolvedPort>,
        container_prefix: &str,
    ) -> Self {
        let mut labels = spec.labels.clone();
        labels.insert(labels::MANAGED.to_string(), "true".to_string());
        labels.insert(labels::INSTANCE.to_string(), instance_id.to_string());
        labels.insert(labels::TEMPLATE.to_string(), template_name.to_string());
        labels.insert(labels::SPEC.to_string(), spec.name.clone());

        Self {
            instance_id,
            template_name: template_name.to_string(),
            container_name: format!("{}-{}", container_prefix, instance_id.simple()),
            spec,
            ports,
            labels,
        }
    }
}

/// Container runtime contract.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create and start a container for `spec`.
    async fn create_and_start(&self, spec: &ResolvedSpec) -> Result<RuntimeHandle, RuntimeError>;

    /// Stop and remove the container. An already gone container is an
    /// acknowledgment.
    async fn stop(&self, handle: &RuntimeHandle) -> Result<(), RuntimeError>;

    async fn inspect(&self, handle: &RuntimeHandle) -> Result<RuntimeStatus, RuntimeError>;

    /// Whether this runtime can run specs of `provider`.
    fn supports(&self, provider: &Provider) -> bool;

    fn runtime_type(&self) -> &'static str;
}
