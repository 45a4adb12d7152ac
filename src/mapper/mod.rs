//! Port & remote mapper.
//!
//! Turns the declared ports of an [`EnvironmentSpec`] into concrete host
//! bindings and, when the spec carries a [`RemoteSpec`](crate::template::RemoteSpec),
//! a broker session. Allocation is all-or-nothing per spec: a failure on any
//! port or on the broker rolls back everything acquired for that call.
//!
//! Every successful allocation is recorded under an [`AllocationId`].
//! Releasing by id is idempotent, so the orchestrator's compensation path and
//! the instance manager's terminal-state cleanup can both call it.

pub mod pool;

pub use pool::{PortAllocator, PortPool};

use crate::broker::{RemoteBroker, RemoteSessionHandle, SessionRequest};
use crate::error::{AllocationError, ProvisioningError, Result, TimeoutError, TimeoutStage};
use crate::instance::InstanceId;
use crate::template::model::{EnvironmentSpec, Protocol};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type AllocationId = Uuid;

/// Address every public port binds on.
pub const PUBLIC_BIND_IP: &str = "0.0.0.0";

/// A declared port resolved to a host binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedPort {
    pub name: String,
    /// Advertised host: the public host for public ports, the internal host otherwise
    pub host: String,
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: Protocol,
    pub public: bool,
    /// Interface the runtime binds the host port on
    pub bind_ip: String,
    /// Display URL with host and port substituted
    pub url: Option<String>,
}

impl ResolvedPort {
    /// Docker-style container key, e.g. `22/tcp`.
    pub fn container_key(&self) -> String {
        format!("{}/{}", self.container_port, self.protocol)
    }
}

/// Result of a successful [`PortMapper::allocate`].
#[derive(Debug, Clone)]
pub struct PortAllocation {
    pub allocation_id: AllocationId,
    pub ports: BTreeMap<String, ResolvedPort>,
    pub remote: Option<RemoteSessionHandle>,
    /// Host the probe and broker use to reach bound ports
    pub internal_host: String,
}

impl PortAllocation {
    /// `(host, port)` pairs a TCP connect probe can target.
    pub fn tcp_targets(&self) -> Vec<(String, u16)> {
        self.ports
            .values()
            .filter(|p| p.protocol == Protocol::Tcp)
            .map(|p| (self.internal_host.clone(), p.host_port))
            .collect()
    }
}

/// Identifies who an allocation is made for.
#[derive(Debug, Clone)]
pub struct AllocationContext {
    pub instance_id: InstanceId,
    pub template_name: String,
}

#[derive(Debug, Clone)]
pub struct MapperConfig {
    pub public_host: String,
    pub internal_host: String,
    pub broker_timeout: Duration,
    /// Fail the allocation when the broker session cannot be created
    pub broker_required: bool,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            public_host: "127.0.0.1".to_string(),
            internal_host: "127.0.0.1".to_string(),
            broker_timeout: Duration::from_secs(15),
            broker_required: true,
        }
    }
}

#[derive(Debug)]
struct AllocationRecord {
    ports: Vec<(Protocol, u16)>,
    remote: Option<RemoteSessionHandle>,
}

pub struct PortMapper {
    allocator: Arc<dyn PortAllocator>,
    broker: Arc<dyn RemoteBroker>,
    config: MapperConfig,
    allocations: DashMap<AllocationId, AllocationRecord>,
}

impl PortMapper {
    pub fn new(
        allocator: Arc<dyn PortAllocator>,
        broker: Arc<dyn RemoteBroker>,
        config: MapperConfig,
    ) -> Self {
        Self {
            allocator,
            broker,
            config,
            allocations: DashMap::new(),
        }
    }

    /// Bind every declared port of `spec`, then open the remote session.
    pub async fn allocate(
        &self,
        spec: &EnvironmentSpec,
        context: &AllocationContext,
    ) -> Result<PortAllocation> {
        let mut bound: Vec<(Protocol, u16)> = Vec::with_capacity(spec.ports.len());
        let mut ports = BTreeMap::new();

        for port in &spec.ports {
            let host_port = match self.allocator.bind(port.protocol, port.preferred_host_port) {
                Ok(host_port) => host_port,
                Err(e) => {
                    warn!(
                        "Port '{}' of spec '{}' could not be bound ({}), rolling back {} port(s)",
                        port.name,
                        spec.name,
                        e,
                        bound.len()
                    );
                    self.release_ports(&bound);
                    return Err(AllocationError {
                        spec: spec.name.clone(),
                        port: port.name.clone(),
                        failure: e.0,
                    }
                    .into());
                }
            };
            bound.push((port.protocol, host_port));

            let host = if port.public {
                self.config.public_host.clone()
            } else {
                self.config.internal_host.clone()
            };
            let bind_ip = if port.public {
                PUBLIC_BIND_IP.to_string()
            } else {
                self.config.internal_host.clone()
            };
            let url = port.url.as_ref().map(|u| u.render(&host, host_port));

            ports.insert(
                port.name.clone(),
                ResolvedPort {
                    name: port.name.clone(),
                    host,
                    host_port,
                    container_port: port.port,
                    protocol: port.protocol,
                    public: port.public,
                    bind_ip,
                    url,
                },
            );
        }

        let remote = match self.open_session(spec, context, &ports).await {
            Ok(remote) => remote,
            Err(e) if self.config.broker_required => {
                warn!(
                    "Remote session for spec '{}' failed, rolling back {} port(s)",
                    spec.name,
                    bound.len()
                );
                self.release_ports(&bound);
                return Err(e);
            }
            Err(e) => {
                warn!("Continuing without remote session: {}", e);
                None
            }
        };

        let allocation_id = Uuid::new_v4();
        self.allocations.insert(
            allocation_id,
            AllocationRecord {
                ports: bound,
                remote: remote.clone(),
            },
        );

        info!(
            "Allocated {} port(s) for spec '{}' of instance {} (allocation {})",
            ports.len(),
            spec.name,
            context.instance_id,
            allocation_id
        );

        Ok(PortAllocation {
            allocation_id,
            ports,
            remote,
            internal_host: self.config.internal_host.clone(),
        })
    }

    async fn open_session(
        &self,
        spec: &EnvironmentSpec,
        context: &AllocationContext,
        ports: &BTreeMap<String, ResolvedPort>,
    ) -> Result<Option<RemoteSessionHandle>> {
        let Some(remote) = &spec.remote else {
            return Ok(None);
        };

        // The validator guarantees the remote port is declared.
        let host_port = ports
            .get(&remote.port_name)
            .map(|p| p.host_port)
            .unwrap_or(remote.port);

        let request = SessionRequest {
            name: format!("{}/{}/{}", context.template_name, spec.name, context.instance_id),
            provider: remote.provider.clone(),
            protocol: remote.protocol,
            host: self.config.internal_host.clone(),
            port: host_port,
            credentials: remote.credentials.clone(),
        };

        debug!(
            "Requesting {} session for spec '{}' via {}",
            remote.protocol,
            spec.name,
            self.broker.broker_type()
        );

        match tokio::time::timeout(self.config.broker_timeout, self.broker.create_session(&request))
            .await
        {
            Ok(Ok(handle)) => Ok(Some(handle)),
            Ok(Err(source)) => Err(ProvisioningError::Broker {
                spec: spec.name.clone(),
                source,
            }),
            Err(_) => Err(ProvisioningError::Timeout {
                spec: spec.name.clone(),
                source: TimeoutError::new(TimeoutStage::BrokerSession, self.config.broker_timeout),
            }),
        }
    }

    fn release_ports(&self, ports: &[(Protocol, u16)]) {
        for (protocol, port) in ports.iter().rev() {
            self.allocator.release(*protocol, *port);
        }
    }

    /// Release an allocation. Returns `false` when it was already released.
    pub async fn release(&self, allocation_id: AllocationId) -> bool {
        let Some((_, record)) = self.allocations.remove(&allocation_id) else {
            debug!("Allocation {} already released", allocation_id);
            return false;
        };

        if let Some(remote) = &record.remote {
            if let Err(e) = self.broker.close_session(&remote.token).await {
                warn!("Failed to close remote session {}: {}", remote.token, e);
            }
        }
        self.release_ports(&record.ports);

        info!(
            "Released allocation {} ({} port(s))",
            allocation_id,
            record.ports.len()
        );
        true
    }

    pub fn is_allocated(&self, allocation_id: AllocationId) -> bool {
        self.allocations.contains_key(&allocation_id)
    }

    pub fn live_allocations(&self) -> usize {
        self.allocations.len()
    }

    /// Host ports currently bound in the underlying pool.
    pub fn ports_in_use(&self) -> usize {
        self.allocator.in_use()
    }

    pub fn config(&self) -> &MapperConfig {
        &self.config
    }
}
