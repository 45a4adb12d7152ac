//! Provisioned instances and their lifecycle.
//!
//! ```text
//! pending ──► starting ──► running ──► stopping ──► stopped
//!    │           │            │
//!    │           └────────────┴──────► failed
//!    └──► stopping / failed
//! ```
//!
//! A pending instance that is cancelled goes through `stopping`; one whose
//! allocation fails before start-up is marked `failed`. Every record is owned
//! by the [`InstanceManager`]; everything else sees snapshots.

pub mod manager;
pub mod retry;

pub use manager::{InstanceManager, LifecycleConfig, NewInstance};
pub use retry::{RetryOutcome, RetryPolicy};

use crate::broker::RemoteSessionHandle;
use crate::mapper::ResolvedPort;
use crate::runtime::RuntimeHandle;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

pub type InstanceId = Uuid;

/// Lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Pending,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl InstanceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceState::Stopped | InstanceState::Failed)
    }

    /// Pending or starting: provisioning has not settled yet.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, InstanceState::Pending | InstanceState::Starting)
    }

    pub fn can_transition_to(&self, next: InstanceState) -> bool {
        use InstanceState::*;
        matches!(
            (self, next),
            (Pending, Starting)
                | (Pending, Stopping)
                | (Pending, Failed)
                | (Starting, Running)
                | (Starting, Stopping)
                | (Starting, Failed)
                | (Running, Stopping)
                | (Running, Failed)
                | (Stopping, Stopped)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Starting => "starting",
            InstanceState::Running => "running",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
            InstanceState::Failed => "failed",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one instance record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionedInstance {
    pub instance_id: InstanceId,
    pub template_name: String,
    pub spec_name: String,
    pub owner: String,
    pub state: InstanceState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_activity: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub ports: BTreeMap<String, ResolvedPort>,
    pub remote: Option<RemoteSessionHandle>,
    pub container: Option<RuntimeHandle>,
    pub failure: Option<String>,
    /// Set when a stop was never acknowledged by the runtime
    pub needs_reconciliation: bool,
}

impl ProvisionedInstance {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Idle time measured from the last recorded activity.
    pub fn idle_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.last_activity)
    }
}

/// What `provision` hands back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceHandle {
    pub instance_id: InstanceId,
    pub template_name: String,
    pub spec_name: String,
    pub state: InstanceState,
    pub ports: BTreeMap<String, ResolvedPort>,
    pub remote: Option<RemoteSessionHandle>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<&ProvisionedInstance> for InstanceHandle {
    fn from(instance: &ProvisionedInstance) -> Self {
        Self {
            instance_id: instance.instance_id,
            template_name: instance.template_name.clone(),
            spec_name: instance.spec_name.clone(),
            state: instance.state,
            ports: instance.ports.clone(),
            remote: instance.remote.clone(),
            expires_at: instance.expires_at,
        }
    }
}

/// Outcome of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The instance was already stopped or failed; nothing was done
    AlreadyTerminal(InstanceState),
    /// The runtime acknowledged the stop
    Stopped,
    /// No acknowledgment within `timeout`; marked stopped and flagged for
    /// reconciliation
    Forced { timeout: Duration },
}
