//! Error taxonomy for the provisioning core.
//!
//! Each stage fails with its own typed error and the orchestrator wraps the
//! cause in [`ProvisioningError`] once compensation has run. Messages always
//! name the offending spec, port or stage and never include credentials.

use crate::instance::{InstanceId, InstanceState};
use std::fmt;
use std::time::Duration;

/// Category of a validation diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticKind {
    /// Missing field, wrong type or out-of-range value
    Structural,
    /// Broken cross-reference or duplicated name
    Referential,
    /// Request for capabilities that need elevated trust
    Policy,
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticKind::Structural => write!(f, "structural"),
            DiagnosticKind::Referential => write!(f, "referential"),
            DiagnosticKind::Policy => write!(f, "policy"),
        }
    }
}

/// A single validation finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    /// Location inside the document, e.g. `virtual_environments[0].ports[1].port`
    pub path: String,
    pub message: String,
}

impl Diagnostic {
    pub fn structural(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: DiagnosticKind::Structural,
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn referential(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: DiagnosticKind::Referential,
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn policy(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: DiagnosticKind::Policy,
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.kind, self.path, self.message)
    }
}

/// Non-empty set of diagnostics produced by one validation pass.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub struct ValidationErrors {
    diagnostics: Vec<Diagnostic>,
}

impl ValidationErrors {
    /// Returns `None` when there is nothing to report.
    pub fn from_diagnostics(diagnostics: Vec<Diagnostic>) -> Option<Self> {
        if diagnostics.is_empty() {
            None
        } else {
            Some(Self { diagnostics })
        }
    }

    pub fn single(diagnostic: Diagnostic) -> Self {
        Self {
            diagnostics: vec![diagnostic],
        }
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn len(&self) -> usize {
        self.diagnostics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_empty()
    }

    pub fn has_kind(&self, kind: DiagnosticKind) -> bool {
        self.diagnostics.iter().any(|d| d.kind == kind)
    }

    /// True if any diagnostic message contains `needle`.
    pub fn mentions(&self, needle: &str) -> bool {
        self.diagnostics.iter().any(|d| d.message.contains(needle))
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "template rejected with {} diagnostic(s)", self.diagnostics.len())?;
        for d in &self.diagnostics {
            write!(f, "\n  {}", d)?;
        }
        Ok(())
    }
}

/// Why a single port could not be bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortFailure {
    /// The requested host port is already taken
    Collision(u16),
    /// No free port left in the pool
    Exhausted,
    /// The requested host port lies outside the pool range
    OutOfRange(u16),
}

impl fmt::Display for PortFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortFailure::Collision(port) => write!(f, "host port {} already bound", port),
            PortFailure::Exhausted => write!(f, "port pool exhausted"),
            PortFailure::OutOfRange(port) => write!(f, "host port {} outside pool range", port),
        }
    }
}

/// Port pool errors as reported by the allocation collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct PortError(pub PortFailure);

/// Port allocation failed; all ports of the spec were rolled back.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Allocation failed for spec '{spec}' port '{port}': {failure}")]
pub struct AllocationError {
    pub spec: String,
    pub port: String,
    pub failure: PortFailure,
}

/// Container runtime failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    /// Worth retrying: daemon unreachable, 5xx, transport errors
    #[error("Transient runtime error: {0}")]
    Transient(String),

    /// The runtime refused the request
    #[error("Runtime rejected request: {0}")]
    Rejected(String),

    /// Unknown container
    #[error("Container not found: {0}")]
    NotFound(String),

    /// The container stopped during start-up
    #[error("Container exited with code {code:?}")]
    Exited { code: Option<i64> },

    /// The container kept restarting during start-up
    #[error("Container is crash-looping ({restarts} restarts)")]
    CrashLoop { restarts: i64 },
}

impl RuntimeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RuntimeError::Transient(_))
    }
}

/// Remote-access broker failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Broker rejected session: {0}")]
    Rejected(String),

    #[error("Unsupported remote protocol: {0}")]
    UnsupportedProtocol(String),
}

/// Stage a timeout was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutStage {
    StartupProbe,
    StopAck,
    BrokerSession,
}

impl fmt::Display for TimeoutStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutStage::StartupProbe => write!(f, "start-up probe"),
            TimeoutStage::StopAck => write!(f, "stop acknowledgment"),
            TimeoutStage::BrokerSession => write!(f, "broker session creation"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Timed out during {stage} after {after:?}")]
pub struct TimeoutError {
    pub stage: TimeoutStage,
    pub after: Duration,
}

impl TimeoutError {
    pub fn new(stage: TimeoutStage, after: Duration) -> Self {
        Self { stage, after }
    }
}

/// Errors surfaced by the provisioning orchestrator.
///
/// When one of these is returned from `provision`, every resource acquired
/// for the request has already been released.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProvisioningError {
    #[error(transparent)]
    Validation(#[from] ValidationErrors),

    #[error("Spec '{spec}' not found in template '{template}'")]
    SpecNotFound { template: String, spec: String },

    #[error("Template '{0}' not found")]
    TemplateNotFound(String),

    #[error("Template '{0}' is offline")]
    TemplateOffline(String),

    #[error("Provider '{provider}' of spec '{spec}' is not supported by this runtime")]
    UnsupportedProvider { spec: String, provider: String },

    #[error("Capacity exhausted: {limit} instances already active")]
    CapacityExhausted { limit: usize },

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error("Runtime failure for spec '{spec}': {source}")]
    Runtime {
        spec: String,
        #[source]
        source: RuntimeError,
    },

    #[error("Remote session for spec '{spec}' failed: {source}")]
    Broker {
        spec: String,
        #[source]
        source: BrokerError,
    },

    #[error("Spec '{spec}': {source}")]
    Timeout {
        spec: String,
        #[source]
        source: TimeoutError,
    },

    #[error("Lifetime {ttl} requested for spec '{spec}' is out of range")]
    InvalidTtl { spec: String, ttl: chrono::Duration },

    #[error("Provisioning of instance {0} was cancelled")]
    Cancelled(InstanceId),

    #[error("Instance {instance_id} ended in state {state} before becoming ready")]
    NotReady {
        instance_id: InstanceId,
        state: InstanceState,
    },

    #[error("Instance {0} not found")]
    InstanceNotFound(InstanceId),

    #[error("Caller '{caller}' does not own instance {instance_id}")]
    Forbidden {
        instance_id: InstanceId,
        caller: String,
    },

    #[error("Invalid transition for instance {instance_id}: {from} -> {to}")]
    InvalidTransition {
        instance_id: InstanceId,
        from: InstanceState,
        to: InstanceState,
    },
}

impl ProvisioningError {
    /// Stage-specific timeout, if this error is one.
    pub fn timeout_stage(&self) -> Option<TimeoutStage> {
        match self {
            ProvisioningError::Timeout { source, .. } => Some(source.stage),
            _ => None,
        }
    }

    /// Whether the enclosing API may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProvisioningError::Allocation(_) | ProvisioningError::CapacityExhausted { .. } => true,
            ProvisioningError::Runtime { source, .. } => source.is_transient(),
            ProvisioningError::Broker { source, .. } => {
                matches!(source, BrokerError::Unavailable(_))
            }
            ProvisioningError::Timeout { .. } => true,
            _ => false,
        }
    }
}

/// Result type for provisioning operations.
pub type Result<T> = std::result::Result<T, ProvisioningError>;
