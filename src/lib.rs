//! # hackenv
//!
//! Template-driven provisioning core for hackathon virtual environments.
//! Organizers describe environments in a JSON template; participants get a
//! running container with resolved port bindings and a brokered remote
//! session, reclaimed automatically when it expires or goes idle.
//!
//! ## Architecture Overview
//!
//! - **[`template`]**: lossless template documents, validation and the template catalog
//! - **[`mapper`]**: host port pool and remote session wiring, all-or-nothing per spec
//! - **[`broker`]**: remote-access broker collaborators (Guacamole style, HTTP gateway)
//! - **[`runtime`]**: container runtime collaborator (Docker via bollard) and reachability probe
//! - **[`instance`]**: instance records and their lifecycle state machine
//! - **[`orchestrator`]**: `provision` / `terminate` / `describe` plus the reclamation sweep
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hackenv::{CallerContext, Orchestrator, OrchestratorConfig, TemplateDocument};
//! use hackenv::broker::GuacamoleBroker;
//! use hackenv::instance::LifecycleConfig;
//! use hackenv::mapper::{MapperConfig, PortMapper, PortPool};
//! use hackenv::runtime::{DockerRuntime, DockerRuntimeConfig, TcpProbe};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = Arc::new(DockerRuntime::connect(DockerRuntimeConfig::default()).await?);
//!     let broker = Arc::new(GuacamoleBroker::new("http://localhost:8080/guacamole".parse()?));
//!     let pool = Arc::new(PortPool::new(10000, 20000));
//!     let mapper = Arc::new(PortMapper::new(pool, broker, MapperConfig::default()));
//!
//!     let orchestrator = Orchestrator::new(
//!         runtime,
//!         Arc::new(TcpProbe::default()),
//!         mapper,
//!         LifecycleConfig::default(),
//!         OrchestratorConfig::default(),
//!     );
//!
//!     let document = TemplateDocument::from_json(hackenv::template::SAMPLE_TEMPLATE)?;
//!     let handle = orchestrator
//!         .provision(&document, "web", CallerContext::new("alice"))
//!         .await?;
//!     println!("{}", serde_json::to_string_pretty(&handle)?);
//!
//!     orchestrator.terminate(handle.instance_id).await?;
//!     Ok(())
//! }
//! ```

/// Template documents, validation and catalog.
pub mod template;

/// Host port allocation and remote session wiring.
pub mod mapper;

/// Remote-access broker collaborators.
pub mod broker;

/// Container runtime collaborator.
pub mod runtime;

/// Instance records and lifecycle.
pub mod instance;

/// Provisioning orchestration and reclamation.
pub mod orchestrator;

/// Error taxonomy.
pub mod error;

/// Environment constants and path utilities.
pub mod env;

// CLI module for command-line interface
pub mod cli;

pub use error::{
    AllocationError, BrokerError, Diagnostic, DiagnosticKind, ProvisioningError, RuntimeError,
    TimeoutError, TimeoutStage, ValidationErrors,
};
pub use instance::{InstanceHandle, InstanceId, InstanceState, ProvisionedInstance, Termination};
pub use orchestrator::{CallerContext, Orchestrator, OrchestratorConfig, ReclaimReport};
pub use template::{
    EnvironmentSpec, TemplateCatalog, TemplateDocument, TemplateValidator, ValidTemplate,
    ValidationOptions, validate,
};
