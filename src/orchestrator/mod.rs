//! Provisioning orchestrator.
//!
//! Single entry point of the core: validate, locate the spec, allocate ports
//! and the remote session, start the instance. When a stage fails, whatever
//! was acquired before it is released before the error is surfaced.
//!
//! The orchestrator also deduplicates concurrent requests for the same
//! (template, spec, caller) triple and enforces the instance capacity.

pub mod reclaim;

pub use reclaim::ReclaimReport;

use crate::broker::RemoteSessionHandle;
use crate::error::{ProvisioningError, Result};
use crate::instance::{
    InstanceHandle, InstanceId, InstanceManager, InstanceState, LifecycleConfig, NewInstance,
    ProvisionedInstance, Termination,
};
use crate::mapper::{AllocationContext, PortMapper};
use crate::runtime::{ContainerRuntime, ReachabilityProbe};
use crate::template::{
    TemplateCatalog, TemplateDocument, TemplateStatus, TemplateValidator, ValidTemplate,
    ValidationOptions,
};
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Upper bound on instances that are not yet stopped or failed
    pub max_instances: usize,
    /// Lifetime given to instances whose caller does not ask for one
    pub default_ttl: Option<chrono::Duration>,
    /// Running instances idle this long are reclaimed
    pub idle_timeout: Option<chrono::Duration>,
    /// How long stopped/failed records stay visible to `describe`
    pub terminal_retention: chrono::Duration,
    pub validation: ValidationOptions,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_instances: 100,
            default_ttl: Some(chrono::Duration::minutes(60)),
            idle_timeout: Some(chrono::Duration::minutes(30)),
            terminal_retention: chrono::Duration::minutes(10),
            validation: ValidationOptions::default(),
        }
    }
}

/// Who is asking, and for how long.
#[derive(Debug, Clone)]
pub struct CallerContext {
    pub caller: String,
    /// Overrides the configured default lifetime
    pub ttl: Option<chrono::Duration>,
    pub cancel: CancellationToken,
}

impl CallerContext {
    pub fn new(caller: impl Into<String>) -> Self {
        Self {
            caller: caller.into(),
            ttl: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// (template name, spec name, caller)
type DedupKey = (String, String, String);

enum Admission {
    New(InstanceId),
    Existing(InstanceId),
}

pub struct Orchestrator {
    validator: TemplateValidator,
    catalog: TemplateCatalog,
    mapper: Arc<PortMapper>,
    manager: Arc<InstanceManager>,
    runtime: Arc<dyn ContainerRuntime>,
    config: OrchestratorConfig,
    requests: DashMap<DedupKey, InstanceId>,
    admission: Mutex<()>,
}

impl Orchestrator {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        probe: Arc<dyn ReachabilityProbe>,
        mapper: Arc<PortMapper>,
        lifecycle: LifecycleConfig,
        config: OrchestratorConfig,
    ) -> Self {
        let manager = Arc::new(InstanceManager::new(
            runtime.clone(),
            probe,
            mapper.clone(),
            lifecycle,
        ));

        info!(
            "Orchestrator ready (runtime: {}, capacity: {})",
            runtime.runtime_type(),
            config.max_instances
        );

        Self {
            validator: TemplateValidator::new(config.validation),
            catalog: TemplateCatalog::new(config.validation),
            mapper,
            manager,
            runtime,
            config,
            requests: DashMap::new(),
            admission: Mutex::new(()),
        }
    }

    pub fn catalog(&self) -> &TemplateCatalog {
        &self.catalog
    }

    pub fn mapper(&self) -> &PortMapper {
        &self.mapper
    }

    pub fn manager(&self) -> &InstanceManager {
        &self.manager
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Validate `document` and provision its spec `spec_name`.
    pub async fn provision(
        &self,
        document: &TemplateDocument,
        spec_name: &str,
        context: CallerContext,
    ) -> Result<InstanceHandle> {
        let template = self.validator.validate(document)?;
        self.provision_validated(&template, spec_name, context).await
    }

    /// Provision a spec of a template registered in the catalog.
    pub async fn provision_from_catalog(
        &self,
        template_name: &str,
        spec_name: &str,
        context: CallerContext,
    ) -> Result<InstanceHandle> {
        let entry = self
            .catalog
            .get(template_name)
            .ok_or_else(|| ProvisioningError::TemplateNotFound(template_name.to_string()))?;
        if entry.status == TemplateStatus::Offline {
            return Err(ProvisioningError::TemplateOffline(template_name.to_string()));
        }
        self.provision_validated(&entry.template, spec_name, context)
            .await
    }

    /// Provision a spec of an already validated template.
    pub async fn provision_validated(
        &self,
        template: &ValidTemplate,
        spec_name: &str,
        context: CallerContext,
    ) -> Result<InstanceHandle> {
        let spec = template
            .environment(spec_name)
            .ok_or_else(|| ProvisioningError::SpecNotFound {
                template: template.name().to_string(),
                spec: spec_name.to_string(),
            })?;

        if !self.runtime.supports(&spec.provider) {
            return Err(ProvisioningError::UnsupportedProvider {
                spec: spec.name.clone(),
                provider: spec.provider.to_string(),
            });
        }

        let ttl = context.ttl.or(self.config.default_ttl);
        if let Some(ttl) = ttl {
            if ttl <= chrono::Duration::zero() || chrono::Utc::now().checked_add_signed(ttl).is_none() {
                return Err(ProvisioningError::InvalidTtl {
                    spec: spec.name.clone(),
                    ttl,
                });
            }
        }

        let key: DedupKey = (
            template.name().to_string(),
            spec_name.to_string(),
            context.caller.clone(),
        );

        let new = NewInstance {
            template_name: template.name().to_string(),
            spec: Arc::new(spec.clone()),
            owner: context.caller.clone(),
            ttl,
            cancel: context.cancel.clone(),
        };

        let instance_id = match self.admit(key, new)? {
            Admission::Existing(instance_id) => return self.join_existing(instance_id).await,
            Admission::New(instance_id) => instance_id,
        };

        info!(
            "Provisioning instance {} of {}/{} for {}",
            instance_id,
            template.name(),
            spec_name,
            context.caller
        );

        let allocation_context = AllocationContext {
            instance_id,
            template_name: template.name().to_string(),
        };
        let allocation = match self.mapper.allocate(spec, &allocation_context).await {
            Ok(allocation) => allocation,
            Err(e) => {
                warn!("Allocation for instance {} failed: {}", instance_id, e);
                self.manager.fail_pending(instance_id, &e).await?;
                return Err(e);
            }
        };

        match self.manager.start(instance_id, allocation).await {
            Ok(instance) => {
                info!("Instance {} is running", instance_id);
                Ok(InstanceHandle::from(&instance))
            }
            Err(e) => {
                warn!("Provisioning of instance {} failed: {}", instance_id, e);
                Err(e)
            }
        }
    }

    /// Either hand back the instance already provisioning for `key`, or
    /// register a new one. Capacity is checked in the same critical section.
    fn admit(&self, key: DedupKey, new: NewInstance) -> Result<Admission> {
        let _guard = self
            .admission
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(existing) = self.requests.get(&key).map(|e| *e.value()) {
            let live = self
                .manager
                .state(existing)
                .is_some_and(|s| s.is_in_flight() || s == InstanceState::Running);
            if live {
                debug!("Joining in-flight request for instance {}", existing);
                return Ok(Admission::Existing(existing));
            }
        }

        if self.manager.active_count() >= self.config.max_instances {
            warn!(
                "Refusing request from {}: {} instances active",
                key.2, self.config.max_instances
            );
            return Err(ProvisioningError::CapacityExhausted {
                limit: self.config.max_instances,
            });
        }

        let instance_id = self.manager.register(new);
        self.requests.insert(key, instance_id);
        Ok(Admission::New(instance_id))
    }

    async fn join_existing(&self, instance_id: InstanceId) -> Result<InstanceHandle> {
        let state = self.manager.wait_settled(instance_id).await?;
        if state != InstanceState::Running {
            return Err(ProvisioningError::NotReady { instance_id, state });
        }
        let instance = self.describe(instance_id).await?;
        Ok(InstanceHandle::from(&instance))
    }

    /// Stop an instance. Terminating an instance that is already stopped or
    /// failed succeeds without touching the runtime.
    pub async fn terminate(&self, instance_id: InstanceId) -> Result<Termination> {
        let termination = self.manager.stop(instance_id).await?;
        self.requests.retain(|_, id| *id != instance_id);
        Ok(termination)
    }

    /// Cancel an in-flight provision. Returns `false` once the instance has
    /// settled.
    pub fn cancel(&self, instance_id: InstanceId) -> Result<bool> {
        self.manager.cancel(instance_id)
    }

    pub async fn describe(&self, instance_id: InstanceId) -> Result<ProvisionedInstance> {
        self.manager
            .snapshot(instance_id)
            .await
            .ok_or(ProvisioningError::InstanceNotFound(instance_id))
    }

    pub async fn list(&self) -> Vec<ProvisionedInstance> {
        self.manager.list().await
    }

    /// Record user activity, postponing idle reclamation.
    pub async fn touch(&self, instance_id: InstanceId) -> Result<()> {
        self.manager.touch(instance_id).await
    }

    /// The broker session of a running instance, for its owner only.
    pub async fn remote_session(
        &self,
        instance_id: InstanceId,
        caller: &str,
    ) -> Result<Option<RemoteSessionHandle>> {
        let instance = self.describe(instance_id).await?;
        if instance.owner != caller {
            return Err(ProvisioningError::Forbidden {
                instance_id,
                caller: caller.to_string(),
            });
        }
        if instance.state != InstanceState::Running {
            return Err(ProvisioningError::NotReady {
                instance_id,
                state: instance.state,
            });
        }
        Ok(instance.remote)
    }

    pub fn active_count(&self) -> usize {
        self.manager.active_count()
    }

    fn forget(&self, purged: &[InstanceId]) {
        if !purged.is_empty() {
            self.requests.retain(|_, id| !purged.contains(id));
        }
    }
}
