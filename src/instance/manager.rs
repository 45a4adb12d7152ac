//! Environment instance manager.
//!
//! Owns the arena of instance records and drives each one through its state
//! machine. Transitions of one instance are serialized by a per-instance
//! mutex; different instances progress independently. Terminal states always
//! release the instance's port allocation.

use super::retry::{RetryOutcome, RetryPolicy};
use super::{InstanceId, InstanceState, ProvisionedInstance, Termination};
use crate::error::{ProvisioningError, Result, RuntimeError, TimeoutError, TimeoutStage};
use crate::mapper::{AllocationId, PortAllocation, PortMapper};
use crate::runtime::{ContainerRuntime, ReachabilityProbe, ResolvedSpec, RuntimeHandle};
use crate::template::model::EnvironmentSpec;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub startup_timeout: Duration,
    pub probe_interval: Duration,
    pub stop_timeout: Duration,
    pub stop_retry_interval: Duration,
    pub start_retry: RetryPolicy,
    /// Restarts tolerated during start-up before the container counts as crash-looping
    pub crash_loop_restarts: i64,
    pub container_prefix: String,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(120),
            probe_interval: Duration::from_millis(500),
            stop_timeout: Duration::from_secs(30),
            stop_retry_interval: Duration::from_secs(1),
            start_retry: RetryPolicy::default(),
            crash_loop_restarts: 3,
            container_prefix: "hackenv".to_string(),
        }
    }
}

/// Parameters of a new instance record.
#[derive(Debug, Clone)]
pub struct NewInstance {
    pub template_name: String,
    pub spec: Arc<EnvironmentSpec>,
    pub owner: String,
    pub ttl: Option<chrono::Duration>,
    /// Cancelling this token cancels the instance's provisioning
    pub cancel: CancellationToken,
}

#[derive(Debug)]
struct InstanceRecord {
    info: ProvisionedInstance,
    allocation_id: Option<AllocationId>,
}

#[derive(Debug)]
struct InstanceSlot {
    spec: Arc<EnvironmentSpec>,
    record: RwLock<InstanceRecord>,
    transition: Mutex<()>,
    state_tx: watch::Sender<InstanceState>,
    cancel: CancellationToken,
}

impl InstanceSlot {
    fn state(&self) -> InstanceState {
        *self.state_tx.borrow()
    }
}

pub struct InstanceManager {
    runtime: Arc<dyn ContainerRuntime>,
    probe: Arc<dyn ReachabilityProbe>,
    mapper: Arc<PortMapper>,
    config: LifecycleConfig,
    instances: DashMap<InstanceId, Arc<InstanceSlot>>,
}

impl InstanceManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        probe: Arc<dyn ReachabilityProbe>,
        mapper: Arc<PortMapper>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            runtime,
            probe,
            mapper,
            config,
            instances: DashMap::new(),
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    fn slot(&self, id: InstanceId) -> Result<Arc<InstanceSlot>> {
        self.instances
            .get(&id)
            .map(|slot| slot.value().clone())
            .ok_or(ProvisioningError::InstanceNotFound(id))
    }

    /// Create a `pending` record.
    pub fn register(&self, new: NewInstance) -> InstanceId {
        let instance_id = Uuid::new_v4();
        let now = Utc::now();
        let (state_tx, _) = watch::channel(InstanceState::Pending);

        let info = ProvisionedInstance {
            instance_id,
            template_name: new.template_name,
            spec_name: new.spec.name.clone(),
            owner: new.owner,
            state: InstanceState::Pending,
            created_at: now,
            started_at: None,
            expires_at: new.ttl.and_then(|ttl| now.checked_add_signed(ttl)),
            last_activity: now,
            finished_at: None,
            ports: BTreeMap::new(),
            remote: None,
            container: None,
            failure: None,
            needs_reconciliation: false,
        };

        let slot = InstanceSlot {
            spec: new.spec,
            record: RwLock::new(InstanceRecord {
                info,
                allocation_id: None,
            }),
            transition: Mutex::new(()),
            state_tx,
            cancel: new.cancel.child_token(),
        };
        self.instances.insert(instance_id, Arc::new(slot));

        debug!("Registered pending instance {}", instance_id);
        instance_id
    }

    async fn transition(
        &self,
        id: InstanceId,
        slot: &InstanceSlot,
        next: InstanceState,
        failure: Option<String>,
    ) -> Result<()> {
        let mut record = slot.record.write().await;
        let from = record.info.state;
        if !from.can_transition_to(next) {
            return Err(ProvisioningError::InvalidTransition {
                instance_id: id,
                from,
                to: next,
            });
        }

        let now = Utc::now();
        record.info.state = next;
        match next {
            InstanceState::Running => {
                record.info.started_at = Some(now);
                record.info.last_activity = now;
            }
            InstanceState::Stopped | InstanceState::Failed => {
                record.info.finished_at = Some(now);
            }
            _ => {}
        }
        if let Some(reason) = failure {
            record.info.failure = Some(reason);
        }
        drop(record);

        slot.state_tx.send_replace(next);
        info!("Instance {} {} -> {}", id, from, next);
        Ok(())
    }

    async fn release_allocation(&self, slot: &InstanceSlot) {
        let allocation_id = slot.record.write().await.allocation_id.take();
        if let Some(allocation_id) = allocation_id {
            self.mapper.release(allocation_id).await;
        }
    }

    /// Drive a pending instance to `running`.
    ///
    /// On failure the container is stopped (best effort), the allocation is
    /// released and the instance ends `failed`; on cancellation it ends
    /// `stopped`.
    pub async fn start(&self, id: InstanceId, allocation: PortAllocation) -> Result<ProvisionedInstance> {
        let slot = self.slot(id)?;
        let _guard = slot.transition.lock().await;

        let state = slot.state();
        if state != InstanceState::Pending {
            self.mapper.release(allocation.allocation_id).await;
            return Err(if state == InstanceState::Stopped {
                ProvisioningError::Cancelled(id)
            } else {
                ProvisioningError::InvalidTransition {
                    instance_id: id,
                    from: state,
                    to: InstanceState::Starting,
                }
            });
        }

        let template_name = {
            let mut record = slot.record.write().await;
            record.allocation_id = Some(allocation.allocation_id);
            record.info.ports = allocation.ports.clone();
            record.info.remote = allocation.remote.clone();
            record.info.template_name.clone()
        };

        if slot.cancel.is_cancelled() {
            return self.finish_cancelled(id, &slot, None).await;
        }
        self.transition(id, &slot, InstanceState::Starting, None).await?;

        let spec_name = slot.spec.name.clone();
        let resolved = ResolvedSpec::new(
            id,
            &template_name,
            slot.spec.clone(),
            allocation.ports.values().cloned().collect(),
            &self.config.container_prefix,
        );

        // One deadline covers create, start and readiness
        let deadline = Instant::now() + self.config.startup_timeout;
        let runtime = &self.runtime;
        let request = &resolved;
        let created = tokio::time::timeout_at(
            deadline,
            self.config.start_retry.run(&slot.cancel, move |attempt| {
                debug!("Creating container for instance {} (attempt {})", id, attempt);
                runtime.create_and_start(request)
            }),
        )
        .await;

        // A dropped create may already have reached the daemon; the container
        // name is deterministic, so tear down by name.
        let orphan = RuntimeHandle {
            id: resolved.container_name.clone(),
            name: resolved.container_name.clone(),
        };
        let handle = match created {
            Ok(RetryOutcome::Done(handle)) => handle,
            Ok(RetryOutcome::Failed { error, attempts }) => {
                error!(
                    "Instance {} failed to start after {} attempt(s): {}",
                    id, attempts, error
                );
                let error = ProvisioningError::Runtime {
                    spec: spec_name,
                    source: error,
                };
                return self.fail_start(id, &slot, None, error).await;
            }
            Ok(RetryOutcome::Cancelled) => {
                return self.finish_cancelled(id, &slot, Some(&orphan)).await;
            }
            Err(_) => {
                warn!(
                    "Container of instance {} not created within {:?}",
                    id, self.config.startup_timeout
                );
                return self
                    .fail_start(id, &slot, Some(&orphan), self.startup_timeout_error(spec_name))
                    .await;
            }
        };
        slot.record.write().await.info.container = Some(handle.clone());

        let targets = allocation.tcp_targets();
        let readiness = tokio::select! {
            _ = slot.cancel.cancelled() => None,
            result = tokio::time::timeout_at(deadline, self.await_ready(&handle, &targets)) => Some(result),
        };

        match readiness {
            None => self.finish_cancelled(id, &slot, Some(&handle)).await,
            Some(Ok(Ok(()))) => {
                self.transition(id, &slot, InstanceState::Running, None).await?;
                Ok(slot.record.read().await.info.clone())
            }
            Some(Ok(Err(source))) => {
                let error = ProvisioningError::Runtime {
                    spec: spec_name,
                    source,
                };
                self.fail_start(id, &slot, Some(&handle), error).await
            }
            Some(Err(_)) => {
                warn!(
                    "Instance {} not reachable within {:?}",
                    id, self.config.startup_timeout
                );
                self.fail_start(id, &slot, Some(&handle), self.startup_timeout_error(spec_name))
                    .await
            }
        }
    }

    fn startup_timeout_error(&self, spec: String) -> ProvisioningError {
        ProvisioningError::Timeout {
            spec,
            source: TimeoutError::new(TimeoutStage::StartupProbe, self.config.startup_timeout),
        }
    }

    /// Poll until the container is live and, if it declares TCP ports, one
    /// of them accepts a connection.
    async fn await_ready(
        &self,
        handle: &RuntimeHandle,
        targets: &[(String, u16)],
    ) -> std::result::Result<(), RuntimeError> {
        loop {
            match self.runtime.inspect(handle).await {
                Ok(status) if !status.running => {
                    return Err(RuntimeError::Exited {
                        code: status.exit_code,
                    });
                }
                Ok(status) if status.restart_count > self.config.crash_loop_restarts => {
                    return Err(RuntimeError::CrashLoop {
                        restarts: status.restart_count,
                    });
                }
                Ok(_) => {
                    if targets.is_empty() || self.any_reachable(targets).await {
                        return Ok(());
                    }
                }
                Err(e) if e.is_transient() => {
                    debug!("Inspect of {} failed, will retry: {}", handle.name, e);
                }
                Err(e) => return Err(e),
            }

            tokio::time::sleep(self.config.probe_interval).await;
        }
    }

    async fn any_reachable(&self, targets: &[(String, u16)]) -> bool {
        for (host, port) in targets {
            if self.probe.is_reachable(host, *port).await {
                debug!("{}:{} is reachable", host, port);
                return true;
            }
        }
        false
    }

    async fn fail_start(
        &self,
        id: InstanceId,
        slot: &InstanceSlot,
        handle: Option<&RuntimeHandle>,
        error: ProvisioningError,
    ) -> Result<ProvisionedInstance> {
        if let Some(handle) = handle {
            let termination = self.stop_container(handle).await;
            self.flag_forced(slot, &termination).await;
        }
        self.release_allocation(slot).await;
        self.transition(id, slot, InstanceState::Failed, Some(error.to_string()))
            .await?;
        Err(error)
    }

    async fn finish_cancelled(
        &self,
        id: InstanceId,
        slot: &InstanceSlot,
        handle: Option<&RuntimeHandle>,
    ) -> Result<ProvisionedInstance> {
        info!("Provisioning of instance {} cancelled", id);
        self.transition(id, slot, InstanceState::Stopping, None).await?;
        if let Some(handle) = handle {
            let termination = self.stop_container(handle).await;
            self.flag_forced(slot, &termination).await;
        }
        self.release_allocation(slot).await;
        self.transition(id, slot, InstanceState::Stopped, Some("cancelled".to_string()))
            .await?;
        Err(ProvisioningError::Cancelled(id))
    }

    /// Record an unacknowledged stop on the instance.
    async fn flag_forced(&self, slot: &InstanceSlot, termination: &Termination) {
        if let Termination::Forced { timeout } = termination {
            let mut record = slot.record.write().await;
            record.info.needs_reconciliation = true;
            record
                .info
                .failure
                .get_or_insert_with(|| TimeoutError::new(TimeoutStage::StopAck, *timeout).to_string());
        }
    }

    /// Retry `stop` until acknowledged or the hard timeout passes.
    async fn stop_container(&self, handle: &RuntimeHandle) -> Termination {
        let timeout = self.config.stop_timeout;
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            match tokio::time::timeout(remaining, self.runtime.stop(handle)).await {
                Ok(Ok(())) => return Termination::Stopped,
                Ok(Err(RuntimeError::NotFound(_))) => {
                    debug!("Container {} already gone", handle.name);
                    return Termination::Stopped;
                }
                Ok(Err(e)) => warn!("Stop of {} not acknowledged: {}", handle.name, e),
                Err(_) => break,
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(self.config.stop_retry_interval.min(remaining)).await;
        }

        error!(
            "Container {} did not acknowledge stop within {:?}; flagging for reconciliation",
            handle.name, timeout
        );
        Termination::Forced { timeout }
    }

    /// Stop an instance. Stopping a terminal instance is a no-op; stopping
    /// one that is still provisioning cancels it.
    pub async fn stop(&self, id: InstanceId) -> Result<Termination> {
        let slot = self.slot(id)?;

        let interrupted = slot.state().is_in_flight();
        if interrupted {
            slot.cancel.cancel();
        }

        let _guard = slot.transition.lock().await;
        let state = slot.state();
        if state.is_terminal() {
            if interrupted && state == InstanceState::Stopped {
                return Ok(Termination::Stopped);
            }
            debug!("Instance {} already {}", id, state);
            return Ok(Termination::AlreadyTerminal(state));
        }

        self.transition(id, &slot, InstanceState::Stopping, None).await?;

        let handle = slot.record.read().await.info.container.clone();
        let termination = match handle {
            Some(handle) => self.stop_container(&handle).await,
            None => Termination::Stopped,
        };
        self.flag_forced(&slot, &termination).await;

        self.release_allocation(&slot).await;
        self.transition(id, &slot, InstanceState::Stopped, None).await?;
        Ok(termination)
    }

    /// Mark a pending instance failed before start-up, e.g. after its
    /// allocation was refused.
    pub async fn fail_pending(&self, id: InstanceId, reason: &ProvisioningError) -> Result<()> {
        let slot = self.slot(id)?;
        let _guard = slot.transition.lock().await;
        if slot.state() != InstanceState::Pending {
            return Ok(());
        }
        self.release_allocation(&slot).await;
        self.transition(id, &slot, InstanceState::Failed, Some(reason.to_string()))
            .await
    }

    /// Re-check a running instance against the runtime; a dead container
    /// turns the instance `failed`.
    pub async fn observe(&self, id: InstanceId) -> Result<InstanceState> {
        let slot = self.slot(id)?;
        let _guard = slot.transition.lock().await;
        let state = slot.state();
        if state != InstanceState::Running {
            return Ok(state);
        }

        let container = slot.record.read().await.info.container.clone();
        let Some(handle) = container else {
            return Ok(state);
        };

        let reason = match self.runtime.inspect(&handle).await {
            Ok(status) if status.running => return Ok(state),
            Ok(status) => RuntimeError::Exited {
                code: status.exit_code,
            }
            .to_string(),
            Err(e @ RuntimeError::NotFound(_)) => e.to_string(),
            Err(e) => {
                debug!("Inspect of instance {} inconclusive: {}", id, e);
                return Ok(state);
            }
        };

        warn!("Instance {} died: {}", id, reason);
        self.release_allocation(&slot).await;
        self.transition(id, &slot, InstanceState::Failed, Some(reason))
            .await?;
        Ok(InstanceState::Failed)
    }

    /// Cancel in-flight provisioning. Returns `false` when there was nothing
    /// to cancel.
    pub fn cancel(&self, id: InstanceId) -> Result<bool> {
        let slot = self.slot(id)?;
        if slot.state().is_in_flight() {
            slot.cancel.cancel();
            return Ok(true);
        }
        Ok(false)
    }

    /// Record user activity on a live instance.
    pub async fn touch(&self, id: InstanceId) -> Result<()> {
        let slot = self.slot(id)?;
        let mut record = slot.record.write().await;
        if !record.info.state.is_terminal() {
            record.info.last_activity = Utc::now();
        }
        Ok(())
    }

    /// Wait until the instance leaves `pending`/`starting`.
    pub async fn wait_settled(&self, id: InstanceId) -> Result<InstanceState> {
        let slot = self.slot(id)?;
        let mut rx = slot.state_tx.subscribe();
        let state = rx
            .wait_for(|state| !state.is_in_flight())
            .await
            .map(|state| *state)
            .map_err(|_| ProvisioningError::InstanceNotFound(id))?;
        Ok(state)
    }

    pub fn state(&self, id: InstanceId) -> Option<InstanceState> {
        self.instances.get(&id).map(|slot| slot.state())
    }

    pub async fn snapshot(&self, id: InstanceId) -> Option<ProvisionedInstance> {
        let slot = self.instances.get(&id).map(|slot| slot.value().clone())?;
        let info = slot.record.read().await.info.clone();
        Some(info)
    }

    pub async fn list(&self) -> Vec<ProvisionedInstance> {
        let slots: Vec<Arc<InstanceSlot>> =
            self.instances.iter().map(|e| e.value().clone()).collect();

        let mut snapshots = Vec::with_capacity(slots.len());
        for slot in slots {
            snapshots.push(slot.record.read().await.info.clone());
        }
        snapshots.sort_by_key(|s| s.created_at);
        snapshots
    }

    /// Number of instances not yet stopped or failed.
    pub fn active_count(&self) -> usize {
        self.instances
            .iter()
            .filter(|e| !e.value().state().is_terminal())
            .count()
    }

    /// Drop terminal records that finished before `cutoff`.
    pub async fn purge_terminal(&self, cutoff: DateTime<Utc>) -> Vec<InstanceId> {
        let slots: Vec<(InstanceId, Arc<InstanceSlot>)> = self
            .instances
            .iter()
            .filter(|e| e.value().state().is_terminal())
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        let mut purged = Vec::new();
        for (id, slot) in slots {
            let finished = slot.record.read().await.info.finished_at;
            if finished.is_some_and(|at| at < cutoff) {
                self.instances.remove(&id);
                debug!("Purged instance record {}", id);
                purged.push(id);
            }
        }
        purged
    }
}
