//! In-memory collaborators shared by the scenario tests.

#![allow(dead_code)]

use async_trait::async_trait;
use hackenv::broker::{GuacamoleBroker, RemoteBroker, RemoteSessionHandle, SessionRequest, SessionToken};
use hackenv::instance::{InstanceId, InstanceState, LifecycleConfig, RetryPolicy};
use hackenv::mapper::{MapperConfig, PortMapper, PortPool};
use hackenv::runtime::{ContainerRuntime, ReachabilityProbe, ResolvedSpec, RuntimeHandle, RuntimeStatus};
use hackenv::template::{Provider, SAMPLE_TEMPLATE};
use hackenv::{BrokerError, Orchestrator, OrchestratorConfig, RuntimeError, TemplateDocument};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

/// Container runtime that keeps containers in a map.
#[derive(Default)]
pub struct FakeRuntime {
    pub creates: AtomicU32,
    pub stops: AtomicU32,
    /// Fail this many create calls with a transient error first
    pub transient_failures: AtomicU32,
    pub reject_creates: AtomicBool,
    pub stop_hangs: AtomicBool,
    pub docker_unsupported: AtomicBool,
    pub start_delay: Mutex<Duration>,
    /// Delay after the container exists but before the start call returns
    pub created_delay: Mutex<Duration>,
    containers: Mutex<HashMap<String, RuntimeStatus>>,
    specs: Mutex<Vec<ResolvedSpec>>,
}

impl FakeRuntime {
    /// Simulate the container of `instance_id` dying.
    pub fn kill(&self, instance_id: InstanceId) {
        let mut containers = self.containers.lock().unwrap();
        for (name, status) in containers.iter_mut() {
            if name.ends_with(&instance_id.simple().to_string()) {
                status.running = false;
                status.exit_code = Some(137);
            }
        }
    }

    pub fn live_containers(&self) -> usize {
        self.containers.lock().unwrap().len()
    }

    pub fn last_spec(&self) -> Option<ResolvedSpec> {
        self.specs.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create_and_start(&self, spec: &ResolvedSpec) -> Result<RuntimeHandle, RuntimeError> {
        self.creates.fetch_add(1, Ordering::SeqCst);

        let delay = *self.start_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.reject_creates.load(Ordering::SeqCst) {
            return Err(RuntimeError::Rejected("image not found".to_string()));
        }
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(RuntimeError::Transient("daemon busy".to_string()));
        }

        self.specs.lock().unwrap().push(spec.clone());
        self.containers.lock().unwrap().insert(
            spec.container_name.clone(),
            RuntimeStatus {
                running: true,
                exit_code: None,
                restart_count: 0,
            },
        );

        let delay = *self.created_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        Ok(RuntimeHandle {
            id: spec.container_name.clone(),
            name: spec.container_name.clone(),
        })
    }

    async fn stop(&self, handle: &RuntimeHandle) -> Result<(), RuntimeError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if self.stop_hangs.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.containers.lock().unwrap().remove(&handle.id);
        Ok(())
    }

    async fn inspect(&self, handle: &RuntimeHandle) -> Result<RuntimeStatus, RuntimeError> {
        self.containers
            .lock()
            .unwrap()
            .get(&handle.id)
            .copied()
            .ok_or_else(|| RuntimeError::NotFound(handle.name.clone()))
    }

    fn supports(&self, provider: &Provider) -> bool {
        matches!(provider, Provider::Docker) && !self.docker_unsupported.load(Ordering::SeqCst)
    }

    fn runtime_type(&self) -> &'static str {
        "fake"
    }
}

/// Probe whose answer is set by the test.
pub struct FakeProbe {
    pub reachable: AtomicBool,
    pub calls: AtomicU32,
}

impl FakeProbe {
    pub fn new(reachable: bool) -> Self {
        Self {
            reachable: AtomicBool::new(reachable),
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl ReachabilityProbe for FakeProbe {
    async fn is_reachable(&self, _host: &str, _port: u16) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.reachable.load(Ordering::SeqCst)
    }
}

/// Broker that is always down.
pub struct UnavailableBroker;

#[async_trait]
impl RemoteBroker for UnavailableBroker {
    async fn create_session(&self, _request: &SessionRequest) -> Result<RemoteSessionHandle, BrokerError> {
        Err(BrokerError::Unavailable("gateway down".to_string()))
    }

    async fn close_session(&self, _token: &SessionToken) -> Result<(), BrokerError> {
        Ok(())
    }

    fn broker_type(&self) -> &'static str {
        "unavailable"
    }
}

/// Broker that never answers.
pub struct StalledBroker;

#[async_trait]
impl RemoteBroker for StalledBroker {
    async fn create_session(&self, _request: &SessionRequest) -> Result<RemoteSessionHandle, BrokerError> {
        std::future::pending().await
    }

    async fn close_session(&self, _token: &SessionToken) -> Result<(), BrokerError> {
        Ok(())
    }

    fn broker_type(&self) -> &'static str {
        "stalled"
    }
}

pub struct Harness {
    pub runtime: Arc<FakeRuntime>,
    pub probe: Arc<FakeProbe>,
    pub broker: Arc<GuacamoleBroker>,
    pub mapper: Arc<PortMapper>,
    pub orchestrator: Arc<Orchestrator>,
}

pub struct HarnessOptions {
    pub port_range: (u16, u16),
    pub mapper: MapperConfig,
    pub lifecycle: LifecycleConfig,
    pub orchestrator: OrchestratorConfig,
    pub broker: Option<Arc<dyn RemoteBroker>>,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            port_range: (10000, 10100),
            mapper: MapperConfig {
                public_host: "203.0.113.10".to_string(),
                internal_host: "10.0.0.5".to_string(),
                ..MapperConfig::default()
            },
            lifecycle: fast_lifecycle(),
            orchestrator: OrchestratorConfig::default(),
            broker: None,
        }
    }
}

/// Timings short enough for tests.
pub fn fast_lifecycle() -> LifecycleConfig {
    LifecycleConfig {
        startup_timeout: Duration::from_millis(300),
        probe_interval: Duration::from_millis(10),
        stop_timeout: Duration::from_millis(200),
        stop_retry_interval: Duration::from_millis(10),
        start_retry: RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
            multiplier: 2.0,
        },
        ..LifecycleConfig::default()
    }
}

pub fn harness() -> Harness {
    harness_with(HarnessOptions::default())
}

pub fn harness_with(options: HarnessOptions) -> Harness {
    let runtime = Arc::new(FakeRuntime::default());
    let probe = Arc::new(FakeProbe::new(true));
    let broker = Arc::new(GuacamoleBroker::new(
        Url::parse("https://gateway.example.org/guacamole").unwrap(),
    ));
    let mapper_broker: Arc<dyn RemoteBroker> = options.broker.unwrap_or_else(|| broker.clone());

    let (start, end) = options.port_range;
    let mapper = Arc::new(PortMapper::new(
        Arc::new(PortPool::new(start, end)),
        mapper_broker,
        options.mapper,
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        runtime.clone(),
        probe.clone(),
        mapper.clone(),
        options.lifecycle,
        options.orchestrator,
    ));

    Harness {
        runtime,
        probe,
        broker,
        mapper,
        orchestrator,
    }
}

pub fn sample_document() -> TemplateDocument {
    TemplateDocument::from_json(SAMPLE_TEMPLATE).unwrap()
}

/// The sample template with `edit` applied to its JSON value.
pub fn edited_document(edit: impl FnOnce(&mut serde_json::Value)) -> TemplateDocument {
    let mut value: serde_json::Value = serde_json::from_str(SAMPLE_TEMPLATE).unwrap();
    edit(&mut value);
    TemplateDocument::from_value(value).unwrap()
}

/// Poll until `instance_id` reaches `state` or two seconds pass.
pub async fn wait_for_state(orchestrator: &Orchestrator, instance_id: InstanceId, state: InstanceState) -> bool {
    for _ in 0..200 {
        if orchestrator.manager().state(instance_id) == Some(state) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
