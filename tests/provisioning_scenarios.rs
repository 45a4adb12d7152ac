//! End-to-end provisioning scenarios against in-memory collaborators.

mod common;

use common::{
    HarnessOptions, StalledBroker, UnavailableBroker, edited_document, fast_lifecycle, harness,
    harness_with, sample_document, wait_for_state,
};
use hackenv::error::PortFailure;
use hackenv::mapper::MapperConfig;
use hackenv::{
    CallerContext, InstanceState, OrchestratorConfig, ProvisioningError, RuntimeError,
    Termination, TimeoutStage,
};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_sample_template_provisions_web() {
    let h = harness();

    let handle = h
        .orchestrator
        .provision(&sample_document(), "web", CallerContext::new("alice"))
        .await
        .unwrap();

    assert_eq!(handle.state, InstanceState::Running);
    assert_eq!(handle.template_name, "sample-template-for-docker");
    assert_eq!(handle.spec_name, "web");

    let website = &handle.ports["website"];
    let ssh = &handle.ports["ssh"];
    assert!((10000..=10100).contains(&website.host_port));
    assert!((10000..=10100).contains(&ssh.host_port));
    assert_ne!(website.host_port, ssh.host_port);
    assert_eq!(website.container_port, 80);
    assert_eq!(ssh.container_port, 22);
    assert_eq!(
        website.url.as_deref(),
        Some(format!("http://203.0.113.10:{}", website.host_port).as_str())
    );
    assert!(ssh.url.is_none());

    let remote = handle.remote.clone().unwrap();
    assert!(!remote.token.as_str().is_empty());
    assert!(remote.url.unwrap().contains(remote.token.as_str()));

    // The broker reaches the instance on the internal host and the ssh binding
    let info = h.broker.connection_info(&remote.token).unwrap();
    assert_eq!(info["hostname"], json!("10.0.0.5"));
    assert_eq!(info["port"], json!(ssh.host_port));

    let resolved = h.runtime.last_spec().unwrap();
    assert_eq!(resolved.instance_id, handle.instance_id);
    assert!(resolved.container_name.starts_with("hackenv-"));
    assert_eq!(resolved.labels["hackenv.spec"], "web");
    assert_eq!(resolved.labels["hackenv.template"], "sample-template-for-docker");
    assert_eq!(resolved.ports.len(), 2);
}

#[tokio::test]
async fn test_undeclared_remote_port_is_rejected() {
    let h = harness();
    let document = edited_document(|v| {
        v["virtual_environments"][0]["remote"]["port"] = json!(2222);
    });

    let err = h
        .orchestrator
        .provision(&document, "web", CallerContext::new("alice"))
        .await
        .unwrap_err();

    match err {
        ProvisioningError::Validation(errors) => {
            assert!(errors.mentions("RemoteSpec port 2222 not declared"));
        }
        other => panic!("expected validation error, got {other:?}"),
    }
    assert_eq!(h.runtime.creates.load(Ordering::SeqCst), 0);
    assert_eq!(h.mapper.ports_in_use(), 0);
    assert!(h.orchestrator.list().await.is_empty());
}

#[tokio::test]
async fn test_unknown_spec() {
    let h = harness();
    let err = h
        .orchestrator
        .provision(&sample_document(), "db", CallerContext::new("alice"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ProvisioningError::SpecNotFound { ref spec, .. } if spec == "db"
    ));
}

#[tokio::test]
async fn test_unsupported_provider() {
    let h = harness();
    h.runtime.docker_unsupported.store(true, Ordering::SeqCst);

    let err = h
        .orchestrator
        .provision(&sample_document(), "web", CallerContext::new("alice"))
        .await
        .unwrap_err();

    assert!(matches!(err, ProvisioningError::UnsupportedProvider { .. }));
    assert!(h.orchestrator.list().await.is_empty());
}

#[tokio::test]
async fn test_probe_timeout_compensates_fully() {
    let h = harness();
    h.probe.reachable.store(false, Ordering::SeqCst);

    let err = h
        .orchestrator
        .provision(&sample_document(), "web", CallerContext::new("alice"))
        .await
        .unwrap_err();

    assert_eq!(err.timeout_stage(), Some(TimeoutStage::StartupProbe));
    assert!(err.to_string().contains("'web'"));

    let instances = h.orchestrator.list().await;
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].state, InstanceState::Failed);
    assert!(instances[0].failure.is_some());

    assert_eq!(h.mapper.ports_in_use(), 0);
    assert_eq!(h.mapper.live_allocations(), 0);
    assert_eq!(h.broker.active_sessions(), 0);
    assert_eq!(h.runtime.live_containers(), 0);
}

#[tokio::test]
async fn test_hung_create_times_out_and_releases() {
    let h = harness();
    *h.runtime.start_delay.lock().unwrap() = Duration::from_secs(30);

    let result = tokio::time::timeout(
        Duration::from_secs(3),
        h.orchestrator
            .provision(&sample_document(), "web", CallerContext::new("alice")),
    )
    .await
    .expect("provision must give up at the start-up deadline");

    let err = result.unwrap_err();
    assert_eq!(err.timeout_stage(), Some(TimeoutStage::StartupProbe));
    assert!(err.is_retryable());

    let instances = h.orchestrator.list().await;
    assert_eq!(instances[0].state, InstanceState::Failed);
    assert_eq!(h.mapper.ports_in_use(), 0);
    assert_eq!(h.mapper.live_allocations(), 0);
    assert_eq!(h.broker.active_sessions(), 0);
    assert_eq!(h.orchestrator.active_count(), 0);
}

#[tokio::test]
async fn test_slow_start_counts_against_startup_timeout() {
    let h = harness();
    *h.runtime.created_delay.lock().unwrap() = Duration::from_secs(30);

    let err = h
        .orchestrator
        .provision(&sample_document(), "web", CallerContext::new("alice"))
        .await
        .unwrap_err();

    assert_eq!(err.timeout_stage(), Some(TimeoutStage::StartupProbe));
    assert_eq!(h.mapper.ports_in_use(), 0);
    assert_eq!(h.runtime.live_containers(), 0);
}

#[tokio::test]
async fn test_allocation_is_all_or_nothing() {
    let h = harness_with(HarnessOptions {
        port_range: (10000, 10000),
        ..HarnessOptions::default()
    });

    let err = h
        .orchestrator
        .provision(&sample_document(), "web", CallerContext::new("alice"))
        .await
        .unwrap_err();

    match &err {
        ProvisioningError::Allocation(e) => {
            assert_eq!(e.spec, "web");
            assert_eq!(e.port, "ssh");
            assert_eq!(e.failure, PortFailure::Exhausted);
        }
        other => panic!("expected allocation error, got {other:?}"),
    }
    assert!(err.is_retryable());
    assert_eq!(h.mapper.ports_in_use(), 0);
    assert_eq!(h.runtime.creates.load(Ordering::SeqCst), 0);

    let instances = h.orchestrator.list().await;
    assert_eq!(instances[0].state, InstanceState::Failed);
}

#[tokio::test]
async fn test_concurrent_requests_are_deduplicated() {
    let h = harness();
    *h.runtime.start_delay.lock().unwrap() = Duration::from_millis(50);
    let document = sample_document();

    let (first, second) = tokio::join!(
        h.orchestrator
            .provision(&document, "web", CallerContext::new("alice")),
        h.orchestrator
            .provision(&document, "web", CallerContext::new("alice")),
    );

    let first = first.unwrap();
    let second = second.unwrap();
    assert_eq!(first.instance_id, second.instance_id);
    assert_eq!(h.runtime.creates.load(Ordering::SeqCst), 1);
    assert_eq!(h.mapper.live_allocations(), 1);

    let other = h
        .orchestrator
        .provision(&document, "web", CallerContext::new("bob"))
        .await
        .unwrap();
    assert_ne!(other.instance_id, first.instance_id);
}

#[tokio::test]
async fn test_terminate_is_idempotent() {
    let h = harness();
    let handle = h
        .orchestrator
        .provision(&sample_document(), "web", CallerContext::new("alice"))
        .await
        .unwrap();

    let first = h.orchestrator.terminate(handle.instance_id).await.unwrap();
    assert_eq!(first, Termination::Stopped);
    assert_eq!(h.mapper.ports_in_use(), 0);
    assert_eq!(h.broker.active_sessions(), 0);

    let second = h.orchestrator.terminate(handle.instance_id).await.unwrap();
    assert_eq!(second, Termination::AlreadyTerminal(InstanceState::Stopped));
    assert_eq!(h.runtime.stops.load(Ordering::SeqCst), 1);

    let instance = h.orchestrator.describe(handle.instance_id).await.unwrap();
    assert_eq!(instance.state, InstanceState::Stopped);
    assert!(instance.finished_at.is_some());
}

#[tokio::test]
async fn test_terminate_unknown_instance() {
    let h = harness();
    let err = h
        .orchestrator
        .terminate(uuid::Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisioningError::InstanceNotFound(_)));
}

#[tokio::test]
async fn test_unacknowledged_stop_is_flagged() {
    let h = harness();
    let handle = h
        .orchestrator
        .provision(&sample_document(), "web", CallerContext::new("alice"))
        .await
        .unwrap();
    h.runtime.stop_hangs.store(true, Ordering::SeqCst);

    let termination = h.orchestrator.terminate(handle.instance_id).await.unwrap();
    assert!(matches!(termination, Termination::Forced { .. }));

    let instance = h.orchestrator.describe(handle.instance_id).await.unwrap();
    assert_eq!(instance.state, InstanceState::Stopped);
    assert!(instance.needs_reconciliation);
    assert!(instance.failure.unwrap().contains("stop acknowledgment"));
    assert_eq!(h.mapper.ports_in_use(), 0);
}

#[tokio::test]
async fn test_transient_start_errors_are_retried() {
    let h = harness();
    h.runtime.transient_failures.store(2, Ordering::SeqCst);

    let handle = h
        .orchestrator
        .provision(&sample_document(), "web", CallerContext::new("alice"))
        .await
        .unwrap();

    assert_eq!(handle.state, InstanceState::Running);
    assert_eq!(h.runtime.creates.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_retry_budget_is_bounded() {
    let h = harness();
    h.runtime.transient_failures.store(10, Ordering::SeqCst);

    let err = h
        .orchestrator
        .provision(&sample_document(), "web", CallerContext::new("alice"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ProvisioningError::Runtime {
            source: RuntimeError::Transient(_),
            ..
        }
    ));
    assert!(err.is_retryable());
    assert_eq!(h.runtime.creates.load(Ordering::SeqCst), 3);
    assert_eq!(h.mapper.ports_in_use(), 0);
}

#[tokio::test]
async fn test_rejected_start_is_not_retried() {
    let h = harness();
    h.runtime.reject_creates.store(true, Ordering::SeqCst);

    let err = h
        .orchestrator
        .provision(&sample_document(), "web", CallerContext::new("alice"))
        .await
        .unwrap_err();

    assert!(!err.is_retryable());
    assert_eq!(h.runtime.creates.load(Ordering::SeqCst), 1);
    assert_eq!(h.mapper.ports_in_use(), 0);
    assert_eq!(h.broker.active_sessions(), 0);
}

#[tokio::test]
async fn test_cancel_during_startup_tears_down() {
    let h = harness_with(HarnessOptions {
        lifecycle: hackenv::instance::LifecycleConfig {
            startup_timeout: Duration::from_secs(10),
            ..fast_lifecycle()
        },
        ..HarnessOptions::default()
    });
    h.probe.reachable.store(false, Ordering::SeqCst);

    let orchestrator = h.orchestrator.clone();
    let task = tokio::spawn(async move {
        orchestrator
            .provision(&sample_document(), "web", CallerContext::new("alice"))
            .await
    });

    let mut instance_id = None;
    for _ in 0..200 {
        if let Some(instance) = h.orchestrator.list().await.first() {
            instance_id = Some(instance.instance_id);
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let instance_id = instance_id.unwrap();
    assert!(wait_for_state(&h.orchestrator, instance_id, InstanceState::Starting).await);

    assert!(h.orchestrator.cancel(instance_id).unwrap());

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, ProvisioningError::Cancelled(id) if id == instance_id));
    assert_eq!(
        h.orchestrator.manager().state(instance_id),
        Some(InstanceState::Stopped)
    );
    assert_eq!(h.mapper.ports_in_use(), 0);
    assert_eq!(h.broker.active_sessions(), 0);
    assert_eq!(h.runtime.live_containers(), 0);
    assert!(!h.orchestrator.cancel(instance_id).unwrap());
}

#[tokio::test]
async fn test_cancel_during_create_removes_container() {
    let h = harness_with(HarnessOptions {
        lifecycle: hackenv::instance::LifecycleConfig {
            startup_timeout: Duration::from_secs(10),
            ..fast_lifecycle()
        },
        ..HarnessOptions::default()
    });
    *h.runtime.created_delay.lock().unwrap() = Duration::from_millis(500);

    let cancel = CancellationToken::new();
    let orchestrator = h.orchestrator.clone();
    let context = CallerContext::new("alice").with_cancellation(cancel.clone());
    let task = tokio::spawn(async move {
        orchestrator
            .provision(&sample_document(), "web", context)
            .await
    });

    for _ in 0..200 {
        if h.runtime.live_containers() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(h.runtime.live_containers(), 1);
    cancel.cancel();

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, ProvisioningError::Cancelled(_)));

    let instances = h.orchestrator.list().await;
    assert_eq!(instances[0].state, InstanceState::Stopped);
    assert_eq!(h.runtime.live_containers(), 0);
    assert_eq!(h.mapper.ports_in_use(), 0);
    assert_eq!(h.broker.active_sessions(), 0);
}

#[tokio::test]
async fn test_out_of_range_ttl_is_rejected() {
    let h = harness();

    let err = h
        .orchestrator
        .provision(
            &sample_document(),
            "web",
            CallerContext::new("alice").with_ttl(chrono::Duration::days(100_000_000)),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ProvisioningError::InvalidTtl { ref spec, .. } if spec == "web"));
    assert!(!err.is_retryable());
    assert!(h.orchestrator.list().await.is_empty());
    assert_eq!(h.mapper.ports_in_use(), 0);

    let err = h
        .orchestrator
        .provision(
            &sample_document(),
            "web",
            CallerContext::new("alice").with_ttl(chrono::Duration::minutes(-5)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisioningError::InvalidTtl { .. }));
}

#[tokio::test]
async fn test_cancelled_caller_token_never_starts() {
    let h = harness();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = h
        .orchestrator
        .provision(
            &sample_document(),
            "web",
            CallerContext::new("alice").with_cancellation(cancel),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ProvisioningError::Cancelled(_)));
    assert_eq!(h.runtime.creates.load(Ordering::SeqCst), 0);
    assert_eq!(h.mapper.ports_in_use(), 0);
}

#[tokio::test]
async fn test_required_broker_failure_rolls_back() {
    let h = harness_with(HarnessOptions {
        broker: Some(Arc::new(UnavailableBroker)),
        ..HarnessOptions::default()
    });

    let document = edited_document(|v| {
        v["virtual_environments"][0]["remote"]["password"] = json!("hunter2-secret");
    });
    let err = h
        .orchestrator
        .provision(&document, "web", CallerContext::new("alice"))
        .await
        .unwrap_err();

    assert!(matches!(err, ProvisioningError::Broker { .. }));
    assert!(!err.to_string().contains("hunter2-secret"));
    assert!(!format!("{err:?}").contains("hunter2-secret"));
    assert_eq!(h.mapper.ports_in_use(), 0);
    assert_eq!(h.runtime.creates.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_optional_broker_failure_degrades() {
    let h = harness_with(HarnessOptions {
        broker: Some(Arc::new(UnavailableBroker)),
        mapper: MapperConfig {
            broker_required: false,
            ..MapperConfig::default()
        },
        ..HarnessOptions::default()
    });

    let handle = h
        .orchestrator
        .provision(&sample_document(), "web", CallerContext::new("alice"))
        .await
        .unwrap();

    assert_eq!(handle.state, InstanceState::Running);
    assert!(handle.remote.is_none());
    assert_eq!(handle.ports.len(), 2);
}

#[tokio::test]
async fn test_required_broker_timeout_rolls_back() {
    let h = harness_with(HarnessOptions {
        broker: Some(Arc::new(StalledBroker)),
        mapper: MapperConfig {
            broker_timeout: Duration::from_millis(100),
            ..MapperConfig::default()
        },
        ..HarnessOptions::default()
    });

    let err = h
        .orchestrator
        .provision(&sample_document(), "web", CallerContext::new("alice"))
        .await
        .unwrap_err();

    assert_eq!(err.timeout_stage(), Some(TimeoutStage::BrokerSession));
    assert_eq!(h.mapper.ports_in_use(), 0);
    assert_eq!(h.runtime.creates.load(Ordering::SeqCst), 0);

    let instances = h.orchestrator.list().await;
    assert_eq!(instances[0].state, InstanceState::Failed);
    assert!(instances[0].failure.as_ref().unwrap().contains("broker session"));
}

#[tokio::test]
async fn test_optional_broker_timeout_degrades() {
    let h = harness_with(HarnessOptions {
        broker: Some(Arc::new(StalledBroker)),
        mapper: MapperConfig {
            broker_timeout: Duration::from_millis(100),
            broker_required: false,
            ..MapperConfig::default()
        },
        ..HarnessOptions::default()
    });

    let handle = h
        .orchestrator
        .provision(&sample_document(), "web", CallerContext::new("alice"))
        .await
        .unwrap();

    assert_eq!(handle.state, InstanceState::Running);
    assert!(handle.remote.is_none());
}

#[tokio::test]
async fn test_remote_session_is_owner_only() {
    let h = harness();
    let handle = h
        .orchestrator
        .provision(&sample_document(), "web", CallerContext::new("alice"))
        .await
        .unwrap();

    let err = h
        .orchestrator
        .remote_session(handle.instance_id, "mallory")
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisioningError::Forbidden { ref caller, .. } if caller == "mallory"));

    let session = h
        .orchestrator
        .remote_session(handle.instance_id, "alice")
        .await
        .unwrap();
    assert_eq!(session, handle.remote);

    h.orchestrator.terminate(handle.instance_id).await.unwrap();
    let err = h
        .orchestrator
        .remote_session(handle.instance_id, "alice")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ProvisioningError::NotReady {
            state: InstanceState::Stopped,
            ..
        }
    ));
}

#[tokio::test]
async fn test_capacity_limit() {
    let h = harness_with(HarnessOptions {
        orchestrator: OrchestratorConfig {
            max_instances: 1,
            ..OrchestratorConfig::default()
        },
        ..HarnessOptions::default()
    });
    let document = sample_document();

    let first = h
        .orchestrator
        .provision(&document, "web", CallerContext::new("alice"))
        .await
        .unwrap();

    let err = h
        .orchestrator
        .provision(&document, "web", CallerContext::new("bob"))
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisioningError::CapacityExhausted { limit: 1 }));
    assert!(err.is_retryable());

    h.orchestrator.terminate(first.instance_id).await.unwrap();
    h.orchestrator
        .provision(&document, "web", CallerContext::new("bob"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_catalog_provisioning_respects_status() {
    let h = harness();
    let document = sample_document();
    h.orchestrator.catalog().register(&document).unwrap();

    let handle = h
        .orchestrator
        .provision_from_catalog("sample-template-for-docker", "web", CallerContext::new("alice"))
        .await
        .unwrap();
    assert_eq!(handle.state, InstanceState::Running);

    h.orchestrator
        .catalog()
        .retire("sample-template-for-docker")
        .unwrap();
    let err = h
        .orchestrator
        .provision_from_catalog("sample-template-for-docker", "web", CallerContext::new("bob"))
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisioningError::TemplateOffline(_)));

    let err = h
        .orchestrator
        .provision_from_catalog("missing", "web", CallerContext::new("bob"))
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisioningError::TemplateNotFound(_)));
}

#[tokio::test]
async fn test_touch_updates_activity() {
    let h = harness();
    let handle = h
        .orchestrator
        .provision(&sample_document(), "web", CallerContext::new("alice"))
        .await
        .unwrap();

    let before = h.orchestrator.describe(handle.instance_id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    h.orchestrator.touch(handle.instance_id).await.unwrap();
    let after = h.orchestrator.describe(handle.instance_id).await.unwrap();

    assert!(after.last_activity > before.last_activity);
}
