//! Degraded providers and clusters.

mod harness;

use std::time::Duration;

use chrono::Utc;
use harness::{eventually, pod, Harness, NODE, RENEW_INTERVAL};
use k8s_openapi::api::core::v1::{ConfigMapKeySelector, EnvVar, EnvVarSource};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use vk_errdefs::ErrorKind;
use vk_node_agent::control_plane::memory::Call;
use vk_node_agent::control_plane::LEASE_NAMESPACE;
use vk_node_agent::lease::LeaseState;
use vk_node_agent::provider::mock::Operation;
use vk_node_agent::workload::{WorkloadKey, PROVIDER_CONDITION, REASON_PROVIDER_FAILED};

fn within(actual: Duration, expected: Duration, jitter: f64) -> bool {
    let expected = expected.as_millis() as f64;
    let actual = actual.as_millis() as f64;
    actual >= expected * (1.0 - jitter) - 5.0 && actual <= expected * (1.0 + jitter) + 5.0
}

#[tokio::test(start_paused = true)]
async fn test_transient_create_failures_back_off_then_converge() {
    let h = Harness::start_with(|_, provider| {
        provider.fail_next(Operation::Create, ErrorKind::Transient, 3);
    })
    .await;
    eventually(Duration::from_secs(2), || *h.ready.borrow()).await;

    let key = WorkloadKey::new("default", "flaky");
    h.control_plane
        .submit_pod(pod("default", "flaky", "nginx"))
        .unwrap();

    eventually(Duration::from_secs(10), || {
        h.pod_phase(&key).as_deref() == Some("Running")
    })
    .await;

    let creates = h.provider.calls_for(Operation::Create, &key);
    assert_eq!(creates.len(), 4);
    let expected = [500, 1_000, 2_000].map(Duration::from_millis);
    for (pair, expected) in creates.windows(2).zip(expected) {
        let gap = pair[1].at - pair[0].at;
        assert!(within(gap, expected, 0.2), "gap {gap:?}, expected about {expected:?}");
    }

    // Transient failures never surface on the pod.
    let status = h.control_plane.pod(&key).unwrap().status.unwrap();
    let conditions = status.conditions.unwrap_or_default();
    assert!(conditions.iter().all(|c| c.type_ != PROVIDER_CONDITION));

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_unsupported_update_is_recorded_once() {
    let h = Harness::start().await;
    eventually(Duration::from_secs(2), || *h.ready.borrow()).await;

    let key = WorkloadKey::new("default", "pinned");
    h.control_plane
        .submit_pod(pod("default", "pinned", "nginx:1.26"))
        .unwrap();
    eventually(Duration::from_secs(5), || {
        h.pod_phase(&key).as_deref() == Some("Running")
    })
    .await;

    h.provider.fail_next(Operation::Update, ErrorKind::Unsupported, 1);
    h.control_plane
        .update_pod(&key, |pod| {
            if let Some(spec) = pod.spec.as_mut() {
                spec.containers[0].image = Some("nginx:1.27".to_string());
            }
        })
        .unwrap();

    let provider_condition = || {
        h.control_plane
            .pod(&key)
            .and_then(|p| p.status)
            .and_then(|s| s.conditions)
            .and_then(|c| c.into_iter().find(|c| c.type_ == PROVIDER_CONDITION))
    };
    eventually(Duration::from_secs(5), || provider_condition().is_some()).await;

    let condition = provider_condition().unwrap();
    assert_eq!(condition.status, "False");
    assert_eq!(condition.reason.as_deref(), Some("Unsupported"));
    assert_eq!(h.provider.calls_for(Operation::Update, &key).len(), 1);

    // A full resync sees the same spec and leaves the provider alone.
    tokio::time::sleep(Duration::from_secs(301)).await;
    assert_eq!(h.provider.calls_for(Operation::Update, &key).len(), 1);
    assert_eq!(h.pod_phase(&key).as_deref(), Some("Running"));

    let events = h.control_plane.events();
    let refusals = events
        .iter()
        .filter(|e| e.reason.as_deref() == Some("ProviderUpdateUnsupported"))
        .count();
    assert_eq!(refusals, 1);

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stalled_ping_marks_node_not_ready_and_pauses_lease() {
    let h = Harness::start().await;
    eventually(Duration::from_secs(2), || h.node_ready().as_deref() == Some("True")).await;
    eventually(Duration::from_secs(2), || {
        *h.lease_state.borrow() == LeaseState::Established
    })
    .await;

    h.provider.stall_ping(Some(Duration::from_secs(1)));
    eventually(Duration::from_millis(2_500), || {
        h.node_ready().as_deref() == Some("False")
    })
    .await;

    // Let any renewal that raced the stall land, then the lease must hold still.
    tokio::time::sleep(RENEW_INTERVAL).await;
    let frozen = h.lease_version();
    tokio::time::sleep(RENEW_INTERVAL * 4).await;
    assert_eq!(h.lease_version(), frozen);

    h.provider.stall_ping(None);
    eventually(Duration::from_secs(3), || h.node_ready().as_deref() == Some("True")).await;
    eventually(Duration::from_secs(3), || h.lease_version() != frozen).await;
    assert!(!h.agent_finished());

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_missing_lease_api_falls_back_to_status_heartbeats() {
    let h = Harness::start_with(|control_plane, _| control_plane.disable_leases()).await;

    eventually(Duration::from_secs(3), || {
        *h.lease_state.borrow() == LeaseState::FailedToEstablish
    })
    .await;
    assert!(h.control_plane.lease(LEASE_NAMESPACE, NODE).is_none());

    let before = h.control_plane.calls(Call::PatchNodeStatus);
    tokio::time::sleep(Duration::from_secs(5)).await;
    let after = h.control_plane.calls(Call::PatchNodeStatus);
    assert!(after >= before + 3, "node status patched {} times in 5s", after - before);

    // Workloads are unaffected.
    let key = WorkloadKey::new("default", "web");
    h.control_plane
        .submit_pod(pod("default", "web", "nginx"))
        .unwrap();
    eventually(Duration::from_secs(5), || {
        h.pod_phase(&key).as_deref() == Some("Running")
    })
    .await;
    assert!(!h.agent_finished());

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_refused_pod_keeps_its_reason_past_the_grace_period() {
    let h = Harness::start().await;
    eventually(Duration::from_secs(2), || *h.ready.borrow()).await;

    let key = WorkloadKey::new("default", "needs-config");
    let mut needs_config = pod("default", "needs-config", "nginx");
    needs_config.spec.as_mut().unwrap().containers[0].env = Some(vec![EnvVar {
        name: "LEVEL".to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            config_map_key_ref: Some(ConfigMapKeySelector {
                name: "absent".to_string(),
                key: "level".to_string(),
                optional: None,
            }),
            ..Default::default()
        }),
    }]);
    h.control_plane.submit_pod(needs_config).unwrap();

    let reason = || {
        h.control_plane
            .pod(&key)
            .and_then(|p| p.status)
            .and_then(|s| s.reason)
    };
    eventually(Duration::from_secs(5), || {
        reason().as_deref() == Some(REASON_PROVIDER_FAILED)
    })
    .await;

    // Old enough that a missing workload would count as lost.
    h.control_plane
        .update_pod(&key, |p| {
            p.metadata.creation_timestamp =
                Some(Time(Utc::now() - chrono::Duration::minutes(5)));
        })
        .unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(reason().as_deref(), Some(REASON_PROVIDER_FAILED));
    assert_eq!(h.pod_phase(&key).as_deref(), Some("Pending"));
    assert!(h.provider.calls_for(Operation::Create, &key).is_empty());

    h.stop().await;
}
