//! Happy path: a healthy provider and a cluster that supports leases.

mod harness;

use std::time::Duration;

use harness::{eventually, pod, Harness, NODE};
use k8s_openapi::api::core::v1::{
    EnvFromSource, EnvVar, EnvVarSource, ObjectFieldSelector, Secret, SecretEnvSource,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use tokio_util::sync::CancellationToken;
use vk_node_agent::control_plane::memory::Call;
use vk_node_agent::provider::Provider;
use vk_node_agent::control_plane::LEASE_NAMESPACE;
use vk_node_agent::lease::LeaseState;
use vk_node_agent::provider::mock::Operation;
use vk_node_agent::workload::WorkloadKey;

#[tokio::test(start_paused = true)]
async fn test_node_registers_with_lease_and_turns_ready() {
    let h = Harness::start().await;

    eventually(Duration::from_secs(2), || h.node_ready().as_deref() == Some("True")).await;

    let node = h.control_plane.node(NODE).expect("node registered");
    let labels = node.metadata.labels.unwrap_or_default();
    assert_eq!(labels.get("type").map(String::as_str), Some("virtual-kubelet"));
    assert_eq!(
        labels.get("kubernetes.io/hostname").map(String::as_str),
        Some(NODE)
    );
    assert_eq!(h.control_plane.calls(Call::CreateNode), 1);

    eventually(Duration::from_secs(2), || {
        h.control_plane.lease(LEASE_NAMESPACE, NODE).is_some()
    })
    .await;
    let lease = h.control_plane.lease(LEASE_NAMESPACE, NODE).unwrap();
    let spec = lease.spec.unwrap_or_default();
    assert_eq!(spec.holder_identity.as_deref(), Some(NODE));
    assert_eq!(spec.lease_duration_seconds, Some(25));
    assert_eq!(*h.lease_state.borrow(), LeaseState::Established);

    // Renewals keep moving the lease while the provider answers.
    let first = h.lease_version();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_ne!(h.lease_version(), first);

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_scheduled_pod_runs_and_is_created_once() {
    let h = Harness::start().await;
    eventually(Duration::from_secs(2), || *h.ready.borrow()).await;

    let key = WorkloadKey::new("default", "web");
    h.control_plane
        .submit_pod(pod("default", "web", "nginx:1.27"))
        .unwrap();

    eventually(Duration::from_secs(5), || {
        h.pod_phase(&key).as_deref() == Some("Running")
    })
    .await;

    let status = h.control_plane.pod(&key).unwrap().status.unwrap();
    let containers = status.container_statuses.unwrap_or_default();
    assert_eq!(containers.len(), 1);
    assert!(containers[0].ready);

    // Status writes, mirror sweeps and periodic resyncs must not recreate it.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.provider.calls_for(Operation::Create, &key).len(), 1);
    assert_eq!(h.provider.calls_for(Operation::Update, &key).len(), 0);

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_deleted_pod_is_torn_down_and_released() {
    let h = Harness::start().await;
    eventually(Duration::from_secs(2), || *h.ready.borrow()).await;

    let key = WorkloadKey::new("default", "job");
    h.control_plane
        .submit_pod(pod("default", "job", "busybox"))
        .unwrap();
    eventually(Duration::from_secs(5), || {
        h.pod_phase(&key).as_deref() == Some("Running")
    })
    .await;

    h.control_plane.request_pod_deletion(&key).unwrap();
    eventually(Duration::from_secs(5), || h.control_plane.pod(&key).is_none()).await;
    assert_eq!(h.provider.calls_for(Operation::Delete, &key).len(), 1);

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_provider_sees_resolved_environment() {
    let h = Harness::start().await;
    eventually(Duration::from_secs(2), || *h.ready.borrow()).await;

    h.control_plane
        .put_secret(Secret {
            metadata: ObjectMeta {
                namespace: Some("default".to_string()),
                name: Some("db".to_string()),
                ..Default::default()
            },
            data: Some([("PASSWORD".to_string(), ByteString(b"hunter2".to_vec()))].into()),
            ..Default::default()
        })
        .unwrap();

    let key = WorkloadKey::new("default", "api");
    let mut api = pod("default", "api", "nginx");
    let container = &mut api.spec.as_mut().unwrap().containers[0];
    container.env_from = Some(vec![EnvFromSource {
        prefix: Some("DB_".to_string()),
        secret_ref: Some(SecretEnvSource {
            name: "db".to_string(),
            optional: None,
        }),
        ..Default::default()
    }]);
    container.env = Some(vec![EnvVar {
        name: "POD_NAMESPACE".to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                api_version: None,
                field_path: "metadata.namespace".to_string(),
            }),
            ..Default::default()
        }),
    }]);
    h.control_plane.submit_pod(api).unwrap();

    eventually(Duration::from_secs(5), || {
        h.pod_phase(&key).as_deref() == Some("Running")
    })
    .await;

    let observed = h
        .provider
        .get_workload(&key, &CancellationToken::new())
        .await
        .unwrap();
    let container = observed.spec.unwrap().containers[0].clone();
    let env: Vec<_> = container
        .env
        .unwrap_or_default()
        .into_iter()
        .map(|v| (v.name, v.value.unwrap_or_default()))
        .collect();
    assert_eq!(
        env,
        [
            ("DB_PASSWORD".to_string(), "hunter2".to_string()),
            ("POD_NAMESPACE".to_string(), "default".to_string()),
        ]
    );
    assert!(container.env_from.is_none());

    // Later resyncs compare against the pod's references without churn.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.provider.calls_for(Operation::Update, &key).len(), 0);

    h.stop().await;
}
