//! Shared fixture for the end-to-end scenarios.
//!
//! Runs a complete agent against the in-memory control plane and the mock
//! provider. Tests run on a paused clock, so "within 2 s" means virtual
//! seconds and long quiet periods cost nothing.

#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Once};
use std::time::Duration;

use k8s_openapi::api::core::v1::{Container, Node, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use vk_errdefs::Result;
use vk_node_agent::control_plane::memory::InMemoryControlPlane;
use vk_node_agent::control_plane::{PodScope, LEASE_NAMESPACE};
use vk_node_agent::lease::LeaseState;
use vk_node_agent::node::NodeConfig;
use vk_node_agent::provider::mock::MockProvider;
use vk_node_agent::status::MirrorConfig;
use vk_node_agent::supervisor::DEFAULT_RESYNC_INTERVAL;
use vk_node_agent::workload::WorkloadKey;
use vk_node_agent::{Agent, AgentSettings};

pub const NODE: &str = "vk-1";
pub const PING_INTERVAL: Duration = Duration::from_secs(1);
pub const PING_TIMEOUT: Duration = Duration::from_millis(500);
pub const RENEW_INTERVAL: Duration = Duration::from_secs(1);

static TRACING: Once = Once::new();

fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

pub fn settings() -> AgentSettings {
    AgentSettings {
        node: NodeConfig {
            name: NODE.to_string(),
            taint: None,
            version: "v0.1.0".to_string(),
            status_interval: Duration::from_secs(5),
            ping_interval: PING_INTERVAL,
        },
        scope: PodScope {
            node_name: NODE.to_string(),
            namespace: None,
        },
        ping_interval: PING_INTERVAL,
        ping_timeout: Some(PING_TIMEOUT),
        lease_renew_interval: RENEW_INTERVAL,
        resync_interval: DEFAULT_RESYNC_INTERVAL,
        mirror: MirrorConfig {
            interval: Duration::from_secs(2),
            workers: 2,
        },
        pod_sync_workers: 2,
        shutdown_timeout: Duration::from_secs(5),
    }
}

pub struct Harness {
    pub control_plane: Arc<InMemoryControlPlane>,
    pub provider: Arc<MockProvider>,
    pub ready: watch::Receiver<bool>,
    pub lease_state: watch::Receiver<LeaseState>,
    root: CancellationToken,
    agent: JoinHandle<Result<()>>,
}

impl Harness {
    /// Build a control plane and provider, let `prepare` adjust them, then
    /// start the agent.
    pub async fn start_with(
        prepare: impl FnOnce(&InMemoryControlPlane, &MockProvider),
    ) -> Self {
        init_tracing();
        let control_plane = Arc::new(InMemoryControlPlane::new());
        let provider = Arc::new(MockProvider::new(NODE, "Linux", "10.0.0.5", 10250));
        prepare(&control_plane, &provider);

        let agent = Agent::new(settings(), control_plane.clone(), provider.clone()).unwrap();
        let ready = agent.readiness();
        let lease_state = agent.lease_state();
        let root = CancellationToken::new();
        let running = agent.start(root.clone()).await.unwrap();

        Self {
            control_plane,
            provider,
            ready,
            lease_state,
            root,
            agent: tokio::spawn(running.wait()),
        }
    }

    pub async fn start() -> Self {
        Self::start_with(|_, _| {}).await
    }

    pub fn node_ready(&self) -> Option<String> {
        let node = self.control_plane.node(NODE)?;
        condition(&node, "Ready")
    }

    pub fn pod_phase(&self, key: &WorkloadKey) -> Option<String> {
        self.control_plane.pod(key)?.status?.phase
    }

    pub fn lease_version(&self) -> Option<String> {
        self.control_plane
            .lease(LEASE_NAMESPACE, NODE)?
            .metadata
            .resource_version
    }

    pub fn agent_finished(&self) -> bool {
        self.agent.is_finished()
    }

    /// Cancel and wait for a clean drain.
    pub async fn stop(self) {
        self.root.cancel();
        self.agent.await.unwrap().unwrap();
    }
}

/// Status of a node condition by type.
pub fn condition(node: &Node, type_: &str) -> Option<String> {
    node.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == type_)
        .map(|c| c.status.clone())
}

/// Poll `check` until it holds or `within` elapses. Returns the time taken.
pub async fn eventually<F>(within: Duration, mut check: F) -> Duration
where
    F: FnMut() -> bool,
{
    let started = tokio::time::Instant::now();
    loop {
        if check() {
            return started.elapsed();
        }
        assert!(
            started.elapsed() <= within,
            "condition not met within {within:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Like [`eventually`] for async checks.
pub async fn eventually_async<F, Fut>(within: Duration, mut check: F) -> Duration
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let started = tokio::time::Instant::now();
    loop {
        if check().await {
            return started.elapsed();
        }
        assert!(
            started.elapsed() <= within,
            "condition not met within {within:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A pod bound to the test node with one container.
pub fn pod(namespace: &str, name: &str, image: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            namespace: Some(namespace.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(NODE.to_string()),
            containers: vec![Container {
                name: "main".to_string(),
                image: Some(image.to_string()),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: None,
    }
}
