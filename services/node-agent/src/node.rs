//! Node controller.
//!
//! Registers (or adopts) the node object and keeps its status current:
//! `Ready` from the latest ping, capacity and addresses from the provider's
//! description. Runs at a slow cadence, plus immediately when readiness flips
//! or the provider publishes a new description. When the lease controller
//! could not establish a lease, node status updates become the heartbeat and
//! run at the ping interval.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{
    DaemonEndpoint, Node, NodeCondition, NodeDaemonEndpoints, NodeSpec, NodeStatus,
    NodeSystemInfo, Taint,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vk_errdefs::{Error, ErrorKind, Result};

use crate::control_plane::ControlPlane;
use crate::lease::{LeaseState, ServerNode};
use crate::ping::PingResult;
use crate::provider::{NodeDescription, Provider};

/// Attempts at a node status write before giving up on conflicts.
const MAX_STATUS_ATTEMPTS: u32 = 5;

pub const LABEL_TYPE: &str = "type";
pub const LABEL_ROLE: &str = "kubernetes.io/role";
pub const LABEL_HOSTNAME: &str = "kubernetes.io/hostname";
pub const LABEL_OS: &str = "kubernetes.io/os";

/// Static node settings.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub name: String,

    /// Taint that keeps ordinary workloads off the virtual node.
    pub taint: Option<Taint>,

    /// Reported as the kubelet version in node info.
    pub version: String,

    /// Cadence of full status updates while the lease is healthy.
    pub status_interval: Duration,

    /// Cadence used instead when leases are unavailable.
    pub ping_interval: Duration,
}

// =============================================================================
// Node shape
// =============================================================================

/// The node object published for `description`.
pub fn build_node(config: &NodeConfig, description: &NodeDescription) -> Node {
    let labels = BTreeMap::from([
        (LABEL_TYPE.to_string(), "virtual-kubelet".to_string()),
        (LABEL_ROLE.to_string(), "agent".to_string()),
        (LABEL_HOSTNAME.to_string(), config.name.clone()),
        (
            LABEL_OS.to_string(),
            description.operating_system.to_lowercase(),
        ),
    ]);

    Node {
        metadata: ObjectMeta {
            name: Some(config.name.clone()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(NodeSpec {
            taints: config.taint.clone().map(|taint| vec![taint]),
            ..Default::default()
        }),
        status: Some(build_status(config, description)),
    }
}

fn build_status(config: &NodeConfig, description: &NodeDescription) -> NodeStatus {
    NodeStatus {
        node_info: Some(NodeSystemInfo {
            operating_system: description.operating_system.clone(),
            architecture: description.architecture.clone(),
            kubelet_version: config.version.clone(),
            ..Default::default()
        }),
        daemon_endpoints: Some(NodeDaemonEndpoints {
            kubelet_endpoint: Some(DaemonEndpoint {
                port: description.daemon_port,
            }),
        }),
        capacity: Some(description.capacity.clone()),
        allocatable: Some(description.allocatable.clone()),
        addresses: Some(description.addresses.clone()),
        conditions: Some(description.conditions.clone()),
        ..Default::default()
    }
}

/// Read back the published subset of a node's description.
pub fn description_from_node(node: &Node) -> Option<NodeDescription> {
    let status = node.status.as_ref()?;
    let info = status.node_info.as_ref()?;
    Some(NodeDescription {
        operating_system: info.operating_system.clone(),
        architecture: info.architecture.clone(),
        capacity: status.capacity.clone().unwrap_or_default(),
        allocatable: status.allocatable.clone().unwrap_or_default(),
        conditions: status.conditions.clone().unwrap_or_default(),
        addresses: status.addresses.clone().unwrap_or_default(),
        daemon_port: status
            .daemon_endpoints
            .as_ref()
            .and_then(|d| d.kubelet_endpoint.as_ref())
            .map_or(0, |e| e.port),
    })
}

/// The `Ready` condition for a ping outcome.
pub fn ready_condition(ping: &PingResult) -> NodeCondition {
    match &ping.error {
        None => NodeCondition {
            type_: "Ready".to_string(),
            status: "True".to_string(),
            reason: Some("KubeletReady".to_string()),
            message: Some("kubelet is ready.".to_string()),
            ..Default::default()
        },
        Some(err) => NodeCondition {
            type_: "Ready".to_string(),
            status: "False".to_string(),
            reason: Some("ProviderPingFailed".to_string()),
            message: Some(format!("provider ping failed: {}", err.report())),
            ..Default::default()
        },
    }
}

/// Stamp heartbeat times on `conditions`, carrying transition times over
/// from `previous` for conditions whose status did not change.
pub fn stamp_conditions(conditions: &mut [NodeCondition], previous: &[NodeCondition]) {
    let now = Time(Utc::now());
    for condition in conditions {
        let prior = previous.iter().find(|p| p.type_ == condition.type_);
        condition.last_heartbeat_time = Some(now.clone());
        condition.last_transition_time = match prior {
            Some(p) if p.status == condition.status && p.last_transition_time.is_some() => {
                p.last_transition_time.clone()
            }
            _ => Some(now.clone()),
        };
    }
}

fn condition_status<'a>(node: &'a Node, type_: &str) -> Option<&'a str> {
    node.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == type_)
        .map(|c| c.status.as_str())
}

// =============================================================================
// Handle
// =============================================================================

/// Shared view of the latest node object the controller wrote or read.
#[derive(Clone)]
pub struct NodeHandle {
    node: watch::Receiver<Option<Node>>,
}

impl NodeHandle {
    pub fn current(&self) -> Option<Node> {
        self.node.borrow().clone()
    }
}

#[async_trait]
impl ServerNode for NodeHandle {
    async fn node(&self, cancel: &CancellationToken) -> Result<Node> {
        let mut rx = self.node.clone();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(node) = current {
                return Ok(node);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::cancelled()),
                changed = rx.changed() => changed.map_err(|_| Error::cancelled())?,
            }
        }
    }
}

// =============================================================================
// Controller
// =============================================================================

/// Node object upkeep.
pub struct NodeController {
    config: NodeConfig,
    control_plane: Arc<dyn ControlPlane>,
    provider: Arc<dyn Provider>,
    description: watch::Sender<Option<NodeDescription>>,
    node: watch::Sender<Option<Node>>,
}

impl NodeController {
    pub fn new(
        config: NodeConfig,
        control_plane: Arc<dyn ControlPlane>,
        provider: Arc<dyn Provider>,
    ) -> Result<Self> {
        if config.status_interval.is_zero() || config.ping_interval.is_zero() {
            return Err(Error::invalid_input("node status intervals must be nonzero"));
        }
        let (description, _) = watch::channel(None);
        let (node, _) = watch::channel(None);
        Ok(Self {
            config,
            control_plane,
            provider,
            description,
            node,
        })
    }

    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            node: self.node.subscribe(),
        }
    }

    /// Last description read from the provider.
    pub fn description(&self) -> Option<NodeDescription> {
        self.description.borrow().clone()
    }

    /// Ask the provider to describe the node.
    pub async fn describe(&self, cancel: &CancellationToken) -> Result<NodeDescription> {
        let description = self
            .provider
            .describe(cancel)
            .await
            .map_err(|e| Error::wrap(e, "describe node"))?;
        self.description.send_replace(Some(description.clone()));
        Ok(description)
    }

    /// Create the node object, or adopt one that already exists.
    pub async fn register(&self, cancel: &CancellationToken) -> Result<Node> {
        let description = match self.description() {
            Some(description) => description,
            None => self.describe(cancel).await?,
        };
        let desired = build_node(&self.config, &description);

        let node = match self.control_plane.get_node(&self.config.name).await {
            Ok(existing) => {
                info!(node = %self.config.name, "Adopting existing node");
                existing
            }
            Err(e) if e.is(ErrorKind::NotFound) => {
                match self.control_plane.create_node(&desired).await {
                    Ok(created) => {
                        info!(node = %self.config.name, "Registered node");
                        created
                    }
                    Err(e) if e.is(ErrorKind::AlreadyExists) => {
                        self.control_plane.get_node(&self.config.name).await?
                    }
                    Err(e) => return Err(Error::wrap(e, "register node")),
                }
            }
            Err(e) => return Err(Error::wrap(e, "get node")),
        };

        self.node.send_replace(Some(node.clone()));
        Ok(node)
    }

    /// Write a fresh node status: description fields plus `Ready` from `ping`.
    ///
    /// Conflicts re-read the node and retry a bounded number of times.
    pub async fn update_status(
        &self,
        ping: Option<&PingResult>,
        cancel: &CancellationToken,
    ) -> Result<Node> {
        let description = match self.description() {
            Some(description) => description,
            None => self.describe(cancel).await?,
        };

        let cached = self.node.borrow().clone();
        let mut current = match cached {
            Some(node) => node,
            None => self.register(cancel).await?,
        };

        for attempt in 1..=MAX_STATUS_ATTEMPTS {
            if cancel.is_cancelled() {
                return Err(Error::cancelled());
            }

            let status = self.desired_status(&description, ping, &current);
            match self
                .control_plane
                .patch_node_status(
                    &self.config.name,
                    current.metadata.resource_version.as_deref(),
                    &status,
                )
                .await
            {
                Ok(node) => {
                    debug!(node = %self.config.name, ready = ?condition_status(&node, "Ready"), "Updated node status");
                    self.node.send_replace(Some(node.clone()));
                    return Ok(node);
                }
                Err(e) if e.is(ErrorKind::Conflict) => {
                    debug!(node = %self.config.name, attempt, "Node status conflict, re-reading");
                    current = self.control_plane.get_node(&self.config.name).await?;
                }
                Err(e) if e.is(ErrorKind::NotFound) => {
                    warn!(node = %self.config.name, "Node object disappeared, registering again");
                    self.node.send_replace(None);
                    current = self.register(cancel).await?;
                }
                Err(e) => return Err(Error::wrap(e, "update node status")),
            }
        }

        Err(Error::transient(format!(
            "node {} status kept conflicting after {MAX_STATUS_ATTEMPTS} attempts",
            self.config.name
        )))
    }

    fn desired_status(
        &self,
        description: &NodeDescription,
        ping: Option<&PingResult>,
        current: &Node,
    ) -> NodeStatus {
        let mut status = build_status(&self.config, description);
        let mut conditions = description.conditions.clone();
        let ready = match ping {
            Some(ping) => ready_condition(ping),
            None => NodeCondition {
                type_: "Ready".to_string(),
                status: "Unknown".to_string(),
                reason: Some("NodeStatusUnknown".to_string()),
                message: Some("waiting for the first provider ping".to_string()),
                ..Default::default()
            },
        };
        match conditions.iter_mut().find(|c| c.type_ == "Ready") {
            Some(slot) => *slot = ready,
            None => conditions.push(ready),
        }
        let previous = current
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_deref())
            .unwrap_or_default();
        stamp_conditions(&mut conditions, previous);
        status.conditions = Some(conditions);
        status
    }

    /// Keep the node status current until cancelled.
    pub async fn run(
        self: Arc<Self>,
        cancel: CancellationToken,
        mut ping: watch::Receiver<Option<PingResult>>,
        mut lease: watch::Receiver<LeaseState>,
    ) -> Result<()> {
        let mut descriptions = self.provider.node_updates();
        let mut reported_ready: Option<bool> = None;
        let mut lease_open = true;

        info!(
            node = %self.config.name,
            interval_ms = self.config.status_interval.as_millis() as u64,
            "Starting node controller"
        );

        loop {
            let latest = ping.borrow_and_update().clone();
            match self.update_status(latest.as_ref(), &cancel).await {
                Ok(_) => reported_ready = latest.as_ref().map(PingResult::is_ok),
                Err(e) if e.is(ErrorKind::Cancelled) => return Ok(()),
                Err(e) if e.is(ErrorKind::Fatal) => return Err(e),
                Err(e) => warn!(node = %self.config.name, error = %e.report(), "Node status update failed"),
            }

            let cadence = if *lease.borrow() == LeaseState::FailedToEstablish {
                self.config.ping_interval
            } else {
                self.config.status_interval
            };
            let sleep = tokio::time::sleep(cadence);
            tokio::pin!(sleep);

            // Wait for the next reason to write.
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = &mut sleep => break,
                    changed = ping.changed() => {
                        if changed.is_err() {
                            return Ok(());
                        }
                        let ready = ping.borrow().as_ref().map(PingResult::is_ok);
                        if ready != reported_ready {
                            info!(node = %self.config.name, ready = ?ready, "Node readiness changed");
                            break;
                        }
                    }
                    changed = lease.changed(), if lease_open => {
                        // A dropped sender keeps the current cadence.
                        lease_open = changed.is_ok();
                        break;
                    }
                    Some(description) = next_description(&mut descriptions) => {
                        info!(node = %self.config.name, "Provider published a new node description");
                        self.description.send_replace(Some(description));
                        break;
                    }
                }
            }
        }
    }
}

/// Next description from the provider, or never when it does not push.
async fn next_description(
    updates: &mut Option<watch::Receiver<NodeDescription>>,
) -> Option<NodeDescription> {
    let Some(rx) = updates else {
        return std::future::pending().await;
    };
    match rx.changed().await {
        Ok(()) => Some(rx.borrow_and_update().clone()),
        Err(_) => {
            *updates = None;
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::memory::{Call, InMemoryControlPlane};
    use crate::provider::mock::MockProvider;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    fn config() -> NodeConfig {
        NodeConfig {
            name: "vk-1".to_string(),
            taint: Some(Taint {
                key: "virtual-kubelet.io/provider".to_string(),
                value: Some("mock".to_string()),
                effect: "NoSchedule".to_string(),
                time_added: None,
            }),
            version: "v1.32.0-vk".to_string(),
            status_interval: Duration::from_secs(30),
            ping_interval: Duration::from_secs(1),
        }
    }

    fn ok_ping() -> PingResult {
        PingResult {
            at: Utc::now(),
            error: None,
        }
    }

    fn failed_ping() -> PingResult {
        PingResult {
            at: Utc::now(),
            error: Some(Arc::new(Error::transient("unreachable"))),
        }
    }

    fn controller() -> (Arc<InMemoryControlPlane>, Arc<MockProvider>, NodeController) {
        let control_plane = Arc::new(InMemoryControlPlane::new());
        let provider = Arc::new(MockProvider::new("vk-1", "Linux", "10.0.0.5", 10250));
        let controller =
            NodeController::new(config(), control_plane.clone(), provider.clone()).unwrap();
        (control_plane, provider, controller)
    }

    #[test]
    fn test_node_shape() {
        let provider = MockProvider::new("vk-1", "Linux", "10.0.0.5", 10250);
        let description = provider_description(&provider);
        let node = build_node(&config(), &description);

        let labels = node.metadata.labels.unwrap();
        assert_eq!(labels[LABEL_TYPE], "virtual-kubelet");
        assert_eq!(labels[LABEL_ROLE], "agent");
        assert_eq!(labels[LABEL_HOSTNAME], "vk-1");
        assert_eq!(labels[LABEL_OS], "linux");

        let taints = node.spec.unwrap().taints.unwrap();
        assert_eq!(taints[0].effect, "NoSchedule");

        let capacity = node.status.unwrap().capacity.unwrap();
        assert_eq!(capacity["cpu"], Quantity("20".to_string()));
        assert_eq!(capacity["memory"], Quantity("100Gi".to_string()));
        assert_eq!(capacity["pods"], Quantity("20".to_string()));
    }

    fn provider_description(provider: &MockProvider) -> NodeDescription {
        let updates = provider.node_updates().unwrap();
        let description = updates.borrow().clone();
        description
    }

    #[test]
    fn test_description_round_trips_through_node() {
        let provider = MockProvider::new("vk-1", "Linux", "10.0.0.5", 10250);
        let description = provider_description(&provider);
        let node = build_node(&config(), &description);
        assert_eq!(description_from_node(&node), Some(description));
    }

    #[test]
    fn test_transition_time_only_moves_on_change() {
        let earlier = Time(Utc::now() - chrono::Duration::minutes(5));
        let previous = vec![NodeCondition {
            type_: "Ready".to_string(),
            status: "True".to_string(),
            last_transition_time: Some(earlier.clone()),
            ..Default::default()
        }];

        let mut same = vec![ready_condition(&ok_ping())];
        stamp_conditions(&mut same, &previous);
        assert_eq!(same[0].last_transition_time, Some(earlier.clone()));
        assert!(same[0].last_heartbeat_time.as_ref().unwrap().0 > earlier.0);

        let mut flipped = vec![ready_condition(&failed_ping())];
        stamp_conditions(&mut flipped, &previous);
        assert_eq!(flipped[0].status, "False");
        assert!(flipped[0].last_transition_time.as_ref().unwrap().0 > earlier.0);
    }

    #[tokio::test]
    async fn test_register_creates_then_adopts() {
        let (control_plane, provider, controller) = controller();
        let cancel = CancellationToken::new();

        let node = controller.register(&cancel).await.unwrap();
        assert!(node.metadata.uid.is_some());
        assert_eq!(control_plane.calls(Call::CreateNode), 1);

        let again = NodeController::new(config(), control_plane.clone(), provider).unwrap();
        let adopted = again.register(&cancel).await.unwrap();
        assert_eq!(adopted.metadata.uid, node.metadata.uid);
        assert_eq!(control_plane.calls(Call::CreateNode), 1);
    }

    #[tokio::test]
    async fn test_ready_follows_ping() {
        let (control_plane, _provider, controller) = controller();
        let cancel = CancellationToken::new();
        controller.register(&cancel).await.unwrap();

        let node = controller.update_status(Some(&ok_ping()), &cancel).await.unwrap();
        assert_eq!(condition_status(&node, "Ready"), Some("True"));

        let node = controller
            .update_status(Some(&failed_ping()), &cancel)
            .await
            .unwrap();
        assert_eq!(condition_status(&node, "Ready"), Some("False"));

        let stored = control_plane.node("vk-1").unwrap();
        assert_eq!(condition_status(&stored, "Ready"), Some("False"));
        assert_eq!(condition_status(&stored, "MemoryPressure"), Some("False"));
    }

    #[tokio::test]
    async fn test_conflicts_retry_then_escalate() {
        let (control_plane, _provider, controller) = controller();
        let cancel = CancellationToken::new();
        controller.register(&cancel).await.unwrap();

        control_plane.fail_next(Call::PatchNodeStatus, ErrorKind::Conflict, 2);
        controller.update_status(Some(&ok_ping()), &cancel).await.unwrap();
        assert_eq!(control_plane.calls(Call::PatchNodeStatus), 3);

        control_plane.fail_next(
            Call::PatchNodeStatus,
            ErrorKind::Conflict,
            MAX_STATUS_ATTEMPTS as usize,
        );
        let err = controller
            .update_status(Some(&ok_ping()), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[tokio::test]
    async fn test_deleted_node_is_registered_again() {
        let (control_plane, _provider, controller) = controller();
        let cancel = CancellationToken::new();
        controller.register(&cancel).await.unwrap();
        control_plane.delete_node("vk-1");

        controller.update_status(Some(&ok_ping()), &cancel).await.unwrap();
        assert!(control_plane.node("vk-1").is_some());
        assert_eq!(control_plane.calls(Call::CreateNode), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_reacts_to_readiness_flip_and_capacity_push() {
        let (control_plane, provider, controller) = controller();
        let controller = Arc::new(controller);
        let cancel = CancellationToken::new();
        let (ping_tx, ping_rx) = watch::channel(Some(ok_ping()));
        let (_lease_tx, lease_rx) = watch::channel(LeaseState::Established);
        let runner = tokio::spawn(controller.clone().run(cancel.clone(), ping_rx, lease_rx));

        tokio::time::sleep(Duration::from_millis(10)).await;
        let node = control_plane.node("vk-1").unwrap();
        assert_eq!(condition_status(&node, "Ready"), Some("True"));

        ping_tx.send_replace(Some(failed_ping()));
        tokio::time::sleep(Duration::from_millis(10)).await;
        let node = control_plane.node("vk-1").unwrap();
        assert_eq!(condition_status(&node, "Ready"), Some("False"));

        provider.set_capacity("pods", "40");
        tokio::time::sleep(Duration::from_millis(10)).await;
        let node = control_plane.node("vk-1").unwrap();
        let capacity = node.status.unwrap().capacity.unwrap();
        assert_eq!(capacity["pods"], Quantity("40".to_string()));

        cancel.cancel();
        runner.await.unwrap().unwrap();
    }
}
