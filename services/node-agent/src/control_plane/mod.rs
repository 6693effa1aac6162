//! Control-plane client.
//!
//! The agent talks to the cluster API through [`ControlPlane`]. Two
//! implementations ship:
//!
//! - [`KubeControlPlane`]: the real API server, via `kube`.
//! - [`InMemoryControlPlane`]: an in-process store with resource versions,
//!   conflict preconditions, watches and fault injection.
//!
//! Errors are classified into [`vk_errdefs::ErrorKind`] inside the
//! implementation, never by callers.

pub mod kubernetes;
pub mod memory;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{
    ConfigMap, Event, Node, NodeStatus, Pod, PodStatus, Secret, Service,
};
use serde_json::Value;
use vk_errdefs::Result;

use crate::workload::WorkloadKey;

pub use kubernetes::KubeControlPlane;
pub use memory::InMemoryControlPlane;

/// Namespace holding node leases.
pub const LEASE_NAMESPACE: &str = "kube-node-lease";

/// A change to a pod assigned to this node.
#[derive(Debug, Clone, PartialEq)]
pub enum PodEvent {
    Added(Pod),
    Modified(Pod),
    Deleted(Pod),
}

impl PodEvent {
    pub fn pod(&self) -> &Pod {
        match self {
            Self::Added(pod) | Self::Modified(pod) | Self::Deleted(pod) => pod,
        }
    }
}

/// Stream of pod changes. Ends (or yields an error) when the watch expires;
/// the consumer relists and resubscribes.
pub type PodEventStream = BoxStream<'static, Result<PodEvent>>;

/// A consistent snapshot of the pods in scope.
#[derive(Debug, Clone, Default)]
pub struct PodList {
    pub items: Vec<Pod>,

    /// Version to resume watching from.
    pub resource_version: String,
}

/// Which pods the agent sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodScope {
    /// Only pods with `spec.nodeName` equal to this.
    pub node_name: String,

    /// Restrict to one namespace; `None` means all.
    pub namespace: Option<String>,
}

impl PodScope {
    pub fn field_selector(&self) -> String {
        format!("spec.nodeName={}", self.node_name)
    }

    pub fn contains(&self, pod: &Pod) -> bool {
        let on_node = pod.spec.as_ref().and_then(|s| s.node_name.as_deref())
            == Some(self.node_name.as_str());
        let in_namespace = match &self.namespace {
            Some(ns) => pod.metadata.namespace.as_deref() == Some(ns.as_str()),
            None => true,
        };
        on_node && in_namespace
    }
}

/// The cluster API surface a worker agent uses.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn get_node(&self, name: &str) -> Result<Node>;

    async fn create_node(&self, node: &Node) -> Result<Node>;

    /// Merge `status` into the node's status. Conditions merge by type.
    /// When `resource_version` is set, a stale version fails with `Conflict`.
    async fn patch_node_status(
        &self,
        name: &str,
        resource_version: Option<&str>,
        status: &NodeStatus,
    ) -> Result<Node>;

    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Lease>;

    async fn create_lease(&self, lease: &Lease) -> Result<Lease>;

    /// Replace a lease; its `resourceVersion` is the precondition.
    async fn update_lease(&self, lease: &Lease) -> Result<Lease>;

    async fn delete_lease(&self, namespace: &str, name: &str) -> Result<()>;

    async fn list_pods(&self, scope: &PodScope) -> Result<PodList>;

    async fn watch_pods(&self, scope: &PodScope, resource_version: &str)
        -> Result<PodEventStream>;

    async fn get_pod(&self, key: &WorkloadKey) -> Result<Pod>;

    /// Merge `status` into the pod's status. Conditions merge by type.
    async fn patch_pod_status(
        &self,
        key: &WorkloadKey,
        resource_version: Option<&str>,
        status: &PodStatus,
    ) -> Result<Pod>;

    /// Delete a pod; `Some(0)` removes it immediately.
    async fn delete_pod(&self, key: &WorkloadKey, grace_period_seconds: Option<u32>)
        -> Result<()>;

    async fn create_event(&self, event: &Event) -> Result<()>;

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret>;

    async fn list_services(&self, namespace: &str) -> Result<Vec<Service>>;
}

/// Merge `patch` into `base` the way a strategic-merge status patch does:
/// objects merge recursively, `null` deletes, lists named `conditions` merge
/// by their `type`, other lists are replaced.
pub(crate) fn merge_status(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (key, value) in patch {
                if value.is_null() {
                    base.remove(&key);
                } else if key == "conditions" {
                    let existing = base.entry(key).or_insert_with(|| Value::Array(Vec::new()));
                    merge_conditions(existing, value);
                } else {
                    merge_status(base.entry(key).or_insert(Value::Null), value);
                }
            }
        }
        (base, patch) => *base = patch,
    }
}

fn merge_conditions(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Array(existing), Value::Array(updates)) => {
            for update in updates {
                let ty = update.get("type").cloned();
                match existing.iter_mut().find(|c| c.get("type") == ty.as_ref()) {
                    Some(slot) => merge_status(slot, update),
                    None => existing.push(update),
                }
            }
        }
        (base, patch) => *base = patch,
    }
}
