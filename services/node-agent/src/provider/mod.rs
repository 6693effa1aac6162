//! Provider contract: the capability set the agent consumes from the
//! substrate that actually runs workloads.
//!
//! Every operation takes a [`CancellationToken`] and must return promptly
//! with [`ErrorKind::Cancelled`](vk_errdefs::ErrorKind::Cancelled) once it
//! fires. Operations on different workloads may be issued concurrently; the
//! provider serializes internally where it needs to.
//!
//! Providers are compiled in and selected by name through [`ProviderKind`].

pub mod mock;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{NodeAddress, NodeCondition, Pod, PodStatus};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use vk_errdefs::{Error, Result};

use crate::workload::WorkloadKey;

pub use mock::MockProvider;

/// Static self-description of the node, as reported by the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeDescription {
    /// Operating system, `Linux` or `Windows`.
    pub operating_system: String,

    /// CPU architecture reported in node info.
    pub architecture: String,

    /// Declared capacity (`cpu`, `memory`, `pods`, ...).
    pub capacity: BTreeMap<String, Quantity>,

    /// Allocatable resources; usually equal to capacity.
    pub allocatable: BTreeMap<String, Quantity>,

    /// Condition scaffolding; the agent owns these condition types.
    pub conditions: Vec<NodeCondition>,

    /// Node addresses.
    pub addresses: Vec<NodeAddress>,

    /// Port of the kubelet-compatible HTTP surface.
    pub daemon_port: i32,
}

/// Output of a non-interactive exec.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Workload provider.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Create a workload. Idempotent.
    async fn create_workload(&self, pod: &Pod, cancel: &CancellationToken) -> Result<()>;

    /// Update a workload in place. `Unsupported` is an acceptable answer.
    async fn update_workload(&self, pod: &Pod, cancel: &CancellationToken) -> Result<()>;

    /// Delete a workload. Idempotent; `NotFound` counts as success.
    async fn delete_workload(&self, key: &WorkloadKey, cancel: &CancellationToken) -> Result<()>;

    /// Last-observed spec of a workload.
    async fn get_workload(&self, key: &WorkloadKey, cancel: &CancellationToken) -> Result<Pod>;

    /// Current observed status of a workload.
    async fn get_workload_status(
        &self,
        key: &WorkloadKey,
        cancel: &CancellationToken,
    ) -> Result<PodStatus>;

    /// All workloads the provider currently owns on this node.
    async fn list_workloads(&self, cancel: &CancellationToken) -> Result<Vec<Pod>>;

    /// A bounded tail of container output.
    async fn get_logs(
        &self,
        key: &WorkloadKey,
        container: &str,
        tail_lines: Option<u32>,
        cancel: &CancellationToken,
    ) -> Result<String>;

    /// Cheap liveness check. Must not do heavy work.
    async fn ping(&self, cancel: &CancellationToken) -> Result<()>;

    /// Static node self-description.
    async fn describe(&self, cancel: &CancellationToken) -> Result<NodeDescription>;

    /// Run a command in a container and collect its output.
    async fn exec_in_container(
        &self,
        key: &WorkloadKey,
        container: &str,
        _command: &[String],
        _cancel: &CancellationToken,
    ) -> Result<ExecOutput> {
        Err(Error::unsupported(format!(
            "exec into {key}/{container} is not supported by this provider"
        )))
    }

    /// Node and pod resource statistics, in the kubelet summary format.
    async fn stats_summary(&self, _cancel: &CancellationToken) -> Result<serde_json::Value> {
        Err(Error::unsupported("stats are not supported by this provider"))
    }

    /// Push notifications of status changes, keyed by workload.
    fn status_notifications(&self) -> Option<broadcast::Receiver<WorkloadKey>> {
        None
    }

    /// Push notifications of node description changes.
    fn node_updates(&self) -> Option<watch::Receiver<NodeDescription>> {
        None
    }
}

/// Everything a provider needs to know about the node it serves.
#[derive(Debug, Clone)]
pub struct ProviderInit {
    pub node_name: String,
    pub operating_system: String,
    pub internal_ip: String,
    pub daemon_port: i32,
    pub config_path: Option<PathBuf>,
}

/// Compiled-in providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// In-memory provider for development and tests.
    Mock,
}

impl ProviderKind {
    pub const ALL: &'static [ProviderKind] = &[ProviderKind::Mock];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Mock => "mock",
        }
    }

    /// Instantiate the provider.
    pub fn build(&self, init: &ProviderInit) -> Result<Arc<dyn Provider>> {
        match self {
            Self::Mock => Ok(Arc::new(MockProvider::from_init(init)?)),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ProviderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| {
                let known: Vec<_> = Self::ALL.iter().map(|k| k.name()).collect();
                Error::invalid_input(format!(
                    "provider {s:?} is not registered (known: {})",
                    known.join(", ")
                ))
            })
    }
}
