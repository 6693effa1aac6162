//! In-memory provider for development and testing.
//!
//! Workloads "run" as soon as they are created. Every call is recorded, and
//! failures can be scripted per operation so tests can drive the agent
//! through its recovery paths.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateRunning, ContainerStatus, NodeAddress, NodeCondition, Pod,
    PodCondition, PodStatus,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use serde::Deserialize;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use vk_errdefs::{Error, ErrorKind, Result};

use super::{ExecOutput, NodeDescription, Provider, ProviderInit};
use crate::workload::WorkloadKey;

const MOCK_HOST_IP: &str = "1.2.3.4";
const MOCK_POD_IP: &str = "5.6.7.8";

// =============================================================================
// Configuration
// =============================================================================

/// Per-node capacity, loaded from a JSON file keyed by node name.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct MockConfig {
    #[serde(default = "default_cpu")]
    pub cpu: String,

    #[serde(default = "default_memory")]
    pub memory: String,

    #[serde(default = "default_pods")]
    pub pods: String,

    /// Extra resources, e.g. `nvidia.com/gpu`.
    #[serde(default)]
    pub others: BTreeMap<String, String>,
}

fn default_cpu() -> String {
    "20".to_string()
}

fn default_memory() -> String {
    "100Gi".to_string()
}

fn default_pods() -> String {
    "20".to_string()
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            cpu: default_cpu(),
            memory: default_memory(),
            pods: default_pods(),
            others: BTreeMap::new(),
        }
    }
}

impl MockConfig {
    /// Load the entry for `node_name`; nodes without an entry get defaults.
    pub fn load(path: &Path, node_name: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| {
                Error::invalid_input(format!("read provider config {}", path.display()))
                    .with_source(e)
            })?;
        let mut nodes: HashMap<String, MockConfig> = serde_json::from_str(&raw).map_err(|e| {
            Error::invalid_input(format!("parse provider config {}", path.display()))
                .with_source(e)
        })?;
        let config = nodes.remove(node_name).unwrap_or_default();
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for (name, value) in [("cpu", &self.cpu), ("memory", &self.memory), ("pods", &self.pods)]
            .into_iter()
            .chain(self.others.iter().map(|(k, v)| (k.as_str(), v)))
        {
            if !is_quantity(value) {
                return Err(Error::invalid_input(format!(
                    "resource {name} has invalid quantity {value:?}"
                )));
            }
        }
        Ok(())
    }

    fn resources(&self) -> BTreeMap<String, Quantity> {
        let mut resources = BTreeMap::from([
            ("cpu".to_string(), Quantity(self.cpu.clone())),
            ("memory".to_string(), Quantity(self.memory.clone())),
            ("pods".to_string(), Quantity(self.pods.clone())),
        ]);
        for (name, value) in &self.others {
            resources.insert(name.clone(), Quantity(value.clone()));
        }
        resources
    }
}

/// Accepts the decimal forms of a resource quantity: `20`, `0.5`, `500m`,
/// `100Gi`, `1e3`.
fn is_quantity(s: &str) -> bool {
    let s = s.strip_prefix(['+', '-']).unwrap_or(s);
    let digits_end = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(digits_end);
    if number.is_empty() || number == "." || number.matches('.').count() > 1 {
        return false;
    }
    match suffix {
        "" | "n" | "u" | "m" | "k" | "M" | "G" | "T" | "P" | "E" => true,
        "Ki" | "Mi" | "Gi" | "Ti" | "Pi" | "Ei" => true,
        exp => {
            let exp = exp
                .strip_prefix(['e', 'E'])
                .map(|e| e.strip_prefix(['+', '-']).unwrap_or(e));
            matches!(exp, Some(e) if !e.is_empty() && e.chars().all(|c| c.is_ascii_digit()))
        }
    }
}

// =============================================================================
// Call log and fault injection
// =============================================================================

/// Provider operations, as recorded in the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Update,
    Delete,
    Get,
    GetStatus,
    List,
    Logs,
    Exec,
    Ping,
    Describe,
}

/// One recorded provider call.
#[derive(Debug, Clone)]
pub struct ProviderCall {
    pub operation: Operation,
    pub key: Option<WorkloadKey>,
    pub at: Instant,
}

#[derive(Default)]
struct Faults {
    scripted: HashMap<Operation, VecDeque<ErrorKind>>,
    ping_stall: Option<Duration>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// Provider
// =============================================================================

/// Mock provider.
pub struct MockProvider {
    node_name: String,

    /// Current description; subscribers see updates.
    description: watch::Sender<NodeDescription>,

    /// Workloads by key, status embedded.
    workloads: RwLock<HashMap<WorkloadKey, Pod>>,

    faults: Mutex<Faults>,

    calls: Mutex<Vec<ProviderCall>>,

    status_tx: broadcast::Sender<WorkloadKey>,
}

impl MockProvider {
    /// Create a mock provider with default capacity.
    pub fn new(node_name: &str, operating_system: &str, internal_ip: &str, daemon_port: i32) -> Self {
        Self::with_config(
            node_name,
            operating_system,
            internal_ip,
            daemon_port,
            MockConfig::default(),
        )
    }

    pub fn with_config(
        node_name: &str,
        operating_system: &str,
        internal_ip: &str,
        daemon_port: i32,
        config: MockConfig,
    ) -> Self {
        let resources = config.resources();
        let description = NodeDescription {
            operating_system: operating_system.to_string(),
            architecture: "amd64".to_string(),
            capacity: resources.clone(),
            allocatable: resources,
            conditions: node_conditions(),
            addresses: vec![NodeAddress {
                type_: "InternalIP".to_string(),
                address: internal_ip.to_string(),
            }],
            daemon_port,
        };
        let (description, _) = watch::channel(description);
        let (status_tx, _) = broadcast::channel(256);

        Self {
            node_name: node_name.to_string(),
            description,
            workloads: RwLock::new(HashMap::new()),
            faults: Mutex::new(Faults::default()),
            calls: Mutex::new(Vec::new()),
            status_tx,
        }
    }

    pub fn from_init(init: &ProviderInit) -> Result<Self> {
        let config = match &init.config_path {
            Some(path) => MockConfig::load(path, &init.node_name)?,
            None => MockConfig::default(),
        };
        Ok(Self::with_config(
            &init.node_name,
            &init.operating_system,
            &init.internal_ip,
            init.daemon_port,
            config,
        ))
    }

    /// Fail the next `times` calls of `operation` with `kind`.
    pub fn fail_next(&self, operation: Operation, kind: ErrorKind, times: usize) {
        let mut faults = lock(&self.faults);
        let queue = faults.scripted.entry(operation).or_default();
        queue.extend(std::iter::repeat(kind).take(times));
    }

    /// Make every ping block for `stall` before answering.
    pub fn stall_ping(&self, stall: Option<Duration>) {
        lock(&self.faults).ping_stall = stall;
    }

    /// Snapshot of the call log.
    pub fn calls(&self) -> Vec<ProviderCall> {
        lock(&self.calls).clone()
    }

    /// Calls of `operation` against `key`.
    pub fn calls_for(&self, operation: Operation, key: &WorkloadKey) -> Vec<ProviderCall> {
        lock(&self.calls)
            .iter()
            .filter(|c| c.operation == operation && c.key.as_ref() == Some(key))
            .cloned()
            .collect()
    }

    pub fn count(&self, operation: Operation) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    /// Overwrite a workload's status and notify subscribers.
    pub async fn set_workload_status(&self, key: &WorkloadKey, status: PodStatus) -> Result<()> {
        let mut workloads = self.workloads.write().await;
        let pod = workloads
            .get_mut(key)
            .ok_or_else(|| Error::not_found(format!("workload {key}")))?;
        pod.status = Some(status);
        drop(workloads);
        let _ = self.status_tx.send(key.clone());
        Ok(())
    }

    /// Drop a workload without going through the agent.
    pub async fn forget_workload(&self, key: &WorkloadKey) -> bool {
        self.workloads.write().await.remove(key).is_some()
    }

    /// Change a resource and publish the new description.
    pub fn set_capacity(&self, resource: &str, quantity: &str) {
        self.description.send_modify(|d| {
            d.capacity
                .insert(resource.to_string(), Quantity(quantity.to_string()));
            d.allocatable
                .insert(resource.to_string(), Quantity(quantity.to_string()));
        });
    }

    fn record(&self, operation: Operation, key: Option<&WorkloadKey>) {
        lock(&self.calls).push(ProviderCall {
            operation,
            key: key.cloned(),
            at: Instant::now(),
        });
    }

    fn injected(&self, operation: Operation) -> Result<()> {
        let kind = lock(&self.faults)
            .scripted
            .get_mut(&operation)
            .and_then(VecDeque::pop_front);
        match kind {
            Some(kind) => Err(Error::new(kind, format!("injected {operation:?} failure"))),
            None => Ok(()),
        }
    }

    fn begin(
        &self,
        operation: Operation,
        key: Option<&WorkloadKey>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.record(operation, key);
        if cancel.is_cancelled() {
            return Err(Error::cancelled());
        }
        self.injected(operation)
    }
}

fn node_conditions() -> Vec<NodeCondition> {
    let now = Time(Utc::now());
    [
        ("Ready", "True", "KubeletReady", "kubelet is ready."),
        (
            "MemoryPressure",
            "False",
            "KubeletHasSufficientMemory",
            "kubelet has sufficient memory available",
        ),
        (
            "DiskPressure",
            "False",
            "KubeletHasNoDiskPressure",
            "kubelet has no disk pressure",
        ),
        (
            "PIDPressure",
            "False",
            "KubeletHasSufficientPID",
            "kubelet has sufficient PID available",
        ),
        (
            "NetworkUnavailable",
            "False",
            "RouteCreated",
            "RouteController created a route",
        ),
    ]
    .into_iter()
    .map(|(type_, status, reason, message)| NodeCondition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        last_heartbeat_time: Some(now.clone()),
        last_transition_time: Some(now.clone()),
    })
    .collect()
}

fn running_status(pod: &Pod) -> PodStatus {
    let now = Time(Utc::now());
    let condition = |type_: &str| PodCondition {
        type_: type_.to_string(),
        status: "True".to_string(),
        last_transition_time: Some(now.clone()),
        ..Default::default()
    };
    let container_statuses = pod
        .spec
        .iter()
        .flat_map(|spec| spec.containers.iter())
        .map(|container| ContainerStatus {
            name: container.name.clone(),
            image: container.image.clone().unwrap_or_default(),
            ready: true,
            restart_count: 0,
            started: Some(true),
            state: Some(ContainerState {
                running: Some(ContainerStateRunning {
                    started_at: Some(now.clone()),
                }),
                ..Default::default()
            }),
            ..Default::default()
        })
        .collect();

    PodStatus {
        phase: Some("Running".to_string()),
        host_ip: Some(MOCK_HOST_IP.to_string()),
        pod_ip: Some(MOCK_POD_IP.to_string()),
        start_time: Some(now.clone()),
        conditions: Some(vec![
            condition("Initialized"),
            condition("Ready"),
            condition("PodScheduled"),
        ]),
        container_statuses: Some(container_statuses),
        ..Default::default()
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn create_workload(&self, pod: &Pod, cancel: &CancellationToken) -> Result<()> {
        let key = WorkloadKey::of(pod);
        self.begin(Operation::Create, Some(&key), cancel)?;

        let mut workloads = self.workloads.write().await;
        if let Some(existing) = workloads.get(&key) {
            if existing.metadata.uid == pod.metadata.uid {
                debug!(key = %key, "[MOCK] Workload already exists");
                return Ok(());
            }
        }

        info!(key = %key, node = %self.node_name, "[MOCK] Creating workload");
        let mut stored = pod.clone();
        stored.status = Some(running_status(pod));
        workloads.insert(key.clone(), stored);
        drop(workloads);

        let _ = self.status_tx.send(key);
        Ok(())
    }

    async fn update_workload(&self, pod: &Pod, cancel: &CancellationToken) -> Result<()> {
        let key = WorkloadKey::of(pod);
        self.begin(Operation::Update, Some(&key), cancel)?;

        let mut workloads = self.workloads.write().await;
        let existing = workloads
            .get_mut(&key)
            .ok_or_else(|| Error::not_found(format!("workload {key}")))?;

        info!(key = %key, "[MOCK] Updating workload");
        let status = existing.status.take();
        *existing = pod.clone();
        existing.status = status;
        Ok(())
    }

    async fn delete_workload(&self, key: &WorkloadKey, cancel: &CancellationToken) -> Result<()> {
        self.begin(Operation::Delete, Some(key), cancel)?;

        if self.workloads.write().await.remove(key).is_none() {
            return Err(Error::not_found(format!("workload {key}")));
        }
        info!(key = %key, "[MOCK] Deleted workload");
        let _ = self.status_tx.send(key.clone());
        Ok(())
    }

    async fn get_workload(&self, key: &WorkloadKey, cancel: &CancellationToken) -> Result<Pod> {
        self.begin(Operation::Get, Some(key), cancel)?;
        self.workloads
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("workload {key}")))
    }

    async fn get_workload_status(
        &self,
        key: &WorkloadKey,
        cancel: &CancellationToken,
    ) -> Result<PodStatus> {
        self.begin(Operation::GetStatus, Some(key), cancel)?;
        self.workloads
            .read()
            .await
            .get(key)
            .map(|pod| pod.status.clone().unwrap_or_default())
            .ok_or_else(|| Error::not_found(format!("workload {key}")))
    }

    async fn list_workloads(&self, cancel: &CancellationToken) -> Result<Vec<Pod>> {
        self.begin(Operation::List, None, cancel)?;
        Ok(self.workloads.read().await.values().cloned().collect())
    }

    async fn get_logs(
        &self,
        key: &WorkloadKey,
        container: &str,
        tail_lines: Option<u32>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        self.begin(Operation::Logs, Some(key), cancel)?;
        let workloads = self.workloads.read().await;
        let pod = workloads
            .get(key)
            .ok_or_else(|| Error::not_found(format!("workload {key}")))?;
        let known = pod
            .spec
            .iter()
            .flat_map(|s| s.containers.iter())
            .any(|c| c.name == container);
        if !known {
            return Err(Error::not_found(format!("container {container} in {key}")));
        }

        let lines: Vec<String> = (1..=10).map(|i| format!("{container}: log line {i}")).collect();
        let skip = tail_lines.map_or(0, |tail| lines.len().saturating_sub(tail as usize));
        Ok(lines[skip..].iter().map(|l| format!("{l}\n")).collect())
    }

    async fn ping(&self, cancel: &CancellationToken) -> Result<()> {
        self.record(Operation::Ping, None);
        let stall = lock(&self.faults).ping_stall;
        if let Some(stall) = stall {
            tokio::select! {
                _ = tokio::time::sleep(stall) => {}
                _ = cancel.cancelled() => return Err(Error::cancelled()),
            }
        }
        if cancel.is_cancelled() {
            return Err(Error::cancelled());
        }
        self.injected(Operation::Ping)
    }

    async fn describe(&self, cancel: &CancellationToken) -> Result<NodeDescription> {
        self.begin(Operation::Describe, None, cancel)?;
        Ok(self.description.borrow().clone())
    }

    async fn exec_in_container(
        &self,
        key: &WorkloadKey,
        container: &str,
        command: &[String],
        cancel: &CancellationToken,
    ) -> Result<ExecOutput> {
        self.begin(Operation::Exec, Some(key), cancel)?;
        if !self.workloads.read().await.contains_key(key) {
            return Err(Error::not_found(format!("workload {key}")));
        }
        info!(key = %key, container, command = ?command, "[MOCK] Exec in container");
        Ok(ExecOutput {
            stdout: format!("{}\n", command.join(" ")),
            stderr: String::new(),
            exit_code: 0,
        })
    }

    async fn stats_summary(&self, cancel: &CancellationToken) -> Result<serde_json::Value> {
        if cancel.is_cancelled() {
            return Err(Error::cancelled());
        }
        let workloads = self.workloads.read().await;
        let pods: Vec<_> = workloads
            .values()
            .map(|pod| {
                let containers: Vec<_> = pod
                    .spec
                    .iter()
                    .flat_map(|s| s.containers.iter())
                    .map(|c| serde_json::json!({ "name": c.name }))
                    .collect();
                serde_json::json!({
                    "podRef": {
                        "namespace": pod.metadata.namespace,
                        "name": pod.metadata.name,
                        "uid": pod.metadata.uid,
                    },
                    "containers": containers,
                })
            })
            .collect();
        Ok(serde_json::json!({
            "node": { "nodeName": self.node_name },
            "pods": pods,
        }))
    }

    fn status_notifications(&self) -> Option<broadcast::Receiver<WorkloadKey>> {
        Some(self.status_tx.subscribe())
    }

    fn node_updates(&self) -> Option<watch::Receiver<NodeDescription>> {
        Some(self.description.subscribe())
    }
}
