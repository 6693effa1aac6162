//! In-memory control plane.
//!
//! Behaves like the API server where the agent depends on it: resource
//! versions advance on every write, stale preconditions fail with
//! `Conflict`, duplicate creates fail with `AlreadyExists`, watches resume
//! from a version and end when expired. Used by tests and by local runs
//! without a cluster.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{
    ConfigMap, Event, Node, NodeStatus, Pod, PodStatus, Secret, Service,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::debug;
use uuid::Uuid;
use vk_errdefs::{Error, ErrorKind, Result};

use super::{merge_status, ControlPlane, PodEvent, PodEventStream, PodList, PodScope};
use crate::workload::WorkloadKey;

/// Pod changes kept for resuming watches.
const EVENT_LOG_CAPACITY: usize = 1024;

/// Control-plane calls, for fault injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Call {
    GetNode,
    CreateNode,
    PatchNodeStatus,
    GetLease,
    CreateLease,
    UpdateLease,
    DeleteLease,
    ListPods,
    WatchPods,
    GetPod,
    PatchPodStatus,
    DeletePod,
    CreateEvent,
    GetConfigMap,
    GetSecret,
    ListServices,
}

struct State {
    revision: u64,
    nodes: HashMap<String, Node>,
    leases: HashMap<(String, String), Lease>,
    pods: BTreeMap<WorkloadKey, Pod>,
    events: Vec<Event>,
    config_maps: HashMap<(String, String), ConfigMap>,
    secrets: HashMap<(String, String), Secret>,
    services: BTreeMap<(String, String), Service>,
    log: VecDeque<(u64, PodEvent)>,
    leases_supported: bool,
    faults: HashMap<Call, VecDeque<ErrorKind>>,
    calls: HashMap<Call, usize>,
}

impl State {
    fn bump(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }

    fn stamp_new(&mut self, meta: &mut ObjectMeta) {
        meta.uid = Some(Uuid::new_v4().to_string());
        meta.creation_timestamp = Some(Time(Utc::now()));
        meta.resource_version = Some(self.bump());
    }

    fn begin(&mut self, call: Call) -> Result<()> {
        *self.calls.entry(call).or_insert(0) += 1;
        match self.faults.get_mut(&call).and_then(VecDeque::pop_front) {
            Some(kind) => Err(Error::new(kind, format!("injected {call:?} failure"))),
            None => Ok(()),
        }
    }

    fn leases_available(&self) -> Result<()> {
        if self.leases_supported {
            Ok(())
        } else {
            Err(Error::not_found(
                "the server could not find the requested resource (leases.coordination.k8s.io)",
            ))
        }
    }
}

fn check_version(kind: &str, name: &str, expected: Option<&str>, current: &ObjectMeta) -> Result<()> {
    match expected {
        Some(expected) if Some(expected) != current.resource_version.as_deref() => {
            Err(Error::conflict(format!(
                "operation cannot be fulfilled on {kind} {name:?}: the object has been modified"
            )))
        }
        _ => Ok(()),
    }
}

fn merged<T>(base: Option<&T>, patch: &T) -> Result<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    let invalid = |e: serde_json::Error| Error::invalid_input("merge status").with_source(e);
    let mut value = match base {
        Some(base) => serde_json::to_value(base).map_err(invalid)?,
        None => serde_json::Value::Object(Default::default()),
    };
    merge_status(&mut value, serde_json::to_value(patch).map_err(invalid)?);
    serde_json::from_value(value).map_err(invalid)
}

/// In-memory control plane.
pub struct InMemoryControlPlane {
    state: Mutex<State>,
    pod_tx: broadcast::Sender<(u64, PodEvent)>,
    watch_epoch: watch::Sender<u64>,
}

impl Default for InMemoryControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryControlPlane {
    pub fn new() -> Self {
        let (pod_tx, _) = broadcast::channel(EVENT_LOG_CAPACITY);
        let (watch_epoch, _) = watch::channel(0);
        Self {
            state: Mutex::new(State {
                revision: 0,
                nodes: HashMap::new(),
                leases: HashMap::new(),
                pods: BTreeMap::new(),
                events: Vec::new(),
                config_maps: HashMap::new(),
                secrets: HashMap::new(),
                services: BTreeMap::new(),
                log: VecDeque::new(),
                leases_supported: true,
                faults: HashMap::new(),
                calls: HashMap::new(),
            }),
            pod_tx,
            watch_epoch,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, state: &mut State, event: PodEvent) {
        let revision = state.revision;
        if state.log.len() == EVENT_LOG_CAPACITY {
            state.log.pop_front();
        }
        state.log.push_back((revision, event.clone()));
        let _ = self.pod_tx.send((revision, event));
    }

    // =========================================================================
    // Test and operator hooks
    // =========================================================================

    /// Fail the next `times` calls of `call` with `kind`.
    pub fn fail_next(&self, call: Call, kind: ErrorKind, times: usize) {
        self.lock()
            .faults
            .entry(call)
            .or_default()
            .extend(std::iter::repeat(kind).take(times));
    }

    /// Number of calls of `call` so far, failed ones included.
    pub fn calls(&self, call: Call) -> usize {
        self.lock().calls.get(&call).copied().unwrap_or(0)
    }

    /// Behave like a server without the coordination API.
    pub fn disable_leases(&self) {
        self.lock().leases_supported = false;
    }

    /// Schedule a pod, as the scheduler would after binding it.
    pub fn submit_pod(&self, mut pod: Pod) -> Result<Pod> {
        let mut state = self.lock();
        pod.metadata
            .namespace
            .get_or_insert_with(|| "default".to_string());
        let key = WorkloadKey::of(&pod);
        if state.pods.contains_key(&key) {
            return Err(Error::already_exists(format!("pod {key}")));
        }
        state.stamp_new(&mut pod.metadata);
        state.pods.insert(key, pod.clone());
        self.publish(&mut state, PodEvent::Added(pod.clone()));
        Ok(pod)
    }

    /// Edit a pod's metadata or spec.
    pub fn update_pod(&self, key: &WorkloadKey, edit: impl FnOnce(&mut Pod)) -> Result<Pod> {
        let mut state = self.lock();
        let revision = state.bump();
        let pod = state
            .pods
            .get_mut(key)
            .ok_or_else(|| Error::not_found(format!("pod {key}")))?;
        edit(pod);
        pod.metadata.resource_version = Some(revision);
        let pod = pod.clone();
        self.publish(&mut state, PodEvent::Modified(pod.clone()));
        Ok(pod)
    }

    fn remove_pod(&self, state: &mut State, key: &WorkloadKey, grace: Option<u32>) -> Result<()> {
        if !state.pods.contains_key(key) {
            return Err(Error::not_found(format!("pod {key}")));
        }
        let revision = state.bump();
        if grace == Some(0) {
            if let Some(mut pod) = state.pods.remove(key) {
                pod.metadata.resource_version = Some(revision);
                self.publish(state, PodEvent::Deleted(pod));
            }
            return Ok(());
        }

        let Some(pod) = state.pods.get_mut(key) else {
            return Ok(());
        };
        if pod.metadata.deletion_timestamp.is_none() {
            pod.metadata.deletion_timestamp = Some(Time(Utc::now()));
            pod.metadata.deletion_grace_period_seconds = Some(i64::from(grace.unwrap_or(30)));
        }
        pod.metadata.resource_version = Some(revision);
        let pod = pod.clone();
        self.publish(state, PodEvent::Modified(pod));
        Ok(())
    }

    /// Start a graceful deletion, as `kubectl delete` would.
    pub fn request_pod_deletion(&self, key: &WorkloadKey) -> Result<()> {
        let mut state = self.lock();
        self.remove_pod(&mut state, key, None)
    }

    /// Delete a node; leases it owns go with it.
    pub fn delete_node(&self, name: &str) -> Option<Node> {
        let mut state = self.lock();
        let node = state.nodes.remove(name)?;
        let uid = node.metadata.uid.clone();
        state.leases.retain(|_, lease| {
            !lease
                .metadata
                .owner_references
                .iter()
                .flatten()
                .any(|owner| owner.kind == "Node" && Some(&owner.uid) == uid.as_ref())
        });
        state.bump();
        Some(node)
    }

    /// Create or replace a config map.
    pub fn put_config_map(&self, mut config_map: ConfigMap) -> Result<ConfigMap> {
        let key = object_key("config map", &config_map.metadata)?;
        let mut state = self.lock();
        state.stamp_new(&mut config_map.metadata);
        state.config_maps.insert(key, config_map.clone());
        Ok(config_map)
    }

    /// Create or replace a secret.
    pub fn put_secret(&self, mut secret: Secret) -> Result<Secret> {
        let key = object_key("secret", &secret.metadata)?;
        let mut state = self.lock();
        state.stamp_new(&mut secret.metadata);
        state.secrets.insert(key, secret.clone());
        Ok(secret)
    }

    /// Create or replace a service.
    pub fn put_service(&self, mut service: Service) -> Result<Service> {
        let key = object_key("service", &service.metadata)?;
        let mut state = self.lock();
        state.stamp_new(&mut service.metadata);
        state.services.insert(key, service.clone());
        Ok(service)
    }

    /// End every open watch, forcing consumers to relist.
    pub fn expire_watches(&self) {
        self.watch_epoch.send_modify(|epoch| *epoch += 1);
    }

    pub fn node(&self, name: &str) -> Option<Node> {
        self.lock().nodes.get(name).cloned()
    }

    pub fn lease(&self, namespace: &str, name: &str) -> Option<Lease> {
        self.lock()
            .leases
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn pod(&self, key: &WorkloadKey) -> Option<Pod> {
        self.lock().pods.get(key).cloned()
    }

    pub fn events(&self) -> Vec<Event> {
        self.lock().events.clone()
    }
}

struct WatchCursor {
    replay: VecDeque<PodEvent>,
    rx: broadcast::Receiver<(u64, PodEvent)>,
    epoch: watch::Receiver<u64>,
    scope: PodScope,
    since: u64,
    done: bool,
}

#[async_trait]
impl ControlPlane for InMemoryControlPlane {
    async fn get_node(&self, name: &str) -> Result<Node> {
        let mut state = self.lock();
        state.begin(Call::GetNode)?;
        state
            .nodes
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("node {name:?}")))
    }

    async fn create_node(&self, node: &Node) -> Result<Node> {
        let mut state = self.lock();
        state.begin(Call::CreateNode)?;
        let name = node
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::invalid_input("node has no name"))?;
        if state.nodes.contains_key(&name) {
            return Err(Error::already_exists(format!("node {name:?}")));
        }
        let mut node = node.clone();
        state.stamp_new(&mut node.metadata);
        state.nodes.insert(name, node.clone());
        Ok(node)
    }

    async fn patch_node_status(
        &self,
        name: &str,
        resource_version: Option<&str>,
        status: &NodeStatus,
    ) -> Result<Node> {
        let mut state = self.lock();
        state.begin(Call::PatchNodeStatus)?;
        let current = state
            .nodes
            .get(name)
            .ok_or_else(|| Error::not_found(format!("node {name:?}")))?;
        check_version("nodes", name, resource_version, &current.metadata)?;
        let merged = merged(current.status.as_ref(), status)?;

        let revision = state.bump();
        let node = state
            .nodes
            .get_mut(name)
            .ok_or_else(|| Error::not_found(format!("node {name:?}")))?;
        node.status = Some(merged);
        node.metadata.resource_version = Some(revision);
        Ok(node.clone())
    }

    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Lease> {
        let mut state = self.lock();
        state.begin(Call::GetLease)?;
        state.leases_available()?;
        state
            .leases
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| Error::not_found(format!("lease {namespace}/{name}")))
    }

    async fn create_lease(&self, lease: &Lease) -> Result<Lease> {
        let mut state = self.lock();
        state.begin(Call::CreateLease)?;
        state.leases_available()?;
        let key = lease_key(lease)?;
        if state.leases.contains_key(&key) {
            return Err(Error::already_exists(format!("lease {}/{}", key.0, key.1)));
        }
        let mut lease = lease.clone();
        state.stamp_new(&mut lease.metadata);
        state.leases.insert(key, lease.clone());
        Ok(lease)
    }

    async fn update_lease(&self, lease: &Lease) -> Result<Lease> {
        let mut state = self.lock();
        state.begin(Call::UpdateLease)?;
        state.leases_available()?;
        let key = lease_key(lease)?;
        let current = state
            .leases
            .get(&key)
            .ok_or_else(|| Error::not_found(format!("lease {}/{}", key.0, key.1)))?;
        check_version(
            "leases",
            &key.1,
            lease.metadata.resource_version.as_deref(),
            &current.metadata,
        )?;

        let mut updated = lease.clone();
        updated.metadata.uid = current.metadata.uid.clone();
        updated.metadata.creation_timestamp = current.metadata.creation_timestamp.clone();
        updated.metadata.resource_version = Some(state.bump());
        state.leases.insert(key, updated.clone());
        Ok(updated)
    }

    async fn delete_lease(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.lock();
        state.begin(Call::DeleteLease)?;
        state.leases_available()?;
        state
            .leases
            .remove(&(namespace.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| Error::not_found(format!("lease {namespace}/{name}")))
    }

    async fn list_pods(&self, scope: &PodScope) -> Result<PodList> {
        let mut state = self.lock();
        state.begin(Call::ListPods)?;
        Ok(PodList {
            items: state
                .pods
                .values()
                .filter(|pod| scope.contains(pod))
                .cloned()
                .collect(),
            resource_version: state.revision.to_string(),
        })
    }

    async fn watch_pods(
        &self,
        scope: &PodScope,
        resource_version: &str,
    ) -> Result<PodEventStream> {
        let mut state = self.lock();
        state.begin(Call::WatchPods)?;
        let since: u64 = resource_version.parse().map_err(|_| {
            Error::invalid_input(format!("resource version {resource_version:?} is not valid"))
        })?;

        // Subscribing under the lock keeps replay and live events contiguous.
        let rx = self.pod_tx.subscribe();
        let oldest = state.log.front().map(|(rev, _)| *rev);
        if let Some(oldest) = oldest {
            if since.saturating_add(1) < oldest {
                return Err(Error::transient(format!(
                    "resource version {since} is too old"
                )));
            }
        }
        let replay: VecDeque<PodEvent> = state
            .log
            .iter()
            .filter(|(rev, event)| *rev > since && scope.contains(event.pod()))
            .map(|(_, event)| event.clone())
            .collect();
        let since = state.revision.max(since);
        drop(state);

        debug!(since, replay = replay.len(), "Opened pod watch");
        let cursor = WatchCursor {
            replay,
            rx,
            epoch: self.watch_epoch.subscribe(),
            scope: scope.clone(),
            since,
            done: false,
        };

        let stream = stream::unfold(cursor, |mut cursor| async move {
            if cursor.done {
                return None;
            }
            if let Some(event) = cursor.replay.pop_front() {
                return Some((Ok(event), cursor));
            }
            loop {
                tokio::select! {
                    _ = cursor.epoch.changed() => return None,
                    received = cursor.rx.recv() => match received {
                        Ok((rev, event)) => {
                            if rev <= cursor.since || !cursor.scope.contains(event.pod()) {
                                continue;
                            }
                            cursor.since = rev;
                            return Some((Ok(event), cursor));
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            cursor.done = true;
                            let err = Error::transient(format!("watch fell behind by {missed} events"));
                            return Some((Err(err), cursor));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    },
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn get_pod(&self, key: &WorkloadKey) -> Result<Pod> {
        let mut state = self.lock();
        state.begin(Call::GetPod)?;
        state
            .pods
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("pod {key}")))
    }

    async fn patch_pod_status(
        &self,
        key: &WorkloadKey,
        resource_version: Option<&str>,
        status: &PodStatus,
    ) -> Result<Pod> {
        let mut state = self.lock();
        state.begin(Call::PatchPodStatus)?;
        let current = state
            .pods
            .get(key)
            .ok_or_else(|| Error::not_found(format!("pod {key}")))?;
        check_version("pods", &key.name, resource_version, &current.metadata)?;
        let merged = merged(current.status.as_ref(), status)?;

        let revision = state.bump();
        let pod = state
            .pods
            .get_mut(key)
            .ok_or_else(|| Error::not_found(format!("pod {key}")))?;
        pod.status = Some(merged);
        pod.metadata.resource_version = Some(revision);
        let pod = pod.clone();
        self.publish(&mut state, PodEvent::Modified(pod.clone()));
        Ok(pod)
    }

    async fn delete_pod(&self, key: &WorkloadKey, grace_period_seconds: Option<u32>) -> Result<()> {
        let mut state = self.lock();
        state.begin(Call::DeletePod)?;
        self.remove_pod(&mut state, key, grace_period_seconds)
    }

    async fn create_event(&self, event: &Event) -> Result<()> {
        let mut state = self.lock();
        state.begin(Call::CreateEvent)?;
        let mut event = event.clone();
        state.stamp_new(&mut event.metadata);
        state.events.push(event);
        Ok(())
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap> {
        let mut state = self.lock();
        state.begin(Call::GetConfigMap)?;
        state
            .config_maps
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| Error::not_found(format!("configmap {namespace}/{name}")))
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret> {
        let mut state = self.lock();
        state.begin(Call::GetSecret)?;
        state
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| Error::not_found(format!("secret {namespace}/{name}")))
    }

    async fn list_services(&self, namespace: &str) -> Result<Vec<Service>> {
        let mut state = self.lock();
        state.begin(Call::ListServices)?;
        Ok(state
            .services
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, service)| service.clone())
            .collect())
    }
}

fn lease_key(lease: &Lease) -> Result<(String, String)> {
    object_key("lease", &lease.metadata)
}

fn object_key(kind: &str, meta: &ObjectMeta) -> Result<(String, String)> {
    match (&meta.namespace, &meta.name) {
        (Some(ns), Some(name)) => Ok((ns.clone(), name.clone())),
        _ => Err(Error::invalid_input(format!("{kind} needs a namespace and a name"))),
    }
}
