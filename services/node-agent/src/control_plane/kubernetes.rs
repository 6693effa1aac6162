//! Control plane backed by a real API server.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{
    ConfigMap, Event, Node, NodeStatus, Pod, PodStatus, Secret, Service,
};
use kube::api::{
    Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, WatchEvent, WatchParams,
};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::ErrorResponse;
use kube::{Client, Config};
use serde_json::json;
use tokio::sync::{mpsc, Semaphore};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};
use vk_errdefs::{Error, ErrorKind, Result};

use super::{ControlPlane, PodEvent, PodEventStream, PodList, PodScope};
use crate::workload::WorkloadKey;

/// Server-side watch timeout; the stream ends and the reflector resumes.
const WATCH_TIMEOUT_SECS: u32 = 290;

/// Delay suggested to callers after a 429.
const THROTTLE_RETRY_AFTER: Duration = Duration::from_secs(1);

/// API-server client with bounded concurrency and per-call timeouts.
#[derive(Clone)]
pub struct KubeControlPlane {
    client: Client,
    inflight: Arc<Semaphore>,
    request_timeout: Duration,
}

impl KubeControlPlane {
    pub fn new(client: Client, max_inflight: usize, request_timeout: Duration) -> Self {
        Self {
            client,
            inflight: Arc::new(Semaphore::new(max_inflight.max(1))),
            request_timeout,
        }
    }

    /// Connect using an explicit kubeconfig, or the in-cluster / default
    /// configuration when none is given.
    pub async fn connect(
        kubeconfig: Option<&Path>,
        max_inflight: usize,
        request_timeout: Duration,
    ) -> Result<Self> {
        let config = match kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    Error::invalid_input(format!("read kubeconfig {}", path.display()))
                        .with_source(e)
                })?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| Error::invalid_input("load kubeconfig").with_source(e))?
            }
            None => Config::infer()
                .await
                .map_err(|e| Error::invalid_input("infer cluster configuration").with_source(e))?,
        };
        info!(cluster_url = %config.cluster_url, "Connecting to API server");

        let client = Client::try_from(config)
            .map_err(|e| Error::invalid_input("build API client").with_source(e))?;
        Ok(Self::new(client, max_inflight, request_timeout))
    }

    /// Run one request under the in-flight limit and the request timeout.
    async fn call<T, F>(&self, what: &str, request: F) -> Result<T>
    where
        F: Future<Output = kube::Result<T>>,
    {
        let _permit = self
            .inflight
            .acquire()
            .await
            .map_err(|_| Error::cancelled())?;
        match tokio::time::timeout(self.request_timeout, request).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(classify(what, e)),
            Err(_) => Err(Error::wrap(Error::timeout(self.request_timeout), what)),
        }
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    fn leases(&self, namespace: &str) -> Api<Lease> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn scoped_pods(&self, scope: &PodScope) -> Api<Pod> {
        match &scope.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

/// Map a client error onto the error taxonomy.
fn classify(what: &str, err: kube::Error) -> Error {
    let tagged = match &err {
        kube::Error::Api(response) => classify_response(response),
        kube::Error::SerdeError(_) => Error::invalid_input("malformed response"),
        kube::Error::Auth(_) => Error::unauthorized("authentication failed"),
        _ => Error::transient("request failed"),
    };
    Error::wrap(tagged.with_source(err), what)
}

fn classify_response(response: &ErrorResponse) -> Error {
    let message = response.message.clone();
    match response.code {
        400 | 422 => Error::invalid_input(message),
        401 => Error::unauthorized(message),
        403 => Error::forbidden(message),
        404 => Error::not_found(message),
        405 | 501 => Error::unsupported(message),
        409 if response.reason == "AlreadyExists" => Error::already_exists(message),
        409 => Error::conflict(message),
        429 => Error::transient(message).with_retry_after(THROTTLE_RETRY_AFTER),
        504 => Error::new(ErrorKind::Timeout, message),
        _ => Error::transient(message),
    }
}

fn object_namespace(namespace: &Option<String>) -> Result<&str> {
    namespace
        .as_deref()
        .ok_or_else(|| Error::invalid_input("object has no namespace"))
}

fn object_name(name: &Option<String>) -> Result<&str> {
    name.as_deref()
        .ok_or_else(|| Error::invalid_input("object has no name"))
}

#[async_trait]
impl ControlPlane for KubeControlPlane {
    async fn get_node(&self, name: &str) -> Result<Node> {
        self.call("get node", self.nodes().get(name)).await
    }

    async fn create_node(&self, node: &Node) -> Result<Node> {
        self.call("create node", self.nodes().create(&PostParams::default(), node))
            .await
    }

    async fn patch_node_status(
        &self,
        name: &str,
        resource_version: Option<&str>,
        status: &NodeStatus,
    ) -> Result<Node> {
        let patch = status_patch(resource_version, status)?;
        let nodes = self.nodes();
        self.call(
            "patch node status",
            nodes.patch_status(name, &PatchParams::default(), &Patch::Strategic(patch)),
        )
        .await
    }

    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Lease> {
        self.call("get lease", self.leases(namespace).get(name)).await
    }

    async fn create_lease(&self, lease: &Lease) -> Result<Lease> {
        let leases = self.leases(object_namespace(&lease.metadata.namespace)?);
        self.call("create lease", leases.create(&PostParams::default(), lease))
            .await
    }

    async fn update_lease(&self, lease: &Lease) -> Result<Lease> {
        let leases = self.leases(object_namespace(&lease.metadata.namespace)?);
        let name = object_name(&lease.metadata.name)?;
        self.call(
            "update lease",
            leases.replace(name, &PostParams::default(), lease),
        )
        .await
    }

    async fn delete_lease(&self, namespace: &str, name: &str) -> Result<()> {
        let leases = self.leases(namespace);
        self.call("delete lease", leases.delete(name, &DeleteParams::default()))
            .await
            .map(|_| ())
    }

    async fn list_pods(&self, scope: &PodScope) -> Result<PodList> {
        let params = ListParams::default().fields(&scope.field_selector());
        let list = self
            .call("list pods", self.scoped_pods(scope).list(&params))
            .await?;
        Ok(PodList {
            resource_version: list.metadata.resource_version.unwrap_or_default(),
            items: list.items,
        })
    }

    async fn watch_pods(
        &self,
        scope: &PodScope,
        resource_version: &str,
    ) -> Result<PodEventStream> {
        let pods = self.scoped_pods(scope);
        let params = WatchParams::default()
            .fields(&scope.field_selector())
            .timeout(WATCH_TIMEOUT_SECS);
        let resource_version = resource_version.to_string();
        let (tx, rx) = mpsc::channel(64);

        // The watch stream borrows its `Api`; a task owns both and forwards.
        tokio::spawn(async move {
            let stream = match pods.watch(&params, &resource_version).await {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = tx.send(Err(classify("watch pods", e))).await;
                    return;
                }
            };
            debug!(resource_version = %resource_version, "Opened pod watch");
            futures_util::pin_mut!(stream);

            loop {
                let item = tokio::select! {
                    _ = tx.closed() => break,
                    item = stream.next() => match item {
                        Some(item) => item,
                        None => break,
                    },
                };
                let event = match item {
                    Ok(WatchEvent::Added(pod)) => Ok(PodEvent::Added(pod)),
                    Ok(WatchEvent::Modified(pod)) => Ok(PodEvent::Modified(pod)),
                    Ok(WatchEvent::Deleted(pod)) => Ok(PodEvent::Deleted(pod)),
                    Ok(WatchEvent::Bookmark(_)) => continue,
                    Ok(WatchEvent::Error(response)) => {
                        Err(Error::wrap(classify_response(&response), "watch pods"))
                    }
                    Err(e) => Err(classify("watch pods", e)),
                };
                let failed = event.is_err();
                if tx.send(event).await.is_err() || failed {
                    break;
                }
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn get_pod(&self, key: &WorkloadKey) -> Result<Pod> {
        self.call("get pod", self.pods(&key.namespace).get(&key.name))
            .await
    }

    async fn patch_pod_status(
        &self,
        key: &WorkloadKey,
        resource_version: Option<&str>,
        status: &PodStatus,
    ) -> Result<Pod> {
        let patch = status_patch(resource_version, status)?;
        let pods = self.pods(&key.namespace);
        self.call(
            "patch pod status",
            pods.patch_status(&key.name, &PatchParams::default(), &Patch::Strategic(patch)),
        )
        .await
    }

    async fn delete_pod(&self, key: &WorkloadKey, grace_period_seconds: Option<u32>) -> Result<()> {
        let params = DeleteParams {
            grace_period_seconds,
            ..DeleteParams::default()
        };
        let pods = self.pods(&key.namespace);
        self.call("delete pod", pods.delete(&key.name, &params))
            .await
            .map(|_| ())
    }

    async fn create_event(&self, event: &Event) -> Result<()> {
        let namespace = event.metadata.namespace.as_deref().unwrap_or("default");
        let events: Api<Event> = Api::namespaced(self.client.clone(), namespace);
        self.call("create event", events.create(&PostParams::default(), event))
            .await
            .map(|_| ())
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap> {
        let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        self.call("get configmap", config_maps.get(name)).await
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        self.call("get secret", secrets.get(name)).await
    }

    async fn list_services(&self, namespace: &str) -> Result<Vec<Service>> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let list = self
            .call("list services", services.list(&ListParams::default()))
            .await?;
        Ok(list.items)
    }
}

fn status_patch<T: serde::Serialize>(
    resource_version: Option<&str>,
    status: &T,
) -> Result<serde_json::Value> {
    let status = serde_json::to_value(status)
        .map_err(|e| Error::invalid_input("encode status").with_source(e))?;
    Ok(match resource_version {
        Some(rv) => json!({ "metadata": { "resourceVersion": rv }, "status": status }),
        None => json!({ "status": status }),
    })
}
