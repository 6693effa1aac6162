//! Workload reflector.
//!
//! Keeps an eventually consistent cache of the pods assigned to this node:
//! list, then watch from the list's resource version; when the watch ends,
//! relist, diff against the cache and resume. Every change that matters to
//! the reconciler enqueues the pod's key.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vk_errdefs::Result;
use vk_reconcile::{BackoffPolicy, WorkQueue};

use crate::control_plane::{ControlPlane, PodEvent, PodScope};
use crate::workload::{should_enqueue, WorkloadKey};

/// Read-mostly cache of pods assigned to this node.
#[derive(Clone, Default)]
pub struct PodStore {
    pods: Arc<RwLock<HashMap<WorkloadKey, Pod>>>,
}

impl PodStore {
    pub async fn get(&self, key: &WorkloadKey) -> Option<Pod> {
        self.pods.read().await.get(key).cloned()
    }

    pub async fn contains(&self, key: &WorkloadKey) -> bool {
        self.pods.read().await.contains_key(key)
    }

    pub async fn keys(&self) -> Vec<WorkloadKey> {
        self.pods.read().await.keys().cloned().collect()
    }

    /// All cached pods, sorted by key.
    pub async fn list(&self) -> Vec<Pod> {
        let pods = self.pods.read().await;
        let mut keyed: Vec<_> = pods.iter().collect();
        keyed.sort_by(|a, b| a.0.cmp(b.0));
        keyed.into_iter().map(|(_, pod)| pod.clone()).collect()
    }

    pub async fn len(&self) -> usize {
        self.pods.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// List-and-watch loop feeding [`PodStore`] and the reconcile queue.
pub struct Reflector {
    control_plane: Arc<dyn ControlPlane>,
    scope: PodScope,
    store: PodStore,
    queue: Arc<WorkQueue<WorkloadKey>>,
    synced: watch::Sender<bool>,
    resync_interval: Duration,
    backoff: BackoffPolicy,
}

impl Reflector {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        scope: PodScope,
        queue: Arc<WorkQueue<WorkloadKey>>,
        resync_interval: Duration,
    ) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            control_plane,
            scope,
            store: PodStore::default(),
            queue,
            synced,
            resync_interval,
            backoff: BackoffPolicy::new(Duration::from_millis(200), Duration::from_secs(30))
                .with_jitter(0.2),
        }
    }

    pub fn store(&self) -> PodStore {
        self.store.clone()
    }

    /// Whether the initial list has completed.
    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    pub fn subscribe_synced(&self) -> watch::Receiver<bool> {
        self.synced.subscribe()
    }

    /// List pods in scope, replace the cache and enqueue what changed.
    /// With `enqueue_all`, every key is enqueued. Returns the version to
    /// watch from.
    pub async fn relist(&self, enqueue_all: bool) -> Result<String> {
        let list = self.control_plane.list_pods(&self.scope).await?;
        let fresh: HashMap<WorkloadKey, Pod> = list
            .items
            .into_iter()
            .map(|pod| (WorkloadKey::of(&pod), pod))
            .collect();

        let mut changed = Vec::new();
        {
            let mut pods = self.store.pods.write().await;
            for (key, pod) in &fresh {
                let differs = match pods.get(key) {
                    Some(old) => should_enqueue(old, pod),
                    None => true,
                };
                if enqueue_all || differs {
                    changed.push(key.clone());
                }
            }
            changed.extend(pods.keys().filter(|k| !fresh.contains_key(*k)).cloned());
            *pods = fresh;
        }

        debug!(
            resource_version = %list.resource_version,
            changed = changed.len(),
            "Relisted pods"
        );
        for key in changed {
            self.queue.add(key);
        }
        self.synced.send_if_modified(|synced| !std::mem::replace(synced, true));
        Ok(list.resource_version)
    }

    /// Apply one watch event to the cache.
    pub async fn apply(&self, event: PodEvent) {
        let mut pods = self.store.pods.write().await;
        let (key, enqueue) = match event {
            PodEvent::Added(pod) | PodEvent::Modified(pod) => {
                let key = WorkloadKey::of(&pod);
                let enqueue = match pods.insert(key.clone(), pod) {
                    Some(old) => should_enqueue(&old, &pods[&key]),
                    None => true,
                };
                (key, enqueue)
            }
            PodEvent::Deleted(pod) => {
                let key = WorkloadKey::of(&pod);
                pods.remove(&key);
                (key, true)
            }
        };
        drop(pods);

        if enqueue {
            debug!(key = %key, "Pod changed");
            self.queue.add(key);
        }
    }

    /// List and watch until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        info!(
            node = %self.scope.node_name,
            namespace = self.scope.namespace.as_deref().unwrap_or("*"),
            "Starting pod reflector"
        );

        let mut failures = 0u32;
        let mut enqueue_all = false;
        loop {
            if failures > 0 {
                let delay = self.backoff.delay(failures - 1);
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let listed = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                listed = self.relist(enqueue_all) => listed,
            };
            let resource_version = match listed {
                Ok(rv) => rv,
                Err(e) => {
                    warn!(error = %e.report(), "Failed to list pods");
                    failures += 1;
                    continue;
                }
            };
            enqueue_all = false;

            let mut events = match self
                .control_plane
                .watch_pods(&self.scope, &resource_version)
                .await
            {
                Ok(events) => events,
                Err(e) => {
                    warn!(error = %e.report(), "Failed to watch pods");
                    failures += 1;
                    continue;
                }
            };

            let resync = tokio::time::sleep(self.resync_interval);
            tokio::pin!(resync);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = &mut resync => {
                        debug!("Periodic pod resync");
                        enqueue_all = true;
                        break;
                    }
                    event = events.next() => match event {
                        Some(Ok(event)) => {
                            failures = 0;
                            self.apply(event).await;
                        }
                        Some(Err(e)) => {
                            warn!(error = %e.report(), "Pod watch failed, relisting");
                            failures += 1;
                            break;
                        }
                        None => {
                            debug!("Pod watch ended, relisting");
                            break;
                        }
                    },
                }
            }
        }
    }
}
