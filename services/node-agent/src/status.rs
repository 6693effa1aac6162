//! Status mirror: provider-observed status back onto pods.
//!
//! Pull mode sweeps every known key at a fixed interval; push mode reacts to
//! provider notifications. Both feed one coalescing queue, so writes for a
//! key are serialized. A status identical to the last one written is not
//! written again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::core::v1::{Pod, PodStatus};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vk_errdefs::{Error, ErrorKind, Result};
use vk_reconcile::{BackoffPolicy, WorkQueue};

use crate::control_plane::ControlPlane;
use crate::provider::Provider;
use crate::reflector::PodStore;
use crate::workload::{is_terminal, lost_status, missing_is_lost, WorkloadKey};

/// Re-read-and-retry rounds for a conflicting status write.
pub const MAX_CONFLICT_RETRIES: u32 = 3;

// =============================================================================
// Writer
// =============================================================================

/// Pod status writes with a resource-version precondition.
pub struct StatusWriter {
    control_plane: Arc<dyn ControlPlane>,
}

impl StatusWriter {
    pub fn new(control_plane: Arc<dyn ControlPlane>) -> Self {
        Self { control_plane }
    }

    /// Patch `status` onto `pod`. A conflict re-reads the pod for its
    /// current version and retries, a bounded number of times.
    pub async fn write(&self, pod: &Pod, status: &PodStatus) -> Result<Pod> {
        let key = WorkloadKey::of(pod);
        let mut resource_version = pod.metadata.resource_version.clone();

        for attempt in 0..=MAX_CONFLICT_RETRIES {
            match self
                .control_plane
                .patch_pod_status(&key, resource_version.as_deref(), status)
                .await
            {
                Ok(updated) => return Ok(updated),
                Err(e) if e.is(ErrorKind::Conflict) && attempt < MAX_CONFLICT_RETRIES => {
                    debug!(key = %key, attempt, "Pod status conflict, re-reading");
                    let current = self.control_plane.get_pod(&key).await?;
                    resource_version = current.metadata.resource_version;
                }
                Err(e) => return Err(Error::wrap(e, format!("write status of {key}"))),
            }
        }

        Err(Error::conflict(format!(
            "status of {key} kept conflicting"
        )))
    }
}

// =============================================================================
// Mirror
// =============================================================================

/// Status mirror settings.
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    /// Pull sweep interval.
    pub interval: Duration,

    /// Concurrent per-key status syncs.
    pub workers: usize,
}

pub struct StatusMirror {
    provider: Arc<dyn Provider>,
    store: PodStore,
    writer: Arc<StatusWriter>,

    /// Keys whose writes gave up on conflicts go back to the reconciler.
    reconcile_queue: Arc<WorkQueue<WorkloadKey>>,

    queue: WorkQueue<WorkloadKey>,

    /// Last status written per key.
    snapshots: Mutex<HashMap<WorkloadKey, PodStatus>>,

    config: MirrorConfig,
}

impl StatusMirror {
    pub fn new(
        provider: Arc<dyn Provider>,
        store: PodStore,
        writer: Arc<StatusWriter>,
        reconcile_queue: Arc<WorkQueue<WorkloadKey>>,
        config: MirrorConfig,
    ) -> Result<Self> {
        if config.interval.is_zero() {
            return Err(Error::invalid_input("status sync interval must be nonzero"));
        }
        Ok(Self {
            provider,
            store,
            writer,
            reconcile_queue,
            queue: WorkQueue::new(BackoffPolicy::new(
                Duration::from_millis(500),
                config.interval.max(Duration::from_secs(1)),
            )),
            snapshots: Mutex::new(HashMap::new()),
            config,
        })
    }

    fn snapshots(&self) -> MutexGuard<'_, HashMap<WorkloadKey, PodStatus>> {
        self.snapshots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Last status written for `key`.
    pub fn snapshot(&self, key: &WorkloadKey) -> Option<PodStatus> {
        self.snapshots().get(key).cloned()
    }

    /// Ask for an immediate status read of `key`.
    pub fn notify(&self, key: WorkloadKey) {
        self.queue.add(key);
    }

    /// Enqueue every known key and drop snapshots of forgotten ones.
    pub async fn sweep(&self) {
        let keys = self.store.keys().await;
        {
            let mut snapshots = self.snapshots();
            snapshots.retain(|key, _| keys.contains(key));
        }
        for key in keys {
            self.queue.add(key);
        }
    }

    /// Mirror one key.
    pub async fn sync(&self, key: &WorkloadKey, cancel: &CancellationToken) -> Result<()> {
        let Some(pod) = self.store.get(key).await else {
            self.snapshots().remove(key);
            return Ok(());
        };
        if is_terminal(&pod) {
            return Ok(());
        }

        let status = match self.provider.get_workload_status(key, cancel).await {
            Ok(status) => status,
            Err(e) if e.is(ErrorKind::NotFound) => {
                let now = Utc::now();
                if !missing_is_lost(&pod, now) {
                    // Not created yet.
                    return Ok(());
                }
                info!(key = %key, "Workload is missing from the provider, marking it failed");
                lost_status(&pod, now)
            }
            Err(e) => return Err(Error::wrap(e, format!("read status of {key}"))),
        };

        let previous = self.snapshot(key).or_else(|| pod.status.clone());
        if previous.as_ref() == Some(&status) {
            return Ok(());
        }

        self.writer.write(&pod, &status).await?;
        debug!(key = %key, phase = status.phase.as_deref().unwrap_or(""), "Mirrored pod status");
        self.snapshots().insert(key.clone(), status);
        Ok(())
    }

    async fn worker(self: Arc<Self>, cancel: CancellationToken) {
        while let Some(key) = self.queue.next().await {
            match self.sync(&key, &cancel).await {
                Ok(()) => self.queue.forget(&key),
                Err(e) if e.is(ErrorKind::Cancelled) => {}
                Err(e) if e.is(ErrorKind::Conflict) => {
                    warn!(key = %key, error = %e.report(), "Giving status back to the reconciler");
                    self.queue.forget(&key);
                    self.reconcile_queue.add(key.clone());
                }
                Err(e) => {
                    let delay = self.queue.add_rate_limited(key.clone(), e.retry_after());
                    warn!(key = %key, error = %e.report(), retry_in_ms = delay.as_millis() as u64, "Status sync failed");
                }
            }
            self.queue.done(&key);
        }
    }

    /// Sweep, follow push notifications and write statuses until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let mut notifications = self.provider.status_notifications();
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            push = notifications.is_some(),
            "Starting status mirror"
        );

        let mut workers = JoinSet::new();
        for _ in 0..self.config.workers.max(1) {
            workers.spawn(self.clone().worker(cancel.clone()));
        }

        let mut ticker = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.sweep().await,
                notified = next_notification(&mut notifications) => match notified {
                    Ok(key) => self.queue.add(key),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!(missed, "Status notifications lagged, sweeping");
                        self.sweep().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => notifications = None,
                },
            }
        }

        self.queue.shut_down();
        while workers.join_next().await.is_some() {}
        info!("Status mirror stopped");
        Ok(())
    }
}

async fn next_notification(
    notifications: &mut Option<broadcast::Receiver<WorkloadKey>>,
) -> std::result::Result<WorkloadKey, broadcast::error::RecvError> {
    match notifications {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
