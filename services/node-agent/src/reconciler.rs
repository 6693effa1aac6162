//! Workload reconciler.
//!
//! Drives the provider toward the pods assigned to this node. Keys arrive
//! from the reflector; each sync reads desired state from the pod cache and
//! observed state from the provider, then creates, updates, tears down or
//! deletes. A key is never synced by two workers at once.
//!
//! Permanent refusals (`InvalidInput`, `Unsupported`) are written onto the
//! pod and remembered against a fingerprint of the mutable fields, so the
//! same request is not sent again until the pod itself changes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use k8s_openapi::api::core::v1::{Pod, PodStatus};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vk_errdefs::{Error, ErrorKind, Result};
use vk_reconcile::{SpecHash, WorkQueue};

use crate::control_plane::ControlPlane;
use crate::env::{EnvResolver, Resolved};
use crate::events::{
    EventRecorder, REASON_CREATE_FAILED, REASON_DELETE_FAILED, REASON_UPDATE_UNSUPPORTED,
};
use crate::provider::Provider;
use crate::reflector::PodStore;
use crate::status::StatusWriter;
use crate::workload::{
    is_terminal, is_terminating, mutable_fields_differ, mutable_fingerprint,
    provider_failure_status, set_provider_condition, WorkloadKey,
};

/// Retry floor for credential failures, unless the server names one.
pub const AUTH_RETRY_DELAY: Duration = Duration::from_secs(30);

/// What a sync did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Created,
    Updated,
    Deleted,
    /// Provider workload removed and the pod object released.
    TornDown,
    Unchanged,
    /// Neither side knows the key anymore.
    Forgotten,
    /// Terminal pods are left alone.
    Skipped,
    /// The provider refused permanently; recorded on the pod.
    Refused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Refused {
    Create,
    Update,
}

/// A permanent refusal remembered for one key.
struct Refusal {
    op: Refused,
    fingerprint: SpecHash,
    /// Status still to be written onto the pod; cleared once it lands.
    pending: Option<PodStatus>,
}

pub struct Reconciler {
    provider: Arc<dyn Provider>,
    control_plane: Arc<dyn ControlPlane>,
    store: PodStore,
    queue: Arc<WorkQueue<WorkloadKey>>,
    writer: Arc<StatusWriter>,
    events: EventRecorder,
    environment: EnvResolver,

    /// Permanent refusals by key and the fingerprint they were refused for.
    refusals: Mutex<HashMap<WorkloadKey, Refusal>>,

    workers: usize,
}

impl Reconciler {
    pub fn new(
        provider: Arc<dyn Provider>,
        control_plane: Arc<dyn ControlPlane>,
        store: PodStore,
        queue: Arc<WorkQueue<WorkloadKey>>,
        writer: Arc<StatusWriter>,
        events: EventRecorder,
        workers: usize,
    ) -> Result<Self> {
        if workers == 0 {
            return Err(Error::invalid_input("reconcile workers must be at least 1"));
        }
        Ok(Self {
            provider,
            environment: EnvResolver::new(control_plane.clone()),
            control_plane,
            store,
            queue,
            writer,
            events,
            refusals: Mutex::new(HashMap::new()),
            workers,
        })
    }

    fn refusals(&self) -> MutexGuard<'_, HashMap<WorkloadKey, Refusal>> {
        self.refusals
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_refused(&self, key: &WorkloadKey, op: Refused, fingerprint: &SpecHash) -> bool {
        matches!(
            self.refusals().get(key),
            Some(r) if r.op == op && &r.fingerprint == fingerprint
        )
    }

    /// Remember a refusal before anything else can fail, so a retry only
    /// re-drives the status write and never the provider call.
    fn refuse(&self, key: &WorkloadKey, op: Refused, fingerprint: SpecHash, status: PodStatus) {
        self.refusals().insert(
            key.clone(),
            Refusal {
                op,
                fingerprint,
                pending: Some(status),
            },
        );
    }

    /// Write the status of a refusal if it has not landed yet.
    async fn record_refusal(&self, key: &WorkloadKey, pod: &Pod) -> Result<Action> {
        let pending = self.refusals().get(key).and_then(|r| r.pending.clone());
        if let Some(status) = pending {
            self.writer
                .write(pod, &status)
                .await
                .map_err(|e| Error::wrap(e, format!("record refusal of {key}")))?;
            if let Some(refusal) = self.refusals().get_mut(key) {
                refusal.pending = None;
            }
        }
        Ok(Action::Refused)
    }

    // =========================================================================
    // Sync
    // =========================================================================

    /// Converge one key.
    pub async fn sync(&self, key: &WorkloadKey, cancel: &CancellationToken) -> Result<Action> {
        let desired = self.store.get(key).await;
        if let Some(pod) = &desired {
            if is_terminal(pod) {
                return Ok(Action::Skipped);
            }
            if is_terminating(pod) {
                return self.tear_down(key, pod, cancel).await;
            }
        }

        let observed = match self.provider.get_workload(key, cancel).await {
            Ok(pod) => Some(pod),
            Err(e) if e.is(ErrorKind::NotFound) => None,
            Err(e) => return Err(Error::wrap(e, format!("get workload {key}"))),
        };

        match (desired, observed) {
            (Some(desired), None) => self.create(key, &desired, cancel).await,
            (Some(desired), Some(observed)) => {
                if mutable_fields_differ(&desired, &observed) {
                    self.update(key, &desired, cancel).await
                } else {
                    Ok(Action::Unchanged)
                }
            }
            (None, Some(observed)) => self.delete(key, &observed, cancel).await,
            (None, None) => {
                self.refusals().remove(key);
                Ok(Action::Forgotten)
            }
        }
    }

    async fn create(
        &self,
        key: &WorkloadKey,
        pod: &Pod,
        cancel: &CancellationToken,
    ) -> Result<Action> {
        let fingerprint = mutable_fingerprint(pod)?;
        if self.is_refused(key, Refused::Create, &fingerprint) {
            debug!(key = %key, "Create already refused for this spec");
            return self.record_refusal(key, pod).await;
        }

        let outcome = match self.resolve(pod).await {
            Ok(resolved) => self.provider.create_workload(&resolved, cancel).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(()) => {
                info!(key = %key, "Created workload");
                self.refusals().remove(key);
                Ok(Action::Created)
            }
            Err(e) if e.kind().is_permanent() => {
                warn!(key = %key, kind = e.kind().as_str(), error = %e.report(), "Provider refused create");
                self.refuse(key, Refused::Create, fingerprint, provider_failure_status(pod, &e));
                self.events
                    .warning(pod, REASON_CREATE_FAILED, &e.report().to_string())
                    .await;
                self.record_refusal(key, pod).await
            }
            Err(e) => Err(Error::wrap(e, format!("create workload {key}"))),
        }
    }

    async fn update(
        &self,
        key: &WorkloadKey,
        pod: &Pod,
        cancel: &CancellationToken,
    ) -> Result<Action> {
        let fingerprint = mutable_fingerprint(pod)?;
        if self.is_refused(key, Refused::Update, &fingerprint) {
            debug!(key = %key, "Update already refused for this spec");
            return self.record_refusal(key, pod).await;
        }

        let outcome = match self.resolve(pod).await {
            Ok(resolved) => self.provider.update_workload(&resolved, cancel).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(()) => {
                info!(key = %key, "Updated workload");
                self.refusals().remove(key);
                Ok(Action::Updated)
            }
            Err(e) if e.kind().is_permanent() => {
                warn!(key = %key, kind = e.kind().as_str(), error = %e.report(), "Provider refused update");
                let message = e.report().to_string();
                let mut status = PodStatus::default();
                set_provider_condition(&mut status, e.kind(), &message);
                self.refuse(key, Refused::Update, fingerprint, status);
                self.events
                    .warning(pod, REASON_UPDATE_UNSUPPORTED, &message)
                    .await;
                self.record_refusal(key, pod).await
            }
            Err(e) => Err(Error::wrap(e, format!("update workload {key}"))),
        }
    }

    /// Copy of `pod` with its container environment resolved. Skipped
    /// optional references are reported as events.
    async fn resolve(&self, pod: &Pod) -> Result<Pod> {
        let Resolved { pod: resolved, warnings } = self.environment.resolve(pod).await?;
        for warning in &warnings {
            self.events.warning(pod, warning.reason, &warning.message).await;
        }
        Ok(resolved)
    }

    /// Delete a workload whose pod is gone.
    async fn delete(
        &self,
        key: &WorkloadKey,
        observed: &Pod,
        cancel: &CancellationToken,
    ) -> Result<Action> {
        match self.provider.delete_workload(key, cancel).await {
            Ok(()) => info!(key = %key, "Deleted workload"),
            Err(e) if e.is(ErrorKind::NotFound) => debug!(key = %key, "Workload already gone"),
            Err(e) => {
                if self.queue.failures(key) == 0 {
                    self.events
                        .warning(observed, REASON_DELETE_FAILED, &e.report().to_string())
                        .await;
                }
                return Err(Error::wrap(e, format!("delete workload {key}")));
            }
        }
        self.refusals().remove(key);
        Ok(Action::Deleted)
    }

    /// Remove the workload of a terminating pod, then release the pod.
    async fn tear_down(
        &self,
        key: &WorkloadKey,
        pod: &Pod,
        cancel: &CancellationToken,
    ) -> Result<Action> {
        match self.provider.delete_workload(key, cancel).await {
            Ok(()) => info!(key = %key, "Deleted workload of terminating pod"),
            Err(e) if e.is(ErrorKind::NotFound) => {}
            Err(e) if e.kind().is_permanent() => {
                // Retrying cannot help; release the pod and leave the
                // provider side to its owner.
                warn!(key = %key, error = %e.report(), "Provider refused delete, releasing pod");
                self.events
                    .warning(pod, REASON_DELETE_FAILED, &e.report().to_string())
                    .await;
            }
            Err(e) => {
                if self.queue.failures(key) == 0 {
                    self.events
                        .warning(pod, REASON_DELETE_FAILED, &e.report().to_string())
                        .await;
                }
                return Err(Error::wrap(e, format!("delete workload {key}")));
            }
        }

        match self.control_plane.delete_pod(key, Some(0)).await {
            Ok(()) => debug!(key = %key, "Released pod"),
            Err(e) if e.is(ErrorKind::NotFound) => {}
            Err(e) => return Err(Error::wrap(e, format!("release pod {key}"))),
        }
        self.refusals().remove(key);
        Ok(Action::TornDown)
    }

    // =========================================================================
    // Loop
    // =========================================================================

    /// Enqueue provider workloads that have no pod in the cache.
    ///
    /// Only meaningful once the cache has synced.
    pub async fn enqueue_dangling(&self, cancel: &CancellationToken) -> Result<usize> {
        let workloads = self.provider.list_workloads(cancel).await?;
        let mut dangling = 0;
        for workload in &workloads {
            let key = WorkloadKey::of(workload);
            if !self.store.contains(&key).await {
                debug!(key = %key, "Dangling workload");
                self.queue.add(key);
                dangling += 1;
            }
        }
        if dangling > 0 {
            info!(dangling, "Found workloads with no pod");
        }
        Ok(dangling)
    }

    async fn worker(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        while let Some(key) = self.queue.next().await {
            let outcome = self.sync(&key, &cancel).await;
            let result = match outcome {
                Ok(action) => {
                    debug!(key = %key, ?action, "Synced");
                    self.queue.forget(&key);
                    Ok(())
                }
                Err(e) if e.is(ErrorKind::Cancelled) => Ok(()),
                Err(e) if e.is(ErrorKind::Fatal) => {
                    error!(key = %key, error = %e.report(), "Fatal reconcile error");
                    Err(e)
                }
                Err(e) => {
                    let auth = matches!(e.kind(), ErrorKind::Unauthorized | ErrorKind::Forbidden);
                    let hint = match e.retry_after() {
                        Some(after) => Some(after),
                        None if auth => Some(AUTH_RETRY_DELAY),
                        None => None,
                    };
                    let delay = self.queue.add_rate_limited(key.clone(), hint);
                    let retry_in_ms = delay.as_millis() as u64;
                    if auth {
                        error!(key = %key, error = %e.report(), retry_in_ms, "Reconcile not authorized");
                    } else {
                        warn!(key = %key, error = %e.report(), retry_in_ms, "Reconcile failed");
                    }
                    Ok(())
                }
            };
            self.queue.done(&key);
            result?;
        }
        Ok(())
    }

    /// Wait for the cache to sync, then run workers until cancelled.
    ///
    /// A fatal error from any worker ends the loop and is returned.
    pub async fn run(
        self: Arc<Self>,
        cancel: CancellationToken,
        mut synced: watch::Receiver<bool>,
    ) -> Result<()> {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            waited = synced.wait_for(|s| *s) => {
                if waited.is_err() {
                    return Ok(());
                }
            }
        }

        info!(workers = self.workers, "Starting workload reconciler");
        if let Err(e) = self.enqueue_dangling(&cancel).await {
            warn!(error = %e.report(), "Failed to list provider workloads");
        }

        let mut workers = JoinSet::new();
        for _ in 0..self.workers {
            workers.spawn(self.clone().worker(cancel.clone()));
        }

        let outcome = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                joined = workers.join_next() => match joined {
                    Some(Ok(Err(e))) => break Err(e),
                    Some(Ok(Ok(()))) => continue,
                    Some(Err(e)) => {
                        break Err(Error::fatal(format!("reconcile worker failed: {e}")))
                    }
                    None => break Ok(()),
                },
            }
        };

        self.queue.shut_down();
        while workers.join_next().await.is_some() {}
        info!("Workload reconciler stopped");
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::memory::{Call, InMemoryControlPlane};
    use crate::control_plane::{PodEvent, PodScope};
    use crate::provider::mock::{MockProvider, Operation};
    use crate::reflector::Reflector;
    use crate::workload::tests::pod;
    use crate::workload::{PROVIDER_CONDITION, REASON_PROVIDER_FAILED};
    use k8s_openapi::api::core::v1::{ConfigMap, ConfigMapKeySelector, EnvVar, EnvVarSource};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use vk_reconcile::BackoffPolicy;

    struct Fixture {
        control_plane: Arc<InMemoryControlPlane>,
        provider: Arc<MockProvider>,
        reflector: Arc<Reflector>,
        reconciler: Arc<Reconciler>,
    }

    fn fixture() -> Fixture {
        let control_plane = Arc::new(InMemoryControlPlane::new());
        let provider = Arc::new(MockProvider::new("vk-1", "Linux", "10.0.0.5", 10250));
        let queue = Arc::new(WorkQueue::new(BackoffPolicy::new(
            Duration::from_millis(10),
            Duration::from_secs(1),
        )));
        let reflector = Arc::new(Reflector::new(
            control_plane.clone(),
            PodScope {
                node_name: "vk-1".to_string(),
                namespace: None,
            },
            queue.clone(),
            Duration::from_secs(300),
        ));
        let reconciler = Arc::new(
            Reconciler::new(
                provider.clone(),
                control_plane.clone(),
                reflector.store(),
                queue,
                Arc::new(StatusWriter::new(control_plane.clone())),
                EventRecorder::new(control_plane.clone(), "vk-1"),
                2,
            )
            .unwrap(),
        );
        Fixture {
            control_plane,
            provider,
            reflector,
            reconciler,
        }
    }

    async fn schedule(f: &Fixture, pod: Pod) -> WorkloadKey {
        let created = f.control_plane.submit_pod(pod).unwrap();
        f.reflector.apply(PodEvent::Added(created.clone())).await;
        WorkloadKey::of(&created)
    }

    async fn refresh(f: &Fixture, key: &WorkloadKey) {
        let current = f.control_plane.pod(key).unwrap();
        f.reflector.apply(PodEvent::Modified(current)).await;
    }

    fn provider_condition(status: &PodStatus) -> Option<(String, String)> {
        status
            .conditions
            .iter()
            .flatten()
            .find(|c| c.type_ == PROVIDER_CONDITION)
            .map(|c| (c.status.clone(), c.reason.clone().unwrap_or_default()))
    }

    #[test]
    fn test_zero_workers_rejected() {
        let control_plane = Arc::new(InMemoryControlPlane::new());
        let err = Reconciler::new(
            Arc::new(MockProvider::new("vk-1", "Linux", "10.0.0.5", 10250)),
            control_plane.clone(),
            PodStore::default(),
            Arc::new(WorkQueue::new(BackoffPolicy::default())),
            Arc::new(StatusWriter::new(control_plane.clone())),
            EventRecorder::new(control_plane, "vk-1"),
            0,
        )
        .err()
        .unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_same_desired_state_creates_once() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let key = schedule(&f, pod("default", "web", "nginx")).await;

        assert_eq!(f.reconciler.sync(&key, &cancel).await.unwrap(), Action::Created);
        assert_eq!(f.reconciler.sync(&key, &cancel).await.unwrap(), Action::Unchanged);

        assert_eq!(f.provider.count(Operation::Create), 1);
        assert_eq!(f.provider.count(Operation::Update), 0);
    }

    #[tokio::test]
    async fn test_label_change_updates_in_place() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let key = schedule(&f, pod("default", "web", "nginx")).await;
        f.reconciler.sync(&key, &cancel).await.unwrap();

        f.control_plane
            .update_pod(&key, |p| {
                p.metadata.labels = Some([("tier".to_string(), "web".to_string())].into())
            })
            .unwrap();
        refresh(&f, &key).await;

        assert_eq!(f.reconciler.sync(&key, &cancel).await.unwrap(), Action::Updated);
        let observed = f.provider.get_workload(&key, &cancel).await.unwrap();
        assert_eq!(
            observed.metadata.labels.unwrap().get("tier").map(String::as_str),
            Some("web")
        );
    }

    #[tokio::test]
    async fn test_transient_create_failure_is_retryable_and_not_recorded() {
        let f = fixture();
        let cancel = CancellationToken::new();
        f.provider.fail_next(Operation::Create, ErrorKind::Transient, 1);
        let key = schedule(&f, pod("default", "web", "nginx")).await;

        let err = f.reconciler.sync(&key, &cancel).await.unwrap_err();
        assert!(err.kind().is_retryable());
        assert_eq!(f.control_plane.calls(Call::PatchPodStatus), 0);

        assert_eq!(f.reconciler.sync(&key, &cancel).await.unwrap(), Action::Created);
    }

    #[tokio::test]
    async fn test_invalid_create_is_recorded_once() {
        let f = fixture();
        let cancel = CancellationToken::new();
        f.provider.fail_next(Operation::Create, ErrorKind::InvalidInput, 1);
        let key = schedule(&f, pod("default", "job", "busybox")).await;

        assert_eq!(f.reconciler.sync(&key, &cancel).await.unwrap(), Action::Refused);
        let status = f.control_plane.pod(&key).unwrap().status.unwrap();
        assert_eq!(status.phase.as_deref(), Some("Pending"));
        assert_eq!(status.reason.as_deref(), Some(REASON_PROVIDER_FAILED));
        assert_eq!(
            provider_condition(&status),
            Some(("False".to_string(), "InvalidInput".to_string()))
        );
        let events = f.control_plane.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason.as_deref(), Some(REASON_CREATE_FAILED));

        // Same spec: no second attempt.
        refresh(&f, &key).await;
        assert_eq!(f.reconciler.sync(&key, &cancel).await.unwrap(), Action::Refused);
        assert_eq!(f.provider.count(Operation::Create), 1);
    }

    #[tokio::test]
    async fn test_lost_refusal_write_retries_only_the_write() {
        let f = fixture();
        let cancel = CancellationToken::new();
        f.provider.fail_next(Operation::Create, ErrorKind::InvalidInput, 2);
        f.control_plane
            .fail_next(Call::PatchPodStatus, ErrorKind::Transient, 1);
        let key = schedule(&f, pod("default", "job", "busybox")).await;

        let err = f.reconciler.sync(&key, &cancel).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);

        assert_eq!(f.reconciler.sync(&key, &cancel).await.unwrap(), Action::Refused);
        assert_eq!(f.provider.calls_for(Operation::Create, &key).len(), 1);
        let status = f.control_plane.pod(&key).unwrap().status.unwrap();
        assert_eq!(status.reason.as_deref(), Some(REASON_PROVIDER_FAILED));
        assert_eq!(f.control_plane.events().len(), 1);

        // Once written, later syncs leave the control plane alone.
        let writes = f.control_plane.calls(Call::PatchPodStatus);
        refresh(&f, &key).await;
        assert_eq!(f.reconciler.sync(&key, &cancel).await.unwrap(), Action::Refused);
        assert_eq!(f.control_plane.calls(Call::PatchPodStatus), writes);
    }

    #[tokio::test]
    async fn test_lost_update_refusal_write_is_retried_without_update() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let key = schedule(&f, pod("default", "web", "nginx")).await;
        f.reconciler.sync(&key, &cancel).await.unwrap();

        f.provider.fail_next(Operation::Update, ErrorKind::Unsupported, 2);
        f.control_plane
            .fail_next(Call::PatchPodStatus, ErrorKind::Transient, 1);
        f.control_plane
            .update_pod(&key, |p| {
                p.spec.as_mut().unwrap().active_deadline_seconds = Some(600)
            })
            .unwrap();
        refresh(&f, &key).await;

        assert!(f.reconciler.sync(&key, &cancel).await.is_err());
        assert_eq!(f.reconciler.sync(&key, &cancel).await.unwrap(), Action::Refused);
        assert_eq!(f.provider.count(Operation::Update), 1);
        let status = f.control_plane.pod(&key).unwrap().status.unwrap();
        assert_eq!(
            provider_condition(&status),
            Some(("False".to_string(), "Unsupported".to_string()))
        );
    }

    fn with_config_map_env(mut p: Pod, config_map: &str) -> Pod {
        p.spec.as_mut().unwrap().containers[0].env = Some(vec![EnvVar {
            name: "LEVEL".to_string(),
            value: None,
            value_from: Some(EnvVarSource {
                config_map_key_ref: Some(ConfigMapKeySelector {
                    name: config_map.to_string(),
                    key: "level".to_string(),
                    optional: None,
                }),
                ..Default::default()
            }),
        }]);
        p
    }

    #[tokio::test]
    async fn test_provider_receives_resolved_environment() {
        let f = fixture();
        let cancel = CancellationToken::new();
        f.control_plane
            .put_config_map(ConfigMap {
                metadata: ObjectMeta {
                    namespace: Some("default".to_string()),
                    name: Some("app".to_string()),
                    ..Default::default()
                },
                data: Some([("level".to_string(), "debug".to_string())].into()),
                ..Default::default()
            })
            .unwrap();
        let key = schedule(&f, with_config_map_env(pod("default", "web", "nginx"), "app")).await;

        assert_eq!(f.reconciler.sync(&key, &cancel).await.unwrap(), Action::Created);
        let observed = f.provider.get_workload(&key, &cancel).await.unwrap();
        let env = observed.spec.unwrap().containers[0].env.clone().unwrap();
        assert_eq!(env.len(), 1);
        assert_eq!(env[0].value.as_deref(), Some("debug"));
        assert!(env[0].value_from.is_none());

        // The cached pod keeps its references; that is not a difference.
        assert_eq!(f.reconciler.sync(&key, &cancel).await.unwrap(), Action::Unchanged);
        assert_eq!(f.provider.count(Operation::Update), 0);
    }

    #[tokio::test]
    async fn test_missing_config_map_refuses_without_provider_call() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let key = schedule(&f, with_config_map_env(pod("default", "web", "nginx"), "absent")).await;

        assert_eq!(f.reconciler.sync(&key, &cancel).await.unwrap(), Action::Refused);
        assert_eq!(f.provider.count(Operation::Create), 0);
        let status = f.control_plane.pod(&key).unwrap().status.unwrap();
        assert_eq!(status.reason.as_deref(), Some(REASON_PROVIDER_FAILED));
        assert_eq!(
            provider_condition(&status),
            Some(("False".to_string(), "InvalidInput".to_string()))
        );
        assert!(status.message.unwrap().contains("\"absent\""));
    }

    #[tokio::test]
    async fn test_unreadable_config_map_is_retried() {
        let f = fixture();
        let cancel = CancellationToken::new();
        f.control_plane
            .fail_next(Call::GetConfigMap, ErrorKind::Transient, 1);
        let key = schedule(&f, with_config_map_env(pod("default", "web", "nginx"), "absent")).await;

        let err = f.reconciler.sync(&key, &cancel).await.unwrap_err();
        assert!(err.kind().is_retryable());
        assert_eq!(f.control_plane.calls(Call::PatchPodStatus), 0);
        assert_eq!(f.provider.count(Operation::Create), 0);
    }

    #[tokio::test]
    async fn test_unsupported_update_is_sticky_per_spec() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let key = schedule(&f, pod("default", "web", "nginx")).await;
        f.reconciler.sync(&key, &cancel).await.unwrap();

        f.provider.fail_next(Operation::Update, ErrorKind::Unsupported, 1);
        f.control_plane
            .update_pod(&key, |p| {
                p.spec.as_mut().unwrap().active_deadline_seconds = Some(600)
            })
            .unwrap();
        refresh(&f, &key).await;

        assert_eq!(f.reconciler.sync(&key, &cancel).await.unwrap(), Action::Refused);
        let status = f.control_plane.pod(&key).unwrap().status.unwrap();
        assert_eq!(
            provider_condition(&status),
            Some(("False".to_string(), "Unsupported".to_string()))
        );
        assert_eq!(
            f.control_plane.events()[0].reason.as_deref(),
            Some(REASON_UPDATE_UNSUPPORTED)
        );

        refresh(&f, &key).await;
        f.reconciler.sync(&key, &cancel).await.unwrap();
        assert_eq!(f.provider.count(Operation::Update), 1);

        // A different combination is tried again.
        f.control_plane
            .update_pod(&key, |p| {
                p.spec.as_mut().unwrap().active_deadline_seconds = Some(900)
            })
            .unwrap();
        refresh(&f, &key).await;
        assert_eq!(f.reconciler.sync(&key, &cancel).await.unwrap(), Action::Updated);
        assert_eq!(f.provider.count(Operation::Update), 2);
    }

    #[tokio::test]
    async fn test_terminating_pod_is_torn_down_and_released() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let key = schedule(&f, pod("default", "web", "nginx")).await;
        f.reconciler.sync(&key, &cancel).await.unwrap();

        f.control_plane.request_pod_deletion(&key).unwrap();
        refresh(&f, &key).await;

        assert_eq!(f.reconciler.sync(&key, &cancel).await.unwrap(), Action::TornDown);
        assert!(f.control_plane.pod(&key).is_none());
        assert_eq!(
            f.provider.get_workload(&key, &cancel).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_failed_teardown_keeps_pod_and_records_event() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let key = schedule(&f, pod("default", "web", "nginx")).await;
        f.reconciler.sync(&key, &cancel).await.unwrap();
        f.control_plane.request_pod_deletion(&key).unwrap();
        refresh(&f, &key).await;
        f.provider.fail_next(Operation::Delete, ErrorKind::Transient, 1);

        let err = f.reconciler.sync(&key, &cancel).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(f.control_plane.pod(&key).is_some());
        assert_eq!(
            f.control_plane.events()[0].reason.as_deref(),
            Some(REASON_DELETE_FAILED)
        );

        assert_eq!(f.reconciler.sync(&key, &cancel).await.unwrap(), Action::TornDown);
    }

    #[tokio::test]
    async fn test_orphaned_workload_is_deleted() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let orphan = pod("default", "old", "nginx");
        f.provider.create_workload(&orphan, &cancel).await.unwrap();
        let key = WorkloadKey::of(&orphan);

        assert_eq!(f.reconciler.enqueue_dangling(&cancel).await.unwrap(), 1);
        assert_eq!(f.reconciler.sync(&key, &cancel).await.unwrap(), Action::Deleted);
        assert_eq!(f.reconciler.sync(&key, &cancel).await.unwrap(), Action::Forgotten);
    }

    #[tokio::test]
    async fn test_terminal_pods_are_skipped() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let mut done = pod("default", "job", "busybox");
        done.status = Some(PodStatus {
            phase: Some("Succeeded".to_string()),
            ..Default::default()
        });
        let key = schedule(&f, done).await;

        assert_eq!(f.reconciler.sync(&key, &cancel).await.unwrap(), Action::Skipped);
        assert_eq!(f.provider.count(Operation::Get), 0);
    }

    #[tokio::test]
    async fn test_run_converges_and_retries_with_backoff() {
        let f = fixture();
        let cancel = CancellationToken::new();
        f.provider.fail_next(Operation::Create, ErrorKind::Transient, 2);
        let runner = tokio::spawn(
            f.reconciler
                .clone()
                .run(cancel.clone(), f.reflector.subscribe_synced()),
        );

        f.control_plane.submit_pod(pod("default", "web", "nginx")).unwrap();
        f.reflector.relist(false).await.unwrap();
        let key = WorkloadKey::new("default", "web");

        tokio::time::timeout(Duration::from_secs(5), async {
            while f.provider.get_workload(&key, &cancel).await.is_err() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let creates = f.provider.calls_for(Operation::Create, &key);
        assert_eq!(creates.len(), 3);
        assert!(creates[1].at > creates[0].at);

        cancel.cancel();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_fatal_sync_ends_run() {
        let f = fixture();
        let cancel = CancellationToken::new();
        f.provider.fail_next(Operation::Create, ErrorKind::Fatal, 1);
        f.control_plane.submit_pod(pod("default", "web", "nginx")).unwrap();
        f.reflector.relist(false).await.unwrap();

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            f.reconciler.clone().run(cancel, f.reflector.subscribe_synced()),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fatal);
    }
}
