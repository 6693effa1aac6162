//! Workload identity and pod helpers shared by the reflector, reconciler and
//! status mirror.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    Container, ContainerState, ContainerStateTerminated, Pod, PodCondition, PodStatus, Toleration,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use serde::Serialize;
use vk_errdefs::{Error, ErrorKind, Result};
use vk_reconcile::SpecHash;

/// Pod condition the agent owns to report provider outcomes.
pub const PROVIDER_CONDITION: &str = "ProviderSynced";

/// Pod status reason for permanent provider failures.
pub const REASON_PROVIDER_FAILED: &str = "ProviderFailed";

/// Pod status reason when the provider lost track of a workload.
pub const REASON_NOT_FOUND: &str = "NotFound";

pub const MESSAGE_STATUS_NOT_FOUND: &str =
    "The pod status was not found and may have been deleted from the provider";

/// Exit code stamped on containers whose workload vanished from the provider.
pub const EXIT_CODE_NOT_FOUND: i32 = -137;

/// Seconds a pod may go without provider status before it is declared lost.
const STATUS_GRACE_SECS: i64 = 60;

/// Stable identity of a workload: `namespace/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkloadKey {
    pub namespace: String,
    pub name: String,
}

impl WorkloadKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a pod; pods without a namespace live in `default`.
    pub fn of(pod: &Pod) -> Self {
        Self {
            namespace: pod
                .metadata
                .namespace
                .clone()
                .unwrap_or_else(|| "default".to_string()),
            name: pod.metadata.name.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for WorkloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for WorkloadKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(ns, name))
            }
            _ => Err(Error::invalid_input(format!(
                "workload key {s:?} is not namespace/name"
            ))),
        }
    }
}

pub fn phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref()?.phase.as_deref()
}

/// Pods that finished are never created, updated or polled again.
pub fn is_terminal(pod: &Pod) -> bool {
    matches!(phase(pod), Some("Succeeded") | Some("Failed"))
}

pub fn is_terminating(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

/// The fields a provider may be asked to change in place.
///
/// Container environment is left out: it cannot change on a pod, and the
/// provider holds the resolved form rather than the references.
#[derive(Debug, PartialEq, Serialize)]
struct MutableFields<'a> {
    containers: Option<Vec<Container>>,
    init_containers: Option<Vec<Container>>,
    active_deadline_seconds: Option<i64>,
    tolerations: Option<&'a Vec<Toleration>>,
    labels: Option<&'a BTreeMap<String, String>>,
    annotations: Option<&'a BTreeMap<String, String>>,
}

impl<'a> MutableFields<'a> {
    fn of(pod: &'a Pod) -> Self {
        let spec = pod.spec.as_ref();
        Self {
            containers: spec.map(|s| without_env(&s.containers)),
            init_containers: spec.and_then(|s| s.init_containers.as_deref()).map(without_env),
            active_deadline_seconds: spec.and_then(|s| s.active_deadline_seconds),
            tolerations: spec.and_then(|s| s.tolerations.as_ref()),
            labels: pod.metadata.labels.as_ref(),
            annotations: pod.metadata.annotations.as_ref(),
        }
    }
}

fn without_env(containers: &[Container]) -> Vec<Container> {
    containers
        .iter()
        .map(|c| Container {
            env: None,
            env_from: None,
            ..c.clone()
        })
        .collect()
}

/// Whether `desired` and `observed` differ on a field the provider can update.
pub fn mutable_fields_differ(desired: &Pod, observed: &Pod) -> bool {
    MutableFields::of(desired) != MutableFields::of(observed)
}

/// Fingerprint of the mutable fields, used to make `Unsupported` sticky.
pub fn mutable_fingerprint(pod: &Pod) -> Result<SpecHash> {
    SpecHash::of(&MutableFields::of(pod))
        .map_err(|e| Error::invalid_input("fingerprint pod").with_source(e))
}

/// Whether a watch update carries anything the reconciler acts on.
///
/// Status-only updates (mostly our own writes) are filtered out.
pub fn should_enqueue(old: &Pod, new: &Pod) -> bool {
    old.spec != new.spec
        || old.metadata.uid != new.metadata.uid
        || old.metadata.labels != new.metadata.labels
        || old.metadata.annotations != new.metadata.annotations
        || old.metadata.deletion_timestamp != new.metadata.deletion_timestamp
        || old.metadata.deletion_grace_period_seconds != new.metadata.deletion_grace_period_seconds
}

/// Insert or replace the agent-owned provider condition.
pub fn set_provider_condition(status: &mut PodStatus, kind: ErrorKind, message: &str) {
    let now = Time(Utc::now());
    let conditions = status.conditions.get_or_insert_with(Vec::new);
    let condition = PodCondition {
        type_: PROVIDER_CONDITION.to_string(),
        status: "False".to_string(),
        reason: Some(kind.as_str().to_string()),
        message: Some(message.to_string()),
        last_transition_time: Some(now),
        ..Default::default()
    };
    match conditions.iter_mut().find(|c| c.type_ == PROVIDER_CONDITION) {
        Some(existing) => {
            if existing.status == condition.status && existing.reason == condition.reason {
                existing.message = condition.message;
            } else {
                *existing = condition;
            }
        }
        None => conditions.push(condition),
    }
}

fn is_refused(pod: &Pod) -> bool {
    pod.status.as_ref().and_then(|s| s.reason.as_deref()) == Some(REASON_PROVIDER_FAILED)
}

/// Status recorded when the provider permanently refuses to create a pod.
pub fn provider_failure_status(pod: &Pod, err: &Error) -> PodStatus {
    let mut status = pod.status.clone().unwrap_or_default();
    let never_restart = pod
        .spec
        .as_ref()
        .and_then(|s| s.restart_policy.as_deref())
        == Some("Never");

    status.phase = Some(if never_restart { "Failed" } else { "Pending" }.to_string());
    status.reason = Some(REASON_PROVIDER_FAILED.to_string());
    let message = err.report().to_string();
    set_provider_condition(&mut status, err.kind(), &message);
    status.message = Some(message);
    status
}

/// Whether a pod the provider no longer knows about should be declared lost.
///
/// Freshly scheduled pods get a grace period while the provider creates them.
/// Pods the provider refused were never created, so they cannot be lost.
pub fn missing_is_lost(pod: &Pod, now: DateTime<Utc>) -> bool {
    if is_terminating(pod) || is_terminal(pod) || is_refused(pod) {
        return false;
    }
    if phase(pod) == Some("Running") {
        return true;
    }
    match &pod.metadata.creation_timestamp {
        Some(Time(created)) => (now - *created).num_seconds() > STATUS_GRACE_SECS,
        None => false,
    }
}

/// Status for a pod whose workload vanished from the provider.
pub fn lost_status(pod: &Pod, now: DateTime<Utc>) -> PodStatus {
    let mut status = pod.status.clone().unwrap_or_default();
    status.phase = Some("Failed".to_string());
    status.reason = Some(REASON_NOT_FOUND.to_string());
    status.message = Some(MESSAGE_STATUS_NOT_FOUND.to_string());

    for container in status.container_statuses.iter_mut().flatten() {
        let started_at = container
            .state
            .as_ref()
            .and_then(|s| s.running.as_ref())
            .and_then(|r| r.started_at.clone());
        container.state = Some(ContainerState {
            terminated: Some(ContainerStateTerminated {
                exit_code: EXIT_CODE_NOT_FOUND,
                reason: Some(REASON_NOT_FOUND.to_string()),
                message: Some(MESSAGE_STATUS_NOT_FOUND.to_string()),
                started_at,
                finished_at: Some(Time(now)),
                ..Default::default()
            }),
            ..Default::default()
        });
        container.ready = false;
    }
    status
}
