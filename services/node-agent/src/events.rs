//! Best-effort pod events for provider failures.

use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::api::core::v1::{Event, EventSource, ObjectReference, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta, Time};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::control_plane::ControlPlane;
use crate::workload::WorkloadKey;

pub const REASON_CREATE_FAILED: &str = "ProviderCreateFailed";
pub const REASON_UPDATE_UNSUPPORTED: &str = "ProviderUpdateUnsupported";
pub const REASON_DELETE_FAILED: &str = "ProviderDeleteFailed";

/// Reporting component name on emitted events.
pub const COMPONENT: &str = "virtual-kubelet";

/// Emits warning events on pods. Failures are logged, never returned.
#[derive(Clone)]
pub struct EventRecorder {
    control_plane: Arc<dyn ControlPlane>,
    node_name: String,
}

impl EventRecorder {
    pub fn new(control_plane: Arc<dyn ControlPlane>, node_name: impl Into<String>) -> Self {
        Self {
            control_plane,
            node_name: node_name.into(),
        }
    }

    pub async fn warning(&self, pod: &Pod, reason: &str, message: &str) {
        let event = self.event(pod, reason, message);
        let key = WorkloadKey::of(pod);
        match self.control_plane.create_event(&event).await {
            Ok(()) => debug!(key = %key, reason, "Recorded event"),
            Err(e) => warn!(key = %key, reason, error = %e.report(), "Failed to record event"),
        }
    }

    fn event(&self, pod: &Pod, reason: &str, message: &str) -> Event {
        let key = WorkloadKey::of(pod);
        let now = Utc::now();
        Event {
            metadata: ObjectMeta {
                name: Some(format!("{}.{}", key.name, Uuid::new_v4().simple())),
                namespace: Some(key.namespace.clone()),
                ..Default::default()
            },
            involved_object: ObjectReference {
                api_version: Some("v1".to_string()),
                kind: Some("Pod".to_string()),
                name: Some(key.name),
                namespace: Some(key.namespace),
                uid: pod.metadata.uid.clone(),
                resource_version: pod.metadata.resource_version.clone(),
                ..Default::default()
            },
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            type_: Some("Warning".to_string()),
            source: Some(EventSource {
                component: Some(COMPONENT.to_string()),
                host: Some(self.node_name.clone()),
            }),
            reporting_component: Some(COMPONENT.to_string()),
            reporting_instance: Some(self.node_name.clone()),
            first_timestamp: Some(Time(now)),
            last_timestamp: Some(Time(now)),
            event_time: Some(MicroTime(now)),
            count: Some(1),
            ..Default::default()
        }
    }
}
