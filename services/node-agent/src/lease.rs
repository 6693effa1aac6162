//! Lease controller.
//!
//! Renews the node lease in `kube-node-lease` as the primary liveness signal.
//! A tick renews only when the latest provider ping succeeded, so a sick
//! provider lets the lease lapse.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta, OwnerReference};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vk_errdefs::{Error, ErrorKind, Result};

use crate::control_plane::{ControlPlane, LEASE_NAMESPACE};
use crate::ping::PingStatus;

/// Lease duration as a multiple of the renewal interval.
pub const LEASE_DURATION_FACTOR: f64 = 25.0;

/// Pause between deleting a clashing lease and creating it again.
const RECREATE_DELAY: Duration = Duration::from_millis(100);

const MAX_CREATE_ATTEMPTS: u32 = 5;

/// Where lease establishment stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    /// No outcome yet.
    Pending,
    /// At least one create or renewal succeeded.
    Established,
    /// The control plane does not support leases; the controller stopped.
    FailedToEstablish,
}

/// Source of the node object that owns the lease.
#[async_trait]
pub trait ServerNode: Send + Sync {
    async fn node(&self, cancel: &CancellationToken) -> Result<Node>;
}

/// Outcome of a single tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Renewed,
    /// The latest ping failed; nothing was written.
    Skipped,
    /// Lease creation was refused as unsupported before it ever worked.
    Unsupported,
}

/// The controller's view of the server-side lease.
#[derive(Debug, Default)]
pub struct LeaseSlot {
    lease: Option<Lease>,
    /// Re-read before the next write.
    stale: bool,
}

/// Periodic lease renewal.
pub struct LeaseController {
    control_plane: Arc<dyn ControlPlane>,
    ping: Arc<dyn PingStatus>,
    node: Arc<dyn ServerNode>,
    node_name: String,
    renew_interval: Duration,
    state: watch::Sender<LeaseState>,
}

impl LeaseController {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        ping: Arc<dyn PingStatus>,
        node: Arc<dyn ServerNode>,
        node_name: impl Into<String>,
        renew_interval: Duration,
    ) -> Result<Self> {
        if renew_interval.is_zero() {
            return Err(Error::invalid_input("lease renewal interval must be nonzero"));
        }
        let (state, _) = watch::channel(LeaseState::Pending);
        Ok(Self {
            control_plane,
            ping,
            node,
            node_name: node_name.into(),
            renew_interval,
            state,
        })
    }

    pub fn state(&self) -> LeaseState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LeaseState> {
        self.state.subscribe()
    }

    /// Lease duration advertised to the control plane.
    pub fn lease_duration_seconds(&self) -> i32 {
        (self.renew_interval.as_secs_f64() * LEASE_DURATION_FACTOR)
            .ceil()
            .max(1.0) as i32
    }

    /// Wait for `ready`, then renew every interval until cancelled.
    ///
    /// Returns `Ok` on cancellation and when leases turn out to be
    /// unsupported; returns an error only for fatal conditions.
    pub async fn run(
        self: Arc<Self>,
        cancel: CancellationToken,
        mut ready: watch::Receiver<bool>,
    ) -> Result<()> {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            gate = ready.wait_for(|ready| *ready) => {
                if gate.is_err() {
                    return Ok(());
                }
            }
        }

        info!(
            node = %self.node_name,
            interval_ms = self.renew_interval.as_millis() as u64,
            duration_secs = self.lease_duration_seconds(),
            "Starting lease controller"
        );

        let mut slot = LeaseSlot::default();
        loop {
            let delay = match self.tick(&mut slot, &cancel).await {
                Ok(Tick::Unsupported) => return Ok(()),
                Ok(_) => self.renew_interval,
                Err(e) if e.is(ErrorKind::Cancelled) => return Ok(()),
                Err(e) if e.is(ErrorKind::Fatal) => {
                    error!(node = %self.node_name, error = %e.report(), "Lease controller failed");
                    return Err(e);
                }
                Err(e) => {
                    warn!(node = %self.node_name, error = %e.report(), "Lease renewal failed");
                    e.retry_after().unwrap_or(self.renew_interval)
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One renewal attempt.
    pub async fn tick(&self, slot: &mut LeaseSlot, cancel: &CancellationToken) -> Result<Tick> {
        let ping = self.ping.latest(cancel).await?;
        if let Some(err) = &ping.error {
            debug!(node = %self.node_name, error = %err.report(), "Skipping lease renewal, ping failed");
            return Ok(Tick::Skipped);
        }

        let node = self.node.node(cancel).await?;

        if slot.stale {
            slot.lease = match self.control_plane.get_lease(LEASE_NAMESPACE, &self.node_name).await {
                Ok(lease) => Some(lease),
                Err(e) if e.is(ErrorKind::NotFound) => None,
                Err(e) => return Err(e),
            };
            slot.stale = false;
        }

        let mut desired = slot.lease.clone().unwrap_or_else(|| self.new_lease());
        self.stamp(&mut desired, &node);

        if desired.metadata.uid.is_none() {
            return self.establish(slot, &desired, cancel).await;
        }

        match self.control_plane.update_lease(&desired).await {
            Ok(updated) => {
                debug!(node = %self.node_name, "Renewed lease");
                slot.lease = Some(updated);
                self.mark_established();
                Ok(Tick::Renewed)
            }
            Err(e) if e.is(ErrorKind::Conflict) => {
                slot.stale = true;
                Err(e)
            }
            Err(e) if e.is(ErrorKind::NotFound) => {
                slot.lease = None;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn establish(
        &self,
        slot: &mut LeaseSlot,
        desired: &Lease,
        cancel: &CancellationToken,
    ) -> Result<Tick> {
        match self.create(desired, cancel).await {
            Ok(created) => {
                slot.lease = Some(created);
                self.mark_established();
                Ok(Tick::Renewed)
            }
            Err(e) if e.is(ErrorKind::NotFound) || e.is(ErrorKind::InvalidInput) => {
                if self.state() == LeaseState::Pending {
                    warn!(
                        node = %self.node_name,
                        error = %e.report(),
                        "Control plane does not support node leases, relying on node status updates"
                    );
                    self.state.send_replace(LeaseState::FailedToEstablish);
                    Ok(Tick::Unsupported)
                } else {
                    // The refusal is reclassified, so it is not kept as a tagged cause.
                    Err(Error::fatal(format!(
                        "lease for node {} was refused after it had been established: {}",
                        self.node_name,
                        e.report()
                    )))
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Create the lease, deleting and recreating a clashing one a bounded
    /// number of times.
    async fn create(&self, desired: &Lease, cancel: &CancellationToken) -> Result<Lease> {
        for attempt in 1..=MAX_CREATE_ATTEMPTS {
            let err = match self.control_plane.create_lease(desired).await {
                Ok(created) => {
                    info!(node = %self.node_name, "Created node lease");
                    return Ok(created);
                }
                Err(e) if e.is(ErrorKind::AlreadyExists) || e.is(ErrorKind::Conflict) => e,
                Err(e) => return Err(e),
            };

            warn!(node = %self.node_name, attempt, error = %err.report(), "Lease already exists, recreating");
            match self
                .control_plane
                .delete_lease(LEASE_NAMESPACE, &self.node_name)
                .await
            {
                Ok(()) => {}
                Err(e) if e.is(ErrorKind::NotFound) => {}
                Err(e) => return Err(e),
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::cancelled()),
                _ = tokio::time::sleep(RECREATE_DELAY) => {}
            }
        }

        Err(Error::conflict(format!(
            "lease for node {} still clashes after {MAX_CREATE_ATTEMPTS} attempts",
            self.node_name
        )))
    }

    fn mark_established(&self) {
        self.state.send_if_modified(|state| {
            if *state == LeaseState::Established {
                return false;
            }
            info!(node = %self.node_name, "Node lease established");
            *state = LeaseState::Established;
            true
        });
    }

    fn new_lease(&self) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.node_name.clone()),
                namespace: Some(LEASE_NAMESPACE.to_string()),
                ..Default::default()
            },
            spec: Some(LeaseSpec::default()),
        }
    }

    fn stamp(&self, lease: &mut Lease, node: &Node) {
        let spec = lease.spec.get_or_insert_with(LeaseSpec::default);
        spec.holder_identity = Some(self.node_name.clone());
        spec.lease_duration_seconds = Some(self.lease_duration_seconds());
        spec.renew_time = Some(MicroTime(Utc::now()));
        set_node_owner(&mut lease.metadata, node);
    }
}

/// Point the lease's owner reference at `node`, replacing a stale node
/// reference and leaving other owners alone.
pub fn set_node_owner(meta: &mut ObjectMeta, node: &Node) {
    let (Some(name), Some(uid)) = (&node.metadata.name, &node.metadata.uid) else {
        return;
    };
    let owners = meta.owner_references.get_or_insert_with(Vec::new);
    let current = owners
        .iter()
        .any(|o| o.api_version == "v1" && o.kind == "Node" && &o.name == name && &o.uid == uid);
    if current {
        return;
    }
    owners.retain(|o| o.kind != "Node");
    owners.push(OwnerReference {
        api_version: "v1".to_string(),
        kind: "Node".to_string(),
        name: name.clone(),
        uid: uid.clone(),
        ..Default::default()
    });
}
