//! Wiring and supervision.
//!
//! [`Agent`] builds every component against one control plane and one
//! provider. [`Agent::start`] brings them up in order:
//!
//! ```text
//! describe ─▶ first ping ─▶ register node ─▶ spawn controllers ─▶ reflector synced ─▶ ready
//! ```
//!
//! Each component runs under a child of the root cancellation. A component
//! that fails fatally cancels the root; shutdown then drains every task
//! within its budget and abandons what is left.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use vk_errdefs::{Error, ErrorKind, Result};
use vk_reconcile::{BackoffPolicy, WorkQueue};

use crate::config::Config;
use crate::control_plane::{ControlPlane, PodScope};
use crate::events::EventRecorder;
use crate::lease::{LeaseController, LeaseState};
use crate::node::{NodeConfig, NodeController};
use crate::ping::{NodePingController, PingStatus};
use crate::provider::Provider;
use crate::reconciler::Reconciler;
use crate::reflector::{PodStore, Reflector};
use crate::status::{MirrorConfig, StatusMirror, StatusWriter};
use crate::workload::WorkloadKey;

/// Full relist cadence of the reflector.
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Everything [`Agent`] needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub node: NodeConfig,
    pub scope: PodScope,
    pub ping_interval: Duration,
    pub ping_timeout: Option<Duration>,
    pub lease_renew_interval: Duration,
    pub resync_interval: Duration,
    pub mirror: MirrorConfig,
    pub pod_sync_workers: usize,
    pub shutdown_timeout: Duration,
}

impl From<&Config> for AgentSettings {
    fn from(config: &Config) -> Self {
        Self {
            node: config.node_config(),
            scope: config.pod_scope(),
            ping_interval: config.ping_interval,
            ping_timeout: config.ping_timeout,
            lease_renew_interval: config.lease_renew_interval,
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            mirror: config.mirror_config(),
            pod_sync_workers: config.pod_sync_workers,
            shutdown_timeout: config.shutdown_timeout,
        }
    }
}

/// The assembled, not yet running agent.
pub struct Agent {
    settings: AgentSettings,
    ping: Arc<NodePingController>,
    node: Arc<NodeController>,
    lease: Arc<LeaseController>,
    reflector: Arc<Reflector>,
    reconciler: Arc<Reconciler>,
    mirror: Arc<StatusMirror>,
    ready: watch::Sender<bool>,
}

impl Agent {
    pub fn new(
        settings: AgentSettings,
        control_plane: Arc<dyn ControlPlane>,
        provider: Arc<dyn Provider>,
    ) -> Result<Self> {
        if settings.shutdown_timeout.is_zero() {
            return Err(Error::invalid_input("shutdown timeout must be nonzero"));
        }
        let node_name = settings.node.name.clone();

        let ping = Arc::new(NodePingController::new(
            provider.clone(),
            settings.ping_interval,
            settings.ping_timeout,
        )?);
        let node = Arc::new(NodeController::new(
            settings.node.clone(),
            control_plane.clone(),
            provider.clone(),
        )?);
        let lease = Arc::new(LeaseController::new(
            control_plane.clone(),
            ping.clone() as Arc<dyn PingStatus>,
            Arc::new(node.handle()),
            node_name.clone(),
            settings.lease_renew_interval,
        )?);

        let queue: Arc<WorkQueue<WorkloadKey>> = Arc::new(WorkQueue::new(
            BackoffPolicy::new(Duration::from_millis(500), Duration::from_secs(300)).with_jitter(0.2),
        ));
        let reflector = Arc::new(Reflector::new(
            control_plane.clone(),
            settings.scope.clone(),
            queue.clone(),
            settings.resync_interval,
        ));
        let writer = Arc::new(StatusWriter::new(control_plane.clone()));
        let reconciler = Arc::new(Reconciler::new(
            provider.clone(),
            control_plane.clone(),
            reflector.store(),
            queue.clone(),
            writer.clone(),
            EventRecorder::new(control_plane, node_name),
            settings.pod_sync_workers,
        )?);
        let mirror = Arc::new(StatusMirror::new(
            provider,
            reflector.store(),
            writer,
            queue,
            settings.mirror.clone(),
        )?);

        let (ready, _) = watch::channel(false);
        Ok(Self {
            settings,
            ping,
            node,
            lease,
            reflector,
            reconciler,
            mirror,
            ready,
        })
    }

    /// Flips to `true` once the agent is ready, and stays there.
    pub fn readiness(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }

    pub fn store(&self) -> PodStore {
        self.reflector.store()
    }

    pub fn lease_state(&self) -> watch::Receiver<LeaseState> {
        self.lease.subscribe()
    }

    /// Bring every component up under `root`.
    ///
    /// Fails with `Cancelled` if `root` fires first, and with the underlying
    /// error if a startup step fails permanently.
    pub async fn start(self, root: CancellationToken) -> Result<RunningAgent> {
        let node_name = self.settings.node.name.clone();
        info!(node = %node_name, "Starting agent");

        let node = &*self.node;
        let cancel = &root;
        retry_startup("describe node", cancel, move || node.describe(cancel)).await?;

        let mut running = RunningAgent::new(root.clone(), self.settings.shutdown_timeout);
        running.spawn("ping", self.ping.clone().run(root.child_token()));

        let first = self.ping.latest(&root).await.map_err(|e| running.abort_with(e))?;
        match &first.error {
            None => info!(node = %node_name, "First provider ping succeeded"),
            Some(e) => warn!(node = %node_name, error = %e.report(), "First provider ping failed"),
        }

        if let Err(e) = retry_startup("register node", cancel, move || node.register(cancel)).await {
            return Err(running.abort_with(e));
        }

        running.spawn(
            "node",
            self.node.clone().run(
                root.child_token(),
                self.ping.subscribe(),
                self.lease.subscribe(),
            ),
        );
        running.spawn("reflector", self.reflector.clone().run(root.child_token()));
        running.spawn(
            "reconciler",
            self.reconciler
                .clone()
                .run(root.child_token(), self.reflector.subscribe_synced()),
        );
        running.spawn("status", self.mirror.clone().run(root.child_token()));
        running.spawn(
            "lease",
            self.lease.clone().run(root.child_token(), self.ready.subscribe()),
        );

        let mut synced = self.reflector.subscribe_synced();
        let ready = self.ready;
        let gate = root.child_token();
        running.spawn("readiness", async move {
            tokio::select! {
                _ = gate.cancelled() => {}
                waited = synced.wait_for(|s| *s) => {
                    if waited.is_ok() {
                        ready.send_replace(true);
                        info!(node = %node_name, "Agent is ready");
                    }
                }
            }
            Ok(())
        });

        Ok(running)
    }
}

/// Retry a startup step on retryable errors until it succeeds or `cancel`
/// fires.
async fn retry_startup<T, F, Fut>(what: &str, cancel: &CancellationToken, mut step: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let backoff = BackoffPolicy::new(Duration::from_millis(500), Duration::from_secs(30)).with_jitter(0.2);
    let mut attempt = 0;
    loop {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::cancelled()),
            outcome = step() => outcome,
        };
        match outcome {
            Ok(value) => return Ok(value),
            Err(e) if e.kind().is_retryable() => {
                let delay = e.retry_after().unwrap_or_else(|| backoff.delay(attempt));
                warn!(step = what, error = %e.report(), retry_in_ms = delay.as_millis() as u64, "Startup step failed");
                attempt += 1;
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::cancelled()),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => return Err(Error::wrap(e, what.to_string())),
        }
    }
}

/// Supervised component tasks.
pub struct RunningAgent {
    root: CancellationToken,
    tasks: JoinSet<(&'static str, Result<()>)>,
    running: BTreeSet<&'static str>,
    shutdown_timeout: Duration,
}

impl RunningAgent {
    fn new(root: CancellationToken, shutdown_timeout: Duration) -> Self {
        Self {
            root,
            tasks: JoinSet::new(),
            running: BTreeSet::new(),
            shutdown_timeout,
        }
    }

    /// Supervise one more task.
    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.running.insert(name);
        self.tasks.spawn(async move { (name, task.await) });
    }

    /// Names of tasks that have not finished.
    pub fn running(&self) -> Vec<&'static str> {
        self.running.iter().copied().collect()
    }

    /// Request shutdown.
    pub fn shutdown(&self) {
        self.root.cancel();
    }

    fn abort_with(&mut self, err: Error) -> Error {
        self.root.cancel();
        self.tasks.abort_all();
        err
    }

    /// Run until the root is cancelled or a component fails, then drain.
    ///
    /// Returns the first component error, or `Ok` for a requested shutdown.
    pub async fn wait(mut self) -> Result<()> {
        let outcome = loop {
            tokio::select! {
                _ = self.root.cancelled() => break Ok(()),
                joined = self.tasks.join_next() => match joined {
                    Some(Ok((name, result))) => {
                        self.running.remove(name);
                        match result {
                            Ok(()) => info!(component = name, "Component exited"),
                            Err(e) => {
                                error!(component = name, error = %e.report(), "Component failed, shutting down");
                                break Err(e);
                            }
                        }
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Component task aborted, shutting down");
                        break Err(Error::fatal(format!("component task failed: {e}")));
                    }
                    None => break Ok(()),
                },
            }
        };

        self.root.cancel();
        self.drain().await;
        outcome
    }

    async fn drain(&mut self) {
        info!(components = self.running.len(), "Draining components");
        let deadline = tokio::time::Instant::now() + self.shutdown_timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.tasks.join_next()).await {
                Ok(Some(Ok((name, result)))) => {
                    self.running.remove(name);
                    if let Err(e) = result {
                        if !e.is(ErrorKind::Cancelled) {
                            warn!(component = name, error = %e.report(), "Component failed while draining");
                        }
                    }
                }
                Ok(Some(Err(e))) => warn!(error = %e, "Component task aborted while draining"),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        components = ?self.running,
                        timeout_ms = self.shutdown_timeout.as_millis() as u64,
                        "Abandoning components that did not drain"
                    );
                    self.tasks.abort_all();
                    break;
                }
            }
        }
        info!("Agent stopped");
    }
}
