//! Node ping controller.
//!
//! Probes the provider at a fixed interval with at most one probe in flight.
//! Each probe is bounded by the ping timeout (when set) and by cancellation;
//! its outcome is published on a watch channel that the lease and node
//! controllers read.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vk_errdefs::{Error, ErrorKind, Result};

use crate::provider::Provider;

/// Outcome of one provider ping.
#[derive(Debug, Clone)]
pub struct PingResult {
    /// When the probe started.
    pub at: DateTime<Utc>,

    /// Why the probe failed, if it did.
    pub error: Option<Arc<Error>>,
}

impl PingResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Source of the latest ping result.
#[async_trait]
pub trait PingStatus: Send + Sync {
    /// The most recent result, waiting for the first one if needed.
    async fn latest(&self, cancel: &CancellationToken) -> Result<PingResult>;
}

type InFlight = Shared<BoxFuture<'static, PingResult>>;

/// Single-flight, timeout-bounded provider health probe.
pub struct NodePingController {
    provider: Arc<dyn Provider>,
    interval: Duration,
    timeout: Option<Duration>,
    in_flight: Mutex<Option<InFlight>>,
    published: watch::Sender<Option<PingResult>>,
}

impl NodePingController {
    pub fn new(
        provider: Arc<dyn Provider>,
        interval: Duration,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        if interval.is_zero() {
            return Err(Error::invalid_input("ping interval must be nonzero"));
        }
        if timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::invalid_input("ping timeout must be nonzero when set"));
        }
        let (published, _) = watch::channel(None);
        Ok(Self {
            provider,
            interval,
            timeout,
            in_flight: Mutex::new(None),
            published,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Latest published result without waiting.
    pub fn current(&self) -> Option<PingResult> {
        self.published.borrow().clone()
    }

    /// Receiver notified on every published result.
    pub fn subscribe(&self) -> watch::Receiver<Option<PingResult>> {
        self.published.subscribe()
    }

    fn slot(&self) -> MutexGuard<'_, Option<InFlight>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Ping now, joining a probe already in flight instead of starting one.
    pub async fn ping_once(&self, cancel: &CancellationToken) -> PingResult {
        let probe = {
            let mut slot = self.slot();
            match slot.as_ref() {
                Some(probe) => probe.clone(),
                None => {
                    let probe = probe(self.provider.clone(), self.timeout, cancel.child_token())
                        .boxed()
                        .shared();
                    *slot = Some(probe.clone());
                    probe
                }
            }
        };

        let result = probe.clone().await;
        {
            let mut slot = self.slot();
            if slot.as_ref().is_some_and(|current| current.ptr_eq(&probe)) {
                *slot = None;
            }
        }

        self.published.send_replace(Some(result.clone()));
        result
    }

    /// Ping immediately, then every interval, until cancelled.
    ///
    /// Fires run in their own tasks so a stalled probe does not hold up the
    /// ticker; they collapse onto the in-flight probe. Returns an error only
    /// when a probe fails fatally.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            timeout_ms = self.timeout.map(|t| t.as_millis() as u64),
            "Starting node ping controller"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut fires = JoinSet::new();
        let mut healthy = None;

        let outcome = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                _ = ticker.tick() => {
                    let this = self.clone();
                    let cancel = cancel.clone();
                    fires.spawn(async move { this.ping_once(&cancel).await });
                }
                Some(joined) = fires.join_next() => {
                    let Ok(result) = joined else { continue };
                    match &result.error {
                        None => {
                            if healthy != Some(true) {
                                info!("Provider ping succeeded");
                            }
                            healthy = Some(true);
                        }
                        Some(err) if err.is(ErrorKind::Fatal) => {
                            error!(error = %err.report(), "Provider ping failed fatally");
                            break Err(Error::wrap(err.clone(), "node ping"));
                        }
                        Some(err) if err.is(ErrorKind::Cancelled) && cancel.is_cancelled() => {}
                        Some(err) => {
                            if healthy != Some(false) {
                                warn!(error = %err.report(), "Provider ping failed");
                            } else {
                                debug!(error = %err.report(), "Provider ping still failing");
                            }
                            healthy = Some(false);
                        }
                    }
                }
            }
        };

        fires.abort_all();
        info!("Node ping controller stopped");
        outcome
    }
}

#[async_trait]
impl PingStatus for NodePingController {
    async fn latest(&self, cancel: &CancellationToken) -> Result<PingResult> {
        let mut rx = self.published.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(result) = current {
                return Ok(result);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::cancelled()),
                changed = rx.changed() => changed.map_err(|_| Error::cancelled())?,
            }
        }
    }
}

/// One probe. Cancels `cancel` on the way out so a provider that is still
/// blocked sees it.
async fn probe(
    provider: Arc<dyn Provider>,
    timeout: Option<Duration>,
    cancel: CancellationToken,
) -> PingResult {
    let at = Utc::now();
    let attempt = AssertUnwindSafe(provider.ping(&cancel)).catch_unwind();
    let bounded = async {
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, attempt).await {
                Ok(outcome) => outcome,
                Err(_) => Ok(Err(Error::timeout(limit))),
            },
            None => attempt.await,
        }
    };

    let outcome = tokio::select! {
        _ = cancel.cancelled() => Err(Error::cancelled()),
        outcome = bounded => match outcome {
            Ok(outcome) => outcome,
            Err(panic) => Err(Error::fatal(format!(
                "provider ping panicked: {}",
                panic_message(panic.as_ref())
            ))),
        },
    };
    cancel.cancel();

    PingResult {
        at,
        error: outcome.err().map(Arc::new),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
