//! The per-port syncer: a single-flight, debounced, backoff-driven
//! reconciliation loop.
//!
//! Each syncer owns the NEGs for one `(service, port, targetPort)` while it
//! runs. Pokes from watch handlers set a dirty flag and wake the loop; a
//! burst of endpoint updates during a rollout collapses into at most one
//! follow-up reconciliation. Stop is cooperative: the loop observes the
//! shutdown request at iteration boundaries, so an in-flight cloud call is
//! never cancelled.

use crate::{cache::Cache, endpoints, events::EventSink, metrics::Metrics};
use anyhow::{bail, Context, Result};
use neg_controller_core::{
    Backoff, CloudError, EndpointSet, NegCloud, NetworkEndpointGroup, SyncerKey,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Stopped,
    Running,
    ShuttingDown,
}

#[derive(Debug)]
struct Flags {
    state: State,
    dirty: bool,
}

pub(crate) struct Syncer {
    shared: Arc<Shared>,
}

struct Shared {
    key: SyncerKey,
    reconcile: Arc<dyn Reconcile>,
    events: Arc<dyn EventSink>,
    metrics: Metrics,
    backoff: Backoff,
    flags: Mutex<Flags>,
    wake: Notify,
}

/// The reconciliation body the loop drives. Split from the loop so the state
/// machine can be exercised with a scripted body.
#[async_trait::async_trait]
pub(crate) trait Reconcile: Send + Sync + 'static {
    async fn reconcile(&self) -> Result<()>;
}

// === impl Syncer ===

impl Syncer {
    pub(crate) fn new(
        key: SyncerKey,
        reconcile: Arc<dyn Reconcile>,
        events: Arc<dyn EventSink>,
        metrics: Metrics,
        backoff: Backoff,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                key,
                reconcile,
                events,
                metrics,
                backoff,
                flags: Mutex::new(Flags {
                    state: State::Stopped,
                    dirty: false,
                }),
                wake: Notify::new(),
            }),
        }
    }

    /// Starts the worker and schedules an immediate sync. Fails unless the
    /// syncer is stopped.
    pub(crate) fn start(&self) -> Result<()> {
        {
            let mut flags = self.shared.flags.lock();
            match flags.state {
                State::Stopped => {
                    flags.state = State::Running;
                    flags.dirty = true;
                }
                State::Running => bail!("syncer {} is already running", self.shared.key),
                State::ShuttingDown => bail!("syncer {} is shutting down", self.shared.key),
            }
        }
        tokio::spawn(Shared::run(self.shared.clone()));
        Ok(())
    }

    /// Requests a stop and returns immediately; the worker exits at the next
    /// iteration boundary.
    pub(crate) fn stop(&self) {
        let signal = {
            let mut flags = self.shared.flags.lock();
            if flags.state == State::Running {
                flags.state = State::ShuttingDown;
                true
            } else {
                false
            }
        };
        if signal {
            tracing::debug!(syncer = %self.shared.key, "Stopping");
            self.shared.wake.notify_one();
        }
    }

    /// Pokes the loop. Returns false when the syncer is not running.
    pub(crate) fn sync(&self) -> bool {
        {
            let mut flags = self.shared.flags.lock();
            if flags.state != State::Running {
                return false;
            }
            flags.dirty = true;
        }
        self.shared.wake.notify_one();
        true
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.shared.flags.lock().state == State::Stopped
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shared.flags.lock().state == State::ShuttingDown
    }
}

impl std::fmt::Debug for Syncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Syncer")
            .field("key", &self.shared.key)
            .field("flags", &*self.shared.flags.lock())
            .finish_non_exhaustive()
    }
}

// === impl Shared ===

impl Shared {
    async fn run(self: Arc<Self>) {
        tracing::debug!(syncer = %self.key, "Started");
        let mut backoff = self.backoff.clone();
        loop {
            // Park until a sync is requested or the syncer is stopped. The
            // wake future is created before the checks so a poke landing
            // between them is not lost.
            loop {
                let wake = self.wake.notified();
                if self.observe_shutdown() {
                    return;
                }
                if self.take_dirty() {
                    break;
                }
                wake.await;
            }

            // At most one reconciliation runs at a time; pokes that arrive
            // while it is in flight coalesce into one follow-up pass.
            loop {
                if self.observe_shutdown() {
                    return;
                }
                self.metrics.sync();
                match self.reconcile.reconcile().await {
                    Ok(()) => {
                        backoff.reset();
                        tracing::debug!(syncer = %self.key, "Synced");
                        break;
                    }
                    Err(error) => {
                        self.metrics.sync_failure();
                        match backoff.next_delay() {
                            Ok(delay) => {
                                tracing::warn!(
                                    syncer = %self.key,
                                    %error,
                                    ?delay,
                                    "Sync failed; retrying",
                                );
                                // A stop request (or a fresh poke) cuts the
                                // backoff wait short; the loop re-checks its
                                // state before the next attempt.
                                tokio::select! {
                                    _ = tokio::time::sleep(delay) => {}
                                    _ = self.wake.notified() => {}
                                }
                            }
                            Err(_) => {
                                tracing::warn!(
                                    syncer = %self.key,
                                    %error,
                                    "Sync failed and retries are exhausted",
                                );
                                self.events.warn(
                                    &self.key.service_key(),
                                    "SyncNetworkEndpointGroupFailed",
                                    format!("Failed to sync NEGs for {}: {}", self.key, error),
                                );
                                // Park until the inputs change; the next poke
                                // starts a fresh schedule.
                                backoff.reset();
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Completes a requested shutdown at an iteration boundary.
    fn observe_shutdown(&self) -> bool {
        let mut flags = self.flags.lock();
        if flags.state == State::ShuttingDown {
            flags.state = State::Stopped;
            flags.dirty = false;
            tracing::debug!(syncer = %self.key, "Stopped");
            true
        } else {
            false
        }
    }

    fn take_dirty(&self) -> bool {
        let mut flags = self.flags.lock();
        std::mem::replace(&mut flags.dirty, false)
    }
}

/// Converges the cloud NEGs for one syncer key onto the calculated desired
/// state.
pub(crate) struct NegReconciler {
    key: SyncerKey,
    neg_name: String,
    cache: Cache,
    cloud: Arc<dyn NegCloud>,
    events: Arc<dyn EventSink>,
    metrics: Metrics,
}

// === impl NegReconciler ===

impl NegReconciler {
    pub(crate) fn new(
        key: SyncerKey,
        neg_name: String,
        cache: Cache,
        cloud: Arc<dyn NegCloud>,
        events: Arc<dyn EventSink>,
        metrics: Metrics,
    ) -> Self {
        Self {
            key,
            neg_name,
            cache,
            cloud,
            events,
            metrics,
        }
    }

    /// Makes sure the NEG exists in `zone`, creating it lazily. A racing
    /// garbage collection may have deleted and lost to a concurrent create;
    /// `AlreadyExists` is success.
    async fn ensure_neg(&self, zone: &str) -> Result<()> {
        match self.cloud.get(&self.neg_name, zone).await {
            Ok(_) => return Ok(()),
            Err(CloudError::NotFound) => {}
            Err(error) => return Err(error).context("reading NEG"),
        }

        let neg = NetworkEndpointGroup {
            name: self.neg_name.clone(),
            zone: zone.to_string(),
            network_url: self.cloud.network_url().to_string(),
            subnetwork_url: self.cloud.subnetwork_url().to_string(),
            description: self.key.to_string(),
        };
        match self.cloud.create(&neg).await {
            Ok(()) => {
                tracing::info!(neg = %self.neg_name, %zone, "Created NEG");
                self.events.normal(
                    &self.key.service_key(),
                    "Create",
                    format!("Created NEG {} in zone {}", self.neg_name, zone),
                );
                Ok(())
            }
            Err(CloudError::AlreadyExists) => Ok(()),
            Err(error) => Err(error).context("creating NEG"),
        }
    }

    async fn sync_zone(&self, zone: &str, desired: EndpointSet) -> Result<()> {
        self.ensure_neg(zone).await?;

        let current = self.cloud.list_endpoints(&self.neg_name, zone).await?;
        let to_detach: Vec<_> = current.difference(&desired).cloned().collect();
        let to_attach: Vec<_> = desired.difference(&current).cloned().collect();

        // Detach before attach so the NEG never transiently exceeds its
        // steady-state size.
        if !to_detach.is_empty() {
            tracing::debug!(neg = %self.neg_name, %zone, count = to_detach.len(), "Detaching");
            self.cloud.detach(&self.neg_name, zone, to_detach).await?;
        }
        if !to_attach.is_empty() {
            tracing::debug!(neg = %self.neg_name, %zone, count = to_attach.len(), "Attaching");
            self.cloud.attach(&self.neg_name, zone, to_attach).await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Reconcile for NegReconciler {
    async fn reconcile(&self) -> Result<()> {
        let (desired, mut zones) = self.cache.with_state(|state| {
            (
                endpoints::desired_state(state, &self.key, &self.metrics),
                state.nodes().zones(),
            )
        });

        // The NEG is kept (empty) in every cluster zone, and emptied in
        // zones that only appear in stale cloud state.
        zones.extend(desired.keys().cloned());

        for zone in &zones {
            let want = desired.get(zone).cloned().unwrap_or_default();
            self.sync_zone(zone, want)
                .await
                .with_context(|| format!("NEG {} in zone {}", self.neg_name, zone))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        events::{NoopEventSink, RecordingEventSink},
        tests::eventually,
    };
    use neg_controller_core::TargetPort;
    use std::{
        num::NonZeroU16,
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        time::Duration,
    };
    use tokio::sync::Semaphore;

    /// A scripted reconciliation body: counts invocations, optionally fails,
    /// and optionally blocks on a gate the test releases one pass at a time.
    #[derive(Debug)]
    struct Scripted {
        syncs: AtomicUsize,
        fail: AtomicBool,
        gate: Option<Arc<Semaphore>>,
    }

    impl Scripted {
        fn new(gate: Option<Arc<Semaphore>>) -> Arc<Self> {
            Arc::new(Self {
                syncs: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
                gate,
            })
        }

        fn syncs(&self) -> usize {
            self.syncs.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Reconcile for Scripted {
        async fn reconcile(&self) -> Result<()> {
            self.syncs.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.acquire().await.expect("gate closed").forget();
            }
            if self.fail.load(Ordering::SeqCst) {
                bail!("scripted failure");
            }
            Ok(())
        }
    }

    fn mk_syncer(reconcile: Arc<dyn Reconcile>, events: Arc<dyn EventSink>) -> Syncer {
        let key = SyncerKey {
            namespace: "default".into(),
            name: "foo".into(),
            port: NonZeroU16::new(80).unwrap(),
            target_port: TargetPort::Name("http".into()),
        };
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(10), 3);
        Syncer::new(key, reconcile, events, Metrics::default(), backoff)
    }

    #[tokio::test(start_paused = true)]
    async fn start_and_stop() {
        let gate = Arc::new(Semaphore::new(0));
        let body = Scripted::new(Some(gate.clone()));
        let syncer = mk_syncer(body.clone(), Arc::new(NoopEventSink));

        assert!(syncer.is_stopped());
        assert!(!syncer.is_shutting_down());
        assert!(!syncer.sync(), "poking a stopped syncer is a no-op");

        syncer.start().expect("start");
        assert!(!syncer.is_stopped());
        assert!(syncer.start().is_err(), "start requires Stopped");

        // The immediate sync is now blocked inside the body; a stop request
        // leaves the syncer shutting down until the body returns.
        eventually("first sync", || body.syncs() == 1).await;
        syncer.stop();
        assert!(syncer.is_shutting_down());
        assert!(!syncer.is_stopped());

        gate.add_permits(1);
        eventually("stop", || syncer.is_stopped() && !syncer.is_shutting_down()).await;

        // A stopped syncer can be restarted.
        syncer.start().expect("restart");
        gate.add_permits(1);
        eventually("second sync", || body.syncs() == 2).await;
        syncer.stop();
        eventually("stopped again", || syncer.is_stopped()).await;
    }

    #[tokio::test(start_paused = true)]
    async fn pokes_coalesce_into_one_follow_up() {
        let gate = Arc::new(Semaphore::new(0));
        let body = Scripted::new(Some(gate.clone()));
        let syncer = mk_syncer(body.clone(), Arc::new(NoopEventSink));

        syncer.start().expect("start");
        eventually("first sync in flight", || body.syncs() == 1).await;

        for _ in 0..100 {
            assert!(syncer.sync());
        }

        // Release the in-flight pass and the single coalesced follow-up.
        gate.add_permits(1);
        eventually("follow-up", || body.syncs() == 2).await;
        gate.add_permits(1);

        // No further passes happen without a new poke.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(body.syncs(), 2);

        syncer.stop();
        eventually("stopped", || syncer.is_stopped()).await;
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_exhaustion_then_parks() {
        let body = Scripted::new(None);
        body.fail.store(true, Ordering::SeqCst);
        let events = Arc::new(RecordingEventSink::default());
        let syncer = mk_syncer(body.clone(), events.clone());

        syncer.start().expect("start");

        // One initial attempt plus max_retries retries, then a warning event
        // and no further attempts.
        eventually("retries", || body.syncs() == 4).await;
        eventually("failure event", || {
            events.reasons().contains(&"SyncNetworkEndpointGroupFailed")
        })
        .await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(body.syncs(), 4);

        // A fresh poke resumes with a reset schedule.
        body.fail.store(false, Ordering::SeqCst);
        assert!(syncer.sync());
        eventually("resumed", || body.syncs() == 5).await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(body.syncs(), 5);
    }
}
