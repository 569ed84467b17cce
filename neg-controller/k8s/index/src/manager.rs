//! Syncer lifecycle management and NEG garbage collection.
//!
//! The manager owns the syncer registry and the canonical record of which
//! service ports need NEGs. Registry mutations are serialized by one mutex;
//! cloud calls always happen outside it.

use crate::{
    cache::Cache,
    events::EventSink,
    metrics::Metrics,
    namer::NegNamer,
    syncer::{NegReconciler, Syncer},
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use anyhow::{Context, Result};
use neg_controller_core::{
    Backoff, Errors, NegCloud, PortNameMap, ServiceKey, SyncerKey, TargetPort,
};
use parking_lot::Mutex;
use std::{num::NonZeroU16, sync::Arc};

pub struct SyncerManager {
    namer: NegNamer,
    cloud: Arc<dyn NegCloud>,
    cache: Cache,
    events: Arc<dyn EventSink>,
    metrics: Metrics,
    backoff: Backoff,
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    /// The canonical indicator of which ports on a service need NEGs.
    svc_ports: HashMap<ServiceKey, PortNameMap>,

    /// Live (and recently stopped, not yet collected) syncers.
    syncers: HashMap<SyncerKey, Syncer>,
}

// === impl SyncerManager ===

impl SyncerManager {
    pub fn new(
        namer: NegNamer,
        cloud: Arc<dyn NegCloud>,
        cache: Cache,
        events: Arc<dyn EventSink>,
        metrics: Metrics,
        backoff: Backoff,
    ) -> Self {
        Self {
            namer,
            cloud,
            cache,
            events,
            metrics,
            backoff,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Diffs `ports` against the stored map for the service: stops syncers
    /// for removed ports, starts fresh ones for added ports, and leaves
    /// unchanged ports untouched. Start errors are aggregated.
    pub fn ensure_syncers(&self, service: &ServiceKey, ports: PortNameMap) -> Result<()> {
        let mut inner = self.inner.lock();
        let current = inner.svc_ports.get(service).cloned().unwrap_or_default();
        let removed = difference(&current, &ports);
        let added = difference(&ports, &current);
        inner.svc_ports.insert(service.clone(), ports);

        tracing::debug!(
            service = %service,
            removed = removed.len(),
            added = added.len(),
            "Ensuring syncers",
        );

        for (port, target_port) in removed {
            if let Some(syncer) = inner.syncers.get(&syncer_key(service, port, target_port)) {
                syncer.stop();
            }
        }

        let mut errors = Vec::new();
        for (port, target_port) in added {
            let key = syncer_key(service, port, target_port);
            // Any prior entry for this key is stopped or still shutting
            // down; it is replaced by a fresh worker and collected by GC.
            let syncer = self.mk_syncer(&key);
            if let Err(error) = syncer.start() {
                errors.push(error.context(format!("starting syncer for {}", key)));
            }
            if let Some(old) = inner.syncers.insert(key, syncer) {
                old.stop();
            }
        }
        Errors::ok_if_empty(errors)
    }

    /// Stops every syncer for the service and forgets its port map.
    pub fn stop_syncer(&self, service: &ServiceKey) {
        let mut inner = self.inner.lock();
        if let Some(ports) = inner.svc_ports.remove(service) {
            for (port, target_port) in ports {
                if let Some(syncer) = inner.syncers.get(&syncer_key(service, port, target_port)) {
                    syncer.stop();
                }
            }
        }
    }

    /// Pokes every running syncer for the service.
    pub fn sync(&self, service: &ServiceKey) {
        let inner = self.inner.lock();
        if let Some(ports) = inner.svc_ports.get(service) {
            for (port, target_port) in ports {
                let key = syncer_key(service, *port, target_port.clone());
                if let Some(syncer) = inner.syncers.get(&key) {
                    if !syncer.is_stopped() {
                        syncer.sync();
                    }
                }
            }
        }
    }

    /// Pokes every running syncer. Used when node topology changes.
    pub fn sync_all(&self) {
        let inner = self.inner.lock();
        for syncer in inner.syncers.values() {
            if !syncer.is_stopped() {
                syncer.sync();
            }
        }
    }

    /// Requests every syncer to stop. Asynchronous.
    pub fn shutdown(&self) {
        let inner = self.inner.lock();
        for syncer in inner.syncers.values() {
            syncer.stop();
        }
    }

    /// Garbage-collects fully-stopped syncers and orphaned NEGs.
    ///
    /// The syncer registry and the live-name snapshot are taken under the
    /// lock; all cloud calls happen after it is released. Orphans are
    /// deleted in the zones the aggregated listing observed them in, which
    /// covers zones no longer part of the cluster.
    pub async fn gc(&self) -> Result<()> {
        tracing::debug!("Starting NEG garbage collection");

        {
            let mut inner = self.inner.lock();
            inner
                .syncers
                .retain(|_, syncer| !syncer.is_stopped() || syncer.is_shutting_down());
        }

        let zoned = self
            .cloud
            .aggregated_list()
            .await
            .context("listing NEGs for garbage collection")?;

        let mut orphans: HashSet<String> = zoned
            .values()
            .flatten()
            .map(|neg| neg.name.clone())
            .filter(|name| self.namer.is_neg(name))
            .collect();
        {
            let inner = self.inner.lock();
            for (service, ports) in inner.svc_ports.iter() {
                for port in ports.keys() {
                    orphans.remove(&self.namer.neg(&service.namespace, &service.name, *port));
                }
            }
        }

        // A user racing to add the NEG annotation may lose a NEG here; the
        // next sync recreates it.
        let mut errors = Vec::new();
        for (zone, negs) in zoned.iter() {
            for neg in negs {
                if !orphans.contains(&neg.name) {
                    continue;
                }
                match self.cloud.delete(&neg.name, zone).await {
                    Ok(()) => {
                        self.metrics.neg_gc_deleted();
                        tracing::info!(neg = %neg.name, %zone, "Deleted orphaned NEG");
                    }
                    Err(error) if error.is_not_found() => {}
                    Err(error) => errors.push(
                        anyhow::Error::from(error)
                            .context(format!("deleting NEG {} in zone {}", neg.name, zone)),
                    ),
                }
            }
        }
        Errors::ok_if_empty(errors)
    }

    fn mk_syncer(&self, key: &SyncerKey) -> Syncer {
        let neg_name = self.namer.neg(&key.namespace, &key.name, key.port);
        let reconcile = NegReconciler::new(
            key.clone(),
            neg_name,
            self.cache.clone(),
            self.cloud.clone(),
            self.events.clone(),
            self.metrics.clone(),
        );
        Syncer::new(
            key.clone(),
            Arc::new(reconcile),
            self.events.clone(),
            self.metrics.clone(),
            self.backoff.clone(),
        )
    }

    /// The keys of syncers that have not been garbage-collected, for tests.
    #[cfg(test)]
    pub(crate) fn registered(&self) -> Vec<SyncerKey> {
        self.inner.lock().syncers.keys().cloned().collect()
    }

    /// The keys of syncers that are currently running, for tests.
    #[cfg(test)]
    pub(crate) fn running(&self) -> Vec<SyncerKey> {
        let inner = self.inner.lock();
        inner
            .syncers
            .iter()
            .filter(|(_, s)| !s.is_stopped() && !s.is_shutting_down())
            .map(|(key, _)| key.clone())
            .collect()
    }
}

impl std::fmt::Debug for SyncerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncerManager")
            .field("namer", &self.namer)
            .field("inner", &*self.inner.lock())
            .finish_non_exhaustive()
    }
}

fn syncer_key(service: &ServiceKey, port: NonZeroU16, target_port: TargetPort) -> SyncerKey {
    SyncerKey {
        namespace: service.namespace.clone(),
        name: service.name.clone(),
        port,
        target_port,
    }
}

/// The `(port, targetPort)` pairs present in `a` but not in `b`. A port
/// whose target changed shows up as both a removal and an addition.
fn difference(a: &PortNameMap, b: &PortNameMap) -> Vec<(NonZeroU16, TargetPort)> {
    a.iter()
        .filter(|(port, target)| b.get(port) != Some(target))
        .map(|(port, target)| (*port, target.clone()))
        .collect()
}
