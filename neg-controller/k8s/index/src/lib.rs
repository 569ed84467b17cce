#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! NEG controller indexing and reconciliation.
//!
//! The controller observes Services annotated for container-native load
//! balancing and converges one zonal network endpoint group per
//! `(service, port, targetPort)` onto the ready pod endpoints:
//!
//! - The [`Index`] receives Service, Endpoints, Node and Ingress watch events
//!   (via `kubert::index`) and keeps the cluster [`Cache`] current.
//! - Service changes are folded into the set of ports that require NEGs and
//!   handed to the [`SyncerManager`], which starts and stops one syncer task
//!   per port.
//! - Each syncer computes the desired `zone -> endpoints` map from the cache
//!   and converges its NEGs through the cloud facade with attach/detach
//!   deltas, retrying on a backoff schedule.
//! - Garbage collection reconciles the universe of cluster-owned NEGs
//!   against the declared set.
//!
//! Lookups against the cache are read-only; all cache mutation happens on the
//! indexing tasks. No cloud I/O ever happens under the manager's lock.

pub mod annotations;
mod cache;
mod endpoints;
mod events;
mod ingress;
mod manager;
mod metrics;
mod namer;
mod node;
mod service;
mod syncer;
#[cfg(test)]
mod tests;

pub use self::{
    annotations::Features,
    cache::Cache,
    events::{EventSink, KubeEventSink, NoopEventSink},
    manager::SyncerManager,
    metrics::Metrics,
    namer::NegNamer,
};
use self::ingress::IngressIndex;
use neg_controller_core::{PortNameMap, ServiceKey};
use neg_controller_k8s_api as k8s;
use parking_lot::RwLock;
use std::sync::Arc;

pub type SharedIndex = Arc<RwLock<Index>>;

/// Folds watch events into the cluster cache and drives syncer lifecycles.
///
/// Owned behind a `RwLock` so that several `kubert::index` tasks can feed it;
/// the handlers themselves never block on cloud I/O.
#[derive(Debug)]
pub struct Index {
    cache: Cache,
    manager: Arc<SyncerManager>,
    ingresses: IngressIndex,
    features: Features,
    events: Arc<dyn EventSink>,
}

// === impl Index ===

impl Index {
    pub fn shared(
        cache: Cache,
        manager: Arc<SyncerManager>,
        features: Features,
        events: Arc<dyn EventSink>,
    ) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            cache,
            manager,
            ingresses: IngressIndex::default(),
            features,
            events,
        }))
    }

    /// Recomputes the ports that need NEGs for a service and reconciles the
    /// syncer population against them.
    fn reensure_service(&self, key: &ServiceKey) {
        let Some(svc) = self.cache.service(key) else {
            self.manager.stop_syncer(key);
            return;
        };

        let ports = self.required_ports(key, &svc);
        if ports.is_empty() {
            self.manager.stop_syncer(key);
            return;
        }

        tracing::debug!(service = %key, ports = ports.len(), "Ensuring syncers");
        if let Err(error) = self.manager.ensure_syncers(key, ports) {
            tracing::warn!(%error, service = %key, "Failed to start syncers");
        }
        self.manager.sync(key);
    }

    /// Decodes the service's NEG intent into a port map. Parse failures are
    /// surfaced as Warning events and leave the service NEG-disabled.
    fn required_ports(&self, key: &ServiceKey, svc: &k8s::Service) -> PortNameMap {
        let anns = annotations::ServiceAnnotations::from_service(svc);

        let neg = match anns.neg_annotation() {
            Ok(neg) => neg,
            Err(annotations::InvalidAnnotation::NegMissing) => return PortNameMap::default(),
            Err(error) => {
                tracing::info!(%error, service = %key, "Invalid NEG annotation");
                self.events.warn(key, "InvalidAnnotation", error.to_string());
                return PortNameMap::default();
            }
        };

        // Surface an unsupported application protocol, but let the service
        // continue without it.
        if let Err(error) = anns.application_protocols(&self.features) {
            tracing::info!(%error, service = %key, "Invalid application protocol annotation");
            self.events.warn(key, "InvalidAnnotation", error.to_string());
        }

        let mut ports = PortNameMap::default();
        if neg.ingress {
            ports.extend(self.ingresses.referenced_ports(key, svc));
        }
        if !neg.exposed_ports.is_empty() {
            match annotations::expose_neg_ports(svc, &neg) {
                Ok(exposed) => ports.extend(exposed),
                Err(error) => {
                    tracing::info!(%error, service = %key, "Invalid NEG annotation");
                    self.events.warn(key, "InvalidAnnotation", error.to_string());
                    return PortNameMap::default();
                }
            }
        }
        ports
    }
}
