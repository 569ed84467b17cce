//! The controller's read cache of cluster state.
//!
//! Watch handlers write Services, Endpoints and node zones here; syncers
//! read consistent snapshots when computing desired state. Readers never
//! observe a partially-applied update because each mutation happens under
//! the write half of one lock.

use ahash::AHashMap as HashMap;
use neg_controller_core::ServiceKey;
use neg_controller_k8s_api as k8s;
use parking_lot::RwLock;
use std::{collections::BTreeSet, sync::Arc};

/// The zone label carried by Nodes.
const ZONE_LABEL: &str = "topology.kubernetes.io/zone";

/// The deprecated zone label still set by some older node pools.
const LEGACY_ZONE_LABEL: &str = "failure-domain.beta.kubernetes.io/zone";

#[derive(Clone, Debug, Default)]
pub struct Cache {
    state: Arc<RwLock<CacheState>>,
}

#[derive(Debug, Default)]
pub(crate) struct CacheState {
    services: HashMap<ServiceKey, k8s::Service>,
    endpoints: HashMap<ServiceKey, k8s::Endpoints>,
    nodes: NodeIndex,
}

/// Maps nodes to their zone and readiness.
#[derive(Debug, Default)]
pub(crate) struct NodeIndex {
    nodes: HashMap<String, NodeMeta>,
}

#[derive(Debug, PartialEq, Eq)]
struct NodeMeta {
    zone: Option<String>,
    ready: bool,
}

// === impl Cache ===

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` against a consistent snapshot of the cache.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&CacheState) -> R) -> R {
        f(&self.state.read())
    }

    pub fn service(&self, key: &ServiceKey) -> Option<k8s::Service> {
        self.state.read().services.get(key).cloned()
    }

    /// The zones currently containing at least one Ready node.
    pub fn zones(&self) -> BTreeSet<String> {
        self.state.read().nodes.zones()
    }

    pub fn zone_for_node(&self, name: &str) -> Option<String> {
        self.state
            .read()
            .nodes
            .zone_for(name)
            .map(ToString::to_string)
    }

    pub(crate) fn apply_service(&self, key: ServiceKey, svc: k8s::Service) {
        self.state.write().services.insert(key, svc);
    }

    pub(crate) fn delete_service(&self, key: &ServiceKey) {
        self.state.write().services.remove(key);
    }

    pub(crate) fn apply_endpoints(&self, key: ServiceKey, eps: k8s::Endpoints) {
        self.state.write().endpoints.insert(key, eps);
    }

    pub(crate) fn delete_endpoints(&self, key: &ServiceKey) {
        self.state.write().endpoints.remove(key);
    }

    /// Returns true when the node's zone or readiness changed.
    pub(crate) fn apply_node(&self, node: &k8s::Node) -> bool {
        self.state.write().nodes.apply(node)
    }

    /// Returns true when a tracked node was removed.
    pub(crate) fn delete_node(&self, name: &str) -> bool {
        self.state.write().nodes.delete(name)
    }
}

// === impl CacheState ===

impl CacheState {
    pub(crate) fn service(&self, key: &ServiceKey) -> Option<&k8s::Service> {
        self.services.get(key)
    }

    pub(crate) fn endpoints(&self, key: &ServiceKey) -> Option<&k8s::Endpoints> {
        self.endpoints.get(key)
    }

    pub(crate) fn nodes(&self) -> &NodeIndex {
        &self.nodes
    }
}

// === impl NodeIndex ===

impl NodeIndex {
    fn apply(&mut self, node: &k8s::Node) -> bool {
        let name = match node.metadata.name.clone() {
            Some(name) => name,
            None => return false,
        };
        let meta = NodeMeta {
            zone: node_zone(node),
            ready: node_ready(node),
        };
        if meta.zone.is_none() {
            tracing::debug!(node = %name, "Node has no zone label");
        }
        match self.nodes.get(&name) {
            Some(prev) if *prev == meta => false,
            _ => {
                self.nodes.insert(name, meta);
                true
            }
        }
    }

    fn delete(&mut self, name: &str) -> bool {
        self.nodes.remove(name).is_some()
    }

    pub(crate) fn zones(&self) -> BTreeSet<String> {
        self.nodes
            .values()
            .filter(|meta| meta.ready)
            .filter_map(|meta| meta.zone.clone())
            .collect()
    }

    pub(crate) fn zone_for(&self, name: &str) -> Option<&str> {
        self.nodes.get(name).and_then(|meta| meta.zone.as_deref())
    }
}

fn node_zone(node: &k8s::Node) -> Option<String> {
    let labels = node.metadata.labels.as_ref()?;
    labels
        .get(ZONE_LABEL)
        .or_else(|| labels.get(LEGACY_ZONE_LABEL))
        .cloned()
}

fn node_ready(node: &k8s::Node) -> bool {
    node.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map_or(false, |conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}
