//! Desired-state calculation: joins a service's Endpoints with the node zone
//! index into a per-zone endpoint set.

use crate::{annotations::ServiceAnnotations, cache::CacheState, metrics::Metrics, Index};
use neg_controller_core::{Endpoint, ServiceKey, SyncerKey, TargetPort, ZoneMap};
use neg_controller_k8s_api::{self as k8s, ResourceExt};
use std::num::NonZeroU16;

impl kubert::index::IndexNamespacedResource<k8s::Endpoints> for Index {
    fn apply(&mut self, eps: k8s::Endpoints) {
        let namespace = eps.namespace().expect("Endpoints must have a namespace");
        let key = ServiceKey::new(namespace, eps.name_unchecked());
        self.cache.apply_endpoints(key.clone(), eps);
        self.manager.sync(&key);
    }

    fn delete(&mut self, namespace: String, name: String) {
        let key = ServiceKey::new(namespace, name);
        self.cache.delete_endpoints(&key);
        self.manager.sync(&key);
    }
}

/// Computes `zone -> set<Endpoint>` for one syncer key.
///
/// A missing Service, a port no longer in the service spec, a disabled NEG
/// annotation, or a missing Endpoints object all yield the empty map, which
/// makes the syncer detach everything. Two calls against the same snapshot
/// produce the same map.
pub(crate) fn desired_state(state: &CacheState, key: &SyncerKey, metrics: &Metrics) -> ZoneMap {
    let svc_key = key.service_key();

    let svc = match state.service(&svc_key) {
        Some(svc) => svc,
        None => return ZoneMap::default(),
    };
    if !declares_port(svc, key.port) || !ServiceAnnotations::from_service(svc).neg_enabled() {
        return ZoneMap::default();
    }

    let endpoints = match state.endpoints(&svc_key) {
        Some(endpoints) => endpoints,
        None => return ZoneMap::default(),
    };

    let mut zones = ZoneMap::default();
    for subset in endpoints.subsets.iter().flatten() {
        let port = match subset_port(subset, &key.target_port) {
            Some(port) => port,
            None => continue,
        };

        // Only ready addresses are attached.
        for address in subset.addresses.iter().flatten() {
            let node = match address.node_name.as_deref() {
                Some(node) => node,
                None => {
                    metrics.endpoint_skipped();
                    tracing::debug!(service = %svc_key, ip = %address.ip, "Address has no node");
                    continue;
                }
            };
            let zone = match state.nodes().zone_for(node) {
                Some(zone) => zone,
                None => {
                    metrics.endpoint_skipped();
                    tracing::debug!(service = %svc_key, %node, "No zone for node");
                    continue;
                }
            };
            let ip = match address.ip.parse() {
                Ok(ip) => ip,
                Err(error) => {
                    metrics.endpoint_skipped();
                    tracing::warn!(service = %svc_key, ip = %address.ip, %error, "Unparseable address");
                    continue;
                }
            };
            zones
                .entry(zone.to_string())
                .or_default()
                .insert(Endpoint {
                    ip,
                    port,
                    node: node.to_string(),
                });
        }
    }
    zones
}

fn declares_port(svc: &k8s::Service, port: NonZeroU16) -> bool {
    svc.spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .map_or(false, |ports| {
            ports.iter().any(|p| p.port == i32::from(port.get()))
        })
}

/// Finds the subset port matching the target: by number, or by the port's
/// name when the target is named.
fn subset_port(subset: &k8s::EndpointSubset, target: &TargetPort) -> Option<NonZeroU16> {
    subset.ports.iter().flatten().find_map(|p| match target {
        TargetPort::Number(n) => (p.port == i32::from(n.get())).then_some(*n),
        TargetPort::Name(name) => {
            if p.name.as_deref() == Some(name) {
                u16::try_from(p.port).ok().and_then(NonZeroU16::new)
            } else {
                None
            }
        }
    })
}
