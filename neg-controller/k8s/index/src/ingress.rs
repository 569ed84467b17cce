//! Tracks which service ports are referenced by Ingress backends.
//!
//! A service annotated `{"ingress": true}` only gets NEGs for the ports an
//! Ingress actually routes to; with no referencing Ingress, no syncers run.

use crate::{annotations, Index};
use ahash::AHashMap as HashMap;
use neg_controller_core::{PortNameMap, ServiceKey};
use neg_controller_k8s_api::{self as k8s, ResourceExt};
use std::num::NonZeroU16;

#[derive(Debug, Default)]
pub(crate) struct IngressIndex {
    /// Backend references per ingress, keyed by the ingress's own
    /// namespace/name. Backends can only reference services in the
    /// ingress's namespace.
    backends: HashMap<ServiceKey, Vec<(String, PortRef)>>,
}

/// How an Ingress spells a backend service port.
#[derive(Clone, Debug, PartialEq, Eq)]
enum PortRef {
    Number(NonZeroU16),
    Name(String),
}

impl kubert::index::IndexNamespacedResource<k8s::Ingress> for Index {
    fn apply(&mut self, ingress: k8s::Ingress) {
        let namespace = ingress.namespace().expect("Ingress must have a namespace");
        let key = ServiceKey::new(namespace, ingress.name_unchecked());
        let backends = backend_refs(&ingress);
        for service in self.ingresses.apply(key, backends) {
            self.reensure_service(&service);
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        let key = ServiceKey::new(namespace, name);
        for service in self.ingresses.delete(&key) {
            self.reensure_service(&service);
        }
    }
}

// === impl IngressIndex ===

impl IngressIndex {
    /// Stores an ingress's backend references, returning the services whose
    /// NEG population may have changed.
    fn apply(&mut self, ingress: ServiceKey, backends: Vec<(String, PortRef)>) -> Vec<ServiceKey> {
        let namespace = ingress.namespace.clone();
        let mut affected: Vec<ServiceKey> = backends
            .iter()
            .map(|(svc, _)| ServiceKey::new(namespace.clone(), svc.clone()))
            .collect();
        if let Some(prev) = self.backends.insert(ingress, backends) {
            for (svc, _) in prev {
                affected.push(ServiceKey::new(namespace.clone(), svc));
            }
        }
        affected.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        affected.dedup();
        affected
    }

    fn delete(&mut self, ingress: &ServiceKey) -> Vec<ServiceKey> {
        let mut affected: Vec<ServiceKey> = self
            .backends
            .remove(ingress)
            .unwrap_or_default()
            .into_iter()
            .map(|(svc, _)| ServiceKey::new(ingress.namespace.clone(), svc))
            .collect();
        affected.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        affected.dedup();
        affected
    }

    /// The ports of `svc` referenced by any known Ingress, resolved against
    /// the service's port spec.
    pub(crate) fn referenced_ports(&self, key: &ServiceKey, svc: &k8s::Service) -> PortNameMap {
        let spec_ports = svc
            .spec
            .as_ref()
            .and_then(|spec| spec.ports.as_deref())
            .unwrap_or_default();

        let mut ports = PortNameMap::default();
        let refs = self
            .backends
            .iter()
            .filter(|(ingress, _)| ingress.namespace == key.namespace)
            .flat_map(|(_, backends)| backends)
            .filter(|(svc_name, _)| *svc_name == key.name);
        for (_, port_ref) in refs {
            let spec = match port_ref {
                PortRef::Number(n) => spec_ports
                    .iter()
                    .find(|p| p.port == i32::from(n.get())),
                PortRef::Name(name) => spec_ports
                    .iter()
                    .find(|p| p.name.as_deref() == Some(name)),
            };
            if let Some(spec) = spec {
                if let Some(port) = u16::try_from(spec.port).ok().and_then(NonZeroU16::new) {
                    ports.insert(port, annotations::target_port(spec, port));
                }
            }
        }
        ports
    }
}

/// Extracts `(service name, port)` references from an ingress's default
/// backend and rules.
fn backend_refs(ingress: &k8s::Ingress) -> Vec<(String, PortRef)> {
    let Some(spec) = ingress.spec.as_ref() else {
        return Vec::new();
    };

    let rule_backends = spec
        .rules
        .iter()
        .flatten()
        .filter_map(|rule| rule.http.as_ref())
        .flat_map(|http| http.paths.iter())
        .map(|path| &path.backend);

    spec.default_backend
        .iter()
        .chain(rule_backends)
        .filter_map(|backend| {
            let service = backend.service.as_ref()?;
            let port = match service.port.as_ref() {
                Some(k8s::ServiceBackendPort {
                    number: Some(number),
                    ..
                }) => PortRef::Number(u16::try_from(*number).ok().and_then(NonZeroU16::new)?),
                Some(k8s::ServiceBackendPort {
                    name: Some(name), ..
                }) => PortRef::Name(name.clone()),
                _ => return None,
            };
            Some((service.name.clone(), port))
        })
        .collect()
}
