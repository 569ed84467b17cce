use crate::Index;
use neg_controller_core::ServiceKey;
use neg_controller_k8s_api::{self as k8s, ResourceExt};

impl kubert::index::IndexNamespacedResource<k8s::Service> for Index {
    fn apply(&mut self, svc: k8s::Service) {
        let namespace = svc.namespace().expect("Service must have a namespace");
        let key = ServiceKey::new(namespace, svc.name_unchecked());
        self.cache.apply_service(key.clone(), svc);
        self.reensure_service(&key);
    }

    fn delete(&mut self, namespace: String, name: String) {
        let key = ServiceKey::new(namespace, name);
        tracing::debug!(service = %key, "Service deleted");
        self.cache.delete_service(&key);
        self.manager.stop_syncer(&key);

        // Deleting a service orphans its NEGs; collect them promptly rather
        // than waiting for the next periodic pass.
        let manager = self.manager.clone();
        tokio::spawn(async move {
            if let Err(error) = manager.gc().await {
                tracing::warn!(%error, "Garbage collection failed");
            }
        });
    }
}
