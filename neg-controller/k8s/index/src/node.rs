use crate::Index;
use neg_controller_k8s_api as k8s;

impl kubert::index::IndexClusterResource<k8s::Node> for Index {
    fn apply(&mut self, node: k8s::Node) {
        // A node moving zones or flipping readiness changes endpoint
        // placement for any service, so every syncer gets poked.
        if self.cache.apply_node(&node) {
            self.manager.sync_all();
        }
    }

    fn delete(&mut self, name: String) {
        if self.cache.delete_node(&name) {
            self.manager.sync_all();
        }
    }
}
