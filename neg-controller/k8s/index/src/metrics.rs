//! Controller metrics, exposed on the admin server's registry.

use prometheus_client::{metrics::counter::Counter, registry::Registry};

#[derive(Clone, Debug, Default)]
pub struct Metrics {
    syncs: Counter,
    sync_failures: Counter,
    skipped_endpoints: Counter,
    gc_deleted_negs: Counter,
}

// === impl Metrics ===

impl Metrics {
    pub fn register(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "syncs",
            "Reconciliation attempts across all syncers",
            metrics.syncs.clone(),
        );
        registry.register(
            "sync_failures",
            "Reconciliation attempts that ended in an error",
            metrics.sync_failures.clone(),
        );
        registry.register(
            "skipped_endpoints",
            "Endpoints dropped because their node or zone could not be resolved",
            metrics.skipped_endpoints.clone(),
        );
        registry.register(
            "gc_deleted_negs",
            "Orphaned network endpoint groups deleted by garbage collection",
            metrics.gc_deleted_negs.clone(),
        );
        metrics
    }

    pub(crate) fn sync(&self) {
        self.syncs.inc();
    }

    pub(crate) fn sync_failure(&self) {
        self.sync_failures.inc();
    }

    pub(crate) fn endpoint_skipped(&self) {
        self.skipped_endpoints.inc();
    }

    pub(crate) fn neg_gc_deleted(&self) {
        self.gc_deleted_negs.inc();
    }

    /// Total reconciliation attempts. Used by tests to observe syncer
    /// progress without peeking into the loop.
    pub fn syncs_total(&self) -> u64 {
        self.syncs.get()
    }
}
