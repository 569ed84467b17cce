//! The cloud provider facade for network endpoint groups.
//!
//! The syncer drives convergence exclusively through [`NegCloud`], so the
//! whole reconciliation stack can run against the in-memory [`fake`]
//! implementation in tests.

use crate::{Endpoint, EndpointSet};
use ahash::AHashMap as HashMap;

/// A zonal NEG as the cloud sees it. Identity is `(name, zone)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkEndpointGroup {
    pub name: String,
    pub zone: String,
    pub network_url: String,
    pub subnetwork_url: String,
    pub description: String,
}

/// Errors surfaced by the cloud facade.
///
/// `NotFound` is distinguished so that deletes can treat it as success and
/// gets can take the create path. Everything else is retried by the syncer's
/// backoff schedule.
#[derive(Clone, Debug, thiserror::Error)]
pub enum CloudError {
    #[error("not found")]
    NotFound,

    #[error("already exists")]
    AlreadyExists,

    #[error("transient error: {0}")]
    Transient(String),

    #[error("permanent error {code}: {message}")]
    Permanent { code: u16, message: String },
}

/// NEGs grouped by the zone they were observed in.
pub type ZonedNegs = HashMap<String, Vec<NetworkEndpointGroup>>;

/// Minimal NEG CRUD and endpoint attach/detach against the cloud provider.
///
/// Calls are not cancellable; a stopping syncer lets any in-flight call run
/// to completion.
#[async_trait::async_trait]
pub trait NegCloud: Send + Sync + 'static {
    async fn get(&self, name: &str, zone: &str) -> Result<NetworkEndpointGroup, CloudError>;

    async fn list(&self, zone: &str) -> Result<Vec<NetworkEndpointGroup>, CloudError>;

    /// Enumerates NEGs across all zones the project has resources in,
    /// including zones that are no longer part of the cluster.
    async fn aggregated_list(&self) -> Result<ZonedNegs, CloudError>;

    async fn create(&self, neg: &NetworkEndpointGroup) -> Result<(), CloudError>;

    async fn delete(&self, name: &str, zone: &str) -> Result<(), CloudError>;

    async fn list_endpoints(&self, name: &str, zone: &str) -> Result<EndpointSet, CloudError>;

    /// Adds endpoints to a NEG. Attaching an endpoint that is already a
    /// member is tolerated by the provider.
    async fn attach(
        &self,
        name: &str,
        zone: &str,
        endpoints: Vec<Endpoint>,
    ) -> Result<(), CloudError>;

    /// Removes endpoints from a NEG. Detaching a non-member is tolerated.
    async fn detach(
        &self,
        name: &str,
        zone: &str,
        endpoints: Vec<Endpoint>,
    ) -> Result<(), CloudError>;

    /// The network URL new NEGs are created in.
    fn network_url(&self) -> &str;

    /// The subnetwork URL new NEGs are created in.
    fn subnetwork_url(&self) -> &str;
}

// === impl CloudError ===

impl CloudError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists)
    }
}

pub mod fake {
    //! An in-memory [`NegCloud`] with scriptable failures, used throughout
    //! the syncer and manager tests.

    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// A facade operation, for failure injection and call counting.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub enum Op {
        Get,
        List,
        AggregatedList,
        Create,
        Delete,
        ListEndpoints,
        Attach,
        Detach,
    }

    #[derive(Debug, Default)]
    struct State {
        /// NEGs keyed by `(zone, name)`.
        negs: HashMap<(String, String), NetworkEndpointGroup>,
        endpoints: HashMap<(String, String), EndpointSet>,
        failures: HashMap<Op, VecDeque<CloudError>>,
        calls: HashMap<Op, usize>,
    }

    #[derive(Debug)]
    pub struct FakeNegCloud {
        state: Mutex<State>,
        network_url: String,
        subnetwork_url: String,
    }

    // === impl FakeNegCloud ===

    impl Default for FakeNegCloud {
        fn default() -> Self {
            Self::new(
                "projects/test/global/networks/default",
                "projects/test/regions/us/subnetworks/default",
            )
        }
    }

    impl FakeNegCloud {
        pub fn new(network_url: impl Into<String>, subnetwork_url: impl Into<String>) -> Self {
            Self {
                state: Mutex::new(State::default()),
                network_url: network_url.into(),
                subnetwork_url: subnetwork_url.into(),
            }
        }

        /// Scripts the next call to `op` to fail with `error`. Repeated calls
        /// queue further failures.
        pub fn fail_next(&self, op: Op, error: CloudError) {
            self.state
                .lock()
                .failures
                .entry(op)
                .or_default()
                .push_back(error);
        }

        /// The number of times `op` has been invoked.
        pub fn calls(&self, op: Op) -> usize {
            self.state.lock().calls.get(&op).copied().unwrap_or(0)
        }

        /// Seeds a NEG directly, bypassing failure injection. Used to set up
        /// orphans for garbage collection tests.
        pub fn seed_neg(&self, neg: NetworkEndpointGroup) {
            let mut state = self.state.lock();
            let key = (neg.zone.clone(), neg.name.clone());
            state.endpoints.entry(key.clone()).or_default();
            state.negs.insert(key, neg);
        }

        pub fn neg(&self, name: &str, zone: &str) -> Option<NetworkEndpointGroup> {
            self.state
                .lock()
                .negs
                .get(&(zone.to_string(), name.to_string()))
                .cloned()
        }

        pub fn endpoints(&self, name: &str, zone: &str) -> EndpointSet {
            self.state
                .lock()
                .endpoints
                .get(&(zone.to_string(), name.to_string()))
                .cloned()
                .unwrap_or_default()
        }

        /// All NEG names present in any zone.
        pub fn all_neg_names(&self) -> Vec<String> {
            let mut names = self
                .state
                .lock()
                .negs
                .keys()
                .map(|(_, name)| name.clone())
                .collect::<Vec<_>>();
            names.sort();
            names.dedup();
            names
        }

        fn enter(&self, op: Op) -> Result<(), CloudError> {
            let mut state = self.state.lock();
            *state.calls.entry(op).or_default() += 1;
            if let Some(error) = state.failures.get_mut(&op).and_then(VecDeque::pop_front) {
                return Err(error);
            }
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl NegCloud for FakeNegCloud {
        async fn get(&self, name: &str, zone: &str) -> Result<NetworkEndpointGroup, CloudError> {
            self.enter(Op::Get)?;
            self.neg(name, zone).ok_or(CloudError::NotFound)
        }

        async fn list(&self, zone: &str) -> Result<Vec<NetworkEndpointGroup>, CloudError> {
            self.enter(Op::List)?;
            Ok(self
                .state
                .lock()
                .negs
                .iter()
                .filter(|((z, _), _)| z == zone)
                .map(|(_, neg)| neg.clone())
                .collect())
        }

        async fn aggregated_list(&self) -> Result<ZonedNegs, CloudError> {
            self.enter(Op::AggregatedList)?;
            let mut zones = ZonedNegs::default();
            for ((zone, _), neg) in self.state.lock().negs.iter() {
                zones.entry(zone.clone()).or_default().push(neg.clone());
            }
            Ok(zones)
        }

        async fn create(&self, neg: &NetworkEndpointGroup) -> Result<(), CloudError> {
            self.enter(Op::Create)?;
            let mut state = self.state.lock();
            let key = (neg.zone.clone(), neg.name.clone());
            if state.negs.contains_key(&key) {
                return Err(CloudError::AlreadyExists);
            }
            state.endpoints.insert(key.clone(), EndpointSet::default());
            state.negs.insert(key, neg.clone());
            Ok(())
        }

        async fn delete(&self, name: &str, zone: &str) -> Result<(), CloudError> {
            self.enter(Op::Delete)?;
            let mut state = self.state.lock();
            let key = (zone.to_string(), name.to_string());
            state.endpoints.remove(&key);
            state
                .negs
                .remove(&key)
                .map(|_| ())
                .ok_or(CloudError::NotFound)
        }

        async fn list_endpoints(&self, name: &str, zone: &str) -> Result<EndpointSet, CloudError> {
            self.enter(Op::ListEndpoints)?;
            let state = self.state.lock();
            let key = (zone.to_string(), name.to_string());
            if !state.negs.contains_key(&key) {
                return Err(CloudError::NotFound);
            }
            Ok(state.endpoints.get(&key).cloned().unwrap_or_default())
        }

        async fn attach(
            &self,
            name: &str,
            zone: &str,
            endpoints: Vec<Endpoint>,
        ) -> Result<(), CloudError> {
            self.enter(Op::Attach)?;
            let mut state = self.state.lock();
            let key = (zone.to_string(), name.to_string());
            if !state.negs.contains_key(&key) {
                return Err(CloudError::NotFound);
            }
            state.endpoints.entry(key).or_default().extend(endpoints);
            Ok(())
        }

        async fn detach(
            &self,
            name: &str,
            zone: &str,
            endpoints: Vec<Endpoint>,
        ) -> Result<(), CloudError> {
            self.enter(Op::Detach)?;
            let mut state = self.state.lock();
            let key = (zone.to_string(), name.to_string());
            if !state.negs.contains_key(&key) {
                return Err(CloudError::NotFound);
            }
            if let Some(set) = state.endpoints.get_mut(&key) {
                for ep in &endpoints {
                    set.remove(ep);
                }
            }
            Ok(())
        }

        fn network_url(&self) -> &str {
            &self.network_url
        }

        fn subnetwork_url(&self) -> &str {
            &self.subnetwork_url
        }
    }
}
