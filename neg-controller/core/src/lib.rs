#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Core types for the NEG controller.
//!
//! This crate holds the domain model shared by the indexing and cloud crates:
//! syncer keys, port maps, calculated endpoints, the cloud facade trait, and
//! the retry schedule. It deliberately has no Kubernetes dependencies so that
//! the reconciliation logic can be exercised without a cluster.

mod backoff;
pub mod cloud;

pub use self::{
    backoff::{Backoff, RetriesExceeded},
    cloud::{CloudError, NegCloud, NetworkEndpointGroup},
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use std::{fmt, net::IpAddr, num::NonZeroU16};

/// Identifies a Service by namespace and name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServiceKey {
    pub namespace: String,
    pub name: String,
}

/// Identifies one NEG syncer: a single service port and the pod port it
/// targets. Exactly one live syncer exists per key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SyncerKey {
    pub namespace: String,
    pub name: String,
    pub port: NonZeroU16,
    pub target_port: TargetPort,
}

/// A pod-side port spelling: either a number or a named container port.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TargetPort {
    Number(NonZeroU16),
    Name(String),
}

/// Maps a service port number to the pod port it targets. The canonical
/// indicator of which ports on a service need NEGs.
pub type PortNameMap = HashMap<NonZeroU16, TargetPort>;

/// A single network endpoint: a pod IP and port, annotated with the node the
/// pod runs on so it can be placed in the node's zone.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: NonZeroU16,
    pub node: String,
}

pub type EndpointSet = HashSet<Endpoint>;

/// The desired state computed for one syncer: endpoints grouped by zone.
pub type ZoneMap = HashMap<String, EndpointSet>;

// === impl ServiceKey ===

impl ServiceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// === impl SyncerKey ===

impl SyncerKey {
    pub fn service_key(&self) -> ServiceKey {
        ServiceKey {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

impl fmt::Display for SyncerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}:{}/{}",
            self.namespace, self.name, self.port, self.target_port
        )
    }
}

// === impl TargetPort ===

impl fmt::Display for TargetPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(p) => p.fmt(f),
            Self::Name(n) => n.fmt(f),
        }
    }
}

impl From<NonZeroU16> for TargetPort {
    fn from(port: NonZeroU16) -> Self {
        Self::Number(port)
    }
}

/// An aggregate of errors from independently-failing operations.
#[derive(Debug)]
pub struct Errors(Vec<anyhow::Error>);

// === impl Errors ===

impl Errors {
    pub fn ok_if_empty(errors: Vec<anyhow::Error>) -> anyhow::Result<()> {
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Self(errors).into())
        }
    }
}

impl fmt::Display for Errors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0[0])?;
        for e in &self.0[1..] {
            write!(f, "; and {}", e)?;
        }
        Ok(())
    }
}

impl std::error::Error for Errors {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.0[0])
    }
}
