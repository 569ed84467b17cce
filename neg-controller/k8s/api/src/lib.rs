#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Re-exports the Kubernetes API types the controller consumes, so the rest
//! of the tree has a single import surface for `k8s-openapi`/`kube` names.

pub use k8s_openapi::{
    api::{
        self,
        core::v1::{
            EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Node, NodeCondition,
            ObjectReference, Service, ServicePort, ServiceSpec,
        },
        networking::v1::{Ingress, IngressBackend, IngressServiceBackend, ServiceBackendPort},
    },
    apimachinery::{self, pkg::util::intstr::IntOrString},
};
pub use kube::{
    api::{Api, ObjectMeta, Resource, ResourceExt},
    runtime::{
        events::{Event, EventType, Recorder, Reporter},
        watcher,
    },
    Client, Error,
};
