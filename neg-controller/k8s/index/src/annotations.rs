//! Service annotation parsing.
//!
//! Three annotations are recognized on Services: the NEG annotation
//! requesting container-native load balancing, the application-protocol
//! annotation (with a vendor-prefixed fallback key), and the backend-config
//! annotation. Unknown fields in the decoded objects are tolerated so newer
//! annotation schemas do not break older controllers.

use neg_controller_core::{PortNameMap, TargetPort};
use neg_controller_k8s_api as k8s;
use std::{collections::BTreeMap, num::NonZeroU16};

/// Requests NEGs for a service. The value is JSON, e.g.
/// `{"ingress": true, "exposed_ports": {"80": {}}}`.
pub const NEG_ANNOTATION_KEY: &str = "cloud.google.com/neg";

/// Maps service ports to their application protocol. User-owned; takes
/// precedence over [`VENDOR_APP_PROTOCOLS_KEY`].
pub const APP_PROTOCOLS_KEY: &str = "service.alpha.kubernetes.io/app-protocols";

/// Vendor-prefixed fallback for the application-protocol annotation.
pub const VENDOR_APP_PROTOCOLS_KEY: &str = "cloud.google.com/app-protocols";

/// Names the backend configs to apply to the service's ports.
pub const BACKEND_CONFIG_KEY: &str = "beta.cloud.google.com/backend-config";

/// Feature gates read during annotation parsing, injected so tests can vary
/// them without process-wide state.
#[derive(Clone, Copy, Debug, Default)]
pub struct Features {
    pub http2: bool,
}

/// The decoded NEG annotation.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NegAnnotation {
    #[serde(default)]
    pub ingress: bool,

    #[serde(default, rename = "exposed_ports")]
    pub exposed_ports: BTreeMap<NonZeroU16, NegAttributes>,
}

/// Per-port attributes of an exposed NEG port. Currently empty; present so
/// the annotation shape can grow without a schema change.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NegAttributes {}

/// An application protocol for a service port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AppProtocol {
    #[serde(rename = "HTTP")]
    Http,
    #[serde(rename = "HTTPS")]
    Https,
    #[serde(rename = "HTTP2")]
    Http2,
}

/// The decoded backend-config annotation.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BackendConfigs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,

    #[serde(default)]
    pub ports: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum InvalidAnnotation {
    #[error("NEG annotation is missing")]
    NegMissing,

    #[error("NEG annotation is invalid: {0}")]
    NegInvalid(String),

    #[error("port {0} in the NEG annotation is not present in the service spec")]
    UnknownPort(NonZeroU16),

    #[error("application protocol annotation is invalid: {0}")]
    ProtocolInvalid(String),

    #[error("HTTP2 is not enabled on this cluster")]
    UnsupportedProtocol,

    #[error("backend config annotation is missing")]
    BackendConfigMissing,

    #[error("backend config annotation is invalid: {0}")]
    BackendConfigInvalid(String),

    #[error("backend config annotation names no configs")]
    BackendConfigNoneFound,
}

/// Read access to the recognized annotations of one Service.
#[derive(Clone, Copy, Debug)]
pub struct ServiceAnnotations<'a> {
    annotations: Option<&'a BTreeMap<String, String>>,
}

// === impl NegAnnotation ===

impl NegAnnotation {
    /// Whether any NEGs are requested at all.
    pub fn enabled(&self) -> bool {
        self.ingress || !self.exposed_ports.is_empty()
    }

    /// Whether standalone exposure is requested for an explicit port set.
    pub fn exposed(&self) -> bool {
        !self.exposed_ports.is_empty()
    }
}

// === impl ServiceAnnotations ===

impl<'a> ServiceAnnotations<'a> {
    pub fn from_service(svc: &'a k8s::Service) -> Self {
        Self {
            annotations: svc.metadata.annotations.as_ref(),
        }
    }

    fn get(&self, key: &str) -> Option<&'a str> {
        self.annotations.and_then(|a| a.get(key)).map(String::as_str)
    }

    pub fn neg_annotation(&self) -> Result<NegAnnotation, InvalidAnnotation> {
        let raw = self
            .get(NEG_ANNOTATION_KEY)
            .ok_or(InvalidAnnotation::NegMissing)?;
        serde_json::from_str(raw).map_err(|e| InvalidAnnotation::NegInvalid(e.to_string()))
    }

    /// Whether the service requests NEGs (an unparseable annotation counts
    /// as disabled).
    pub fn neg_enabled(&self) -> bool {
        self.neg_annotation().map_or(false, |n| n.enabled())
    }

    /// The per-port application protocols. The user-owned key wins over the
    /// vendor-prefixed fallback. `HTTP2` requires the feature gate.
    pub fn application_protocols(
        &self,
        features: &Features,
    ) -> Result<BTreeMap<String, AppProtocol>, InvalidAnnotation> {
        let raw = match self
            .get(APP_PROTOCOLS_KEY)
            .or_else(|| self.get(VENDOR_APP_PROTOCOLS_KEY))
        {
            Some(raw) => raw,
            None => return Ok(BTreeMap::new()),
        };

        let protocols: BTreeMap<String, AppProtocol> = serde_json::from_str(raw)
            .map_err(|e| InvalidAnnotation::ProtocolInvalid(e.to_string()))?;

        if !features.http2 && protocols.values().any(|p| *p == AppProtocol::Http2) {
            return Err(InvalidAnnotation::UnsupportedProtocol);
        }
        Ok(protocols)
    }

    pub fn backend_configs(&self) -> Result<BackendConfigs, InvalidAnnotation> {
        let raw = self
            .get(BACKEND_CONFIG_KEY)
            .ok_or(InvalidAnnotation::BackendConfigMissing)?;
        let configs: BackendConfigs = serde_json::from_str(raw)
            .map_err(|e| InvalidAnnotation::BackendConfigInvalid(e.to_string()))?;
        if configs.default.is_none() && configs.ports.is_empty() {
            return Err(InvalidAnnotation::BackendConfigNoneFound);
        }
        Ok(configs)
    }
}

/// Resolves the annotation's exposed ports against the service's port spec.
/// Every exposed port must exist in the spec.
pub fn expose_neg_ports(
    svc: &k8s::Service,
    neg: &NegAnnotation,
) -> Result<PortNameMap, InvalidAnnotation> {
    let spec_ports = svc
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_deref())
        .unwrap_or_default();

    let mut ports = PortNameMap::default();
    for &port in neg.exposed_ports.keys() {
        let spec = spec_ports
            .iter()
            .find(|p| p.port == i32::from(port.get()))
            .ok_or(InvalidAnnotation::UnknownPort(port))?;
        ports.insert(port, target_port(spec, port));
    }
    Ok(ports)
}

/// The pod-side spelling of a service port. An absent targetPort defaults to
/// the port itself.
pub(crate) fn target_port(spec: &k8s::ServicePort, port: NonZeroU16) -> TargetPort {
    match spec.target_port.clone() {
        Some(k8s::IntOrString::Int(n)) => match u16::try_from(n).ok().and_then(NonZeroU16::new) {
            Some(target) => TargetPort::Number(target),
            None => TargetPort::Number(port),
        },
        Some(k8s::IntOrString::String(name)) => TargetPort::Name(name),
        None => TargetPort::Number(port),
    }
}
