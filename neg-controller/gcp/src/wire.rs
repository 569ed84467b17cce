//! Wire shapes for the beta compute NEG API.

use neg_controller_core::{cloud::ZonedNegs, CloudError, Endpoint, NetworkEndpointGroup};
use std::{collections::HashMap, num::NonZeroU16};

const NEG_TYPE: &str = "GCE_VM_IP_PORT";

#[derive(Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Neg {
    pub name: String,
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub subnetwork: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub network_endpoint_type: String,
}

#[derive(Debug, serde::Deserialize)]
pub(crate) struct NegList {
    #[serde(default)]
    pub items: Vec<Neg>,
}

/// The aggregated listing groups NEGs by scope; zonal scopes are keyed
/// `zones/<zone>`. Global and regional scopes are not NEG-bearing but are
/// tolerated in the response.
#[derive(Debug, serde::Deserialize)]
pub(crate) struct AggregatedNegList {
    #[serde(default)]
    items: HashMap<String, AggregatedScope>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct AggregatedScope {
    #[serde(default)]
    network_endpoint_groups: Vec<Neg>,
}

#[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct NetworkEndpoint {
    pub instance: String,
    pub ip_address: String,
    pub port: u16,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct NetworkEndpointWithHealth {
    pub network_endpoint: NetworkEndpoint,
}

#[derive(Debug, serde::Deserialize)]
pub(crate) struct NetworkEndpointList {
    #[serde(default)]
    pub items: Vec<NetworkEndpointWithHealth>,
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct NetworkEndpointsRequest {
    network_endpoints: Vec<NetworkEndpoint>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Operation {
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub http_error_status_code: Option<u16>,
    #[serde(default)]
    pub error: Option<OperationError>,
}

#[derive(Debug, serde::Deserialize)]
pub(crate) struct OperationError {
    #[serde(default)]
    errors: Vec<OperationErrorItem>,
}

#[derive(Debug, serde::Deserialize)]
struct OperationErrorItem {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

// === impl Neg ===

impl Neg {
    pub fn from_neg(neg: &NetworkEndpointGroup) -> Self {
        Self {
            name: neg.name.clone(),
            network: neg.network_url.clone(),
            subnetwork: neg.subnetwork_url.clone(),
            description: neg.description.clone(),
            network_endpoint_type: NEG_TYPE.to_string(),
        }
    }

    pub fn into_neg(self, zone: &str) -> NetworkEndpointGroup {
        NetworkEndpointGroup {
            name: self.name,
            zone: zone.to_string(),
            network_url: self.network,
            subnetwork_url: self.subnetwork,
            description: self.description,
        }
    }
}

// === impl AggregatedNegList ===

impl AggregatedNegList {
    pub fn into_zoned(self) -> ZonedNegs {
        let mut zoned = ZonedNegs::default();
        for (scope, items) in self.items {
            let Some(zone) = scope.strip_prefix("zones/") else {
                continue;
            };
            if items.network_endpoint_groups.is_empty() {
                continue;
            }
            zoned.entry(zone.to_string()).or_default().extend(
                items
                    .network_endpoint_groups
                    .into_iter()
                    .map(|neg| neg.into_neg(zone)),
            );
        }
        zoned
    }
}

// === impl NetworkEndpoint ===

impl NetworkEndpoint {
    fn from_endpoint(endpoint: &Endpoint) -> Self {
        Self {
            instance: endpoint.node.clone(),
            ip_address: endpoint.ip.to_string(),
            port: endpoint.port.get(),
        }
    }

    pub fn into_endpoint(self) -> Result<Endpoint, CloudError> {
        let ip = self
            .ip_address
            .parse()
            .map_err(|_| CloudError::Transient(format!("bad endpoint IP {}", self.ip_address)))?;
        let port = NonZeroU16::new(self.port)
            .ok_or_else(|| CloudError::Transient("endpoint port is zero".to_string()))?;
        Ok(Endpoint {
            ip,
            port,
            node: self.instance,
        })
    }
}

// === impl NetworkEndpointsRequest ===

impl NetworkEndpointsRequest {
    pub fn from_endpoints(endpoints: &[Endpoint]) -> Self {
        Self {
            network_endpoints: endpoints.iter().map(NetworkEndpoint::from_endpoint).collect(),
        }
    }
}

// === impl Operation ===

impl Operation {
    pub fn is_done(&self) -> bool {
        self.status == "DONE"
    }

    /// Maps a finished operation's error onto the facade taxonomy: the
    /// canonical code string decides the class, and for the permanent rest
    /// the operation's own `httpErrorStatusCode` is carried through the same
    /// classification as a direct HTTP failure.
    pub fn into_result(self) -> Result<(), CloudError> {
        let Some(error) = self.error else {
            return Ok(());
        };
        let first = error.errors.first();
        let code = first.map(|e| e.code.as_str()).unwrap_or_default();
        let message = first.map(|e| e.message.clone()).unwrap_or_default();
        if code.contains("NOT_FOUND") {
            Err(CloudError::NotFound)
        } else if code.contains("ALREADY_EXISTS") {
            Err(CloudError::AlreadyExists)
        } else if retryable_code(code) {
            Err(CloudError::Transient(format!("{}: {}", code, message)))
        } else if let Some(status) = self.http_error_status_code {
            Err(crate::status_error(status, message))
        } else {
            // No status to classify by; let the syncer's retry budget decide
            // when to give up.
            Err(CloudError::Transient(format!("{}: {}", code, message)))
        }
    }
}

/// Quota, rate-limit and server-side operation failures that a later attempt
/// can reasonably expect to clear.
fn retryable_code(code: &str) -> bool {
    matches!(code, "INTERNAL_ERROR" | "UNAVAILABLE")
        || code.ends_with("_EXCEEDED")
        || code.ends_with("_EXHAUSTED")
}
