#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! A GCE Compute implementation of the NEG cloud facade.
//!
//! Talks to the beta compute API over REST with bearer tokens from the GKE
//! metadata server. Mutations are long-running zonal operations; each call
//! waits for its operation to finish before returning so the syncer's
//! success/failure disposition is accurate.

mod token;
mod wire;

pub use self::token::TokenSource;
use neg_controller_core::{
    cloud::ZonedNegs, CloudError, Endpoint, EndpointSet, NegCloud, NetworkEndpointGroup,
};

const COMPUTE_ENDPOINT: &str = "https://compute.googleapis.com";

/// How long to keep re-issuing `zoneOperations.wait` for one mutation before
/// giving up and letting the syncer retry.
const OPERATION_WAIT_ROUNDS: u32 = 10;

pub struct GceNegCloud {
    client: reqwest::Client,
    token: TokenSource,
    base: String,
    network_url: String,
    subnetwork_url: String,
}

// === impl GceNegCloud ===

impl GceNegCloud {
    pub fn new(
        project: &str,
        network_url: impl Into<String>,
        subnetwork_url: impl Into<String>,
    ) -> Self {
        Self::with_endpoint(COMPUTE_ENDPOINT, project, network_url, subnetwork_url)
    }

    pub fn with_endpoint(
        endpoint: &str,
        project: &str,
        network_url: impl Into<String>,
        subnetwork_url: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::new();
        Self {
            token: TokenSource::new(client.clone()),
            base: format!("{}/compute/beta/projects/{}", endpoint, project),
            network_url: network_url.into(),
            subnetwork_url: subnetwork_url.into(),
            client,
        }
    }

    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
    ) -> Result<T, CloudError> {
        let token = self.token.token().await?;
        let rsp = req
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| CloudError::Transient(e.to_string()))?;

        let status = rsp.status();
        if !status.is_success() {
            let body = rsp.text().await.unwrap_or_default();
            return Err(status_error(status.as_u16(), body));
        }
        rsp.json()
            .await
            .map_err(|e| CloudError::Transient(format!("decoding response: {}", e)))
    }

    /// Issues a mutation and waits for its zonal operation to complete.
    async fn mutate(
        &self,
        req: reqwest::RequestBuilder,
        zone: &str,
    ) -> Result<(), CloudError> {
        let op: wire::Operation = self.send(req).await?;
        if op.is_done() {
            return op.into_result();
        }

        let url = format!("{}/zones/{}/operations/{}/wait", self.base, zone, op.name);
        for round in 0..OPERATION_WAIT_ROUNDS {
            tracing::debug!(operation = %op.name, %zone, round, "Waiting for operation");
            let op: wire::Operation = self.send(self.client.post(&url)).await?;
            if op.is_done() {
                return op.into_result();
            }
        }
        Err(CloudError::Transient(format!(
            "operation {} did not finish",
            op.name
        )))
    }

    fn neg_url(&self, name: &str, zone: &str) -> String {
        format!("{}/zones/{}/networkEndpointGroups/{}", self.base, zone, name)
    }

    fn negs_url(&self, zone: &str) -> String {
        format!("{}/zones/{}/networkEndpointGroups", self.base, zone)
    }
}

#[async_trait::async_trait]
impl NegCloud for GceNegCloud {
    async fn get(&self, name: &str, zone: &str) -> Result<NetworkEndpointGroup, CloudError> {
        let neg: wire::Neg = self.send(self.client.get(self.neg_url(name, zone))).await?;
        Ok(neg.into_neg(zone))
    }

    async fn list(&self, zone: &str) -> Result<Vec<NetworkEndpointGroup>, CloudError> {
        let list: wire::NegList = self.send(self.client.get(self.negs_url(zone))).await?;
        Ok(list
            .items
            .into_iter()
            .map(|neg| neg.into_neg(zone))
            .collect())
    }

    async fn aggregated_list(&self) -> Result<ZonedNegs, CloudError> {
        let url = format!("{}/aggregated/networkEndpointGroups", self.base);
        let aggregated: wire::AggregatedNegList = self.send(self.client.get(url)).await?;
        Ok(aggregated.into_zoned())
    }

    async fn create(&self, neg: &NetworkEndpointGroup) -> Result<(), CloudError> {
        let body = wire::Neg::from_neg(neg);
        let req = self.client.post(self.negs_url(&neg.zone)).json(&body);
        self.mutate(req, &neg.zone).await
    }

    async fn delete(&self, name: &str, zone: &str) -> Result<(), CloudError> {
        let req = self.client.delete(self.neg_url(name, zone));
        self.mutate(req, zone).await
    }

    async fn list_endpoints(&self, name: &str, zone: &str) -> Result<EndpointSet, CloudError> {
        let url = format!("{}/listNetworkEndpoints", self.neg_url(name, zone));
        let list: wire::NetworkEndpointList = self.send(self.client.post(url)).await?;
        list.items
            .into_iter()
            .map(|item| item.network_endpoint.into_endpoint())
            .collect()
    }

    async fn attach(
        &self,
        name: &str,
        zone: &str,
        endpoints: Vec<Endpoint>,
    ) -> Result<(), CloudError> {
        let url = format!("{}/attachNetworkEndpoints", self.neg_url(name, zone));
        let body = wire::NetworkEndpointsRequest::from_endpoints(&endpoints);
        self.mutate(self.client.post(url).json(&body), zone).await
    }

    async fn detach(
        &self,
        name: &str,
        zone: &str,
        endpoints: Vec<Endpoint>,
    ) -> Result<(), CloudError> {
        let url = format!("{}/detachNetworkEndpoints", self.neg_url(name, zone));
        let body = wire::NetworkEndpointsRequest::from_endpoints(&endpoints);
        self.mutate(self.client.post(url).json(&body), zone).await
    }

    fn network_url(&self) -> &str {
        &self.network_url
    }

    fn subnetwork_url(&self) -> &str {
        &self.subnetwork_url
    }
}

/// Maps an HTTP status to the facade's error taxonomy: 404 is distinguished,
/// 409 marks an existing resource, 429 and server errors are retryable, and
/// the rest of the 4xx range is permanent.
fn status_error(code: u16, body: String) -> CloudError {
    match code {
        404 => CloudError::NotFound,
        409 => CloudError::AlreadyExists,
        429 => CloudError::Transient(body),
        500.. => CloudError::Transient(body),
        _ => CloudError::Permanent { code, message: body },
    }
}
