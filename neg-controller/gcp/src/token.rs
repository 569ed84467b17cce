//! Bearer tokens from the GKE metadata server, cached until shortly before
//! expiry.

use neg_controller_core::CloudError;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

const DEFAULT_TOKEN_URI: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

const EXPIRY_MARGIN: Duration = Duration::from_secs(30);

pub struct TokenSource {
    client: reqwest::Client,
    uri: String,
    cached: Mutex<Option<Cached>>,
}

struct Cached {
    token: String,
    expires_at: Instant,
}

#[derive(serde::Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

// === impl TokenSource ===

impl TokenSource {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_uri(client, DEFAULT_TOKEN_URI)
    }

    pub fn with_uri(client: reqwest::Client, uri: impl Into<String>) -> Self {
        Self {
            client,
            uri: uri.into(),
            cached: Mutex::new(None),
        }
    }

    pub async fn token(&self) -> Result<String, CloudError> {
        if let Some(cached) = &*self.cached.lock() {
            if cached.expires_at > Instant::now() + EXPIRY_MARGIN {
                return Ok(cached.token.clone());
            }
        }

        let rsp = self
            .client
            .get(&self.uri)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| CloudError::Transient(format!("fetching token: {}", e)))?;
        if !rsp.status().is_success() {
            return Err(CloudError::Transient(format!(
                "metadata server returned {}",
                rsp.status()
            )));
        }
        let token: TokenResponse = rsp
            .json()
            .await
            .map_err(|e| CloudError::Transient(format!("decoding token: {}", e)))?;

        let expires_at = Instant::now() + Duration::from_secs(token.expires_in);
        *self.cached.lock() = Some(Cached {
            token: token.access_token.clone(),
            expires_at,
        });
        Ok(token.access_token)
    }
}
