//! Outbound HTTP for guest `fetch`.
//!
//! Every call is logged to the calling worker's Log Channel before it is
//! sent, and again with its status or failure once it completes. Failures
//! are re-raised to the guest as rejected `fetch` promises.

use std::time::Instant;

use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use edge_workers_common::{HostError, OutboundConfig};
use edge_workers_core::GuestScope;

/// HTTP outbound host implementation.
///
/// Holds one connection-pooled client shared by every sandbox.
#[derive(Debug, Clone)]
pub struct HttpOutboundHost {
    client: Client,
    max_body_bytes: usize,
}

/// Request as serialized by the guest's `fetch`.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpRequest {
    /// Target URL.
    pub url: String,
    /// HTTP method.
    pub method: String,
    /// Request headers.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    /// Hex-encoded body, absent for bodiless requests.
    #[serde(default)]
    pub body: Option<String>,
}

/// Response handed back to the guest.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Canonical reason phrase.
    pub status_text: String,
    /// Final URL after redirects.
    pub url: String,
    /// Response headers.
    pub headers: Vec<(String, String)>,
    /// Hex-encoded body, `None` when empty.
    pub body: Option<String>,
}

impl HttpOutboundHost {
    /// Create a new HTTP outbound host.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::OutboundFailed`] if the HTTP client cannot be built.
    pub fn new(config: &OutboundConfig) -> Result<Self, HostError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .connect_timeout(config.connect_timeout())
            .pool_max_idle_per_host(10)
            .user_agent(concat!("edge-workers/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| HostError::OutboundFailed {
                url: String::new(),
                reason: format!("failed to create HTTP client: {e}"),
            })?;
        Ok(Self::with_client(client, config.max_body_bytes))
    }

    /// Create with a custom HTTP client.
    pub fn with_client(client: Client, max_body_bytes: usize) -> Self {
        Self {
            client,
            max_body_bytes,
        }
    }

    /// Perform a guest `fetch`, logging it to the scope's worker.
    pub async fn fetch(&self, scope: &GuestScope, request: HttpRequest) -> Result<HttpResponse, HostError> {
        let worker_id = scope.worker_id();
        let logs = scope.logs();
        let method = request.method.to_ascii_uppercase();
        let url = request.url.clone();
        logs.info(worker_id, format!("fetch {method} {url}"));

        let start = Instant::now();
        match self.send(request).await {
            Ok(response) => {
                info!(
                    worker_id,
                    url = %url,
                    status = response.status,
                    duration_ms = start.elapsed().as_millis(),
                    "Outbound request completed"
                );
                logs.info(worker_id, format!("fetch {method} {url} -> {}", response.status));
                Ok(response)
            }
            Err(e) => {
                warn!(worker_id, url = %url, error = %e, "Outbound request failed");
                logs.error(worker_id, format!("fetch {method} {url} failed: {e}"));
                Err(e)
            }
        }
    }

    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HostError> {
        let target = validate_url(&request.url)?;
        let method = Method::from_bytes(request.method.to_ascii_uppercase().as_bytes()).map_err(
            |_| HostError::invalid_argument(format!("invalid HTTP method '{}'", request.method)),
        )?;

        debug!(method = %method, url = %target, "Executing HTTP request");

        let mut builder = self.client.request(method, target);
        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }
        if let Some(body) = request.body {
            let bytes = hex::decode(body)
                .map_err(|e| HostError::invalid_argument(format!("invalid request body: {e}")))?;
            builder = builder.body(bytes);
        }

        let failed = |e: reqwest::Error| HostError::OutboundFailed {
            url: request.url.clone(),
            reason: e.to_string(),
        };
        let mut response = builder.send().await.map_err(failed)?;

        let limit = self.max_body_bytes;
        if response
            .content_length()
            .is_some_and(|len| usize::try_from(len).map_or(true, |len| len > limit))
        {
            return Err(HostError::BodyTooLarge { limit });
        }

        let status = response.status();
        let final_url = response.url().to_string();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|v| (k.as_str().to_string(), v.to_string()))
            })
            .collect();

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(failed)? {
            if body.len() + chunk.len() > limit {
                return Err(HostError::BodyTooLarge { limit });
            }
            body.extend_from_slice(&chunk);
        }

        Ok(HttpResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            url: final_url,
            headers,
            body: (!body.is_empty()).then(|| hex::encode(&body)),
        })
    }
}

/// Only absolute `http` and `https` URLs leave the sandbox.
fn validate_url(raw: &str) -> Result<url::Url, HostError> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| HostError::invalid_argument(format!("invalid URL '{raw}': {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        scheme => Err(HostError::invalid_argument(format!(
            "unsupported URL scheme '{scheme}'"
        ))),
    }
}
