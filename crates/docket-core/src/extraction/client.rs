use std::time::Duration;

use reqwest::Client;
use serde::de::DeserializeOwned;
use url::Url;

use super::{ExtractionError, ExtractionResult};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// One named remote extraction call: where to send it and what to send.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub name: String,
    pub url: Url,
    pub body: serde_json::Value,
}

impl Endpoint {
    /// Join `path` onto `base`, keeping any path prefix the base carries.
    pub fn new(
        name: impl Into<String>,
        base: &Url,
        path: &str,
        body: serde_json::Value,
    ) -> crate::Result<Self> {
        let joined = format!(
            "{}/{}",
            base.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        let url = Url::parse(&joined)
            .map_err(|e| crate::Error::Config(format!("invalid endpoint URL {joined}: {e}")))?;
        Ok(Self {
            name: name.into(),
            url,
            body,
        })
    }
}

/// Single POST-JSON call with a caller-supplied deadline and no retries.
#[derive(Clone)]
pub struct ExtractionClient {
    http: Client,
}

impl ExtractionClient {
    pub fn new() -> crate::Result<Self> {
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| crate::Error::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http })
    }

    #[must_use]
    pub const fn with_client(http: Client) -> Self {
        Self { http }
    }

    pub async fn call<T: DeserializeOwned>(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> ExtractionResult<T> {
        let started = std::time::Instant::now();
        tracing::debug!(endpoint = %endpoint.name, url = %endpoint.url, "Extraction call");

        let result = tokio::time::timeout(timeout, self.send(endpoint)).await;

        match result {
            Ok(Ok(value)) => {
                tracing::debug!(
                    endpoint = %endpoint.name,
                    elapsed_ms = started.elapsed().as_millis(),
                    "Extraction call succeeded"
                );
                Ok(value)
            }
            Ok(Err(e)) => {
                tracing::warn!(endpoint = %endpoint.name, error = %e, "Extraction call failed");
                Err(e)
            }
            Err(_) => {
                tracing::warn!(
                    endpoint = %endpoint.name,
                    timeout_secs = timeout.as_secs(),
                    "Extraction call timed out"
                );
                Err(ExtractionError::Timeout {
                    endpoint: endpoint.name.clone(),
                    after: timeout,
                })
            }
        }
    }

    async fn send<T: DeserializeOwned>(&self, endpoint: &Endpoint) -> ExtractionResult<T> {
        let response = self
            .http
            .post(endpoint.url.clone())
            .json(&endpoint.body)
            .send()
            .await
            .map_err(|e| ExtractionError::Unreachable {
                endpoint: endpoint.name.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExtractionError::Status {
                endpoint: endpoint.name.clone(),
                status: status.as_u16(),
            });
        }

        let bytes = response.bytes().await.map_err(|e| ExtractionError::Aborted {
            endpoint: endpoint.name.clone(),
            reason: e.to_string(),
        })?;

        serde_json::from_slice(&bytes).map_err(|e| ExtractionError::Decode {
            endpoint: endpoint.name.clone(),
            reason: e.to_string(),
        })
    }
}
