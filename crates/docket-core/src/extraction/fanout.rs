use std::collections::BTreeMap;
use std::time::Duration;

use futures::future::join_all;
use serde::de::DeserializeOwned;

use super::{Endpoint, ExtractionClient, ExtractionError, ExtractionResult};

/// Issues every call of a stage concurrently and joins on all of them.
///
/// The merged map is returned only when every call succeeded; a single
/// failure fails the whole stage and nothing is merged.
#[derive(Clone)]
pub struct FanOut {
    client: ExtractionClient,
}

impl FanOut {
    #[must_use]
    pub const fn new(client: ExtractionClient) -> Self {
        Self { client }
    }

    #[must_use]
    pub const fn client(&self) -> &ExtractionClient {
        &self.client
    }

    pub async fn run<T: DeserializeOwned>(
        &self,
        endpoints: &[Endpoint],
        timeout: Duration,
    ) -> ExtractionResult<BTreeMap<String, T>> {
        if endpoints.is_empty() {
            return Ok(BTreeMap::new());
        }

        let calls = endpoints.iter().map(|endpoint| async move {
            let outcome = self.client.call::<T>(endpoint, timeout).await;
            (endpoint.name.clone(), outcome)
        });
        let settled = join_all(calls).await;

        let mut merged = BTreeMap::new();
        let mut failed = Vec::new();
        let mut first: Option<ExtractionError> = None;

        for (name, outcome) in settled {
            match outcome {
                Ok(value) => {
                    merged.insert(name, value);
                }
                Err(e) => {
                    failed.push(name);
                    if first.is_none() {
                        first = Some(e);
                    }
                }
            }
        }

        match first {
            None => Ok(merged),
            Some(first) => {
                tracing::warn!(
                    failed = failed.len(),
                    total = endpoints.len(),
                    "Stage fan-out failed"
                );
                Err(ExtractionError::Stage {
                    failed,
                    first: Box::new(first),
                })
            }
        }
    }
}
