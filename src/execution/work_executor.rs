use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

use super::{MeteredWorkExecutor, WorkResult, WorkUnit};
use crate::error::{AppError, AppResult, SettlementError};

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u64>,
}

/// AI provider reached over HTTP
pub struct HttpWorkExecutor {
    client: Client,
    endpoint: String,
}

impl HttpWorkExecutor {
    pub fn new(endpoint: &str, request_timeout: Duration) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| AppError::Config(format!("Cannot build AI provider client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
        })
    }
}

#[async_trait]
impl MeteredWorkExecutor for HttpWorkExecutor {
    async fn perform(&self, unit: &WorkUnit) -> AppResult<WorkResult> {
        info!("Running model {} ({} prompt chars)", unit.model, unit.prompt_chars());

        let response = self
            .client
            .post(&self.endpoint)
            .json(&CompletionRequest {
                model: &unit.model,
                prompt: &unit.prompt,
                max_tokens: unit.output_tokens,
            })
            .send()
            .await
            .map_err(|e| SettlementError::WorkUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            warn!("AI provider returned {} for model {}", status, unit.model);
            return Err(SettlementError::WorkUnavailable(format!("provider returned {}", status)).into());
        }

        let result: WorkResult = response
            .json()
            .await
            .map_err(|e| SettlementError::WorkUnavailable(format!("bad provider response: {}", e)))?;

        Ok(result)
    }
}
