use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use super::{ExternalLedgerClient, ExternalStatus};
use crate::error::{AppError, AppResult, SettlementError};
use crate::ledger::models::TxReference;

#[derive(Debug, Serialize)]
struct DebitRequest<'a> {
    account: &'a str,
    amount: String,
    idempotency_key: &'a str,
}

#[derive(Debug, Deserialize)]
struct DebitResponse {
    tx_reference: String,
}

#[derive(Debug, Deserialize)]
struct DebitStatusResponse {
    status: String,
    tx_reference: Option<String>,
}

/// HTTP gateway in front of the external settlement ledger
pub struct HttpLedgerClient {
    client: Client,
    base_url: String,
}

impl HttpLedgerClient {
    pub fn new(base_url: &str, request_timeout: Duration) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| AppError::Config(format!("Cannot build ledger HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

/// 4xx: the gateway refused the debit outright. Anything else is ambiguous.
fn classify_failure(status: StatusCode, body: &str) -> AppError {
    if status.is_client_error() {
        SettlementError::Rejected(format!("{}: {}", status, body)).into()
    } else {
        SettlementError::Unconfirmed(format!("{}: {}", status, body)).into()
    }
}

#[async_trait]
impl ExternalLedgerClient for HttpLedgerClient {
    async fn debit(
        &self,
        account: &str,
        amount: Decimal,
        idempotency_key: &str,
    ) -> AppResult<TxReference> {
        let url = format!("{}/debits", self.base_url);
        debug!("Submitting debit {} for {} ({})", idempotency_key, account, amount);

        let response = self
            .client
            .post(&url)
            .json(&DebitRequest {
                account,
                amount: amount.to_string(),
                idempotency_key,
            })
            .send()
            .await
            .map_err(|e| SettlementError::Unconfirmed(format!("Debit transport error: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("Ledger gateway refused debit {}: {}", idempotency_key, status);
            return Err(classify_failure(status, &body));
        }

        let body: DebitResponse = response.json().await.map_err(|e| {
            SettlementError::Unconfirmed(format!("Unreadable debit response: {}", e))
        })?;

        Ok(body.tx_reference)
    }

    async fn query_status(&self, idempotency_key: &str) -> AppResult<ExternalStatus> {
        let url = format!("{}/debits/{}", self.base_url, idempotency_key);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SettlementError::Unconfirmed(format!("Status transport error: {}", e)))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(ExternalStatus::Absent);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SettlementError::Unconfirmed(format!("{}: {}", status, body)).into());
        }

        let body: DebitStatusResponse = response.json().await.map_err(|e| {
            SettlementError::Unconfirmed(format!("Unreadable status response: {}", e))
        })?;

        match (body.status.as_str(), body.tx_reference) {
            ("confirmed", Some(tx)) => Ok(ExternalStatus::Confirmed(tx)),
            ("pending", _) => Ok(ExternalStatus::Pending),
            ("absent", _) => Ok(ExternalStatus::Absent),
            (other, _) => Err(SettlementError::Unconfirmed(format!(
                "Unexpected debit status '{}' for {}",
                other, idempotency_key
            ))
            .into()),
        }
    }
}
