pub mod ledger_client;
pub mod work_executor;

pub use ledger_client::HttpLedgerClient;
pub use work_executor::HttpWorkExecutor;

use crate::error::AppResult;
use crate::ledger::models::TxReference;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One metered call to the AI provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkUnit {
    pub model: String,
    pub prompt: String,
    /// Caller-declared token counts, used by per-model pricing
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

impl WorkUnit {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            input_tokens: None,
            output_tokens: None,
        }
    }

    pub fn prompt_chars(&self) -> u64 {
        self.prompt.chars().count() as u64
    }

    /// Short description stored on the settlement attempt
    pub fn summary(&self) -> String {
        let preview: String = self.prompt.chars().take(30).collect();
        format!("{}: {}", self.model, preview)
    }
}

/// What the provider returned for a unit of work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkResult {
    pub text: String,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

/// Outcome of looking up a debit by idempotency key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternalStatus {
    /// Seen but not final
    Pending,
    Confirmed(TxReference),
    /// Never received
    Absent,
}

/// External settlement ledger that records the charge for consumed work
///
/// INVARIANTS:
/// - `debit` is idempotent per key: resubmitting a key that already landed
///   returns the original reference and never charges twice
/// - `SettlementError::Rejected` means the debit definitely did not land;
///   `SettlementError::Unconfirmed` means it may have
#[async_trait]
pub trait ExternalLedgerClient: Send + Sync {
    async fn debit(
        &self,
        account: &str,
        amount: Decimal,
        idempotency_key: &str,
    ) -> AppResult<TxReference>;

    async fn query_status(&self, idempotency_key: &str) -> AppResult<ExternalStatus>;
}

/// Performs the metered work (an AI inference call)
#[async_trait]
pub trait MeteredWorkExecutor: Send + Sync {
    /// Fails with `SettlementError::WorkUnavailable` when the provider cannot serve the call
    async fn perform(&self, unit: &WorkUnit) -> AppResult<WorkResult>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_unit_summary_truncates_prompt() {
        let unit = WorkUnit::new("AI_FLASHTX", "x".repeat(100));
        assert_eq!(unit.summary(), format!("AI_FLASHTX: {}", "x".repeat(30)));
        assert_eq!(unit.prompt_chars(), 100);
    }
}
