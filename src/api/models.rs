use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::error::{AppError, AppResult};
use crate::execution::WorkUnit;
use crate::ledger::models::{CreditBalance, SettlementAttempt, SettlementState, SwapRecord};
use crate::settlement::ConsumeOutcome;

// ========== REQUEST MODELS ==========

/// Price a swap without writing anything
#[derive(Debug, Deserialize, Validate)]
pub struct SwapQuoteRequest {
    /// Decimal string, e.g. "100.5"
    #[validate(custom = "validate_decimal")]
    pub blockchain_token_amount: String,
    #[validate(length(min = 1, max = 16))]
    pub blockchain_token_symbol: String,
    #[validate(length(min = 1, max = 64))]
    pub ai_provider: String,
}

/// Exchange blockchain tokens for provider credit
#[derive(Debug, Deserialize, Validate)]
pub struct TokenSwapRequest {
    #[validate(length(min = 1, max = 128))]
    pub wallet_address: String,
    #[validate(custom = "validate_decimal")]
    pub blockchain_token_amount: String,
    #[validate(length(min = 1, max = 16))]
    pub blockchain_token_symbol: String,
    #[validate(length(min = 1, max = 64))]
    pub ai_provider: String,
}

/// Spend credit on one metered AI call
#[derive(Debug, Deserialize, Validate)]
pub struct ConsumeRequest {
    #[validate(length(min = 1, max = 128))]
    pub wallet_address: String,
    #[validate(length(min = 1, max = 64))]
    pub ai_provider: String,
    #[validate(length(min = 1, max = 64))]
    pub model: String,
    #[validate(length(min = 1, max = 100000))]
    pub prompt: String,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

impl ConsumeRequest {
    pub fn work_unit(&self) -> WorkUnit {
        let mut unit = WorkUnit::new(self.model.clone(), self.prompt.clone());
        unit.input_tokens = self.input_tokens;
        unit.output_tokens = self.output_tokens;
        unit
    }
}

fn validate_decimal(value: &str) -> Result<(), ValidationError> {
    Decimal::from_str(value.trim())
        .map(|_| ())
        .map_err(|_| ValidationError::new("not_a_decimal"))
}

/// Parse an already-validated amount string
pub fn parse_amount(value: &str) -> AppResult<Decimal> {
    Decimal::from_str(value.trim())
        .map_err(|e| AppError::InvalidInput(format!("Invalid amount {:?}: {}", value, e)))
}

// ========== RESPONSE MODELS ==========

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub service: String,
    pub version: String,
}

/// asset -> provider -> credits per unit
pub type ExchangeRatesResponse = BTreeMap<String, BTreeMap<String, String>>;

#[derive(Debug, Serialize)]
pub struct SupportedTokensResponse {
    pub blockchain_tokens: Vec<String>,
    pub ai_providers: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct SwapQuoteResponse {
    pub blockchain_token_symbol: String,
    pub ai_provider: String,
    pub blockchain_token_amount: String,
    pub ai_credits: String,
    pub exchange_rate: String,
}

#[derive(Debug, Serialize)]
pub struct SwapResponse {
    pub swap_id: String,
    pub wallet_address: String,
    pub blockchain_token_symbol: String,
    pub ai_provider: String,
    pub blockchain_tokens_sent: String,
    pub ai_credits_received: String,
    pub exchange_rate: String,
    pub timestamp: DateTime<Utc>,
    pub status: String,
    pub transaction_hash: String,
}

impl From<SwapRecord> for SwapResponse {
    fn from(swap: SwapRecord) -> Self {
        Self {
            swap_id: swap.swap_id,
            wallet_address: swap.account_id,
            blockchain_token_symbol: swap.asset,
            ai_provider: swap.provider,
            blockchain_tokens_sent: swap.source_amount.to_string(),
            ai_credits_received: swap.credit_amount.to_string(),
            exchange_rate: swap.rate.to_string(),
            timestamp: swap.created_at,
            status: "completed".to_string(),
            transaction_hash: swap.transaction_hash,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub wallet_address: String,
    pub ai_provider: String,
    pub credit_balance: String,
    pub reserved: String,
    pub available: String,
    pub tokens_available: i64,
}

impl From<CreditBalance> for BalanceResponse {
    fn from(balance: CreditBalance) -> Self {
        Self {
            tokens_available: balance.tokens_available(),
            available: balance.available().to_string(),
            credit_balance: balance.amount.to_string(),
            reserved: balance.reserved_amount.to_string(),
            wallet_address: balance.account_id,
            ai_provider: balance.provider,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ConsumeResponse {
    pub attempt_id: Uuid,
    pub response: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub credits_used: String,
    pub state: SettlementState,
    pub tx_reference: Option<String>,
    pub reconciliation_pending: bool,
    /// Spendable credit left for the provider once this charge is held or settled
    pub new_balance: Option<String>,
    /// Set when the external charge is still being reconciled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl From<ConsumeOutcome> for ConsumeResponse {
    fn from(outcome: ConsumeOutcome) -> Self {
        let warning = outcome.reconciliation_pending.then(|| {
            "External settlement is pending; the charge will be reconciled".to_string()
        });
        Self {
            attempt_id: outcome.attempt_id,
            response: outcome.result.text,
            input_tokens: outcome.result.input_tokens,
            output_tokens: outcome.result.output_tokens,
            credits_used: outcome.cost.to_string(),
            state: outcome.state,
            tx_reference: outcome.tx_reference,
            reconciliation_pending: outcome.reconciliation_pending,
            new_balance: None,
            warning,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SettlementAttemptResponse {
    pub attempt_id: Uuid,
    pub wallet_address: String,
    pub ai_provider: String,
    pub cost: String,
    pub state: SettlementState,
    pub tx_reference: Option<String>,
    pub work_summary: String,
    pub last_error: Option<String>,
    pub retry_count: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub escalated: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<SettlementAttempt> for SettlementAttemptResponse {
    fn from(attempt: SettlementAttempt) -> Self {
        Self {
            attempt_id: attempt.id,
            wallet_address: attempt.account_id,
            ai_provider: attempt.provider,
            cost: attempt.cost.to_string(),
            state: attempt.state,
            tx_reference: attempt.tx_reference,
            work_summary: attempt.work_summary,
            last_error: attempt.last_error,
            retry_count: attempt.retry_count,
            next_retry_at: attempt.next_retry_at,
            escalated: attempt.escalated_at.is_some(),
            created_at: attempt.created_at,
            updated_at: attempt.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_swap_request_validation() {
        let valid = TokenSwapRequest {
            wallet_address: "0xabc".to_string(),
            blockchain_token_amount: "100.5".to_string(),
            blockchain_token_symbol: "USDC".to_string(),
            ai_provider: "openai".to_string(),
        };
        assert!(valid.validate().is_ok());

        let invalid = TokenSwapRequest {
            wallet_address: String::new(),
            blockchain_token_amount: "a lot".to_string(),
            ..valid
        };
        let errors = invalid.validate().unwrap_err();
        let fields = errors.field_errors();
        assert!(fields.contains_key("wallet_address"));
        assert!(fields.contains_key("blockchain_token_amount"));
    }

    #[test]
    fn test_balance_response_reports_tokens() {
        let mut balance = CreditBalance::empty("0xabc", "openai");
        balance.amount = dec!(0.5);
        balance.reserved_amount = dec!(0.2);

        let response = BalanceResponse::from(balance);
        assert_eq!(response.credit_balance, "0.5");
        assert_eq!(response.available, "0.3");
        assert_eq!(response.tokens_available, 300_000);
    }

    #[test]
    fn test_parse_amount() {
        assert_eq!(parse_amount(" 1.25 ").unwrap(), dec!(1.25));
        assert!(matches!(parse_amount("x"), Err(AppError::InvalidInput(_))));
    }
}
