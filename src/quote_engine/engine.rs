use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use super::rates::RateTable;
use crate::error::{AppError, AppResult, CreditError};
use crate::ledger::models::{AuditEventType, SwapRecord, SwapStatus};
use crate::ledger::store::LedgerStore;

/// Fresh ids tried before a swap gives up on collisions
const MAX_SWAP_ID_ATTEMPTS: u32 = 8;

/// Result of pricing a swap, before anything is written
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapQuote {
    pub asset: String,
    pub provider: String,
    pub source_amount: Decimal,
    pub credit_amount: Decimal,
    pub rate: Decimal,
}

/// Exchange calculator - converts blockchain token amounts into provider credits
///
/// Pricing is pure; `record_swap` is the only method that writes, and it does
/// so through a single `LedgerStore::apply_swap` transaction.
pub struct ExchangeCalculator {
    rates: Arc<RateTable>,
    ledger: Arc<dyn LedgerStore>,
    counter: AtomicU64,
}

impl ExchangeCalculator {
    pub fn new(rates: Arc<RateTable>, ledger: Arc<dyn LedgerStore>) -> Self {
        Self {
            rates,
            ledger,
            counter: AtomicU64::new(0),
        }
    }

    pub fn rates(&self) -> &Arc<RateTable> {
        &self.rates
    }

    /// Credits `amount` of `asset` would buy from `provider`
    pub fn quote(&self, amount: Decimal, asset: &str, provider: &str) -> AppResult<SwapQuote> {
        if amount <= Decimal::ZERO {
            return Err(CreditError::InvalidAmount(format!(
                "Swap amount must be greater than zero, got {}",
                amount
            ))
            .into());
        }

        let rate = self.rates.rate(asset, provider)?;
        let credit_amount = amount
            .checked_mul(rate)
            .ok_or_else(|| CreditError::InvalidAmount(format!("Swap amount {} too large", amount)))?
            .normalize();

        if credit_amount <= Decimal::ZERO {
            return Err(CreditError::InvalidAmount(format!(
                "Swap amount {} buys no credit",
                amount
            ))
            .into());
        }

        Ok(SwapQuote {
            asset: asset.to_uppercase(),
            provider: provider.to_lowercase(),
            source_amount: amount,
            credit_amount,
            rate,
        })
    }

    /// Price the swap and credit the account in one ledger transaction
    #[instrument(skip(self))]
    pub async fn record_swap(
        &self,
        account: &str,
        amount: Decimal,
        asset: &str,
        provider: &str,
    ) -> AppResult<SwapRecord> {
        if account.trim().is_empty() {
            return Err(AppError::InvalidInput("Account must not be empty".to_string()));
        }

        let quote = self.quote(amount, asset, provider)?;

        for attempt in 1..=MAX_SWAP_ID_ATTEMPTS {
            let swap_id = self.next_swap_id(account, &quote);
            let record = SwapRecord {
                transaction_hash: transaction_hash(&swap_id),
                swap_id,
                account_id: account.to_string(),
                asset: quote.asset.clone(),
                provider: quote.provider.clone(),
                source_amount: quote.source_amount,
                credit_amount: quote.credit_amount,
                rate: quote.rate,
                status: SwapStatus::Completed,
                created_at: Utc::now(),
            };

            match self.ledger.apply_swap(&record).await {
                Ok(balance) => {
                    info!(
                        "Swap {} recorded: {} {} -> {} {} credits (balance {})",
                        record.swap_id,
                        record.source_amount,
                        record.asset,
                        record.credit_amount,
                        record.provider,
                        balance.amount
                    );

                    if let Err(e) = self
                        .ledger
                        .log_audit_event(
                            AuditEventType::SwapRecorded,
                            Some(record.swap_id.clone()),
                            Some(account),
                            serde_json::json!({
                                "asset": record.asset,
                                "provider": record.provider,
                                "source_amount": record.source_amount.to_string(),
                                "credit_amount": record.credit_amount.to_string(),
                                "rate": record.rate.to_string(),
                            }),
                        )
                        .await
                    {
                        warn!("Failed to audit swap {}: {}", record.swap_id, e);
                    }

                    return Ok(record);
                }
                Err(AppError::Credit(CreditError::DuplicateSwapId(id))) => {
                    warn!("Swap id {} collided (attempt {}), regenerating", id, attempt);
                }
                Err(e) => return Err(e),
            }
        }

        Err(AppError::Internal(format!(
            "Could not allocate a unique swap id after {} attempts",
            MAX_SWAP_ID_ATTEMPTS
        )))
    }

    fn next_swap_id(&self, account: &str, quote: &SwapQuote) -> String {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        swap_id(
            account,
            &quote.asset,
            &quote.provider,
            quote.source_amount,
            counter,
            nanos,
        )
    }
}

/// First 16 hex chars of SHA-256 over the swap inputs
pub fn swap_id(
    account: &str,
    asset: &str,
    provider: &str,
    amount: Decimal,
    counter: u64,
    nanos: i64,
) -> String {
    let digest = Sha256::digest(
        format!("{}:{}:{}:{}:{}:{}", account, asset, provider, amount, counter, nanos).as_bytes(),
    );
    hex::encode(digest)[..16].to_string()
}

/// Synthetic reference shown to wallets for a local swap
pub fn transaction_hash(swap_id: &str) -> String {
    format!("0x{}", hex::encode(Sha256::digest(swap_id.as_bytes())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::models::CreditBalance;
    use crate::ledger::InMemoryLedgerStore;
    use rust_decimal_macros::dec;

    fn calculator() -> (ExchangeCalculator, Arc<InMemoryLedgerStore>) {
        let ledger = Arc::new(InMemoryLedgerStore::new());
        let calc = ExchangeCalculator::new(Arc::new(RateTable::with_defaults()), ledger.clone());
        (calc, ledger)
    }

    #[test]
    fn test_quote_usdc_to_openai() {
        let (calc, _) = calculator();
        let quote = calc.quote(dec!(100), "USDC", "openai").unwrap();
        assert_eq!(quote.credit_amount, dec!(0.002));
        assert_eq!(quote.rate, dec!(0.00002));
    }

    #[test]
    fn test_quote_rejects_bad_input() {
        let (calc, _) = calculator();
        assert!(matches!(
            calc.quote(dec!(0), "USDC", "openai"),
            Err(AppError::Credit(CreditError::InvalidAmount(_)))
        ));
        assert!(matches!(
            calc.quote(dec!(-5), "USDC", "openai"),
            Err(AppError::Credit(CreditError::InvalidAmount(_)))
        ));
        assert!(matches!(
            calc.quote(dec!(100), "DOGE", "openai"),
            Err(AppError::Credit(CreditError::UnsupportedPair { .. }))
        ));
    }

    #[test]
    fn test_swap_id_shape() {
        let id = swap_id("0xabc", "USDC", "openai", dec!(100), 0, 1);
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, swap_id("0xabc", "USDC", "openai", dec!(100), 1, 1));

        let hash = transaction_hash(&id);
        assert!(hash.starts_with("0x"));
        assert_eq!(hash.len(), 66);
    }

    #[tokio::test]
    async fn test_back_to_back_swaps_get_distinct_ids() {
        let (calc, ledger) = calculator();

        let first = calc.record_swap("0xabc", dec!(100), "USDC", "openai").await.unwrap();
        let second = calc.record_swap("0xabc", dec!(100), "USDC", "openai").await.unwrap();

        assert_ne!(first.swap_id, second.swap_id);
        assert_eq!(first.credit_amount, dec!(0.002));

        let balance: CreditBalance = ledger.get_balance("0xabc", "openai").await.unwrap();
        assert_eq!(balance.amount, dec!(0.004));
        assert_eq!(ledger.list_swaps("0xabc").await.unwrap().len(), 2);
        assert_eq!(ledger.audit_events().len(), 2);
    }

    #[tokio::test]
    async fn test_unsupported_swap_writes_nothing() {
        let (calc, ledger) = calculator();

        let err = calc.record_swap("0xabc", dec!(100), "DOGE", "openai").await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Credit(CreditError::UnsupportedPair { .. })
        ));
        assert!(ledger.list_swaps("0xabc").await.unwrap().is_empty());
        assert!(ledger.list_balances("0xabc").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_account_rejected() {
        let (calc, _) = calculator();
        assert!(matches!(
            calc.record_swap("  ", dec!(1), "USDC", "openai").await,
            Err(AppError::InvalidInput(_))
        ));
    }
}
