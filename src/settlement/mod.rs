// Credit settlement: swaps in, metered work out, external ledger kept in step
pub mod coordinator;
pub mod reconciler;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod testing;

pub use coordinator::{ConsumeOutcome, CoordinatorConfig, SettlementCoordinator};
pub use reconciler::{ReconcileReport, ReconcilerConfig, ReconciliationAlert, ReconciliationWorker};
pub use scheduler::ReconciliationScheduler;

use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{AppResult, SettlementError};
use crate::execution::WorkUnit;
use crate::ledger::models::{CreditBalance, SettlementAttempt, SwapRecord};
use crate::ledger::store::LedgerStore;
use crate::quote_engine::{ExchangeCalculator, RateTable, SwapQuote};

/// Public face of the engine: swap tokens for credit, spend credit on work
#[derive(Clone)]
pub struct CreditExchange {
    ledger: Arc<dyn LedgerStore>,
    calculator: Arc<ExchangeCalculator>,
    coordinator: SettlementCoordinator,
}

impl CreditExchange {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        calculator: Arc<ExchangeCalculator>,
        coordinator: SettlementCoordinator,
    ) -> Self {
        Self {
            ledger,
            calculator,
            coordinator,
        }
    }

    pub fn rates(&self) -> &Arc<RateTable> {
        self.calculator.rates()
    }

    pub fn quote_swap(&self, amount: Decimal, asset: &str, provider: &str) -> AppResult<SwapQuote> {
        self.calculator.quote(amount, asset, provider)
    }

    pub async fn record_swap(
        &self,
        account: &str,
        amount: Decimal,
        asset: &str,
        provider: &str,
    ) -> AppResult<SwapRecord> {
        self.calculator.record_swap(account, amount, asset, provider).await
    }

    pub async fn get_balance(&self, account: &str, provider: &str) -> AppResult<CreditBalance> {
        self.ledger.get_balance(account, &provider.to_lowercase()).await
    }

    pub async fn list_balances(&self, account: &str) -> AppResult<Vec<CreditBalance>> {
        self.ledger.list_balances(account).await
    }

    pub async fn list_swaps(&self, account: &str) -> AppResult<Vec<SwapRecord>> {
        self.ledger.list_swaps(account).await
    }

    pub fn cost_of(&self, provider: &str, unit: &WorkUnit) -> AppResult<Decimal> {
        self.coordinator.cost_of(&provider.to_lowercase(), unit)
    }

    pub async fn consume(
        &self,
        account: &str,
        provider: &str,
        unit: WorkUnit,
    ) -> AppResult<ConsumeOutcome> {
        self.coordinator.consume(account, provider, unit).await
    }

    pub async fn get_attempt(&self, attempt_id: Uuid) -> AppResult<SettlementAttempt> {
        self.ledger
            .get_attempt(attempt_id)
            .await?
            .ok_or_else(|| SettlementError::AttemptNotFound(attempt_id).into())
    }

    pub async fn list_attempts(&self, account: &str) -> AppResult<Vec<SettlementAttempt>> {
        self.ledger.list_attempts(account).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AppError, CreditError};
    use crate::ledger::models::SettlementState;
    use crate::settlement::testing::*;
    use rust_decimal_macros::dec;

    fn exchange(h: &Harness) -> CreditExchange {
        let calculator = Arc::new(ExchangeCalculator::new(
            Arc::new(RateTable::with_defaults()),
            h.ledger.clone(),
        ));
        CreditExchange::new(h.ledger.clone(), calculator, h.coordinator.clone())
    }

    #[tokio::test]
    async fn test_swap_then_consume() {
        let h = Harness::new();
        let exchange = exchange(&h);

        let quote = exchange.quote_swap(dec!(100), "USDC", "openai").unwrap();
        assert_eq!(quote.credit_amount, dec!(0.002));

        // 1 ETH buys 50 openai credits
        exchange.record_swap("0xabc", dec!(1), "ETH", "openai").await.unwrap();
        let outcome = exchange
            .consume("0xabc", "OpenAI", unit("hello"))
            .await
            .unwrap();
        assert_eq!(outcome.state, SettlementState::Settled);

        let balance = exchange.get_balance("0xabc", "openai").await.unwrap();
        assert_eq!(balance.amount, dec!(49.95));

        let attempt = exchange.get_attempt(outcome.attempt_id).await.unwrap();
        assert_eq!(attempt.state, SettlementState::Settled);
        assert_eq!(exchange.list_attempts("0xabc").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unsupported_asset_leaves_both_ledgers_unchanged() {
        let h = Harness::new();
        let exchange = exchange(&h);

        let err = exchange
            .record_swap("0xabc", dec!(100), "DOGE", "openai")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Credit(CreditError::UnsupportedPair { .. })
        ));

        let balance = exchange.get_balance("0xabc", "openai").await.unwrap();
        assert_eq!(balance.amount, Decimal::ZERO);
        assert_eq!(h.external.debit_calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_attempt_is_not_found() {
        let h = Harness::new();
        let exchange = exchange(&h);
        assert!(matches!(
            exchange.get_attempt(Uuid::new_v4()).await,
            Err(AppError::Settlement(SettlementError::AttemptNotFound(_)))
        ));
    }
}
