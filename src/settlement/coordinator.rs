use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult, CreditError, SettlementError};
use crate::execution::{ExternalLedgerClient, MeteredWorkExecutor, WorkResult, WorkUnit};
use crate::ledger::models::*;
use crate::ledger::store::LedgerStore;
use crate::quote_engine::{CostModel, RateTable};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub work_timeout: Duration,
    pub debit_timeout: Duration,
    /// Delay before the reconciliation worker first looks at a failed debit
    pub min_backoff: chrono::Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            work_timeout: Duration::from_secs(30),
            debit_timeout: Duration::from_secs(10),
            min_backoff: chrono::Duration::seconds(5),
        }
    }
}

/// What a caller gets back once the work has been delivered
#[derive(Debug, Clone, Serialize)]
pub struct ConsumeOutcome {
    pub attempt_id: Uuid,
    pub result: WorkResult,
    pub state: SettlementState,
    pub tx_reference: Option<TxReference>,
    #[serde(with = "rust_decimal::serde::float")]
    pub cost: Decimal,
    /// The external charge has not landed yet and is queued for reconciliation
    pub reconciliation_pending: bool,
}

/// Settlement coordinator - reserve, perform the work, debit the external ledger
///
/// INVARIANTS:
/// - Credit is reserved before the work runs and released if the work fails
/// - The external debit is only submitted once `ExternalPending` is persisted
/// - A failed or ambiguous debit never fails the caller; it is queued for
///   reconciliation with the reservation still held
#[derive(Clone)]
pub struct SettlementCoordinator {
    ledger: Arc<dyn LedgerStore>,
    rates: Arc<RateTable>,
    cost_model: Arc<dyn CostModel>,
    executor: Arc<dyn MeteredWorkExecutor>,
    external: Arc<dyn ExternalLedgerClient>,
    config: CoordinatorConfig,
}

impl SettlementCoordinator {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        rates: Arc<RateTable>,
        cost_model: Arc<dyn CostModel>,
        executor: Arc<dyn MeteredWorkExecutor>,
        external: Arc<dyn ExternalLedgerClient>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            ledger,
            rates,
            cost_model,
            executor,
            external,
            config,
        }
    }

    /// Price a unit of work in `provider` credits without touching the ledger
    pub fn cost_of(&self, provider: &str, unit: &WorkUnit) -> AppResult<Decimal> {
        if !self.rates.supports_provider(provider) {
            return Err(CreditError::UnsupportedPair {
                asset: "credit".to_string(),
                provider: provider.to_string(),
            }
            .into());
        }

        let cost = self.cost_model.cost(provider, unit)?;
        if cost <= Decimal::ZERO {
            return Err(CreditError::InvalidAmount(format!(
                "Work cost must be greater than zero, got {}",
                cost
            ))
            .into());
        }
        Ok(cost)
    }

    #[instrument(skip(self, unit), fields(model = %unit.model))]
    pub async fn consume(
        &self,
        account: &str,
        provider: &str,
        unit: WorkUnit,
    ) -> AppResult<ConsumeOutcome> {
        if account.trim().is_empty() {
            return Err(AppError::InvalidInput("Account must not be empty".to_string()));
        }
        let provider = provider.to_lowercase();
        let cost = self.cost_of(&provider, &unit)?;

        let attempt = SettlementAttempt::new(account, &provider, cost, unit.summary());
        self.ledger.create_attempt(&attempt).await?;
        info!("Settlement attempt {} initiated: cost {} {}", attempt.id, cost, provider);

        // Step 1: reserve under the attempt id, so recovery can find the hold
        // even if the attempt row never got linked to it
        let token = match self
            .ledger
            .try_reserve_as(attempt.id, account, &provider, cost)
            .await
        {
            Ok(token) => token,
            Err(e) => {
                if let AppError::Credit(CreditError::InsufficientCredit { .. }) = e {
                    warn!("Attempt {} rejected: {}", attempt.id, e);
                    self.advance(
                        attempt.id,
                        SettlementState::Initiated,
                        SettlementState::InsufficientCredit,
                        AttemptPatch::error(e.to_string()),
                    )
                    .await;
                    self.audit(
                        AuditEventType::CreditRejected,
                        &attempt,
                        serde_json::json!({ "cost": cost.to_string(), "error": e.to_string() }),
                    )
                    .await;
                }
                return Err(e);
            }
        };

        if let Err(e) = self
            .ledger
            .transition_attempt(
                attempt.id,
                SettlementState::Initiated,
                SettlementState::Reserved,
                AttemptPatch::reservation(token),
            )
            .await
        {
            error!("Could not mark attempt {} reserved: {}", attempt.id, e);
            if let Err(release_err) = self.ledger.release_reservation(token).await {
                error!("Could not release reservation {}: {}", token, release_err);
            }
            return Err(e);
        }

        // Step 2: perform the work
        let result = match timeout(self.config.work_timeout, self.executor.perform(&unit)).await
        {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => return Err(self.fail_work(&attempt, token, e.to_string()).await),
            Err(_) => {
                let reason = SettlementError::Timeout(self.config.work_timeout.as_millis() as u64);
                return Err(self.fail_work(&attempt, token, reason.to_string()).await);
            }
        };

        // Steps 3+: run detached so a dropped request cannot strand the debit
        let this = self.clone();
        let account_owned = account.to_string();
        let attempt_id = attempt.id;
        let settled = tokio::spawn(async move {
            this.settle(attempt_id, &account_owned, cost, token).await
        })
        .await;

        let (state, tx_reference) = match settled {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Settlement task for attempt {} aborted: {}", attempt_id, e);
                (SettlementState::ExternalPending, None)
            }
        };

        Ok(ConsumeOutcome {
            attempt_id,
            result,
            state,
            tx_reference,
            cost,
            reconciliation_pending: !state.is_settled(),
        })
    }

    async fn fail_work(
        &self,
        attempt: &SettlementAttempt,
        token: ReservationToken,
        reason: String,
    ) -> AppError {
        warn!("Work for attempt {} failed: {}", attempt.id, reason);

        self.advance(
            attempt.id,
            SettlementState::Reserved,
            SettlementState::WorkFailed,
            AttemptPatch::error(reason.clone()),
        )
        .await;

        if let Err(e) = self.ledger.release_reservation(token).await {
            error!("Could not release reservation {} after work failure: {}", token, e);
        }

        self.audit(
            AuditEventType::WorkFailed,
            attempt,
            serde_json::json!({ "error": reason }),
        )
        .await;

        SettlementError::WorkUnavailable(reason).into()
    }

    /// Debit the external ledger and record the result. Never returns an error:
    /// anything short of a committed debit ends in `ReconcileQueued`.
    async fn settle(
        &self,
        attempt_id: Uuid,
        account: &str,
        cost: Decimal,
        token: ReservationToken,
    ) -> (SettlementState, Option<TxReference>) {
        if !self
            .advance(
                attempt_id,
                SettlementState::Reserved,
                SettlementState::WorkDone,
                AttemptPatch::none(),
            )
            .await
        {
            return (SettlementState::Reserved, None);
        }

        if !self
            .advance(
                attempt_id,
                SettlementState::WorkDone,
                SettlementState::ExternalPending,
                AttemptPatch::none(),
            )
            .await
        {
            return (SettlementState::WorkDone, None);
        }

        let key = attempt_id.to_string();
        let debit = timeout(
            self.config.debit_timeout,
            self.external.debit(account, cost, &key),
        )
        .await;

        let failure = match debit {
            Ok(Ok(tx)) => match self.ledger.commit_reservation(token).await {
                Ok(()) => {
                    if self
                        .advance(
                            attempt_id,
                            SettlementState::ExternalPending,
                            SettlementState::Settled,
                            AttemptPatch::tx_reference(tx.clone()),
                        )
                        .await
                    {
                        info!("Attempt {} settled: {}", attempt_id, tx);
                        self.audit_id(
                            AuditEventType::AttemptSettled,
                            attempt_id,
                            account,
                            serde_json::json!({ "tx_reference": tx, "cost": cost.to_string() }),
                        )
                        .await;
                        return (SettlementState::Settled, Some(tx));
                    }
                    format!("debit {} landed but settlement could not be recorded", tx)
                }
                Err(e) => {
                    error!("Debit {} landed but commit failed for {}: {}", tx, attempt_id, e);
                    format!("debit {} landed but commit failed: {}", tx, e)
                }
            },
            Ok(Err(e)) => e.to_string(),
            Err(_) => SettlementError::Timeout(self.config.debit_timeout.as_millis() as u64)
                .to_string(),
        };

        self.queue_for_reconciliation(attempt_id, account, failure).await
    }

    async fn queue_for_reconciliation(
        &self,
        attempt_id: Uuid,
        account: &str,
        failure: String,
    ) -> (SettlementState, Option<TxReference>) {
        warn!("External debit for attempt {} failed: {}", attempt_id, failure);

        if !self
            .advance(
                attempt_id,
                SettlementState::ExternalPending,
                SettlementState::ExternalFailed,
                AttemptPatch::error(failure.clone()),
            )
            .await
        {
            return (SettlementState::ExternalPending, None);
        }

        let next_retry_at = Utc::now() + self.config.min_backoff;
        match self
            .ledger
            .queue_for_reconciliation(attempt_id, next_retry_at)
            .await
        {
            Ok(_) => {
                info!("Attempt {} queued for reconciliation at {}", attempt_id, next_retry_at);
                self.audit_id(
                    AuditEventType::AttemptQueued,
                    attempt_id,
                    account,
                    serde_json::json!({ "error": failure, "next_retry_at": next_retry_at }),
                )
                .await;
                (SettlementState::ReconcileQueued, None)
            }
            Err(e) => {
                error!("Could not queue attempt {} for reconciliation: {}", attempt_id, e);
                (SettlementState::ExternalFailed, None)
            }
        }
    }

    /// Persist a transition, logging instead of failing
    async fn advance(
        &self,
        attempt_id: Uuid,
        from: SettlementState,
        to: SettlementState,
        patch: AttemptPatch,
    ) -> bool {
        match self.ledger.transition_attempt(attempt_id, from, to, patch).await {
            Ok(_) => true,
            Err(e) => {
                error!(
                    "Attempt {} stuck: could not move {} -> {}: {}",
                    attempt_id, from, to, e
                );
                false
            }
        }
    }

    async fn audit(
        &self,
        event: AuditEventType,
        attempt: &SettlementAttempt,
        details: serde_json::Value,
    ) {
        self.audit_id(event, attempt.id, &attempt.account_id, details).await
    }

    async fn audit_id(
        &self,
        event: AuditEventType,
        attempt_id: Uuid,
        account: &str,
        details: serde_json::Value,
    ) {
        if let Err(e) = self
            .ledger
            .log_audit_event(event, Some(attempt_id.to_string()), Some(account), details)
            .await
        {
            warn!("Failed to audit {:?} for attempt {}: {}", event, attempt_id, e);
        }
    }
}
