use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::models::*;
use crate::error::{AppResult, CreditError, SettlementError};

/// Durable credit ledger and settlement attempt log.
///
/// INVARIANTS:
/// - Balance mutations are serialized per (account, provider)
/// - `try_reserve` never succeeds for more than the spendable balance
/// - Attempts are transitioned with a compare-and-swap on their current state,
///   never deleted
#[async_trait]
pub trait LedgerStore: Send + Sync {
    // ========== BALANCE OPERATIONS ==========

    /// Increase the balance. Amount must be positive.
    async fn credit(&self, account: &str, provider: &str, amount: Decimal)
        -> AppResult<CreditBalance>;

    /// Atomically hold `amount` out of the spendable balance under a
    /// caller-chosen reservation id. Fails if the id is already taken.
    async fn try_reserve_as(
        &self,
        reservation_id: Uuid,
        account: &str,
        provider: &str,
        amount: Decimal,
    ) -> AppResult<ReservationToken>;

    async fn try_reserve(
        &self,
        account: &str,
        provider: &str,
        amount: Decimal,
    ) -> AppResult<ReservationToken> {
        self.try_reserve_as(Uuid::new_v4(), account, provider, amount)
            .await
    }

    /// Make a held reservation a permanent debit. No-op if already committed.
    async fn commit_reservation(&self, token: ReservationToken) -> AppResult<()>;

    /// Return a held reservation to the spendable balance. No-op if already released.
    async fn release_reservation(&self, token: ReservationToken) -> AppResult<()>;

    async fn get_reservation(&self, token: ReservationToken) -> AppResult<Option<Reservation>>;

    /// Balance for the pair, zero if the account never held credit there
    async fn get_balance(&self, account: &str, provider: &str) -> AppResult<CreditBalance>;

    async fn list_balances(&self, account: &str) -> AppResult<Vec<CreditBalance>>;

    // ========== SWAP OPERATIONS ==========

    /// Insert the swap record and credit the account in one transaction.
    /// Fails with `DuplicateSwapId` and leaves the balance untouched on id collision.
    async fn apply_swap(&self, record: &SwapRecord) -> AppResult<CreditBalance>;

    /// Swaps for an account, newest first
    async fn list_swaps(&self, account: &str) -> AppResult<Vec<SwapRecord>>;

    // ========== SETTLEMENT ATTEMPT OPERATIONS ==========

    async fn create_attempt(&self, attempt: &SettlementAttempt) -> AppResult<()>;

    async fn get_attempt(&self, attempt_id: Uuid) -> AppResult<Option<SettlementAttempt>>;

    async fn list_attempts(&self, account: &str) -> AppResult<Vec<SettlementAttempt>>;

    /// Move an attempt from `from` to `to`, failing if it is no longer in `from`
    async fn transition_attempt(
        &self,
        attempt_id: Uuid,
        from: SettlementState,
        to: SettlementState,
        patch: AttemptPatch,
    ) -> AppResult<SettlementAttempt>;

    /// Hand a failed external debit to the reconciliation worker
    async fn queue_for_reconciliation(
        &self,
        attempt_id: Uuid,
        next_retry_at: DateTime<Utc>,
    ) -> AppResult<SettlementAttempt> {
        self.transition_attempt(
            attempt_id,
            SettlementState::ExternalFailed,
            SettlementState::ReconcileQueued,
            AttemptPatch {
                next_retry_at: Some(next_retry_at),
                ..AttemptPatch::none()
            },
        )
        .await
    }

    /// Attempts left in a mid-flight state (see `STRANDED_STATES`) and not
    /// updated since `updated_before`, oldest first
    async fn stranded_attempts(
        &self,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<Vec<SettlementAttempt>>;

    /// Queued attempts that are due, under budget, not escalated and not leased
    async fn reconcile_candidates(
        &self,
        now: DateTime<Utc>,
        max_retries: i32,
        limit: i64,
    ) -> AppResult<Vec<SettlementAttempt>>;

    /// Compare-and-swap lease claim. Returns false if another worker holds a live lease.
    async fn claim_attempt(
        &self,
        attempt_id: Uuid,
        worker_id: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AppResult<bool>;

    /// Count a failed retry, reschedule it and drop the worker's lease
    async fn record_retry_failure(
        &self,
        attempt_id: Uuid,
        worker_id: &str,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> AppResult<SettlementAttempt>;

    /// Flag an exhausted attempt for operator action. Returns false if already flagged.
    async fn mark_escalated(&self, attempt_id: Uuid) -> AppResult<bool>;

    // ========== AUDIT LOG ==========

    async fn log_audit_event(
        &self,
        event_type: AuditEventType,
        entity_id: Option<String>,
        account: Option<&str>,
        details: serde_json::Value,
    ) -> AppResult<()>;
}

pub(crate) fn ensure_positive(amount: Decimal, what: &str) -> AppResult<()> {
    if amount <= Decimal::ZERO {
        return Err(CreditError::InvalidAmount(format!(
            "{} must be greater than zero, got {}",
            what, amount
        ))
        .into());
    }
    Ok(())
}

pub(crate) fn validate_transition(from: SettlementState, to: SettlementState) -> AppResult<()> {
    if !from.can_transition_to(to) {
        return Err(SettlementError::InvalidTransition { from, to }.into());
    }
    Ok(())
}
