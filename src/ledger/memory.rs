use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::models::*;
use super::store::{ensure_positive, validate_transition, LedgerStore};
use crate::error::{AppError, AppResult, CreditError, SettlementError};

type BalanceKey = (AccountId, String);

/// Process-local ledger for tests and local development.
///
/// Each (account, provider) balance lives in its own cell so reservations on
/// different keys never contend. State does not survive a restart.
///
/// Lock order: swaps / reservations / attempts map, then a balance cell.
#[derive(Default)]
pub struct InMemoryLedgerStore {
    balances: Mutex<HashMap<BalanceKey, Arc<Mutex<CreditBalance>>>>,
    reservations: Mutex<HashMap<Uuid, Reservation>>,
    swaps: Mutex<HashMap<String, SwapRecord>>,
    attempts: Mutex<HashMap<Uuid, SettlementAttempt>>,
    audit_log: Mutex<Vec<AuditLog>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, account: &str, provider: &str) -> Arc<Mutex<CreditBalance>> {
        let mut balances = self.balances.lock();
        balances
            .entry((account.to_string(), provider.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(CreditBalance::empty(account, provider))))
            .clone()
    }

    /// Audit events recorded so far, oldest first
    pub fn audit_events(&self) -> Vec<AuditLog> {
        self.audit_log.lock().clone()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn credit(
        &self,
        account: &str,
        provider: &str,
        amount: Decimal,
    ) -> AppResult<CreditBalance> {
        ensure_positive(amount, "Credit amount")?;

        let cell = self.cell(account, provider);
        let mut balance = cell.lock();
        balance.amount = checked_total(balance.amount, amount)?;
        balance.updated_at = Utc::now();
        Ok(balance.clone())
    }

    async fn try_reserve_as(
        &self,
        reservation_id: Uuid,
        account: &str,
        provider: &str,
        amount: Decimal,
    ) -> AppResult<ReservationToken> {
        ensure_positive(amount, "Reservation amount")?;

        let mut reservations = self.reservations.lock();
        if reservations.contains_key(&reservation_id) {
            return Err(AppError::Internal(format!(
                "Reservation {} already exists",
                reservation_id
            )));
        }

        let cell = self.cell(account, provider);
        {
            let mut balance = cell.lock();
            if !balance.has_available(amount) {
                return Err(CreditError::InsufficientCredit {
                    required: amount.to_string(),
                    available: balance.available().to_string(),
                }
                .into());
            }
            balance.reserved_amount += amount;
            balance.updated_at = Utc::now();
        }

        let now = Utc::now();
        let reservation = Reservation {
            id: reservation_id,
            account_id: account.to_string(),
            provider: provider.to_string(),
            amount,
            status: ReservationStatus::Held,
            created_at: now,
            updated_at: now,
        };
        let token = reservation.token();
        reservations.insert(reservation.id, reservation);

        Ok(token)
    }

    async fn commit_reservation(&self, token: ReservationToken) -> AppResult<()> {
        let mut reservations = self.reservations.lock();
        let reservation = reservations
            .get_mut(&token.0)
            .ok_or(CreditError::ReservationNotFound(token.0))?;

        match reservation.status {
            ReservationStatus::Committed => return Ok(()),
            ReservationStatus::Released => {
                return Err(CreditError::ReservationReleased(token.0).into())
            }
            ReservationStatus::Held => {}
        }

        let cell = self.cell(&reservation.account_id, &reservation.provider);
        let mut balance = cell.lock();
        balance.amount -= reservation.amount;
        balance.reserved_amount -= reservation.amount;
        balance.updated_at = Utc::now();

        reservation.status = ReservationStatus::Committed;
        reservation.updated_at = Utc::now();
        Ok(())
    }

    async fn release_reservation(&self, token: ReservationToken) -> AppResult<()> {
        let mut reservations = self.reservations.lock();
        let reservation = reservations
            .get_mut(&token.0)
            .ok_or(CreditError::ReservationNotFound(token.0))?;

        match reservation.status {
            ReservationStatus::Released => return Ok(()),
            ReservationStatus::Committed => {
                return Err(CreditError::ReservationCommitted(token.0).into())
            }
            ReservationStatus::Held => {}
        }

        let cell = self.cell(&reservation.account_id, &reservation.provider);
        let mut balance = cell.lock();
        balance.reserved_amount -= reservation.amount;
        balance.updated_at = Utc::now();

        reservation.status = ReservationStatus::Released;
        reservation.updated_at = Utc::now();
        Ok(())
    }

    async fn get_reservation(&self, token: ReservationToken) -> AppResult<Option<Reservation>> {
        Ok(self.reservations.lock().get(&token.0).cloned())
    }

    async fn get_balance(&self, account: &str, provider: &str) -> AppResult<CreditBalance> {
        let cell = {
            let balances = self.balances.lock();
            balances
                .get(&(account.to_string(), provider.to_string()))
                .cloned()
        };
        Ok(cell
            .map(|c| c.lock().clone())
            .unwrap_or_else(|| CreditBalance::empty(account, provider)))
    }

    async fn list_balances(&self, account: &str) -> AppResult<Vec<CreditBalance>> {
        let cells: Vec<_> = {
            let balances = self.balances.lock();
            balances
                .iter()
                .filter(|((a, _), _)| a == account)
                .map(|(_, cell)| cell.clone())
                .collect()
        };
        let mut result: Vec<CreditBalance> = cells.iter().map(|c| c.lock().clone()).collect();
        result.sort_by(|a, b| a.provider.cmp(&b.provider));
        Ok(result)
    }

    async fn apply_swap(&self, record: &SwapRecord) -> AppResult<CreditBalance> {
        ensure_positive(record.credit_amount, "Credit amount")?;

        let mut swaps = self.swaps.lock();
        if swaps.contains_key(&record.swap_id) {
            return Err(CreditError::DuplicateSwapId(record.swap_id.clone()).into());
        }

        let cell = self.cell(&record.account_id, &record.provider);
        let mut balance = cell.lock();
        balance.amount = checked_total(balance.amount, record.credit_amount)?;
        balance.updated_at = Utc::now();

        swaps.insert(record.swap_id.clone(), record.clone());
        Ok(balance.clone())
    }

    async fn list_swaps(&self, account: &str) -> AppResult<Vec<SwapRecord>> {
        let mut result: Vec<SwapRecord> = self
            .swaps
            .lock()
            .values()
            .filter(|s| s.account_id == account)
            .cloned()
            .collect();
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(result)
    }

    async fn create_attempt(&self, attempt: &SettlementAttempt) -> AppResult<()> {
        let mut attempts = self.attempts.lock();
        if attempts.contains_key(&attempt.id) {
            return Err(AppError::Internal(format!(
                "Settlement attempt {} already exists",
                attempt.id
            )));
        }
        attempts.insert(attempt.id, attempt.clone());
        Ok(())
    }

    async fn get_attempt(&self, attempt_id: Uuid) -> AppResult<Option<SettlementAttempt>> {
        Ok(self.attempts.lock().get(&attempt_id).cloned())
    }

    async fn list_attempts(&self, account: &str) -> AppResult<Vec<SettlementAttempt>> {
        let mut result: Vec<SettlementAttempt> = self
            .attempts
            .lock()
            .values()
            .filter(|a| a.account_id == account)
            .cloned()
            .collect();
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(result)
    }

    async fn transition_attempt(
        &self,
        attempt_id: Uuid,
        from: SettlementState,
        to: SettlementState,
        patch: AttemptPatch,
    ) -> AppResult<SettlementAttempt> {
        validate_transition(from, to)?;

        let mut attempts = self.attempts.lock();
        let attempt = attempts
            .get_mut(&attempt_id)
            .ok_or(SettlementError::AttemptNotFound(attempt_id))?;

        if attempt.state != from {
            return Err(SettlementError::InvalidTransition {
                from: attempt.state,
                to,
            }
            .into());
        }

        attempt.state = to;
        if let Some(reservation_id) = patch.reservation_id {
            attempt.reservation_id = Some(reservation_id);
        }
        if let Some(tx) = patch.tx_reference {
            attempt.tx_reference = Some(tx);
        }
        if let Some(error) = patch.last_error {
            attempt.last_error = Some(error);
        }
        if let Some(at) = patch.next_retry_at {
            attempt.next_retry_at = Some(at);
        }
        if patch.clear_claim {
            attempt.claimed_by = None;
            attempt.claim_expires_at = None;
        }
        attempt.updated_at = Utc::now();

        Ok(attempt.clone())
    }

    async fn stranded_attempts(
        &self,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<Vec<SettlementAttempt>> {
        let mut stranded: Vec<SettlementAttempt> = self
            .attempts
            .lock()
            .values()
            .filter(|a| a.is_stranded(updated_before))
            .cloned()
            .collect();
        stranded.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        stranded.truncate(limit.max(0) as usize);
        Ok(stranded)
    }

    async fn reconcile_candidates(
        &self,
        now: DateTime<Utc>,
        max_retries: i32,
        limit: i64,
    ) -> AppResult<Vec<SettlementAttempt>> {
        let mut due: Vec<SettlementAttempt> = self
            .attempts
            .lock()
            .values()
            .filter(|a| a.is_reconcile_candidate(now, max_retries))
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            a.next_retry_at
                .cmp(&b.next_retry_at)
                .then(a.created_at.cmp(&b.created_at))
        });
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn claim_attempt(
        &self,
        attempt_id: Uuid,
        worker_id: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        let mut attempts = self.attempts.lock();
        let attempt = match attempts.get_mut(&attempt_id) {
            Some(a) => a,
            None => return Ok(false),
        };

        if attempt.state != SettlementState::ReconcileQueued || !attempt.is_lease_free(now) {
            return Ok(false);
        }

        attempt.claimed_by = Some(worker_id.to_string());
        attempt.claim_expires_at = Some(lease_until);
        attempt.updated_at = Utc::now();
        Ok(true)
    }

    async fn record_retry_failure(
        &self,
        attempt_id: Uuid,
        worker_id: &str,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> AppResult<SettlementAttempt> {
        let mut attempts = self.attempts.lock();
        let attempt = attempts
            .get_mut(&attempt_id)
            .ok_or(SettlementError::AttemptNotFound(attempt_id))?;

        if attempt.claimed_by.as_deref() != Some(worker_id) {
            return Err(AppError::Internal(format!(
                "Worker {} no longer holds the lease on {}",
                worker_id, attempt_id
            )));
        }

        attempt.retry_count += 1;
        attempt.last_error = Some(error.to_string());
        attempt.next_retry_at = Some(next_retry_at);
        attempt.claimed_by = None;
        attempt.claim_expires_at = None;
        attempt.updated_at = Utc::now();
        Ok(attempt.clone())
    }

    async fn mark_escalated(&self, attempt_id: Uuid) -> AppResult<bool> {
        let mut attempts = self.attempts.lock();
        let attempt = attempts
            .get_mut(&attempt_id)
            .ok_or(SettlementError::AttemptNotFound(attempt_id))?;

        if attempt.escalated_at.is_some() {
            return Ok(false);
        }
        attempt.escalated_at = Some(Utc::now());
        attempt.updated_at = Utc::now();
        Ok(true)
    }

    async fn log_audit_event(
        &self,
        event_type: AuditEventType,
        entity_id: Option<String>,
        account: Option<&str>,
        details: serde_json::Value,
    ) -> AppResult<()> {
        self.audit_log.lock().push(AuditLog {
            id: Uuid::new_v4(),
            event_type,
            entity_id,
            account_id: account.map(str::to_string),
            details,
            created_at: Utc::now(),
        });
        Ok(())
    }
}

fn checked_total(balance: Decimal, amount: Decimal) -> AppResult<Decimal> {
    balance.checked_add(amount).ok_or_else(|| {
        CreditError::InvalidAmount(format!(
            "Crediting {} would overflow the balance of {}",
            amount, balance
        ))
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn swap(id: &str, account: &str, credits: Decimal) -> SwapRecord {
        SwapRecord {
            swap_id: id.to_string(),
            account_id: account.to_string(),
            asset: "USDC".to_string(),
            provider: "openai".to_string(),
            source_amount: dec!(100),
            credit_amount: credits,
            rate: dec!(0.00002),
            status: SwapStatus::Completed,
            transaction_hash: format!("0x{}", id),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_reserve_commit_release() {
        let store = InMemoryLedgerStore::new();
        store.credit("0xabc", "openai", dec!(10)).await.unwrap();

        let first = store.try_reserve("0xabc", "openai", dec!(4)).await.unwrap();
        let second = store.try_reserve("0xabc", "openai", dec!(3)).await.unwrap();

        let balance = store.get_balance("0xabc", "openai").await.unwrap();
        assert_eq!(balance.available(), dec!(3));
        assert_eq!(balance.amount, dec!(10));

        store.commit_reservation(first).await.unwrap();
        store.commit_reservation(first).await.unwrap();
        store.release_reservation(second).await.unwrap();
        store.release_reservation(second).await.unwrap();

        let balance = store.get_balance("0xabc", "openai").await.unwrap();
        assert_eq!(balance.amount, dec!(6));
        assert_eq!(balance.reserved_amount, Decimal::ZERO);

        assert!(store.release_reservation(first).await.is_err());
        assert!(store.commit_reservation(second).await.is_err());
    }

    #[tokio::test]
    async fn test_insufficient_credit_leaves_balance_unchanged() {
        let store = InMemoryLedgerStore::new();
        store.credit("0xabc", "openai", dec!(1)).await.unwrap();

        let err = store.try_reserve("0xabc", "openai", dec!(2)).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Credit(CreditError::InsufficientCredit { .. })
        ));

        let balance = store.get_balance("0xabc", "openai").await.unwrap();
        assert_eq!(balance.amount, dec!(1));
        assert_eq!(balance.reserved_amount, Decimal::ZERO);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reservations_never_overdraw() {
        let store = Arc::new(InMemoryLedgerStore::new());
        store.credit("0xabc", "openai", dec!(10)).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.try_reserve("0xabc", "openai", dec!(1)).await
            }));
        }

        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                granted += 1;
            }
        }

        assert_eq!(granted, 10);
        let balance = store.get_balance("0xabc", "openai").await.unwrap();
        assert_eq!(balance.reserved_amount, dec!(10));
        assert_eq!(balance.available(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_duplicate_swap_id_rejected() {
        let store = InMemoryLedgerStore::new();
        store.apply_swap(&swap("aaaa", "0xabc", dec!(0.002))).await.unwrap();

        let err = store
            .apply_swap(&swap("aaaa", "0xabc", dec!(0.002)))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Credit(CreditError::DuplicateSwapId(_))));

        let balance = store.get_balance("0xabc", "openai").await.unwrap();
        assert_eq!(balance.amount, dec!(0.002));
        assert_eq!(store.list_swaps("0xabc").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_credit_overflow_is_rejected() {
        let store = InMemoryLedgerStore::new();
        store.credit("0xabc", "openai", Decimal::MAX).await.unwrap();

        let err = store.credit("0xabc", "openai", dec!(1)).await.unwrap_err();
        assert!(matches!(err, AppError::Credit(CreditError::InvalidAmount(_))));

        let err = store
            .apply_swap(&swap("bbbb", "0xabc", dec!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Credit(CreditError::InvalidAmount(_))));
        assert!(store.list_swaps("0xabc").await.unwrap().is_empty());

        let balance = store.get_balance("0xabc", "openai").await.unwrap();
        assert_eq!(balance.amount, Decimal::MAX);
        assert_eq!(balance.tokens_available(), i64::MAX);
    }

    #[tokio::test]
    async fn test_reservation_keyed_by_caller_id() {
        let store = InMemoryLedgerStore::new();
        store.credit("0xabc", "openai", dec!(5)).await.unwrap();

        let id = Uuid::new_v4();
        let token = store.try_reserve_as(id, "0xabc", "openai", dec!(2)).await.unwrap();
        assert_eq!(token, ReservationToken(id));

        let err = store
            .try_reserve_as(id, "0xabc", "openai", dec!(1))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Internal(_)));

        let balance = store.get_balance("0xabc", "openai").await.unwrap();
        assert_eq!(balance.reserved_amount, dec!(2));
        let reservation = store.get_reservation(token).await.unwrap().unwrap();
        assert_eq!(reservation.status, ReservationStatus::Held);
    }

    #[tokio::test]
    async fn test_stranded_attempts_skip_fresh_and_queued() {
        let store = InMemoryLedgerStore::new();
        let old = Utc::now() - chrono::Duration::minutes(10);

        let mut stale = SettlementAttempt::new("0xabc", "openai", dec!(1), "m".to_string());
        stale.state = SettlementState::ExternalPending;
        stale.updated_at = old;
        store.create_attempt(&stale).await.unwrap();

        let fresh = SettlementAttempt::new("0xabc", "openai", dec!(1), "m".to_string());
        store.create_attempt(&fresh).await.unwrap();

        let mut queued = SettlementAttempt::new("0xabc", "openai", dec!(1), "m".to_string());
        queued.state = SettlementState::ReconcileQueued;
        queued.updated_at = old;
        store.create_attempt(&queued).await.unwrap();

        let cutoff = Utc::now() - chrono::Duration::minutes(1);
        let stranded = store.stranded_attempts(cutoff, 10).await.unwrap();
        assert_eq!(stranded.len(), 1);
        assert_eq!(stranded[0].id, stale.id);
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_swap() {
        let store = InMemoryLedgerStore::new();
        let attempt = SettlementAttempt::new("0xabc", "openai", dec!(1), "m".to_string());
        store.create_attempt(&attempt).await.unwrap();

        store
            .transition_attempt(
                attempt.id,
                SettlementState::Initiated,
                SettlementState::Reserved,
                AttemptPatch::none(),
            )
            .await
            .unwrap();

        // Stale `from` state loses the race
        let err = store
            .transition_attempt(
                attempt.id,
                SettlementState::Initiated,
                SettlementState::InsufficientCredit,
                AttemptPatch::none(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Settlement(SettlementError::InvalidTransition { .. })
        ));

        // Disallowed edge rejected before touching the row
        let err = store
            .transition_attempt(
                attempt.id,
                SettlementState::Reserved,
                SettlementState::Settled,
                AttemptPatch::none(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Settlement(SettlementError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_claim_attempt_is_exclusive_until_lease_expires() {
        let store = InMemoryLedgerStore::new();
        let mut attempt = SettlementAttempt::new("0xabc", "openai", dec!(1), "m".to_string());
        attempt.state = SettlementState::ReconcileQueued;
        store.create_attempt(&attempt).await.unwrap();

        let now = Utc::now();
        let lease = now + chrono::Duration::seconds(30);
        assert!(store.claim_attempt(attempt.id, "worker-a", lease, now).await.unwrap());
        assert!(!store.claim_attempt(attempt.id, "worker-b", lease, now).await.unwrap());

        let later = lease + chrono::Duration::seconds(1);
        assert!(store
            .claim_attempt(attempt.id, "worker-b", later + chrono::Duration::seconds(30), later)
            .await
            .unwrap());

        // worker-a lost its lease and may not record results
        assert!(store
            .record_retry_failure(attempt.id, "worker-a", "boom", later)
            .await
            .is_err());
        let updated = store
            .record_retry_failure(attempt.id, "worker-b", "boom", later)
            .await
            .unwrap();
        assert_eq!(updated.retry_count, 1);
        assert!(updated.claimed_by.is_none());
    }
}
