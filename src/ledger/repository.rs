use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Transaction};
use std::future::Future;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use super::models::*;
use super::store::{ensure_positive, validate_transition, LedgerStore};
use crate::error::{AppError, AppResult, CreditError, SettlementError};

/// SQLSTATEs for serialization failure, deadlock and lock-not-available
const CONTENTION_CODES: [&str; 3] = ["40001", "40P01", "55P03"];
const CONTENTION_RETRIES: u32 = 5;
const CONTENTION_BASE_DELAY_MS: u64 = 10;

const BALANCE_COLUMNS: &str = "account_id, provider, amount, reserved_amount, updated_at";

const RESERVATION_COLUMNS: &str =
    "id, account_id, provider, amount, status, created_at, updated_at";

const SWAP_COLUMNS: &str = "swap_id, account_id, asset, provider, source_amount, credit_amount, \
     rate, status, transaction_hash, created_at";

const ATTEMPT_COLUMNS: &str = "id, account_id, provider, cost, state, reservation_id, \
     tx_reference, work_summary, last_error, retry_count, next_retry_at, claimed_by, \
     claim_expires_at, escalated_at, created_at, updated_at";

/// Ledger repository - THE source of truth for credit balances and settlement attempts
pub struct LedgerRepository {
    pub pool: PgPool,
}

impl LedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn begin_tx(&self) -> AppResult<Transaction<'_, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    /// Re-run `op` while Postgres reports lock contention, backing off exponentially
    async fn with_contention_retry<T, F, Fut>(&self, what: &str, mut op: F) -> AppResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(err) if is_lock_contention(&err) && attempt < CONTENTION_RETRIES => {
                    let delay = CONTENTION_BASE_DELAY_MS * 2u64.pow(attempt);
                    warn!(
                        "Lock contention during {} (attempt {}), retrying in {}ms: {}",
                        what,
                        attempt + 1,
                        delay,
                        err
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn fetch_attempt(&self, attempt_id: Uuid) -> AppResult<Option<SettlementAttempt>> {
        let attempt = sqlx::query_as::<_, SettlementAttempt>(&format!(
            "SELECT {} FROM settlement_attempts WHERE id = $1",
            ATTEMPT_COLUMNS
        ))
        .bind(attempt_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(attempt)
    }

    // ========== SINGLE-SHOT TRANSACTIONS ==========

    async fn try_reserve_once(
        &self,
        reservation_id: Uuid,
        account: &str,
        provider: &str,
        amount: Decimal,
    ) -> AppResult<ReservationToken> {
        let mut tx = self.begin_tx().await?;

        // Conditional update: the row lock serializes concurrent reservations on the pair
        let result = sqlx::query(
            r#"
            UPDATE credit_balances
            SET reserved_amount = reserved_amount + $3, updated_at = NOW()
            WHERE account_id = $1 AND provider = $2 AND (amount - reserved_amount) >= $3
            "#,
        )
        .bind(account)
        .bind(provider)
        .bind(amount)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            let available = sqlx::query_scalar::<_, Decimal>(
                "SELECT amount - reserved_amount FROM credit_balances WHERE account_id = $1 AND provider = $2",
            )
            .bind(account)
            .bind(provider)
            .fetch_optional(&mut *tx)
            .await?
            .unwrap_or(Decimal::ZERO);

            return Err(CreditError::InsufficientCredit {
                required: amount.to_string(),
                available: available.to_string(),
            }
            .into());
        }

        let reservation_id = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO reservations (id, account_id, provider, amount, status)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(reservation_id)
        .bind(account)
        .bind(provider)
        .bind(amount)
        .bind(ReservationStatus::Held)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(ReservationToken(reservation_id))
    }

    /// Settle a held reservation either into a debit (`commit`) or back into the balance
    async fn finish_reservation_once(
        &self,
        token: ReservationToken,
        target: ReservationStatus,
    ) -> AppResult<()> {
        let mut tx = self.begin_tx().await?;

        let reservation = sqlx::query_as::<_, Reservation>(&format!(
            "SELECT {} FROM reservations WHERE id = $1 FOR UPDATE",
            RESERVATION_COLUMNS
        ))
        .bind(token.0)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(CreditError::ReservationNotFound(token.0))?;

        match (reservation.status, target) {
            (current, wanted) if current == wanted => return Ok(()),
            (ReservationStatus::Released, _) => {
                return Err(CreditError::ReservationReleased(token.0).into())
            }
            (ReservationStatus::Committed, _) => {
                return Err(CreditError::ReservationCommitted(token.0).into())
            }
            _ => {}
        }

        let balance_sql = match target {
            ReservationStatus::Committed => {
                r#"
                UPDATE credit_balances
                SET amount = amount - $3, reserved_amount = reserved_amount - $3, updated_at = NOW()
                WHERE account_id = $1 AND provider = $2
                "#
            }
            _ => {
                r#"
                UPDATE credit_balances
                SET reserved_amount = reserved_amount - $3, updated_at = NOW()
                WHERE account_id = $1 AND provider = $2
                "#
            }
        };

        sqlx::query(balance_sql)
            .bind(&reservation.account_id)
            .bind(&reservation.provider)
            .bind(reservation.amount)
            .execute(&mut *tx)
            .await?;

        sqlx::query("UPDATE reservations SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(token.0)
            .bind(target)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn apply_swap_once(&self, record: &SwapRecord) -> AppResult<CreditBalance> {
        let mut tx = self.begin_tx().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO swap_records (
                swap_id, account_id, asset, provider, source_amount, credit_amount,
                rate, status, transaction_hash, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (swap_id) DO NOTHING
            "#,
        )
        .bind(&record.swap_id)
        .bind(&record.account_id)
        .bind(&record.asset)
        .bind(&record.provider)
        .bind(record.source_amount)
        .bind(record.credit_amount)
        .bind(record.rate)
        .bind(record.status)
        .bind(&record.transaction_hash)
        .bind(record.created_at)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            return Err(CreditError::DuplicateSwapId(record.swap_id.clone()).into());
        }

        let balance = upsert_credit(
            &mut tx,
            &record.account_id,
            &record.provider,
            record.credit_amount,
        )
        .await?;

        tx.commit().await?;
        Ok(balance)
    }
}

async fn upsert_credit(
    tx: &mut Transaction<'_, Postgres>,
    account: &str,
    provider: &str,
    amount: Decimal,
) -> AppResult<CreditBalance> {
    let balance = sqlx::query_as::<_, CreditBalance>(&format!(
        r#"
        INSERT INTO credit_balances (account_id, provider, amount, reserved_amount)
        VALUES ($1, $2, $3, 0)
        ON CONFLICT (account_id, provider)
        DO UPDATE SET
            amount = credit_balances.amount + EXCLUDED.amount,
            updated_at = NOW()
        RETURNING {}
        "#,
        BALANCE_COLUMNS
    ))
    .bind(account)
    .bind(provider)
    .bind(amount)
    .fetch_one(&mut **tx)
    .await?;

    Ok(balance)
}

fn is_lock_contention(err: &AppError) -> bool {
    match err {
        AppError::Database(sqlx::Error::Database(db)) => db
            .code()
            .map(|code| CONTENTION_CODES.iter().any(|c| *c == code))
            .unwrap_or(false),
        _ => false,
    }
}

#[async_trait]
impl LedgerStore for LedgerRepository {
    // ========== BALANCE OPERATIONS ==========

    async fn credit(
        &self,
        account: &str,
        provider: &str,
        amount: Decimal,
    ) -> AppResult<CreditBalance> {
        ensure_positive(amount, "Credit amount")?;

        self.with_contention_retry("credit", move || async move {
            let mut tx = self.begin_tx().await?;
            let balance = upsert_credit(&mut tx, account, provider, amount).await?;
            tx.commit().await?;
            Ok(balance)
        })
        .await
    }

    async fn try_reserve_as(
        &self,
        reservation_id: Uuid,
        account: &str,
        provider: &str,
        amount: Decimal,
    ) -> AppResult<ReservationToken> {
        ensure_positive(amount, "Reservation amount")?;

        self.with_contention_retry("reserve", move || {
            self.try_reserve_once(reservation_id, account, provider, amount)
        })
        .await
    }

    async fn commit_reservation(&self, token: ReservationToken) -> AppResult<()> {
        self.with_contention_retry("commit", move || {
            self.finish_reservation_once(token, ReservationStatus::Committed)
        })
        .await
    }

    async fn release_reservation(&self, token: ReservationToken) -> AppResult<()> {
        self.with_contention_retry("release", move || {
            self.finish_reservation_once(token, ReservationStatus::Released)
        })
        .await
    }

    async fn get_reservation(&self, token: ReservationToken) -> AppResult<Option<Reservation>> {
        let reservation = sqlx::query_as::<_, Reservation>(&format!(
            "SELECT {} FROM reservations WHERE id = $1",
            RESERVATION_COLUMNS
        ))
        .bind(token.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(reservation)
    }

    async fn get_balance(&self, account: &str, provider: &str) -> AppResult<CreditBalance> {
        let balance = sqlx::query_as::<_, CreditBalance>(&format!(
            "SELECT {} FROM credit_balances WHERE account_id = $1 AND provider = $2",
            BALANCE_COLUMNS
        ))
        .bind(account)
        .bind(provider)
        .fetch_optional(&self.pool)
        .await?;

        Ok(balance.unwrap_or_else(|| CreditBalance::empty(account, provider)))
    }

    async fn list_balances(&self, account: &str) -> AppResult<Vec<CreditBalance>> {
        let balances = sqlx::query_as::<_, CreditBalance>(&format!(
            "SELECT {} FROM credit_balances WHERE account_id = $1 ORDER BY provider",
            BALANCE_COLUMNS
        ))
        .bind(account)
        .fetch_all(&self.pool)
        .await?;

        Ok(balances)
    }

    // ========== SWAP OPERATIONS ==========

    async fn apply_swap(&self, record: &SwapRecord) -> AppResult<CreditBalance> {
        ensure_positive(record.credit_amount, "Credit amount")?;

        self.with_contention_retry("swap", move || self.apply_swap_once(record))
            .await
    }

    async fn list_swaps(&self, account: &str) -> AppResult<Vec<SwapRecord>> {
        let swaps = sqlx::query_as::<_, SwapRecord>(&format!(
            "SELECT {} FROM swap_records WHERE account_id = $1 ORDER BY created_at DESC",
            SWAP_COLUMNS
        ))
        .bind(account)
        .fetch_all(&self.pool)
        .await?;

        Ok(swaps)
    }

    // ========== SETTLEMENT ATTEMPT OPERATIONS ==========

    async fn create_attempt(&self, attempt: &SettlementAttempt) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO settlement_attempts (
                id, account_id, provider, cost, state, reservation_id, tx_reference,
                work_summary, last_error, retry_count, next_retry_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(attempt.id)
        .bind(&attempt.account_id)
        .bind(&attempt.provider)
        .bind(attempt.cost)
        .bind(attempt.state)
        .bind(attempt.reservation_id)
        .bind(&attempt.tx_reference)
        .bind(&attempt.work_summary)
        .bind(&attempt.last_error)
        .bind(attempt.retry_count)
        .bind(attempt.next_retry_at)
        .bind(attempt.created_at)
        .bind(attempt.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_attempt(&self, attempt_id: Uuid) -> AppResult<Option<SettlementAttempt>> {
        self.fetch_attempt(attempt_id).await
    }

    async fn list_attempts(&self, account: &str) -> AppResult<Vec<SettlementAttempt>> {
        let attempts = sqlx::query_as::<_, SettlementAttempt>(&format!(
            "SELECT {} FROM settlement_attempts WHERE account_id = $1 ORDER BY created_at DESC",
            ATTEMPT_COLUMNS
        ))
        .bind(account)
        .fetch_all(&self.pool)
        .await?;

        Ok(attempts)
    }

    async fn transition_attempt(
        &self,
        attempt_id: Uuid,
        from: SettlementState,
        to: SettlementState,
        patch: AttemptPatch,
    ) -> AppResult<SettlementAttempt> {
        validate_transition(from, to)?;

        let updated = sqlx::query_as::<_, SettlementAttempt>(&format!(
            r#"
            UPDATE settlement_attempts
            SET state = $3,
                reservation_id = COALESCE($4, reservation_id),
                tx_reference = COALESCE($5, tx_reference),
                last_error = COALESCE($6, last_error),
                next_retry_at = COALESCE($7, next_retry_at),
                claimed_by = CASE WHEN $8 THEN NULL ELSE claimed_by END,
                claim_expires_at = CASE WHEN $8 THEN NULL ELSE claim_expires_at END,
                updated_at = NOW()
            WHERE id = $1 AND state = $2
            RETURNING {}
            "#,
            ATTEMPT_COLUMNS
        ))
        .bind(attempt_id)
        .bind(from)
        .bind(to)
        .bind(patch.reservation_id)
        .bind(patch.tx_reference)
        .bind(patch.last_error)
        .bind(patch.next_retry_at)
        .bind(patch.clear_claim)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(attempt) => Ok(attempt),
            None => match self.fetch_attempt(attempt_id).await? {
                Some(current) => Err(SettlementError::InvalidTransition {
                    from: current.state,
                    to,
                }
                .into()),
                None => Err(SettlementError::AttemptNotFound(attempt_id).into()),
            },
        }
    }

    async fn stranded_attempts(
        &self,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<Vec<SettlementAttempt>> {
        let attempts = sqlx::query_as::<_, SettlementAttempt>(&format!(
            r#"
            SELECT {}
            FROM settlement_attempts
            -- STRANDED_STATES
            WHERE state IN ('initiated', 'reserved', 'work_done', 'external_pending', 'external_failed')
              AND updated_at < $1
            ORDER BY updated_at ASC
            LIMIT $2
            "#,
            ATTEMPT_COLUMNS
        ))
        .bind(updated_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(attempts)
    }

    async fn reconcile_candidates(
        &self,
        now: DateTime<Utc>,
        max_retries: i32,
        limit: i64,
    ) -> AppResult<Vec<SettlementAttempt>> {
        let attempts = sqlx::query_as::<_, SettlementAttempt>(&format!(
            r#"
            SELECT {}
            FROM settlement_attempts
            WHERE state = $1
              AND escalated_at IS NULL
              AND retry_count < $2
              AND (next_retry_at IS NULL OR next_retry_at <= $3)
              AND (claimed_by IS NULL OR claim_expires_at < $3)
            ORDER BY next_retry_at ASC NULLS FIRST, created_at ASC
            LIMIT $4
            "#,
            ATTEMPT_COLUMNS
        ))
        .bind(SettlementState::ReconcileQueued)
        .bind(max_retries)
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(attempts)
    }

    async fn claim_attempt(
        &self,
        attempt_id: Uuid,
        worker_id: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE settlement_attempts
            SET claimed_by = $2, claim_expires_at = $3, updated_at = NOW()
            WHERE id = $1
              AND state = $5
              AND (claimed_by IS NULL OR claim_expires_at < $4)
            "#,
        )
        .bind(attempt_id)
        .bind(worker_id)
        .bind(lease_until)
        .bind(now)
        .bind(SettlementState::ReconcileQueued)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_retry_failure(
        &self,
        attempt_id: Uuid,
        worker_id: &str,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> AppResult<SettlementAttempt> {
        let updated = sqlx::query_as::<_, SettlementAttempt>(&format!(
            r#"
            UPDATE settlement_attempts
            SET retry_count = retry_count + 1,
                last_error = $3,
                next_retry_at = $4,
                claimed_by = NULL,
                claim_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND claimed_by = $2
            RETURNING {}
            "#,
            ATTEMPT_COLUMNS
        ))
        .bind(attempt_id)
        .bind(worker_id)
        .bind(error)
        .bind(next_retry_at)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(attempt) => Ok(attempt),
            None => match self.fetch_attempt(attempt_id).await? {
                Some(_) => Err(AppError::Internal(format!(
                    "Worker {} no longer holds the lease on {}",
                    worker_id, attempt_id
                ))),
                None => Err(SettlementError::AttemptNotFound(attempt_id).into()),
            },
        }
    }

    async fn mark_escalated(&self, attempt_id: Uuid) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE settlement_attempts
            SET escalated_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND escalated_at IS NULL
            "#,
        )
        .bind(attempt_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        match self.fetch_attempt(attempt_id).await? {
            Some(_) => Ok(false),
            None => Err(SettlementError::AttemptNotFound(attempt_id).into()),
        }
    }

    // ========== AUDIT LOG ==========

    async fn log_audit_event(
        &self,
        event_type: AuditEventType,
        entity_id: Option<String>,
        account: Option<&str>,
        details: serde_json::Value,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (event_type, entity_id, account_id, details)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(event_type)
        .bind(entity_id)
        .bind(account)
        .bind(details)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
