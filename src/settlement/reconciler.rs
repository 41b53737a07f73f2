use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult, SettlementError};
use crate::execution::{ExternalLedgerClient, ExternalStatus};
use crate::ledger::models::*;
use crate::ledger::store::LedgerStore;

const ALERT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub worker_id: String,
    pub min_backoff: chrono::Duration,
    pub max_backoff: chrono::Duration,
    pub max_retries: i32,
    /// How long a claim keeps other workers off an attempt
    pub lease: chrono::Duration,
    pub batch_size: i64,
    pub debit_timeout: Duration,
    /// An in-flight attempt untouched this long has lost its coordinator.
    /// Must exceed the coordinator's work and debit timeouts combined.
    pub stale_after: chrono::Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            worker_id: "reconciler-1".to_string(),
            min_backoff: chrono::Duration::seconds(5),
            max_backoff: chrono::Duration::seconds(600),
            max_retries: 10,
            lease: chrono::Duration::seconds(60),
            batch_size: 50,
            debit_timeout: Duration::from_secs(10),
            stale_after: chrono::Duration::seconds(100),
        }
    }
}

/// Raised once per attempt when its retry budget runs out
#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationAlert {
    pub attempt_id: Uuid,
    pub account_id: AccountId,
    pub provider: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub cost: Decimal,
    pub retries: i32,
    pub last_error: Option<String>,
    pub raised_at: DateTime<Utc>,
}

/// Counts from one pass over the queue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Stranded in-flight attempts queued or failed by this pass
    pub recovered: usize,
    pub scanned: usize,
    pub claimed: usize,
    pub reconciled: usize,
    pub rescheduled: usize,
    pub escalated: usize,
}

enum AttemptOutcome {
    Reconciled,
    Rescheduled,
    Escalated,
}

/// Reconciliation worker - drives `ReconcileQueued` attempts to `Reconciled`
///
/// Each pass first recovers attempts a crashed or cancelled coordinator left
/// in flight, so their reservations are neither held forever nor dropped:
/// - `WorkDone`, `ExternalPending`, `ExternalFailed`: queued, then reconciled
///   in the same pass (the status check decides whether a debit is needed)
/// - `Reserved`, `Initiated`: marked `WorkFailed` and the hold released, since
///   delivery of the work was never recorded
///
/// SECURITY: every resubmission reuses the attempt id as the idempotency key,
/// and the status is checked first, so a debit that already landed is never
/// submitted again.
pub struct ReconciliationWorker {
    ledger: Arc<dyn LedgerStore>,
    external: Arc<dyn ExternalLedgerClient>,
    config: ReconcilerConfig,
    alerts: broadcast::Sender<ReconciliationAlert>,
}

impl ReconciliationWorker {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        external: Arc<dyn ExternalLedgerClient>,
        config: ReconcilerConfig,
    ) -> Self {
        let (alerts, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        Self {
            ledger,
            external,
            config,
            alerts,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReconciliationAlert> {
        self.alerts.subscribe()
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Delay before retry number `retry_count`: min(base * 2^retry_count, max)
    pub fn backoff_for(&self, retry_count: i32) -> chrono::Duration {
        let exponent = retry_count.clamp(0, 30) as u32;
        multiply(self.config.min_backoff, 2i64.pow(exponent))
            .unwrap_or(self.config.max_backoff)
            .min(self.config.max_backoff)
    }

    #[instrument(skip(self), fields(worker = %self.config.worker_id))]
    pub async fn run_once(&self) -> AppResult<ReconcileReport> {
        let now = Utc::now();
        let recovered = self.recover_stranded(now).await?;

        let candidates = self
            .ledger
            .reconcile_candidates(now, self.config.max_retries, self.config.batch_size)
            .await?;

        let mut report = ReconcileReport {
            recovered,
            scanned: candidates.len(),
            ..ReconcileReport::default()
        };

        for attempt in candidates {
            let claimed = match self
                .ledger
                .claim_attempt(
                    attempt.id,
                    &self.config.worker_id,
                    now + self.config.lease,
                    now,
                )
                .await
            {
                Ok(claimed) => claimed,
                Err(e) => {
                    warn!("Could not claim attempt {}: {}", attempt.id, e);
                    continue;
                }
            };
            if !claimed {
                debug!("Attempt {} leased by another worker", attempt.id);
                continue;
            }
            report.claimed += 1;

            match self.reconcile_attempt(&attempt).await {
                Ok(AttemptOutcome::Reconciled) => report.reconciled += 1,
                Ok(AttemptOutcome::Rescheduled) => report.rescheduled += 1,
                Ok(AttemptOutcome::Escalated) => {
                    report.rescheduled += 1;
                    report.escalated += 1;
                }
                Err(e) => error!("Reconciliation of attempt {} failed: {}", attempt.id, e),
            }
        }

        if report.scanned > 0 || report.recovered > 0 {
            info!(
                "Reconciliation pass: {} recovered, {} scanned, {} reconciled, {} rescheduled, {} escalated",
                report.recovered,
                report.scanned,
                report.reconciled,
                report.rescheduled,
                report.escalated
            );
        }
        Ok(report)
    }

    async fn recover_stranded(&self, now: DateTime<Utc>) -> AppResult<usize> {
        let cutoff = now - self.config.stale_after;
        let stranded = self
            .ledger
            .stranded_attempts(cutoff, self.config.batch_size)
            .await?;

        let mut recovered = 0;
        for attempt in stranded {
            match self.recover(&attempt, now).await {
                Ok(to) => {
                    recovered += 1;
                    warn!(
                        "Recovered stranded attempt {}: {} -> {}",
                        attempt.id, attempt.state, to
                    );
                    self.audit(
                        AuditEventType::AttemptRecovered,
                        &attempt,
                        serde_json::json!({
                            "from": attempt.state,
                            "to": to,
                            "last_update": attempt.updated_at,
                            "worker": self.config.worker_id,
                        }),
                    )
                    .await;
                }
                // Someone else moved it first
                Err(AppError::Settlement(SettlementError::InvalidTransition { .. })) => {
                    debug!("Stranded attempt {} moved on before recovery", attempt.id)
                }
                Err(e) => error!("Recovery of attempt {} failed: {}", attempt.id, e),
            }
        }
        Ok(recovered)
    }

    /// Every step is a compare-and-swap, so a coordinator that wakes up late
    /// or a second worker can only lose the race, never double-apply it
    async fn recover(
        &self,
        attempt: &SettlementAttempt,
        now: DateTime<Utc>,
    ) -> AppResult<SettlementState> {
        match attempt.state {
            SettlementState::WorkDone | SettlementState::ExternalPending => {
                self.ledger
                    .transition_attempt(
                        attempt.id,
                        attempt.state,
                        SettlementState::ExternalFailed,
                        AttemptPatch::error(format!(
                            "settlement abandoned in {}; external status unknown",
                            attempt.state
                        )),
                    )
                    .await?;
                self.ledger.queue_for_reconciliation(attempt.id, now).await?;
                Ok(SettlementState::ReconcileQueued)
            }
            SettlementState::ExternalFailed => {
                self.ledger.queue_for_reconciliation(attempt.id, now).await?;
                Ok(SettlementState::ReconcileQueued)
            }
            SettlementState::Initiated | SettlementState::Reserved => {
                // Fail the attempt before releasing, so a late coordinator can
                // no longer advance it towards a debit
                self.ledger
                    .transition_attempt(
                        attempt.id,
                        attempt.state,
                        SettlementState::WorkFailed,
                        AttemptPatch::error(format!(
                            "abandoned in {} before the work was recorded",
                            attempt.state
                        )),
                    )
                    .await?;
                let token = attempt
                    .reservation_token()
                    .unwrap_or_else(|| attempt.own_reservation_token());
                if self.ledger.get_reservation(token).await?.is_some() {
                    self.ledger.release_reservation(token).await?;
                }
                Ok(SettlementState::WorkFailed)
            }
            other => Err(SettlementError::InvalidTransition {
                from: other,
                to: SettlementState::ReconcileQueued,
            }
            .into()),
        }
    }

    async fn reconcile_attempt(&self, attempt: &SettlementAttempt) -> AppResult<AttemptOutcome> {
        let key = attempt.idempotency_key();

        let status = timeout(self.config.debit_timeout, self.external.query_status(&key)).await;
        let tx = match status {
            Ok(Ok(ExternalStatus::Confirmed(tx))) => {
                info!("Attempt {} already landed externally as {}", attempt.id, tx);
                tx
            }
            Ok(Ok(ExternalStatus::Pending)) => {
                return self
                    .retry_later(attempt, "external debit still pending".to_string())
                    .await;
            }
            Ok(Ok(ExternalStatus::Absent)) => {
                let debit = timeout(
                    self.config.debit_timeout,
                    self.external.debit(&attempt.account_id, attempt.cost, &key),
                )
                .await;
                match debit {
                    Ok(Ok(tx)) => tx,
                    Ok(Err(e)) => return self.retry_later(attempt, e.to_string()).await,
                    Err(_) => {
                        let reason = SettlementError::Timeout(
                            self.config.debit_timeout.as_millis() as u64,
                        );
                        return self.retry_later(attempt, reason.to_string()).await;
                    }
                }
            }
            Ok(Err(e)) => return self.retry_later(attempt, e.to_string()).await,
            Err(_) => {
                let reason =
                    SettlementError::Timeout(self.config.debit_timeout.as_millis() as u64);
                return self.retry_later(attempt, reason.to_string()).await;
            }
        };

        self.finalize(attempt, tx).await
    }

    async fn finalize(&self, attempt: &SettlementAttempt, tx: TxReference) -> AppResult<AttemptOutcome> {
        if let Some(token) = attempt.reservation_token() {
            if let Err(e) = self.ledger.commit_reservation(token).await {
                return self
                    .retry_later(attempt, format!("commit of {} failed: {}", tx, e))
                    .await;
            }
        }

        self.ledger
            .transition_attempt(
                attempt.id,
                SettlementState::ReconcileQueued,
                SettlementState::Reconciled,
                AttemptPatch::tx_reference(tx.clone()),
            )
            .await?;

        info!("Attempt {} reconciled: {}", attempt.id, tx);
        self.audit(
            AuditEventType::AttemptReconciled,
            attempt,
            serde_json::json!({
                "tx_reference": tx,
                "retry_count": attempt.retry_count,
                "worker": self.config.worker_id,
            }),
        )
        .await;

        Ok(AttemptOutcome::Reconciled)
    }

    async fn retry_later(
        &self,
        attempt: &SettlementAttempt,
        reason: String,
    ) -> AppResult<AttemptOutcome> {
        let next_retry_at = Utc::now() + self.backoff_for(attempt.retry_count + 1);
        let updated = self
            .ledger
            .record_retry_failure(attempt.id, &self.config.worker_id, &reason, next_retry_at)
            .await?;

        if updated.retry_count < self.config.max_retries {
            warn!(
                "Attempt {} retry {}/{} failed: {}; next try at {}",
                attempt.id, updated.retry_count, self.config.max_retries, reason, next_retry_at
            );
            self.audit(
                AuditEventType::ReconciliationRetry,
                &updated,
                serde_json::json!({
                    "retry_count": updated.retry_count,
                    "error": reason,
                    "next_retry_at": next_retry_at,
                }),
            )
            .await;
            return Ok(AttemptOutcome::Rescheduled);
        }

        if !self.ledger.mark_escalated(attempt.id).await? {
            return Ok(AttemptOutcome::Rescheduled);
        }

        let exhausted = SettlementError::ReconciliationExhausted {
            attempt_id: attempt.id,
            retries: updated.retry_count,
        };
        error!(
            "{}: account {} owes {} {} credits, last error: {}",
            exhausted, updated.account_id, updated.cost, updated.provider, reason
        );
        self.audit(
            AuditEventType::ReconciliationExhausted,
            &updated,
            serde_json::json!({
                "retry_count": updated.retry_count,
                "cost": updated.cost.to_string(),
                "error": reason,
            }),
        )
        .await;

        // No subscribers is fine; the log line and audit row remain
        let _ = self.alerts.send(ReconciliationAlert {
            attempt_id: updated.id,
            account_id: updated.account_id.clone(),
            provider: updated.provider.clone(),
            cost: updated.cost,
            retries: updated.retry_count,
            last_error: updated.last_error.clone(),
            raised_at: Utc::now(),
        });

        Ok(AttemptOutcome::Escalated)
    }

    async fn audit(
        &self,
        event: AuditEventType,
        attempt: &SettlementAttempt,
        details: serde_json::Value,
    ) {
        if let Err(e) = self
            .ledger
            .log_audit_event(
                event,
                Some(attempt.id.to_string()),
                Some(&attempt.account_id),
                details,
            )
            .await
        {
            warn!("Failed to audit {:?} for attempt {}: {}", event, attempt.id, e);
        }
    }
}

fn multiply(base: chrono::Duration, factor: i64) -> Option<chrono::Duration> {
    base.num_milliseconds()
        .checked_mul(factor)
        .map(chrono::Duration::milliseconds)
}
