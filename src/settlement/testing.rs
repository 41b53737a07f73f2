//! Scripted collaborators for settlement tests

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::coordinator::{CoordinatorConfig, SettlementCoordinator};
use super::reconciler::{ReconcilerConfig, ReconciliationWorker};
use crate::error::{AppResult, SettlementError};
use crate::execution::{ExternalLedgerClient, ExternalStatus, MeteredWorkExecutor, WorkResult, WorkUnit};
use crate::ledger::models::TxReference;
use crate::ledger::{InMemoryLedgerStore, LedgerStore};
use crate::quote_engine::{PromptLengthCost, RateTable};

pub fn unit(prompt: &str) -> WorkUnit {
    WorkUnit::new("AI_FLASHTX", prompt)
}

#[derive(Default)]
pub struct MockExecutor {
    calls: AtomicUsize,
    failing: AtomicBool,
    delay_ms: AtomicU64,
}

impl MockExecutor {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

#[async_trait]
impl MeteredWorkExecutor for MockExecutor {
    async fn perform(&self, unit: &WorkUnit) -> AppResult<WorkResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(SettlementError::WorkUnavailable("provider down".to_string()).into());
        }

        Ok(WorkResult {
            text: format!("ok: {}", unit.prompt),
            input_tokens: unit.prompt.len() as u64,
            output_tokens: 3,
        })
    }
}

/// External ledger that keeps landed debits keyed by idempotency key
#[derive(Default)]
pub struct MockLedgerClient {
    landed: Mutex<HashMap<String, TxReference>>,
    debit_calls: AtomicUsize,
    fail_remaining: AtomicUsize,
    hang_after_landing: AtomicBool,
    report_pending: AtomicBool,
    status_down: AtomicBool,
}

impl MockLedgerClient {
    /// Distinct debits that actually landed
    pub fn charges(&self) -> usize {
        self.landed.lock().len()
    }

    pub fn debit_calls(&self) -> usize {
        self.debit_calls.load(Ordering::SeqCst)
    }

    /// Fail the next `n` debit submissions without landing them
    pub fn fail_next(&self, n: usize) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    /// Land the debit, then never answer
    pub fn set_hang_after_landing(&self, hang: bool) {
        self.hang_after_landing.store(hang, Ordering::SeqCst);
    }

    pub fn set_report_pending(&self, pending: bool) {
        self.report_pending.store(pending, Ordering::SeqCst);
    }

    pub fn set_status_down(&self, down: bool) {
        self.status_down.store(down, Ordering::SeqCst);
    }
}

#[async_trait]
impl ExternalLedgerClient for MockLedgerClient {
    async fn debit(
        &self,
        _account: &str,
        _amount: Decimal,
        idempotency_key: &str,
    ) -> AppResult<TxReference> {
        self.debit_calls.fetch_add(1, Ordering::SeqCst);

        let failed = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(SettlementError::Unconfirmed("gateway unreachable".to_string()).into());
        }

        let tx = {
            let mut landed = self.landed.lock();
            landed
                .entry(idempotency_key.to_string())
                .or_insert_with(|| format!("tx-{}", idempotency_key))
                .clone()
        };

        if self.hang_after_landing.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        Ok(tx)
    }

    async fn query_status(&self, idempotency_key: &str) -> AppResult<ExternalStatus> {
        if self.status_down.load(Ordering::SeqCst) {
            return Err(SettlementError::Unconfirmed("status endpoint down".to_string()).into());
        }
        if self.report_pending.load(Ordering::SeqCst) {
            return Ok(ExternalStatus::Pending);
        }
        Ok(match self.landed.lock().get(idempotency_key) {
            Some(tx) => ExternalStatus::Confirmed(tx.clone()),
            None => ExternalStatus::Absent,
        })
    }
}

/// Coordinator and worker wired to an in-memory ledger and scripted collaborators.
/// Prompts cost 0.01 openai credits per character.
pub struct Harness {
    pub ledger: Arc<InMemoryLedgerStore>,
    pub executor: Arc<MockExecutor>,
    pub external: Arc<MockLedgerClient>,
    pub coordinator: SettlementCoordinator,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_ledger(Arc::new(InMemoryLedgerStore::new()))
    }

    pub fn with_ledger(ledger: Arc<InMemoryLedgerStore>) -> Self {
        let executor = Arc::new(MockExecutor::default());
        let external = Arc::new(MockLedgerClient::default());
        let coordinator = SettlementCoordinator::new(
            ledger.clone(),
            Arc::new(RateTable::with_defaults()),
            Arc::new(PromptLengthCost {
                credits_per_char: dec!(0.01),
            }),
            executor.clone(),
            external.clone(),
            CoordinatorConfig {
                work_timeout: Duration::from_millis(200),
                debit_timeout: Duration::from_millis(100),
                min_backoff: chrono::Duration::zero(),
            },
        );

        Self {
            ledger,
            executor,
            external,
            coordinator,
        }
    }

    pub async fn fund(&self, account: &str, amount: Decimal) {
        self.ledger
            .credit(account, "openai", amount)
            .await
            .expect("fund account");
    }

    pub fn worker(&self, worker_id: &str, max_retries: i32) -> ReconciliationWorker {
        ReconciliationWorker::new(
            self.ledger.clone(),
            self.external.clone(),
            ReconcilerConfig {
                worker_id: worker_id.to_string(),
                min_backoff: chrono::Duration::zero(),
                max_backoff: chrono::Duration::zero(),
                max_retries,
                lease: chrono::Duration::seconds(30),
                batch_size: 50,
                debit_timeout: Duration::from_millis(100),
                stale_after: chrono::Duration::seconds(60),
            },
        )
    }
}
