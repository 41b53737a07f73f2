// Reconciliation scheduler - runs the reconciliation worker on a fixed interval
//
// - First pass runs immediately on start
// - A slow pass delays the next tick instead of stacking passes
// - Stops when the shutdown channel flips to true or its sender is dropped

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info};

use super::reconciler::ReconciliationWorker;

pub struct ReconciliationScheduler {
    worker: Arc<ReconciliationWorker>,
    period: Duration,
    shutdown: watch::Receiver<bool>,
}

impl ReconciliationScheduler {
    pub fn new(
        worker: Arc<ReconciliationWorker>,
        period: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            worker,
            period,
            shutdown,
        }
    }

    /// Start the scheduler (runs in background)
    pub fn start(&self) -> JoinHandle<()> {
        let worker = self.worker.clone();
        let period = self.period;
        let mut shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                "⏰ Reconciliation scheduler started for {} (every {:?})",
                worker.worker_id(),
                period
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = worker.run_once().await {
                            error!("❌ Reconciliation pass failed: {}", e);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("✓ Reconciliation scheduler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::models::SettlementState;
    use crate::ledger::store::LedgerStore;
    use crate::settlement::testing::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_scheduler_reconciles_then_stops() {
        let h = Harness::new();
        h.fund("0xabc", dec!(1)).await;
        h.external.fail_next(1);
        let outcome = h
            .coordinator
            .consume("0xabc", "openai", unit("hello"))
            .await
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let scheduler = ReconciliationScheduler::new(
            Arc::new(h.worker("worker-a", 5)),
            Duration::from_millis(20),
            rx,
        );
        let handle = scheduler.start();

        let mut state = SettlementState::ReconcileQueued;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            state = h
                .ledger
                .get_attempt(outcome.attempt_id)
                .await
                .unwrap()
                .unwrap()
                .state;
            if state == SettlementState::Reconciled {
                break;
            }
        }
        assert_eq!(state, SettlementState::Reconciled);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("scheduler did not stop")
            .unwrap();
    }
}
