use std::{sync::Arc, time::Duration};
use sqlx::{PgPool, postgres::PgPoolOptions};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::{
    api::handler::AppState,
    config::Config,
    error::AppResult,
    execution::{HttpLedgerClient, HttpWorkExecutor},
    ledger::{LedgerRepository, LedgerStore},
    middleware::RateLimitLayer,
    quote_engine::{pricing::cost_model_from_name, CostModel, ExchangeCalculator, RateTable},
    settlement::{
        CreditExchange, ReconciliationAlert, ReconciliationScheduler, ReconciliationWorker,
        SettlementCoordinator,
    },
};

/// Everything `main` needs to serve traffic and shut down cleanly
pub struct Application {
    pub state: AppState,
    pub rate_limiter: RateLimitLayer,
    pub shutdown: watch::Sender<bool>,
    pub reconciler: JoinHandle<()>,
}

impl Application {
    /// Stop the reconciliation scheduler and wait for its current pass
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.reconciler.await {
            error!("Reconciliation scheduler ended abnormally: {:?}", e);
        }
    }
}

pub async fn initialize_app(config: &Config) -> AppResult<Application> {
    info!("Initializing application components ...");

    // Database pool
    let pool = initialize_database(&config.database_url, config.database_max_connections).await?;
    let ledger: Arc<dyn LedgerStore> = Arc::new(LedgerRepository::new(pool));

    // Rate table
    let rates = Arc::new(match &config.rate_table_path {
        Some(path) => {
            let table = RateTable::from_json_file(path)?;
            info!("✅ Rate table loaded from {}", path);
            table
        }
        None => {
            warn!("⚠️  RATE_TABLE_PATH not set - using built-in rates");
            RateTable::with_defaults()
        }
    });

    // Cost model
    let cost_model: Arc<dyn CostModel> = Arc::from(cost_model_from_name(
        &config.cost_model,
        config.credits_per_char()?,
        config.credits_per_token()?,
    )?);
    info!("✅ Cost model: {}", cost_model.name());

    // External collaborators
    let coordinator_config = config.coordinator_config();
    let executor = Arc::new(HttpWorkExecutor::new(
        &config.ai_provider_url,
        coordinator_config.work_timeout,
    )?);
    let external = Arc::new(HttpLedgerClient::new(
        &config.ledger_gateway_url,
        coordinator_config.debit_timeout,
    )?);
    info!("✅ AI provider at {}", config.ai_provider_url);
    info!("✅ Ledger gateway at {}", config.ledger_gateway_url);

    let coordinator = SettlementCoordinator::new(
        ledger.clone(),
        rates.clone(),
        cost_model,
        executor,
        external.clone(),
        coordinator_config,
    );
    let calculator = Arc::new(ExchangeCalculator::new(rates, ledger.clone()));
    let exchange = CreditExchange::new(ledger.clone(), calculator, coordinator);

    // Reconciliation
    let worker = Arc::new(ReconciliationWorker::new(
        ledger,
        external,
        config.reconciler_config(),
    ));
    spawn_alert_listener(worker.subscribe());

    let (shutdown, shutdown_rx) = watch::channel(false);
    let reconciler =
        ReconciliationScheduler::new(worker, config.reconcile_interval(), shutdown_rx).start();
    info!(
        "✅ Reconciliation worker started (every {}s)",
        config.reconcile_interval().as_secs()
    );

    Ok(Application {
        state: AppState { exchange },
        rate_limiter: RateLimitLayer::per_minute(config.rate_limit_per_minute),
        shutdown,
        reconciler,
    })
}

/// Escalated attempts need an operator; surface each one loudly once
fn spawn_alert_listener(mut alerts: broadcast::Receiver<ReconciliationAlert>) {
    tokio::spawn(async move {
        loop {
            match alerts.recv().await {
                Ok(alert) => error!(
                    "🚨 Manual reconciliation required: attempt {} ({} {} credit for {}) after {} retries: {}",
                    alert.attempt_id,
                    alert.cost,
                    alert.provider,
                    alert.account_id,
                    alert.retries,
                    alert.last_error.as_deref().unwrap_or("unknown error")
                ),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Alert listener lagged, {} alerts dropped from the channel", missed)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn initialize_database(database_url: &str, max_connections: u32) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;

    info!("✓ Database pool configured: {} max connections", max_connections);

    // Run migrations
    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}
