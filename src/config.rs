use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{AppError, AppResult};
use crate::settlement::{CoordinatorConfig, ReconcilerConfig};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub bind_address: String,

    pub ledger_gateway_url: String,
    pub ai_provider_url: String,

    /// JSON rate table; built-in defaults when unset
    pub rate_table_path: Option<String>,
    pub cost_model: String,
    // Kept as strings so env values never pass through f64
    pub credits_per_char: String,
    pub credits_per_token: String,

    pub work_timeout_ms: u64,
    pub debit_timeout_ms: u64,

    pub reconcile_interval_secs: u64,
    pub reconcile_min_backoff_secs: i64,
    pub reconcile_max_backoff_secs: i64,
    pub reconcile_max_retries: i32,
    pub reconcile_lease_secs: i64,
    pub reconcile_batch_size: i64,
    pub worker_id: String,

    pub rate_limit_per_minute: u32,
    /// Comma-separated origins allowed by CORS
    pub cors_origins: String,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        dotenv::dotenv().ok();
        Self::load(config::Environment::default())
    }

    fn load(env: config::Environment) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .set_default("database_url", "postgres://localhost/credit_exchange")?
            .set_default("database_max_connections", 10)?
            .set_default("bind_address", "0.0.0.0:8080")?
            .set_default("ledger_gateway_url", "http://localhost:9000")?
            .set_default("ai_provider_url", "http://localhost:9100/v1/completions")?
            .set_default("cost_model", "prompt_length")?
            .set_default("credits_per_char", "0.00001")?
            .set_default("credits_per_token", "0.00004")?
            .set_default("work_timeout_ms", 30_000)?
            .set_default("debit_timeout_ms", 10_000)?
            .set_default("reconcile_interval_secs", 15)?
            .set_default("reconcile_min_backoff_secs", 5)?
            .set_default("reconcile_max_backoff_secs", 600)?
            .set_default("reconcile_max_retries", 10)?
            .set_default("reconcile_lease_secs", 60)?
            .set_default("reconcile_batch_size", 50)?
            .set_default("worker_id", "reconciler-1")?
            .set_default("rate_limit_per_minute", 100)?
            .set_default("cors_origins", "http://localhost:3000")?
            .add_source(env)
            .build()?
            .try_deserialize()
    }

    pub fn credits_per_char(&self) -> AppResult<Decimal> {
        parse_multiplier("CREDITS_PER_CHAR", &self.credits_per_char)
    }

    pub fn credits_per_token(&self) -> AppResult<Decimal> {
        parse_multiplier("CREDITS_PER_TOKEN", &self.credits_per_token)
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            work_timeout: Duration::from_millis(self.work_timeout_ms),
            debit_timeout: Duration::from_millis(self.debit_timeout_ms),
            min_backoff: chrono::Duration::seconds(self.reconcile_min_backoff_secs),
        }
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            worker_id: self.worker_id.clone(),
            min_backoff: chrono::Duration::seconds(self.reconcile_min_backoff_secs),
            max_backoff: chrono::Duration::seconds(self.reconcile_max_backoff_secs),
            max_retries: self.reconcile_max_retries,
            lease: chrono::Duration::seconds(self.reconcile_lease_secs),
            batch_size: self.reconcile_batch_size,
            debit_timeout: Duration::from_millis(self.debit_timeout_ms),
            stale_after: self.stale_after(),
        }
    }

    /// A coordinator has given up on an attempt once both of its timeouts have
    /// passed; one extra lease covers clock skew between instances
    fn stale_after(&self) -> chrono::Duration {
        let timeouts_ms = self.work_timeout_ms.saturating_add(self.debit_timeout_ms);
        chrono::Duration::milliseconds(i64::try_from(timeouts_ms).unwrap_or(i64::from(u32::MAX)))
            + chrono::Duration::seconds(self.reconcile_lease_secs)
    }

    pub fn cors_origins(&self) -> Vec<String> {
        self.cors_origins
            .split(',')
            .map(str::trim)
            .filter(|origin| !origin.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }
}

fn parse_multiplier(name: &str, raw: &str) -> AppResult<Decimal> {
    let value = Decimal::from_str(raw.trim())
        .map_err(|e| AppError::Config(format!("{} is not a decimal: {}", name, e)))?;
    if value < Decimal::ZERO {
        return Err(AppError::Config(format!("{} must not be negative", name)));
    }
    Ok(value)
}
