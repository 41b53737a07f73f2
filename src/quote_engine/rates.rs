use parking_lot::RwLock;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

use crate::error::{AppError, AppResult, CreditError};

/// asset (upper case) -> provider (lower case) -> credits per unit of asset
pub type RateMap = BTreeMap<String, BTreeMap<String, Decimal>>;

/// Exchange rates between blockchain assets and provider credits.
///
/// Lookups read an `Arc` snapshot, so a concurrent `replace` never exposes a
/// half-written table.
pub struct RateTable {
    inner: RwLock<Arc<RateMap>>,
}

impl RateTable {
    pub fn new(rates: RateMap) -> AppResult<Self> {
        let rates = normalize(rates)?;
        Ok(Self {
            inner: RwLock::new(Arc::new(rates)),
        })
    }

    pub fn with_defaults() -> Self {
        Self {
            inner: RwLock::new(Arc::new(default_rates())),
        }
    }

    /// Load a JSON table of the form `{"USDC": {"openai": "0.00002"}}`
    pub fn from_json_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("Cannot read rate table {}: {}", path.display(), e))
        })?;
        let table = Self::new(parse_rate_json(&raw)?)?;
        info!("Loaded rate table from {}", path.display());
        Ok(table)
    }

    /// Credits granted per unit of `asset` for `provider`
    pub fn rate(&self, asset: &str, provider: &str) -> AppResult<Decimal> {
        let snapshot = self.snapshot();
        snapshot
            .get(&asset.to_uppercase())
            .and_then(|providers| providers.get(&provider.to_lowercase()))
            .copied()
            .ok_or_else(|| {
                CreditError::UnsupportedPair {
                    asset: asset.to_string(),
                    provider: provider.to_string(),
                }
                .into()
            })
    }

    pub fn supports_provider(&self, provider: &str) -> bool {
        let provider = provider.to_lowercase();
        self.snapshot()
            .values()
            .any(|providers| providers.contains_key(&provider))
    }

    /// Swap in a whole new table
    pub fn replace(&self, rates: RateMap) -> AppResult<()> {
        let rates = normalize(rates)?;
        *self.inner.write() = Arc::new(rates);
        info!("Rate table replaced");
        Ok(())
    }

    pub fn snapshot(&self) -> Arc<RateMap> {
        self.inner.read().clone()
    }

    pub fn assets(&self) -> Vec<String> {
        self.snapshot().keys().cloned().collect()
    }

    pub fn providers(&self) -> Vec<String> {
        let mut providers: Vec<String> = self
            .snapshot()
            .values()
            .flat_map(|p| p.keys().cloned())
            .collect();
        providers.sort();
        providers.dedup();
        providers
    }
}

impl Default for RateTable {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn default_rates() -> RateMap {
    let mut rates = RateMap::new();
    rates.insert(
        "USDC".to_string(),
        BTreeMap::from([
            ("openai".to_string(), dec!(0.00002)),
            ("anthropic".to_string(), dec!(0.000015)),
            ("cohere".to_string(), dec!(0.00001)),
        ]),
    );
    rates.insert(
        "ETH".to_string(),
        BTreeMap::from([
            ("openai".to_string(), dec!(50.0)),
            ("anthropic".to_string(), dec!(66.67)),
            ("cohere".to_string(), dec!(100.0)),
        ]),
    );
    rates.insert(
        "MATIC".to_string(),
        BTreeMap::from([
            ("openai".to_string(), dec!(0.002)),
            ("anthropic".to_string(), dec!(0.0015)),
            ("cohere".to_string(), dec!(0.001)),
        ]),
    );
    rates
}

/// Upper-case assets, lower-case providers, reject non-positive rates.
/// Keys that differ only by case are ambiguous and rejected.
fn normalize(rates: RateMap) -> AppResult<RateMap> {
    let mut normalized = RateMap::new();
    for (asset, providers) in rates {
        let asset_key = asset.to_uppercase();
        if normalized.contains_key(&asset_key) {
            return Err(AppError::Config(format!(
                "Asset {} is listed more than once (case-insensitive)",
                asset_key
            )));
        }

        let mut entry = BTreeMap::new();
        for (provider, rate) in providers {
            if rate <= Decimal::ZERO {
                return Err(AppError::Config(format!(
                    "Rate for {} -> {} must be positive, got {}",
                    asset, provider, rate
                )));
            }
            let provider_key = provider.to_lowercase();
            if entry.insert(provider_key.clone(), rate).is_some() {
                return Err(AppError::Config(format!(
                    "Provider {} is listed more than once for {} (case-insensitive)",
                    provider_key, asset_key
                )));
            }
        }
        normalized.insert(asset_key, entry);
    }
    Ok(normalized)
}

pub fn parse_rate_json(raw: &str) -> AppResult<RateMap> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| AppError::Config(format!("Invalid rate table JSON: {}", e)))?;

    let assets = value
        .as_object()
        .ok_or_else(|| AppError::Config("Rate table must be a JSON object".to_string()))?;

    let mut rates = RateMap::new();
    for (asset, providers) in assets {
        let providers = providers.as_object().ok_or_else(|| {
            AppError::Config(format!("Rates for {} must be a JSON object", asset))
        })?;

        let mut entry = BTreeMap::new();
        for (provider, rate) in providers {
            let text = match rate {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                other => {
                    return Err(AppError::Config(format!(
                        "Rate for {} -> {} must be a number or string, got {}",
                        asset, provider, other
                    )))
                }
            };
            let rate = Decimal::from_str(&text).map_err(|e| {
                AppError::Config(format!("Bad rate for {} -> {}: {}", asset, provider, e))
            })?;
            entry.insert(provider.clone(), rate);
        }
        rates.insert(asset.clone(), entry);
    }

    Ok(rates)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_rates() {
        let table = RateTable::with_defaults();
        assert_eq!(table.rate("USDC", "openai").unwrap(), dec!(0.00002));
        assert_eq!(table.rate("eth", "Anthropic").unwrap(), dec!(66.67));
        assert_eq!(table.assets(), vec!["ETH", "MATIC", "USDC"]);
        assert_eq!(table.providers(), vec!["anthropic", "cohere", "openai"]);
    }

    #[test]
    fn test_unknown_pair() {
        let table = RateTable::with_defaults();
        let err = table.rate("DOGE", "openai").unwrap_err();
        assert!(matches!(
            err,
            AppError::Credit(CreditError::UnsupportedPair { .. })
        ));
        assert!(table.rate("USDC", "mistral").is_err());
    }

    #[test]
    fn test_replace_swaps_whole_table() {
        let table = RateTable::with_defaults();
        let before = table.snapshot();

        let rates = parse_rate_json(r#"{"sol": {"OpenAI": "0.5", "cohere": 2}}"#).unwrap();
        table.replace(rates).unwrap();

        assert_eq!(table.rate("SOL", "openai").unwrap(), dec!(0.5));
        assert_eq!(table.rate("SOL", "cohere").unwrap(), dec!(2));
        assert!(table.rate("USDC", "openai").is_err());
        // Snapshots taken earlier keep the old table
        assert!(before.contains_key("USDC"));
    }

    #[test]
    fn test_rejects_non_positive_rates() {
        let rates = parse_rate_json(r#"{"USDC": {"openai": "0"}}"#).unwrap();
        assert!(RateTable::new(rates).is_err());
        assert!(parse_rate_json(r#"{"USDC": {"openai": true}}"#).is_err());
    }

    #[test]
    fn test_rejects_case_duplicate_keys() {
        let rates = parse_rate_json(r#"{"usdc": {"openai": "1"}, "USDC": {"openai": "2"}}"#)
            .unwrap();
        assert!(matches!(RateTable::new(rates), Err(AppError::Config(_))));

        let rates = parse_rate_json(r#"{"USDC": {"openai": "1", "OpenAI": "2"}}"#).unwrap();
        assert!(matches!(RateTable::new(rates), Err(AppError::Config(_))));

        // A rejected reload keeps the table it had
        let table = RateTable::with_defaults();
        let rates = parse_rate_json(r#"{"eth": {"cohere": "1"}, "Eth": {"cohere": "3"}}"#)
            .unwrap();
        assert!(table.replace(rates).is_err());
        assert_eq!(table.rate("USDC", "openai").unwrap(), dec!(0.00002));
    }
}
