use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;

use crate::error::{AppError, AppResult, CreditError};
use crate::execution::WorkUnit;

/// Credit cost of a unit of work, denominated in the provider's credits
pub trait CostModel: Send + Sync {
    fn name(&self) -> &'static str;

    fn cost(&self, provider: &str, unit: &WorkUnit) -> AppResult<Decimal>;
}

/// Rough token count: one token per four characters plus a fixed overhead
pub fn estimate_tokens(prompt: &str) -> u64 {
    prompt.chars().count() as u64 / 4 + 10
}

fn checked_cost(value: Option<Decimal>) -> AppResult<Decimal> {
    value.ok_or_else(|| CreditError::InvalidAmount("Cost overflow".to_string()).into())
}

/// Flat charge per prompt character
#[derive(Debug, Clone)]
pub struct PromptLengthCost {
    pub credits_per_char: Decimal,
}

impl CostModel for PromptLengthCost {
    fn name(&self) -> &'static str {
        "prompt_length"
    }

    fn cost(&self, _provider: &str, unit: &WorkUnit) -> AppResult<Decimal> {
        checked_cost(
            Decimal::from(unit.prompt_chars()).checked_mul(self.credits_per_char),
        )
    }
}

/// Charge per estimated prompt token
#[derive(Debug, Clone)]
pub struct TokenEstimateCost {
    pub credits_per_token: Decimal,
}

impl CostModel for TokenEstimateCost {
    fn name(&self) -> &'static str {
        "token_estimate"
    }

    fn cost(&self, _provider: &str, unit: &WorkUnit) -> AppResult<Decimal> {
        let tokens = unit.input_tokens.unwrap_or_else(|| estimate_tokens(&unit.prompt));
        checked_cost(Decimal::from(tokens).checked_mul(self.credits_per_token))
    }
}

/// Input/output price per million tokens
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPrice {
    pub input_per_million: Decimal,
    pub output_per_million: Decimal,
}

/// Per-model pricing applied to declared token counts.
/// Input falls back to the prompt estimate, output to zero.
#[derive(Debug, Clone)]
pub struct ModelPricingCost {
    prices: HashMap<String, ModelPrice>,
}

impl ModelPricingCost {
    pub fn new(prices: HashMap<String, ModelPrice>) -> Self {
        let prices = prices
            .into_iter()
            .map(|(model, price)| (model.to_uppercase(), price))
            .collect();
        Self { prices }
    }

    pub fn price(&self, model: &str) -> Option<ModelPrice> {
        self.prices.get(&model.to_uppercase()).copied()
    }
}

impl Default for ModelPricingCost {
    fn default() -> Self {
        Self::new(HashMap::from([
            (
                "AI_FLASHTX".to_string(),
                ModelPrice {
                    input_per_million: dec!(0.5),
                    output_per_million: dec!(1.5),
                },
            ),
            (
                "AI_OPUS_PRO".to_string(),
                ModelPrice {
                    input_per_million: dec!(5.0),
                    output_per_million: dec!(15.0),
                },
            ),
        ]))
    }
}

impl CostModel for ModelPricingCost {
    fn name(&self) -> &'static str {
        "model_pricing"
    }

    fn cost(&self, _provider: &str, unit: &WorkUnit) -> AppResult<Decimal> {
        let price = self
            .price(&unit.model)
            .ok_or_else(|| AppError::InvalidInput(format!("Unknown model: {}", unit.model)))?;

        let input = Decimal::from(unit.input_tokens.unwrap_or_else(|| estimate_tokens(&unit.prompt)));
        let output = Decimal::from(unit.output_tokens.unwrap_or(0));

        let input_cost = input.checked_mul(price.input_per_million);
        let output_cost = output.checked_mul(price.output_per_million);
        let total = match (input_cost, output_cost) {
            (Some(i), Some(o)) => i.checked_add(o),
            _ => None,
        };

        Ok(checked_cost(total)? / Decimal::from(1_000_000u64))
    }
}

/// Build the model named by `COST_MODEL`
pub fn cost_model_from_name(
    name: &str,
    credits_per_char: Decimal,
    credits_per_token: Decimal,
) -> AppResult<Box<dyn CostModel>> {
    match name {
        "prompt_length" => Ok(Box::new(PromptLengthCost { credits_per_char })),
        "token_estimate" => Ok(Box::new(TokenEstimateCost { credits_per_token })),
        "model_pricing" => Ok(Box::new(ModelPricingCost::default())),
        other => Err(AppError::Config(format!("Unknown cost model: {}", other))),
    }
}
