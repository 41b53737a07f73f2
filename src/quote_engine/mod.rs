pub mod engine;
pub mod pricing;
pub mod rates;

pub use engine::{ExchangeCalculator, SwapQuote};
pub use pricing::{CostModel, ModelPricingCost, PromptLengthCost, TokenEstimateCost};
pub use rates::RateTable;
