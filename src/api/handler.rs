use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use super::models::*;
use crate::{
    error::AppResult,
    middleware::ValidatedJson,
    settlement::CreditExchange,
};

#[derive(Clone)]
pub struct AppState {
    pub exchange: CreditExchange,
}

/// Health check
/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: Utc::now(),
        service: "credit-exchange".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Current rate table
/// GET /exchange-rates
pub async fn get_exchange_rates(State(state): State<AppState>) -> Json<ExchangeRatesResponse> {
    let snapshot = state.exchange.rates().snapshot();
    let rates = snapshot
        .iter()
        .map(|(asset, providers)| {
            let providers = providers
                .iter()
                .map(|(provider, rate)| (provider.clone(), rate.to_string()))
                .collect();
            (asset.clone(), providers)
        })
        .collect();
    Json(rates)
}

/// GET /supported-tokens
pub async fn get_supported_tokens(State(state): State<AppState>) -> Json<SupportedTokensResponse> {
    let rates = state.exchange.rates();
    Json(SupportedTokensResponse {
        blockchain_tokens: rates.assets(),
        ai_providers: rates.providers(),
    })
}

/// Price a swap
/// POST /swap/quote
pub async fn quote_swap(
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<SwapQuoteRequest>,
) -> AppResult<Json<SwapQuoteResponse>> {
    let amount = parse_amount(&request.blockchain_token_amount)?;
    let quote = state.exchange.quote_swap(
        amount,
        &request.blockchain_token_symbol,
        &request.ai_provider,
    )?;

    Ok(Json(SwapQuoteResponse {
        blockchain_token_symbol: quote.asset,
        ai_provider: quote.provider,
        blockchain_token_amount: quote.source_amount.to_string(),
        ai_credits: quote.credit_amount.to_string(),
        exchange_rate: quote.rate.to_string(),
    }))
}

/// Exchange blockchain tokens for credit
/// POST /swap
pub async fn swap_tokens(
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<TokenSwapRequest>,
) -> AppResult<Json<SwapResponse>> {
    info!(
        "Swap requested: {} {} -> {} credit for {}",
        request.blockchain_token_amount,
        request.blockchain_token_symbol,
        request.ai_provider,
        request.wallet_address
    );

    let amount = parse_amount(&request.blockchain_token_amount)?;
    let swap = state
        .exchange
        .record_swap(
            &request.wallet_address,
            amount,
            &request.blockchain_token_symbol,
            &request.ai_provider,
        )
        .await?;

    Ok(Json(SwapResponse::from(swap)))
}

/// All provider balances for a wallet
/// GET /balance/:wallet_address
pub async fn get_balances(
    State(state): State<AppState>,
    Path(wallet_address): Path<String>,
) -> AppResult<Json<Vec<BalanceResponse>>> {
    let balances = state.exchange.list_balances(&wallet_address).await?;
    Ok(Json(balances.into_iter().map(BalanceResponse::from).collect()))
}

/// GET /balance/:wallet_address/:provider
pub async fn get_balance(
    State(state): State<AppState>,
    Path((wallet_address, provider)): Path<(String, String)>,
) -> AppResult<Json<BalanceResponse>> {
    let balance = state.exchange.get_balance(&wallet_address, &provider).await?;
    Ok(Json(BalanceResponse::from(balance)))
}

/// GET /swap-history/:wallet_address
pub async fn get_swap_history(
    State(state): State<AppState>,
    Path(wallet_address): Path<String>,
) -> AppResult<Json<Vec<SwapResponse>>> {
    let swaps = state.exchange.list_swaps(&wallet_address).await?;
    Ok(Json(swaps.into_iter().map(SwapResponse::from).collect()))
}

/// Spend credit on one AI call
/// POST /consume
///
/// The caller gets the work result as soon as the work is done. A debit the
/// external ledger has not confirmed is reported through `warning` and left
/// to the reconciliation worker.
pub async fn consume_credits(
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<ConsumeRequest>,
) -> AppResult<Json<ConsumeResponse>> {
    let unit = request.work_unit();
    let outcome = state
        .exchange
        .consume(&request.wallet_address, &request.ai_provider, unit)
        .await?;
    let attempt_id = outcome.attempt_id;

    if outcome.reconciliation_pending {
        warn!(
            "Attempt {} delivered with settlement pending reconciliation",
            outcome.attempt_id
        );
    }

    let mut response = ConsumeResponse::from(outcome);

    // The work is already delivered; a failed balance read only drops the field
    match state
        .exchange
        .get_balance(&request.wallet_address, &request.ai_provider)
        .await
    {
        Ok(balance) => response.new_balance = Some(balance.available().to_string()),
        Err(e) => warn!("Could not read balance after attempt {}: {}", attempt_id, e),
    }

    Ok(Json(response))
}

/// GET /settlement/:attempt_id
pub async fn get_settlement_attempt(
    State(state): State<AppState>,
    Path(attempt_id): Path<Uuid>,
) -> AppResult<Json<SettlementAttemptResponse>> {
    let attempt = state.exchange.get_attempt(attempt_id).await?;
    Ok(Json(SettlementAttemptResponse::from(attempt)))
}

/// GET /settlement/account/:wallet_address
pub async fn list_settlement_attempts(
    State(state): State<AppState>,
    Path(wallet_address): Path<String>,
) -> AppResult<Json<Vec<SettlementAttemptResponse>>> {
    let attempts = state.exchange.list_attempts(&wallet_address).await?;
    Ok(Json(
        attempts
            .into_iter()
            .map(SettlementAttemptResponse::from)
            .collect(),
    ))
}
