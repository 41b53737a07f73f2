use axum::{
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use anyhow::Context;
use tower_http::{compression::CompressionLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    api::handler::{
        consume_credits, get_balance, get_balances, get_exchange_rates, get_settlement_attempt,
        get_supported_tokens, get_swap_history, health_check, list_settlement_attempts,
        quote_swap, swap_tokens, AppState,
    },
    middleware::{create_cors_layer, rate_limit_middleware, RateLimitLayer},
};

pub fn create_app(state: AppState, limiter: RateLimitLayer, cors_origins: &[String]) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    // Only the route that spends credit and calls out to the provider is throttled
    let consume: Router<AppState> = Router::new()
        .route("/consume", post(consume_credits))
        .route_layer(from_fn_with_state(limiter, rate_limit_middleware));

    let app = Router::new()
        // Public endpoints
        .route("/health", get(health_check))
        .route("/exchange-rates", get(get_exchange_rates))
        .route("/supported-tokens", get(get_supported_tokens))
        .nest(
            "/api/v1",
            Router::new()
                // Swap endpoints
                .route("/swap/quote", post(quote_swap))
                .route("/swap", post(swap_tokens))
                .route("/swap-history/:wallet_address", get(get_swap_history))
                // Balance endpoints
                .route("/balance/:wallet_address", get(get_balances))
                .route("/balance/:wallet_address/:provider", get(get_balance))
                // Settlement endpoints
                .route("/settlement/:attempt_id", get(get_settlement_attempt))
                .route(
                    "/settlement/account/:wallet_address",
                    get(list_settlement_attempts),
                )
                .merge(consume),
        )
        .layer(CompressionLayer::new())
        .layer(create_cors_layer(cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("✓ HTTP routes configured");
    app
}

pub async fn run_server(
    app: Router,
    bind_address: &str,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .with_context(|| format!("failed to bind {}", bind_address))?;
    info!("🌐 Server listening on: {}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("🛑 Shutdown signal received");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quote_engine::{ExchangeCalculator, RateTable};
    use crate::settlement::testing::Harness;
    use crate::settlement::CreditExchange;
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app(h: &Harness, per_minute: u32) -> Router {
        let calculator = Arc::new(ExchangeCalculator::new(
            Arc::new(RateTable::with_defaults()),
            h.ledger.clone(),
        ));
        let exchange = CreditExchange::new(h.ledger.clone(), calculator, h.coordinator.clone());
        create_app(
            AppState { exchange },
            RateLimitLayer::per_minute(per_minute),
            &["http://localhost:3000".to_string()],
        )
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_swap_then_balance() {
        let h = Harness::new();
        let app = app(&h, 100);

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/v1/swap",
                serde_json::json!({
                    "wallet_address": "0xabc",
                    "blockchain_token_amount": "1",
                    "blockchain_token_symbol": "ETH",
                    "ai_provider": "openai",
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let swap = json_body(response).await;
        assert_eq!(swap["ai_credits_received"], "50");
        assert!(swap["transaction_hash"].as_str().unwrap().starts_with("0x"));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/balance/0xabc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let balances = json_body(response).await;
        assert_eq!(balances[0]["ai_provider"], "openai");
        assert_eq!(balances[0]["tokens_available"], 50_000_000);
    }

    #[tokio::test]
    async fn test_invalid_body_is_rejected() {
        let h = Harness::new();
        let response = app(&h, 100)
            .oneshot(post_json(
                "/api/v1/swap",
                serde_json::json!({
                    "wallet_address": "",
                    "blockchain_token_amount": "lots",
                    "blockchain_token_symbol": "ETH",
                    "ai_provider": "openai",
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error_code"], "INVALID_INPUT");
    }

    #[tokio::test]
    async fn test_consume_without_credit_is_402() {
        let h = Harness::new();
        let response = app(&h, 100)
            .oneshot(post_json(
                "/api/v1/consume",
                serde_json::json!({
                    "wallet_address": "0xabc",
                    "ai_provider": "openai",
                    "model": "AI_FLASHTX",
                    "prompt": "hello",
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
        assert_eq!(h.executor.calls(), 0);
    }

    #[tokio::test]
    async fn test_consume_is_rate_limited() {
        let h = Harness::new();
        h.fund("0xabc", dec!(1)).await;
        let app = app(&h, 1);
        let request = || {
            post_json(
                "/api/v1/consume",
                serde_json::json!({
                    "wallet_address": "0xabc",
                    "ai_provider": "openai",
                    "model": "AI_FLASHTX",
                    "prompt": "hello",
                }),
            )
        };

        let first = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let body = json_body(first).await;
        assert_eq!(body["credits_used"], "0.05");
        assert_eq!(body["new_balance"], "0.95");

        let second = app.oneshot(request()).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(h.executor.calls(), 1);
    }

    #[tokio::test]
    async fn test_consume_reports_balance_while_reconciling() {
        let h = Harness::new();
        h.fund("0xabc", dec!(1)).await;
        h.external.fail_next(1);

        let response = app(&h, 100)
            .oneshot(post_json(
                "/api/v1/consume",
                serde_json::json!({
                    "wallet_address": "0xabc",
                    "ai_provider": "OpenAI",
                    "model": "AI_FLASHTX",
                    "prompt": "hello",
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body["reconciliation_pending"], true);
        // Held, not yet debited, but already unavailable
        assert_eq!(body["new_balance"], "0.95");
        assert!(body["warning"].is_string());
    }

    #[tokio::test]
    async fn test_supported_tokens() {
        let h = Harness::new();
        let response = app(&h, 100)
            .oneshot(
                Request::builder()
                    .uri("/supported-tokens")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = json_body(response).await;
        assert!(body["blockchain_tokens"]
            .as_array()
            .unwrap()
            .contains(&serde_json::json!("USDC")));
        assert!(body["ai_providers"]
            .as_array()
            .unwrap()
            .contains(&serde_json::json!("openai")));
    }
}
