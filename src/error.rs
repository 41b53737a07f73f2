use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use sqlx::migrate::MigrateError;
use thiserror::Error;
use uuid::Uuid;

use crate::ledger::models::SettlementState;

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Credit error: {0}")]
    Credit(#[from] CreditError),

    #[error("Settlement error: {0}")]
    Settlement(#[from] SettlementError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("External error: {0}")]
    ExternalError(String),

    #[error("Rate limit exceeded")]
    RateLimited,
}

/// Credit ledger errors
#[derive(Error, Debug)]
pub enum CreditError {
    #[error("Unsupported pair: asset {asset}, provider {provider}")]
    UnsupportedPair { asset: String, provider: String },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Insufficient credit: required {required}, available {available}")]
    InsufficientCredit { required: String, available: String },

    #[error("Swap id already exists: {0}")]
    DuplicateSwapId(String),

    #[error("Reservation not found: {0}")]
    ReservationNotFound(Uuid),

    #[error("Reservation {0} was already released")]
    ReservationReleased(Uuid),

    #[error("Reservation {0} was already committed")]
    ReservationCommitted(Uuid),
}

/// Settlement and collaborator errors
#[derive(Error, Debug)]
pub enum SettlementError {
    #[error("Metered work unavailable: {0}")]
    WorkUnavailable(String),

    /// The external ledger may or may not have applied the debit
    #[error("External debit unconfirmed: {0}")]
    Unconfirmed(String),

    /// The external ledger definitely did not apply the debit
    #[error("External debit rejected: {0}")]
    Rejected(String),

    #[error("Operation timed out after {0}ms")]
    Timeout(u64),

    #[error("Invalid settlement transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: SettlementState,
        to: SettlementState,
    },

    #[error("Settlement attempt not found: {0}")]
    AttemptNotFound(Uuid),

    #[error("Reconciliation exhausted for attempt {attempt_id} after {retries} retries")]
    ReconciliationExhausted { attempt_id: Uuid, retries: i32 },
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message, details) = match self {
            AppError::Credit(CreditError::UnsupportedPair { asset, provider }) => (
                StatusCode::BAD_REQUEST,
                "UNSUPPORTED_PAIR",
                format!("Pair {} -> {} is not supported", asset, provider),
                Some(serde_json::json!({
                    "asset": asset,
                    "provider": provider,
                })),
            ),
            AppError::Credit(CreditError::InvalidAmount(msg)) => (
                StatusCode::BAD_REQUEST,
                "INVALID_AMOUNT",
                msg,
                None,
            ),
            AppError::Credit(CreditError::InsufficientCredit { required, available }) => (
                StatusCode::PAYMENT_REQUIRED,
                "INSUFFICIENT_CREDIT",
                "Insufficient credits".to_string(),
                Some(serde_json::json!({
                    "required": required,
                    "available": available,
                })),
            ),
            AppError::Settlement(SettlementError::WorkUnavailable(msg)) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "WORK_UNAVAILABLE",
                format!("AI provider unavailable: {}", msg),
                None,
            ),
            AppError::Settlement(SettlementError::AttemptNotFound(id)) => (
                StatusCode::NOT_FOUND,
                "ATTEMPT_NOT_FOUND",
                format!("Settlement attempt not found: {}", id),
                None,
            ),
            AppError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, "INVALID_INPUT", msg, None),
            AppError::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMITED",
                "Rate limit exceeded. Please try again later.".to_string(),
                None,
            ),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "A database error occurred".to_string(),
                None,
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
                None,
            ),
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
            details,
        });

        (status, body).into_response()
    }
}

impl From<rust_decimal::Error> for AppError {
    fn from(error: rust_decimal::Error) -> Self {
        AppError::InvalidInput(format!("Decimal conversion error: {:?}", error))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(error: reqwest::Error) -> Self {
        AppError::ExternalError(format!("HTTP request error: {:?}", error))
    }
}

impl From<MigrateError> for AppError {
    fn from(error: MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(error: config::ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;

    #[test]
    fn test_insufficient_credit_maps_to_payment_required() {
        let err = AppError::Credit(CreditError::InsufficientCredit {
            required: "5".to_string(),
            available: "1".to_string(),
        });
        assert_eq!(err.into_response().status(), StatusCode::PAYMENT_REQUIRED);
    }

    #[test]
    fn test_work_unavailable_maps_to_service_unavailable() {
        let err = AppError::Settlement(SettlementError::WorkUnavailable("down".to_string()));
        assert_eq!(err.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_unsupported_pair_maps_to_bad_request() {
        let err = AppError::Credit(CreditError::UnsupportedPair {
            asset: "DOGE".to_string(),
            provider: "openai".to_string(),
        });
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }
}
