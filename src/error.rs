use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sqlx::migrate::MigrateError;
use serde::Serialize;
use thiserror::Error;

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

/// Ledger-related errors
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Token account not found for user {0}")]
    AccountNotFound(i64),

    #[error("Insufficient balance for user {user_id}: balance {balance}, requested {requested}")]
    InsufficientBalance {
        user_id: i64,
        balance: i64,
        requested: i64,
    },

    #[error("Concurrent modification detected for user {0}")]
    ConcurrencyConflict(i64),

    #[error("Amount must be positive, got {amount} for user {user_id}")]
    InvalidAmount { user_id: i64, amount: i64 },

    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),
}

impl LedgerError {
    /// Whether a caller may retry the same call (same transaction UUID) and
    /// expect a different outcome. Business rejections are final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::ConcurrencyConflict(_))
    }
}

/// Compensation task errors
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("no handler registered")]
    NoHandler,

    #[error("Invalid task payload: {0}")]
    InvalidPayload(String),

    #[error("Task not found: {0}")]
    NotFound(String),
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
            AppError::Ledger(LedgerError::AccountNotFound(user_id)) => (
                StatusCode::NOT_FOUND,
                "ACCOUNT_NOT_FOUND",
                format!("Token account not found for user {}", user_id),
                Some(serde_json::json!({ "user_id": user_id })),
            ),
            AppError::Ledger(LedgerError::InsufficientBalance {
                user_id,
                balance,
                requested,
            }) => (
                StatusCode::CONFLICT,
                "INSUFFICIENT_BALANCE",
                format!("Insufficient balance for user {}", user_id),
                Some(serde_json::json!({
                    "user_id": user_id,
                    "balance": balance,
                    "requested": requested,
                })),
            ),
            AppError::Ledger(LedgerError::ConcurrencyConflict(user_id)) => (
                StatusCode::CONFLICT,
                "CONCURRENCY_CONFLICT",
                format!(
                    "Concurrent modification detected for user {}, retry with the same transaction UUID",
                    user_id
                ),
                Some(serde_json::json!({ "user_id": user_id })),
            ),
            AppError::Ledger(LedgerError::InvalidAmount { user_id, amount }) => (
                StatusCode::BAD_REQUEST,
                "INVALID_AMOUNT",
                format!("Amount must be positive, got {}", amount),
                Some(serde_json::json!({ "user_id": user_id, "amount": amount })),
            ),
            AppError::Ledger(LedgerError::TransactionNotFound(uuid)) => (
                StatusCode::NOT_FOUND,
                "TRANSACTION_NOT_FOUND",
                format!("Transaction not found: {}", uuid),
                None,
            ),
            AppError::NotFound(message) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                message,
                None,
            ),
            AppError::InvalidInput(message) | AppError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                "BAD_REQUEST",
                message,
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

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        AppError::Internal(format!("Error converting: {:?}", error))
    }
}

impl From<MigrateError> for AppError {
    fn from(error: MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(error: serde_json::Error) -> Self {
        AppError::Task(TaskError::InvalidPayload(error.to_string()))
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
