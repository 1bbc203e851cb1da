use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::ledger::models::TokenTransaction;

/// Request to initialize a user's token account.
#[derive(Debug, Deserialize, Validate)]
pub struct TokenInitRequest {
    pub user_id: i64,
    #[serde(default)]
    #[validate(range(min = 0))]
    pub initial_balance: i64,
}

/// Request to credit or debit a user's account.
#[derive(Debug, Deserialize, Validate)]
pub struct TokenTransactionRequest {
    pub user_id: i64,
    #[validate(range(min = 1))]
    pub amount: i64,
    /// Optional idempotency key; generated when absent.
    #[serde(default)]
    pub transaction_uuid: Option<String>,
    #[serde(rename = "type")]
    pub transaction_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub related_entity_type: Option<String>,
    #[serde(default)]
    pub related_entity_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub user_id: i64,
    pub balance: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct TransactionListResponse {
    pub transactions: Vec<TokenTransaction>,
    pub total: i64,
    pub page: i64,
    pub limit: i64,
    pub pages: i64,
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub page: Option<i64>,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
