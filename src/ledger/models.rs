use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;
use std::fmt;

use crate::error::{AppError, AppResult};

/// Token account entity - one row per user
///
/// Invariant: `balance` equals the sum of `amount` over all completed
/// transactions for the user. `version` is the optimistic-lock counter.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TokenAccount {
    pub user_id: i64,
    pub balance: i64,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Transaction type enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Initial,
    PackageCredit,
    ReferralCredit,
    OutlineDebit,
    ContentDebit,
    AiGenerationDebit,
    ReconciliationAdjustment,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Initial => "initial",
            TransactionType::PackageCredit => "package_credit",
            TransactionType::ReferralCredit => "referral_credit",
            TransactionType::OutlineDebit => "outline_debit",
            TransactionType::ContentDebit => "content_debit",
            TransactionType::AiGenerationDebit => "ai_generation_debit",
            TransactionType::ReconciliationAdjustment => "reconciliation_adjustment",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initial" => Some(TransactionType::Initial),
            "package_credit" => Some(TransactionType::PackageCredit),
            "referral_credit" => Some(TransactionType::ReferralCredit),
            "outline_debit" => Some(TransactionType::OutlineDebit),
            "content_debit" => Some(TransactionType::ContentDebit),
            "ai_generation_debit" => Some(TransactionType::AiGenerationDebit),
            "reconciliation_adjustment" => Some(TransactionType::ReconciliationAdjustment),
            _ => None,
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Transaction status enum
///
/// The happy path only ever writes `completed`; `pending` and `failed` are
/// reserved for future two-phase flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Completed,
    Pending,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Completed => "completed",
            TransactionStatus::Pending => "pending",
            TransactionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "completed" => Some(TransactionStatus::Completed),
            "pending" => Some(TransactionStatus::Pending),
            "failed" => Some(TransactionStatus::Failed),
            _ => None,
        }
    }
}

/// Token transaction entity - append-only ledger entry
///
/// `transaction_uuid` is the idempotency key: a duplicate submission is a
/// no-op replay. Rows are never updated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenTransaction {
    pub id: i64,
    pub transaction_uuid: String,
    pub user_id: i64,
    /// Positive = credit, negative = debit
    pub amount: i64,
    pub balance_before: i64,
    pub balance_after: i64,
    pub transaction_type: TransactionType,
    pub related_entity_type: Option<String>,
    pub related_entity_id: Option<String>,
    pub description: String,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
}

impl TokenTransaction {
    /// Create from database row
    pub fn from_row(row: &sqlx::postgres::PgRow) -> AppResult<Self> {
        use sqlx::Row;

        let type_str: String = row.try_get("type")?;
        let transaction_type = TransactionType::parse(&type_str).ok_or_else(|| {
            AppError::Internal(format!("Unknown transaction type in ledger: {}", type_str))
        })?;

        let status_str: String = row.try_get("status")?;
        let status = TransactionStatus::parse(&status_str).ok_or_else(|| {
            AppError::Internal(format!("Unknown transaction status in ledger: {}", status_str))
        })?;

        Ok(TokenTransaction {
            id: row.try_get("id")?,
            transaction_uuid: row.try_get("transaction_uuid")?,
            user_id: row.try_get("user_id")?,
            amount: row.try_get("amount")?,
            balance_before: row.try_get("balance_before")?,
            balance_after: row.try_get("balance_after")?,
            transaction_type,
            related_entity_type: row.try_get("related_entity_type")?,
            related_entity_id: row.try_get("related_entity_id")?,
            description: row.try_get("description")?,
            status,
            created_at: row.try_get("created_at")?,
        })
    }

    pub fn is_completed(&self) -> bool {
        self.status == TransactionStatus::Completed
    }
}

/// Correlation to the business object that caused a balance movement.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelatedEntity {
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
}

impl RelatedEntity {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: Some(entity_type.into()),
            entity_id: Some(entity_id.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_type_round_trip() {
        for t in [
            TransactionType::Initial,
            TransactionType::PackageCredit,
            TransactionType::ReferralCredit,
            TransactionType::OutlineDebit,
            TransactionType::ContentDebit,
            TransactionType::AiGenerationDebit,
            TransactionType::ReconciliationAdjustment,
        ] {
            assert_eq!(TransactionType::parse(t.as_str()), Some(t));
        }
        assert_eq!(TransactionType::parse("bogus"), None);
    }

    #[test]
    fn test_status_round_trip() {
        for s in [
            TransactionStatus::Completed,
            TransactionStatus::Pending,
            TransactionStatus::Failed,
        ] {
            assert_eq!(TransactionStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(TransactionStatus::parse(""), None);
    }
}
