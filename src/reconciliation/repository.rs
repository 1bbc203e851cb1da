use sqlx::PgPool;

use super::models::ReconciliationRecord;
use crate::error::{AppError, AppResult};

/// Storage for audit results. Discrepancies are always persisted before any
/// fix is attempted, so no finding is ever silently dropped.
pub struct ReconciliationRepository {
    pub pool: PgPool,
}

const RECORD_COLUMNS: &str = "id, user_id, current_balance, calculated_balance, discrepancy, \
     is_fixed, fixed_at, description, created_at";

impl ReconciliationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn save(
        &self,
        user_id: i64,
        current_balance: i64,
        calculated_balance: i64,
        description: &str,
    ) -> AppResult<ReconciliationRecord> {
        let record = sqlx::query_as::<_, ReconciliationRecord>(&format!(
            "INSERT INTO token_reconciliation_records
                 (user_id, current_balance, calculated_balance, discrepancy, description)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {RECORD_COLUMNS}"
        ))
        .bind(user_id)
        .bind(current_balance)
        .bind(calculated_balance)
        .bind(current_balance - calculated_balance)
        .bind(description)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    pub async fn mark_fixed(&self, record_id: i64) -> AppResult<()> {
        let result = sqlx::query(
            "UPDATE token_reconciliation_records
             SET is_fixed = TRUE, fixed_at = NOW()
             WHERE id = $1",
        )
        .bind(record_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!(
                "Reconciliation record {} not found",
                record_id
            )));
        }

        Ok(())
    }

    pub async fn recent(&self, limit: i64) -> AppResult<Vec<ReconciliationRecord>> {
        let limit = if limit <= 0 { 100 } else { limit };
        let records = sqlx::query_as::<_, ReconciliationRecord>(&format!(
            "SELECT {RECORD_COLUMNS} FROM token_reconciliation_records
             ORDER BY created_at DESC
             LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    pub async fn for_user(&self, user_id: i64, limit: i64) -> AppResult<Vec<ReconciliationRecord>> {
        let limit = if limit <= 0 { 50 } else { limit };
        let records = sqlx::query_as::<_, ReconciliationRecord>(&format!(
            "SELECT {RECORD_COLUMNS} FROM token_reconciliation_records
             WHERE user_id = $1
             ORDER BY created_at DESC
             LIMIT $2"
        ))
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Records awaiting manual follow-up after a failed or disabled auto-fix.
    pub async fn unfixed(&self, limit: i64) -> AppResult<Vec<ReconciliationRecord>> {
        let limit = if limit <= 0 { 100 } else { limit };
        let records = sqlx::query_as::<_, ReconciliationRecord>(&format!(
            "SELECT {RECORD_COLUMNS} FROM token_reconciliation_records
             WHERE is_fixed = FALSE
             ORDER BY created_at DESC
             LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}
