use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::models::{RelatedEntity, TokenAccount, TokenTransaction, TransactionType};
use super::repository::LedgerRepository;
use crate::compensation::handlers::{
    BalanceChangePayload, InitAccountPayload, TOKEN_CREDIT, TOKEN_DEBIT, USER_TOKEN_INIT,
};
use crate::compensation::{CompensationStore, NewTask};
use crate::error::{AppError, AppResult};

/// Result of a ledger entry point that may defer to compensation.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LedgerOutcome {
    /// The operation committed synchronously.
    Completed { account: TokenAccount },
    /// The operation failed transiently and was enqueued for retry; the
    /// balance will converge once the compensation task runs.
    Queued { task_id: String },
}

/// The accounting service front door. Owns no SQL - delegates every storage
/// operation to [`LedgerRepository`] - and adds operation logging plus the
/// compensation-opting entry points for callers that must not lose a
/// balance movement to a transient failure.
pub struct TokenLedger {
    repo: Arc<LedgerRepository>,
    tasks: Arc<CompensationStore>,
}

/// Retry budget and initial delay for ledger compensation tasks.
const LEDGER_TASK_MAX_RETRIES: i32 = 5;
const LEDGER_TASK_INITIAL_DELAY_SECS: i64 = 10;

impl TokenLedger {
    pub fn new(repo: Arc<LedgerRepository>, tasks: Arc<CompensationStore>) -> Self {
        Self { repo, tasks }
    }

    // ========== DIRECT OPERATIONS ==========

    pub async fn init_account(
        &self,
        user_id: i64,
        initial_balance: i64,
    ) -> AppResult<TokenAccount> {
        info!(
            "Initializing token account for user {} with initial balance {}",
            user_id, initial_balance
        );
        let account = self.repo.init_account(user_id, initial_balance).await?;
        Ok(account)
    }

    pub async fn get_balance(&self, user_id: i64) -> AppResult<i64> {
        self.repo.get_balance(user_id).await
    }

    pub async fn get_account(&self, user_id: i64) -> AppResult<TokenAccount> {
        self.repo.get_account(user_id).await
    }

    pub async fn get_transaction_by_uuid(
        &self,
        transaction_uuid: &str,
    ) -> AppResult<Option<TokenTransaction>> {
        self.repo.get_transaction_by_uuid(transaction_uuid).await
    }

    pub async fn list_transactions(
        &self,
        user_id: i64,
        page: i64,
        limit: i64,
    ) -> AppResult<(Vec<TokenTransaction>, i64)> {
        self.repo.list_transactions(user_id, page, limit).await
    }

    pub async fn credit(
        &self,
        user_id: i64,
        amount: i64,
        transaction_uuid: Option<String>,
        transaction_type: TransactionType,
        description: &str,
        related: &RelatedEntity,
    ) -> AppResult<TokenAccount> {
        info!(
            "Crediting {} tokens to user {} (type {}, uuid {:?})",
            amount, user_id, transaction_type, transaction_uuid
        );
        let account = self
            .repo
            .credit(user_id, amount, transaction_uuid, transaction_type, description, related)
            .await?;
        info!(
            "Credited user {}, new balance: {}",
            user_id, account.balance
        );
        Ok(account)
    }

    pub async fn debit(
        &self,
        user_id: i64,
        amount: i64,
        transaction_uuid: Option<String>,
        transaction_type: TransactionType,
        description: &str,
        related: &RelatedEntity,
    ) -> AppResult<TokenAccount> {
        info!(
            "Debiting {} tokens from user {} (type {}, uuid {:?})",
            amount, user_id, transaction_type, transaction_uuid
        );
        let account = self
            .repo
            .debit(user_id, amount, transaction_uuid, transaction_type, description, related)
            .await?;
        info!(
            "Debited user {}, new balance: {}",
            user_id, account.balance
        );
        Ok(account)
    }

    // ========== COMPENSATION-OPTING OPERATIONS ==========

    /// Initialize an account, falling back to a compensation task when the
    /// store is unavailable so registration flows never lose the opening
    /// balance.
    pub async fn init_account_with_compensation(
        &self,
        user_id: i64,
        initial_balance: i64,
    ) -> AppResult<LedgerOutcome> {
        match self.init_account(user_id, initial_balance).await {
            Ok(account) => Ok(LedgerOutcome::Completed { account }),
            Err(err) if is_compensatable(&err) => {
                warn!(
                    "Account init failed for user {} ({}), enqueueing compensation",
                    user_id, err
                );
                let payload = serde_json::to_string(&InitAccountPayload {
                    user_id,
                    initial_balance,
                })?;
                self.enqueue(USER_TOKEN_INIT, payload, user_id).await
            }
            Err(err) => Err(err),
        }
    }

    /// Credit with guaranteed eventual execution: on a transient failure the
    /// same idempotent call is enqueued for the scheduler to replay.
    pub async fn credit_with_compensation(
        &self,
        user_id: i64,
        amount: i64,
        transaction_uuid: Option<String>,
        transaction_type: TransactionType,
        description: &str,
        related: &RelatedEntity,
    ) -> AppResult<LedgerOutcome> {
        // Pin the UUID before the first attempt so the queued replay targets
        // the same transaction.
        let uuid = transaction_uuid.unwrap_or_else(|| Uuid::new_v4().to_string());

        match self
            .credit(user_id, amount, Some(uuid.clone()), transaction_type, description, related)
            .await
        {
            Ok(account) => Ok(LedgerOutcome::Completed { account }),
            Err(err) if is_compensatable(&err) => {
                warn!(
                    "Credit failed for user {} ({}), enqueueing compensation",
                    user_id, err
                );
                let payload = self.balance_change_payload(
                    user_id,
                    amount,
                    uuid,
                    transaction_type,
                    description,
                    related,
                )?;
                self.enqueue(TOKEN_CREDIT, payload, user_id).await
            }
            Err(err) => Err(err),
        }
    }

    /// Debit counterpart of [`TokenLedger::credit_with_compensation`].
    /// Business rejections (insufficient balance, bad amount) surface
    /// immediately - retrying them cannot change the outcome.
    pub async fn debit_with_compensation(
        &self,
        user_id: i64,
        amount: i64,
        transaction_uuid: Option<String>,
        transaction_type: TransactionType,
        description: &str,
        related: &RelatedEntity,
    ) -> AppResult<LedgerOutcome> {
        let uuid = transaction_uuid.unwrap_or_else(|| Uuid::new_v4().to_string());

        match self
            .debit(user_id, amount, Some(uuid.clone()), transaction_type, description, related)
            .await
        {
            Ok(account) => Ok(LedgerOutcome::Completed { account }),
            Err(err) if is_compensatable(&err) => {
                warn!(
                    "Debit failed for user {} ({}), enqueueing compensation",
                    user_id, err
                );
                let payload = self.balance_change_payload(
                    user_id,
                    amount,
                    uuid,
                    transaction_type,
                    description,
                    related,
                )?;
                self.enqueue(TOKEN_DEBIT, payload, user_id).await
            }
            Err(err) => Err(err),
        }
    }

    fn balance_change_payload(
        &self,
        user_id: i64,
        amount: i64,
        transaction_uuid: String,
        transaction_type: TransactionType,
        description: &str,
        related: &RelatedEntity,
    ) -> AppResult<String> {
        Ok(serde_json::to_string(&BalanceChangePayload {
            user_id,
            amount,
            transaction_uuid,
            transaction_type,
            description: description.to_string(),
            related_entity_type: related.entity_type.clone(),
            related_entity_id: related.entity_id.clone(),
        })?)
    }

    async fn enqueue(
        &self,
        task_type: &str,
        payload: String,
        user_id: i64,
    ) -> AppResult<LedgerOutcome> {
        let task = NewTask::new(task_type, payload)
            .with_max_retries(LEDGER_TASK_MAX_RETRIES)
            .delayed_by(chrono::Duration::seconds(LEDGER_TASK_INITIAL_DELAY_SECS));

        match self.tasks.add_task(task).await {
            Ok(task) => Ok(LedgerOutcome::Queued {
                task_id: task.task_id,
            }),
            Err(err) => {
                // Both the direct call and the fallback write failed; nothing
                // durable records the operation, so the caller must be told.
                error!(
                    "Compensation task creation failed for user {}: {}",
                    user_id, err
                );
                Err(AppError::Internal(
                    "Operation failed and could not be queued for retry".to_string(),
                ))
            }
        }
    }
}

/// Only failures that a later retry can heal are worth a compensation task.
/// Validation and business rejections are deterministic; queueing them would
/// burn retries to reach the same answer.
fn is_compensatable(err: &AppError) -> bool {
    match err {
        AppError::Database(_) | AppError::Internal(_) => true,
        AppError::Ledger(ledger_err) => ledger_err.is_retryable(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LedgerError;

    #[test]
    fn test_business_errors_are_not_compensatable() {
        assert!(!is_compensatable(&AppError::Ledger(
            LedgerError::InsufficientBalance {
                user_id: 1,
                balance: 5,
                requested: 10
            }
        )));
        assert!(!is_compensatable(&AppError::Ledger(
            LedgerError::InvalidAmount { user_id: 1, amount: 0 }
        )));
        assert!(!is_compensatable(&AppError::Ledger(
            LedgerError::AccountNotFound(1)
        )));
    }

    #[test]
    fn test_transient_errors_are_compensatable() {
        assert!(is_compensatable(&AppError::Ledger(
            LedgerError::ConcurrencyConflict(1)
        )));
        assert!(is_compensatable(&AppError::Database(
            sqlx::Error::PoolTimedOut
        )));
    }
}
