use super::models::*;
use crate::error::{AppError, AppResult, LedgerError};
use crate::ids::{self, Business};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

/// Ledger repository - THE source of truth for account balances and the
/// append-only transaction log. Every balance mutation goes through
/// [`LedgerRepository::apply`] inside one storage transaction.
pub struct LedgerRepository {
    pub pool: PgPool,
}

const ACCOUNT_COLUMNS: &str = "user_id, balance, version, created_at, updated_at";

const TRANSACTION_COLUMNS: &str = "id, transaction_uuid, user_id, amount, balance_before, \
     balance_after, type, related_entity_type, related_entity_id, description, status, created_at";

impl LedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // ========== ACCOUNT OPERATIONS ==========

    /// Create the account row if absent; return the existing account
    /// unchanged if already present. A nonzero opening balance on the create
    /// path is logged as an `initial` transaction so the balance stays equal
    /// to the transaction sum; a replayed init writes nothing.
    pub async fn init_account(
        &self,
        user_id: i64,
        initial_balance: i64,
    ) -> AppResult<TokenAccount> {
        if initial_balance < 0 {
            return Err(LedgerError::InvalidAmount {
                user_id,
                amount: initial_balance,
            }
            .into());
        }

        let mut tx = self.pool.begin().await?;

        let created = sqlx::query_as::<_, TokenAccount>(&format!(
            "INSERT INTO token_accounts (user_id, balance, version)
             VALUES ($1, $2, 1)
             ON CONFLICT (user_id) DO NOTHING
             RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(user_id)
        .bind(initial_balance)
        .fetch_optional(&mut *tx)
        .await?;

        let account = match created {
            Some(account) => {
                if initial_balance != 0 {
                    self.insert_transaction(
                        &mut tx,
                        &ids::transaction_id(Business::InitialBalance),
                        user_id,
                        initial_balance,
                        0,
                        initial_balance,
                        TransactionType::Initial,
                        "Opening balance",
                        &RelatedEntity::new("system", "account_init"),
                    )
                    .await?;
                }
                info!(
                    "Token account created for user {} with balance {}",
                    user_id, initial_balance
                );
                account
            }
            None => {
                // Already initialized: return the current state untouched.
                self.fetch_account(&mut tx, user_id, false)
                    .await?
                    .ok_or(LedgerError::AccountNotFound(user_id))?
            }
        };

        tx.commit().await?;
        Ok(account)
    }

    pub async fn find_account(&self, user_id: i64) -> AppResult<Option<TokenAccount>> {
        let account = sqlx::query_as::<_, TokenAccount>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM token_accounts WHERE user_id = $1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(account)
    }

    pub async fn get_account(&self, user_id: i64) -> AppResult<TokenAccount> {
        self.find_account(user_id)
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound(user_id).into())
    }

    pub async fn get_balance(&self, user_id: i64) -> AppResult<i64> {
        Ok(self.get_account(user_id).await?.balance)
    }

    /// All user ids with a token account, for the reconciliation sweep.
    pub async fn all_account_user_ids(&self) -> AppResult<Vec<i64>> {
        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT user_id FROM token_accounts ORDER BY user_id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    // ========== TRANSACTION OPERATIONS ==========

    pub async fn get_transaction_by_uuid(
        &self,
        transaction_uuid: &str,
    ) -> AppResult<Option<TokenTransaction>> {
        let row = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM token_transactions WHERE transaction_uuid = $1"
        ))
        .bind(transaction_uuid)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(TokenTransaction::from_row).transpose()
    }

    /// Paged transaction history, newest first. Page is 1-based.
    pub async fn list_transactions(
        &self,
        user_id: i64,
        page: i64,
        limit: i64,
    ) -> AppResult<(Vec<TokenTransaction>, i64)> {
        let (page, limit) = normalize_page(page, limit);
        let offset = (page - 1) * limit;

        let total = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM token_transactions WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM token_transactions
             WHERE user_id = $1
             ORDER BY created_at DESC, id DESC
             LIMIT $2 OFFSET $3"
        ))
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let transactions = rows
            .iter()
            .map(TokenTransaction::from_row)
            .collect::<AppResult<Vec<_>>>()?;

        Ok((transactions, total))
    }

    /// The balance the transaction log says the user should have: the sum
    /// of completed amounts, excluding corrective adjustments. Adjustments
    /// move the stored balance onto this value; counting them here would
    /// manufacture new drift equal to the one just fixed and the audit
    /// would oscillate forever.
    pub async fn calculated_balance(&self, user_id: i64) -> AppResult<i64> {
        let sum = sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(SUM(amount), 0)::BIGINT FROM token_transactions
             WHERE user_id = $1 AND status = $2 AND type <> $3",
        )
        .bind(user_id)
        .bind(TransactionStatus::Completed.as_str())
        .bind(TransactionType::ReconciliationAdjustment.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(sum)
    }

    // ========== BALANCE MUTATION ==========

    pub async fn credit(
        &self,
        user_id: i64,
        amount: i64,
        transaction_uuid: Option<String>,
        transaction_type: TransactionType,
        description: &str,
        related: &RelatedEntity,
    ) -> AppResult<TokenAccount> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount { user_id, amount }.into());
        }

        let uuid = transaction_uuid.unwrap_or_else(|| Uuid::new_v4().to_string());
        self.apply(user_id, amount, &uuid, transaction_type, description, related)
            .await
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
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount { user_id, amount }.into());
        }

        let uuid = transaction_uuid.unwrap_or_else(|| Uuid::new_v4().to_string());
        self.apply(user_id, -amount, &uuid, transaction_type, description, related)
            .await
    }

    /// One atomic balance movement.
    ///
    /// Steps: idempotency check on the transaction UUID, `FOR UPDATE` lock on
    /// the account row, balance check for debits, version-conditioned update,
    /// transaction insert, single commit. Any error before commit rolls the
    /// whole step back.
    async fn apply(
        &self,
        user_id: i64,
        signed_amount: i64,
        transaction_uuid: &str,
        transaction_type: TransactionType,
        description: &str,
        related: &RelatedEntity,
    ) -> AppResult<TokenAccount> {
        let mut tx = self.pool.begin().await?;

        // Idempotency: a completed transaction with this UUID means the call
        // already happened; return the current state without re-applying.
        let existing = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM token_transactions WHERE transaction_uuid = $1"
        ))
        .bind(transaction_uuid)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = existing {
            let prior = TokenTransaction::from_row(&row)?;
            if prior.is_completed() {
                debug!(
                    "Transaction {} already completed for user {}, replay is a no-op",
                    transaction_uuid, user_id
                );
                let account = self
                    .fetch_account(&mut tx, user_id, false)
                    .await?
                    .ok_or(LedgerError::AccountNotFound(user_id))?;
                tx.commit().await?;
                return Ok(account);
            }
        }

        // Serialize concurrent mutators of this user.
        let account = self
            .fetch_account(&mut tx, user_id, true)
            .await?
            .ok_or(LedgerError::AccountNotFound(user_id))?;

        if signed_amount < 0 && account.balance < -signed_amount {
            return Err(LedgerError::InsufficientBalance {
                user_id,
                balance: account.balance,
                requested: -signed_amount,
            }
            .into());
        }

        let balance_before = account.balance;
        let balance_after = balance_before + signed_amount;

        // Version double-check: zero rows here means a writer slipped past
        // the row lock, which a correct store never allows.
        let result = sqlx::query(
            "UPDATE token_accounts
             SET balance = $3, version = version + 1, updated_at = NOW()
             WHERE user_id = $1 AND version = $2",
        )
        .bind(user_id)
        .bind(account.version)
        .bind(balance_after)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::ConcurrencyConflict(user_id).into());
        }

        let insert = self
            .insert_transaction(
                &mut tx,
                transaction_uuid,
                user_id,
                signed_amount,
                balance_before,
                balance_after,
                transaction_type,
                description,
                related,
            )
            .await;

        if let Err(err) = insert {
            // Two racers can pass the idempotency check with the same UUID;
            // the loser hits the unique index. Treat it as a replay.
            if is_unique_violation(&err) {
                drop(tx);
                debug!(
                    "Transaction {} committed by a concurrent caller, returning current state",
                    transaction_uuid
                );
                return self.get_account(user_id).await;
            }
            return Err(err);
        }

        tx.commit().await?;

        Ok(TokenAccount {
            balance: balance_after,
            version: account.version + 1,
            updated_at: chrono::Utc::now(),
            ..account
        })
    }

    /// Reconciliation write path: re-derive the discrepancy under the account
    /// row lock and, only if drift remains, apply a corrective
    /// `reconciliation_adjustment` entry. The corrective debit bypasses the
    /// insufficient-balance check - the calculated value is authoritative.
    /// Returns the applied adjustment, or `None` when the drift had already
    /// resolved (e.g. a legitimate mutation landed between audit and fix).
    pub async fn fix_discrepancy(&self, user_id: i64) -> AppResult<Option<TokenTransaction>> {
        let mut tx = self.pool.begin().await?;

        let account = self
            .fetch_account(&mut tx, user_id, true)
            .await?
            .ok_or(LedgerError::AccountNotFound(user_id))?;

        let calculated = sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(SUM(amount), 0)::BIGINT FROM token_transactions
             WHERE user_id = $1 AND status = $2 AND type <> $3",
        )
        .bind(user_id)
        .bind(TransactionStatus::Completed.as_str())
        .bind(TransactionType::ReconciliationAdjustment.as_str())
        .fetch_one(&mut *tx)
        .await?;

        let diff = calculated - account.balance;
        if diff == 0 {
            tx.commit().await?;
            info!(
                "Discrepancy for user {} already resolved before fix, skipping adjustment",
                user_id
            );
            return Ok(None);
        }

        let result = sqlx::query(
            "UPDATE token_accounts
             SET balance = $3, version = version + 1, updated_at = NOW()
             WHERE user_id = $1 AND version = $2",
        )
        .bind(user_id)
        .bind(account.version)
        .bind(calculated)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::ConcurrencyConflict(user_id).into());
        }

        let transaction_uuid = ids::transaction_id(Business::Reconciliation);
        let description = format!(
            "Reconciliation adjustment: {} -> {}",
            account.balance, calculated
        );
        let adjustment = self
            .insert_transaction(
                &mut tx,
                &transaction_uuid,
                user_id,
                diff,
                account.balance,
                calculated,
                TransactionType::ReconciliationAdjustment,
                &description,
                &RelatedEntity::new("system", "reconciliation"),
            )
            .await?;

        tx.commit().await?;

        info!(
            "Applied reconciliation adjustment of {} for user {} ({} -> {})",
            diff, user_id, account.balance, calculated
        );
        Ok(Some(adjustment))
    }

    // ========== INTERNAL HELPERS ==========

    async fn fetch_account(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: i64,
        lock: bool,
    ) -> AppResult<Option<TokenAccount>> {
        let query = if lock {
            format!("SELECT {ACCOUNT_COLUMNS} FROM token_accounts WHERE user_id = $1 FOR UPDATE")
        } else {
            format!("SELECT {ACCOUNT_COLUMNS} FROM token_accounts WHERE user_id = $1")
        };

        let account = sqlx::query_as::<_, TokenAccount>(&query)
            .bind(user_id)
            .fetch_optional(&mut **tx)
            .await?;

        Ok(account)
    }

    #[allow(clippy::too_many_arguments)]
    async fn insert_transaction(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        transaction_uuid: &str,
        user_id: i64,
        amount: i64,
        balance_before: i64,
        balance_after: i64,
        transaction_type: TransactionType,
        description: &str,
        related: &RelatedEntity,
    ) -> AppResult<TokenTransaction> {
        let row = sqlx::query(
            "INSERT INTO token_transactions
                 (transaction_uuid, user_id, amount, balance_before, balance_after,
                  type, related_entity_type, related_entity_id, description, status)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             RETURNING id, created_at",
        )
        .bind(transaction_uuid)
        .bind(user_id)
        .bind(amount)
        .bind(balance_before)
        .bind(balance_after)
        .bind(transaction_type.as_str())
        .bind(&related.entity_type)
        .bind(&related.entity_id)
        .bind(description)
        .bind(TransactionStatus::Completed.as_str())
        .fetch_one(&mut **tx)
        .await?;

        use sqlx::Row;
        Ok(TokenTransaction {
            id: row.try_get("id")?,
            transaction_uuid: transaction_uuid.to_string(),
            user_id,
            amount,
            balance_before,
            balance_after,
            transaction_type,
            related_entity_type: related.entity_type.clone(),
            related_entity_id: related.entity_id.clone(),
            description: description.to_string(),
            status: TransactionStatus::Completed,
            created_at: row.try_get("created_at")?,
        })
    }
}

fn normalize_page(page: i64, limit: i64) -> (i64, i64) {
    let page = page.max(1);
    let limit = if limit <= 0 { 20 } else { limit.min(100) };
    (page, limit)
}

fn is_unique_violation(err: &AppError) -> bool {
    match err {
        AppError::Database(sqlx::Error::Database(db)) => db.is_unique_violation(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_page_clamps() {
        assert_eq!(normalize_page(0, 0), (1, 20));
        assert_eq!(normalize_page(-3, -1), (1, 20));
        assert_eq!(normalize_page(2, 50), (2, 50));
        assert_eq!(normalize_page(1, 500), (1, 100));
    }
}
