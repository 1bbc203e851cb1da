use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::models::CompensationTask;
use super::scheduler::CompensationHandler;
use crate::error::AppResult;
use crate::ledger::models::{RelatedEntity, TransactionType};
use crate::ledger::service::TokenLedger;

/// Registry keys for the ledger's compensating handlers.
pub const USER_TOKEN_INIT: &str = "user_token_init";
pub const TOKEN_CREDIT: &str = "token_credit";
pub const TOKEN_DEBIT: &str = "token_debit";

/// Payload of a deferred account initialization.
#[derive(Debug, Serialize, Deserialize)]
pub struct InitAccountPayload {
    pub user_id: i64,
    pub initial_balance: i64,
}

/// Payload of a deferred credit or debit. Carries the original transaction
/// UUID so replays stay idempotent.
#[derive(Debug, Serialize, Deserialize)]
pub struct BalanceChangePayload {
    pub user_id: i64,
    pub amount: i64,
    pub transaction_uuid: String,
    pub transaction_type: TransactionType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub related_entity_type: Option<String>,
    #[serde(default)]
    pub related_entity_id: Option<String>,
}

impl BalanceChangePayload {
    fn related(&self) -> RelatedEntity {
        RelatedEntity {
            entity_type: self.related_entity_type.clone(),
            entity_id: self.related_entity_id.clone(),
        }
    }
}

pub struct InitAccountHandler {
    ledger: Arc<TokenLedger>,
}

impl InitAccountHandler {
    pub fn new(ledger: Arc<TokenLedger>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl CompensationHandler for InitAccountHandler {
    async fn execute(&self, task: &CompensationTask) -> AppResult<()> {
        let params: InitAccountPayload = serde_json::from_str(&task.payload)?;
        self.ledger
            .init_account(params.user_id, params.initial_balance)
            .await?;
        Ok(())
    }
}

pub struct CreditHandler {
    ledger: Arc<TokenLedger>,
}

impl CreditHandler {
    pub fn new(ledger: Arc<TokenLedger>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl CompensationHandler for CreditHandler {
    async fn execute(&self, task: &CompensationTask) -> AppResult<()> {
        let params: BalanceChangePayload = serde_json::from_str(&task.payload)?;
        self.ledger
            .credit(
                params.user_id,
                params.amount,
                Some(params.transaction_uuid.clone()),
                params.transaction_type,
                &params.description,
                &params.related(),
            )
            .await?;
        Ok(())
    }
}

pub struct DebitHandler {
    ledger: Arc<TokenLedger>,
}

impl DebitHandler {
    pub fn new(ledger: Arc<TokenLedger>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl CompensationHandler for DebitHandler {
    async fn execute(&self, task: &CompensationTask) -> AppResult<()> {
        let params: BalanceChangePayload = serde_json::from_str(&task.payload)?;
        self.ledger
            .debit(
                params.user_id,
                params.amount,
                Some(params.transaction_uuid.clone()),
                params.transaction_type,
                &params.description,
                &params.related(),
            )
            .await?;
        Ok(())
    }
}
