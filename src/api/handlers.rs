use axum::{
    extract::{Path, Query, State},
    Json,
};
use std::sync::Arc;
use tracing::info;
use validator::Validate;

use super::models::*;
use crate::{
    error::{AppError, AppResult, LedgerError},
    ledger::{
        models::{RelatedEntity, TransactionType},
        service::{LedgerOutcome, TokenLedger},
    },
    reconciliation::{
        models::{ReconciliationRecord, ReconciliationSummary, UserReconciliation},
        repository::ReconciliationRepository,
        service::ReconciliationService,
    },
};

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<TokenLedger>,
    pub reconciliation: Arc<ReconciliationService>,
    pub reconciliation_records: Arc<ReconciliationRepository>,
}

pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

// ========== LEDGER ENDPOINTS ==========

/// POST /token/init
pub async fn init_token_account(
    State(state): State<AppState>,
    Json(request): Json<TokenInitRequest>,
) -> AppResult<Json<LedgerOutcome>> {
    request
        .validate()
        .map_err(|e| AppError::InvalidInput(e.to_string()))?;

    let outcome = state
        .ledger
        .init_account_with_compensation(request.user_id, request.initial_balance)
        .await?;
    Ok(Json(outcome))
}

/// POST /token/credit
pub async fn credit_tokens(
    State(state): State<AppState>,
    Json(request): Json<TokenTransactionRequest>,
) -> AppResult<Json<LedgerOutcome>> {
    let (transaction_type, related) = validate_transaction_request(&request)?;

    let outcome = state
        .ledger
        .credit_with_compensation(
            request.user_id,
            request.amount,
            request.transaction_uuid.clone(),
            transaction_type,
            &request.description,
            &related,
        )
        .await?;
    Ok(Json(outcome))
}

/// POST /token/debit
pub async fn debit_tokens(
    State(state): State<AppState>,
    Json(request): Json<TokenTransactionRequest>,
) -> AppResult<Json<LedgerOutcome>> {
    let (transaction_type, related) = validate_transaction_request(&request)?;

    let outcome = state
        .ledger
        .debit_with_compensation(
            request.user_id,
            request.amount,
            request.transaction_uuid.clone(),
            transaction_type,
            &request.description,
            &related,
        )
        .await?;
    Ok(Json(outcome))
}

/// GET /token/balance/:user_id
pub async fn get_balance(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> AppResult<Json<BalanceResponse>> {
    let account = state.ledger.get_account(user_id).await?;
    Ok(Json(BalanceResponse {
        user_id: account.user_id,
        balance: account.balance,
        updated_at: account.updated_at,
    }))
}

/// GET /token/account/:user_id
pub async fn get_token_account(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> AppResult<Json<crate::ledger::models::TokenAccount>> {
    let account = state.ledger.get_account(user_id).await?;
    Ok(Json(account))
}

/// GET /token/transactions/:user_id
pub async fn list_user_transactions(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    Query(query): Query<PageQuery>,
) -> AppResult<Json<TransactionListResponse>> {
    let page = query.page.unwrap_or(1);
    let limit = query.limit.unwrap_or(20);

    let (transactions, total) = state.ledger.list_transactions(user_id, page, limit).await?;

    // Mirror the repository's page normalization in the response metadata.
    let page = page.max(1);
    let limit = if limit <= 0 { 20 } else { limit.min(100) };
    let pages = (total + limit - 1) / limit;
    Ok(Json(TransactionListResponse {
        transactions,
        total,
        page,
        limit,
        pages,
    }))
}

/// GET /token/transaction/:uuid
pub async fn get_transaction(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> AppResult<Json<crate::ledger::models::TokenTransaction>> {
    let transaction = state
        .ledger
        .get_transaction_by_uuid(&uuid)
        .await?
        .ok_or(LedgerError::TransactionNotFound(uuid))?;
    Ok(Json(transaction))
}

// ========== ADMIN RECONCILIATION ENDPOINTS ==========

/// POST /admin/reconciliation/start
pub async fn start_reconciliation(
    State(state): State<AppState>,
) -> AppResult<Json<MessageResponse>> {
    state.reconciliation.clone().start();
    Ok(Json(MessageResponse::new("Reconciliation service started")))
}

/// POST /admin/reconciliation/stop
pub async fn stop_reconciliation(
    State(state): State<AppState>,
) -> AppResult<Json<MessageResponse>> {
    state.reconciliation.stop();
    Ok(Json(MessageResponse::new("Reconciliation service stopped")))
}

/// POST /admin/reconciliation/run
pub async fn run_full_reconciliation(
    State(state): State<AppState>,
) -> AppResult<Json<ReconciliationSummary>> {
    info!("Full reconciliation triggered manually");
    let summary = state.reconciliation.run_full().await?;
    Ok(Json(summary))
}

/// POST /admin/reconciliation/run/:user_id
pub async fn run_user_reconciliation(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> AppResult<Json<UserReconciliation>> {
    let outcome = state.reconciliation.run_user(user_id).await?;
    Ok(Json(outcome))
}

/// GET /admin/reconciliation/records
pub async fn recent_reconciliation_records(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> AppResult<Json<Vec<ReconciliationRecord>>> {
    let records = state
        .reconciliation_records
        .recent(query.limit.unwrap_or(100))
        .await?;
    Ok(Json(records))
}

/// GET /admin/reconciliation/records/unfixed
pub async fn unfixed_reconciliation_records(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> AppResult<Json<Vec<ReconciliationRecord>>> {
    let records = state
        .reconciliation_records
        .unfixed(query.limit.unwrap_or(100))
        .await?;
    Ok(Json(records))
}

/// GET /admin/reconciliation/records/user/:user_id
pub async fn user_reconciliation_records(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    Query(query): Query<LimitQuery>,
) -> AppResult<Json<Vec<ReconciliationRecord>>> {
    let records = state
        .reconciliation_records
        .for_user(user_id, query.limit.unwrap_or(50))
        .await?;
    Ok(Json(records))
}

fn validate_transaction_request(
    request: &TokenTransactionRequest,
) -> AppResult<(TransactionType, RelatedEntity)> {
    request
        .validate()
        .map_err(|e| AppError::InvalidInput(e.to_string()))?;

    let transaction_type = TransactionType::parse(&request.transaction_type)
        .ok_or_else(|| {
            AppError::InvalidInput(format!(
                "Unknown transaction type: {}",
                request.transaction_type
            ))
        })?;

    // Adjustments are minted by the reconciliation engine only.
    if transaction_type == TransactionType::ReconciliationAdjustment {
        return Err(AppError::InvalidInput(
            "reconciliation_adjustment is reserved for the reconciliation engine".to_string(),
        ));
    }

    let related = RelatedEntity {
        entity_type: request.related_entity_type.clone(),
        entity_id: request.related_entity_id.clone(),
    };
    Ok((transaction_type, related))
}
