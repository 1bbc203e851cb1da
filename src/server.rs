use std::time::Duration;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    compression::CompressionLayer, cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer,
};
use tracing::info;

use crate::api::handlers::{
    credit_tokens, debit_tokens, get_balance, get_token_account, get_transaction, health_check,
    init_token_account, list_user_transactions, recent_reconciliation_records,
    run_full_reconciliation, run_user_reconciliation, start_reconciliation, stop_reconciliation,
    unfixed_reconciliation_records, user_reconciliation_records, AppState,
};

pub async fn create_app(state: AppState) -> Router {
    info!("Setting up HTTP routes...");

    Router::new()
        .route("/health", get(health_check))
        .nest(
            "/api/v1",
            Router::new()
                // Ledger endpoints
                .route("/token/init", post(init_token_account))
                .route("/token/credit", post(credit_tokens))
                .route("/token/debit", post(debit_tokens))
                .route("/token/balance/:user_id", get(get_balance))
                .route("/token/account/:user_id", get(get_token_account))
                .route("/token/transactions/:user_id", get(list_user_transactions))
                .route("/token/transaction/:uuid", get(get_transaction))
                // Admin reconciliation triggers
                .route("/admin/reconciliation/start", post(start_reconciliation))
                .route("/admin/reconciliation/stop", post(stop_reconciliation))
                .route("/admin/reconciliation/run", post(run_full_reconciliation))
                .route(
                    "/admin/reconciliation/run/:user_id",
                    post(run_user_reconciliation),
                )
                .route(
                    "/admin/reconciliation/records",
                    get(recent_reconciliation_records),
                )
                .route(
                    "/admin/reconciliation/records/unfixed",
                    get(unfixed_reconciliation_records),
                )
                .route(
                    "/admin/reconciliation/records/user/:user_id",
                    get(user_reconciliation_records),
                ),
        )
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .with_state(state)
}

pub async fn run_server(app: Router, bind_address: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("Listening on {}", bind_address);
    axum::serve(listener, app).await?;
    Ok(())
}
