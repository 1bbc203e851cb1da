use std::sync::Arc;
use std::time::Duration;

use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::info;

use crate::{
    api::handlers::AppState,
    compensation::{
        handlers::{
            CreditHandler, DebitHandler, InitAccountHandler, TOKEN_CREDIT, TOKEN_DEBIT,
            USER_TOKEN_INIT,
        },
        CompensationScheduler, CompensationStore,
    },
    config::Config,
    error::AppResult,
    ledger::{repository::LedgerRepository, service::TokenLedger},
    reconciliation::{repository::ReconciliationRepository, service::ReconciliationService},
};

pub async fn initialize_app_state(config: &Config) -> AppResult<AppState> {
    info!("Initializing application components ...");

    let pool = initialize_database(&config.database_url).await?;

    // Core components, wired once and passed by reference everywhere.
    let ledger_repo = Arc::new(LedgerRepository::new(pool.clone()));
    let task_store = Arc::new(CompensationStore::new(pool.clone()));
    let ledger = Arc::new(TokenLedger::new(ledger_repo.clone(), task_store.clone()));

    let reconciliation_records = Arc::new(ReconciliationRepository::new(pool.clone()));
    let reconciliation = Arc::new(ReconciliationService::new(
        config.reconciliation.clone(),
        ledger_repo.clone(),
        reconciliation_records.clone(),
    ));

    // The scheduler replays failed ledger calls; registration must cover
    // every task type the ledger enqueues or those tasks fail permanently.
    let mut scheduler = CompensationScheduler::new(task_store.clone(), config.scheduler.clone());
    scheduler.register_handler(
        USER_TOKEN_INIT,
        Arc::new(InitAccountHandler::new(ledger.clone())),
    );
    scheduler.register_handler(TOKEN_CREDIT, Arc::new(CreditHandler::new(ledger.clone())));
    scheduler.register_handler(TOKEN_DEBIT, Arc::new(DebitHandler::new(ledger.clone())));

    Arc::new(scheduler).start();
    info!("Compensation scheduler started");

    reconciliation.clone().start();

    Ok(AppState {
        ledger,
        reconciliation,
        reconciliation_records,
    })
}

async fn initialize_database(database_url: &str) -> AppResult<PgPool> {
    info!("Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(50)
        .min_connections(5)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;

    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("Database initialized");
    Ok(pool)
}
