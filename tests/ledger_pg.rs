//! Postgres-backed tests for the ledger, reconciliation and compensation
//! properties. They need a real database because the guarantees under test
//! (row locking, reservation uniqueness, atomic commit) live in the store.
//!
//! Run with:
//!   DATABASE_URL=postgresql://localhost/token_ledger_test cargo test -- --ignored

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serial_test::serial;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use token_ledger::compensation::scheduler::CompensationHandler;
use token_ledger::compensation::{
    CompensationScheduler, CompensationStore, CompensationTask, NewTask, TaskStatus,
};
use token_ledger::config::{ReconciliationSettings, SchedulerSettings};
use token_ledger::error::{AppError, AppResult, LedgerError};
use token_ledger::ledger::models::{RelatedEntity, TransactionType};
use token_ledger::ledger::repository::LedgerRepository;
use token_ledger::reconciliation::models::UserReconciliation;
use token_ledger::reconciliation::{ReconciliationRepository, ReconciliationService};

async fn test_pool() -> PgPool {
    let url = std::env::var("DATABASE_URL")
        .expect("DATABASE_URL must be set for database-backed tests");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .expect("failed to connect to test database");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("failed to run migrations");
    pool
}

/// Ids unique per test run so tests can share a database.
fn unique_user() -> i64 {
    static COUNTER: AtomicI64 = AtomicI64::new(0);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .subsec_nanos() as i64;
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;
    secs * 1_000_000 + (nanos % 1_000) * 1_000 + COUNTER.fetch_add(1, Ordering::Relaxed) % 1_000
}

fn no_entity() -> RelatedEntity {
    RelatedEntity::default()
}

fn reconciliation_service(
    pool: &PgPool,
    auto_fix: bool,
) -> (Arc<ReconciliationService>, Arc<LedgerRepository>) {
    let ledger = Arc::new(LedgerRepository::new(pool.clone()));
    let records = Arc::new(ReconciliationRepository::new(pool.clone()));
    let settings = ReconciliationSettings {
        auto_fix,
        ..ReconciliationSettings::default()
    };
    (
        Arc::new(ReconciliationService::new(settings, ledger.clone(), records)),
        ledger,
    )
}

// ========== LEDGER PROPERTIES ==========

#[tokio::test]
#[ignore = "requires a Postgres database; set DATABASE_URL and run with --ignored"]
async fn init_is_idempotent_and_conserves_balance() {
    let pool = test_pool().await;
    let ledger = LedgerRepository::new(pool.clone());
    let user = unique_user();

    let first = ledger.init_account(user, 500).await.unwrap();
    assert_eq!(first.balance, 500);

    // Replayed init returns the existing account untouched and writes no
    // second opening transaction.
    let second = ledger.init_account(user, 9999).await.unwrap();
    assert_eq!(second.balance, 500);

    let sum = ledger.calculated_balance(user).await.unwrap();
    assert_eq!(sum, 500);

    let (transactions, total) = ledger.list_transactions(user, 1, 10).await.unwrap();
    assert_eq!(total, 1);
    assert_eq!(transactions[0].transaction_type, TransactionType::Initial);
}

#[tokio::test]
#[ignore = "requires a Postgres database; set DATABASE_URL and run with --ignored"]
async fn duplicate_transaction_uuid_is_a_noop_replay() {
    let pool = test_pool().await;
    let ledger = LedgerRepository::new(pool.clone());
    let user = unique_user();
    ledger.init_account(user, 0).await.unwrap();

    let uuid = Uuid::new_v4().to_string();
    let first = ledger
        .credit(
            user,
            500,
            Some(uuid.clone()),
            TransactionType::PackageCredit,
            "basic package",
            &no_entity(),
        )
        .await
        .unwrap();
    assert_eq!(first.balance, 500);

    // Verbatim retry: same UUID, same arguments.
    let replay = ledger
        .credit(
            user,
            500,
            Some(uuid.clone()),
            TransactionType::PackageCredit,
            "basic package",
            &no_entity(),
        )
        .await
        .unwrap();
    assert_eq!(replay.balance, 500);

    let (_, total) = ledger.list_transactions(user, 1, 10).await.unwrap();
    assert_eq!(total, 1);
    assert_eq!(ledger.get_balance(user).await.unwrap(), 500);
}

#[tokio::test]
#[ignore = "requires a Postgres database; set DATABASE_URL and run with --ignored"]
async fn debit_never_overdraws() {
    let pool = test_pool().await;
    let ledger = LedgerRepository::new(pool.clone());
    let user = unique_user();
    ledger.init_account(user, 100).await.unwrap();

    let err = ledger
        .debit(
            user,
            150,
            None,
            TransactionType::AiGenerationDebit,
            "too much",
            &no_entity(),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::Ledger(LedgerError::InsufficientBalance { balance: 100, requested: 150, .. })
    ));

    // The rejected debit left no trace.
    assert_eq!(ledger.get_balance(user).await.unwrap(), 100);
    assert_eq!(ledger.calculated_balance(user).await.unwrap(), 100);
}

#[tokio::test]
#[ignore = "requires a Postgres database; set DATABASE_URL and run with --ignored"]
async fn concurrent_debits_stop_exactly_at_the_balance() {
    let pool = test_pool().await;
    let ledger = Arc::new(LedgerRepository::new(pool.clone()));
    let user = unique_user();
    ledger.init_account(user, 100).await.unwrap();

    // Ten concurrent debits of 30 against a balance of 100: exactly three
    // can succeed regardless of interleaving.
    let mut handles = Vec::new();
    for _ in 0..10 {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            ledger
                .debit(
                    user,
                    30,
                    None,
                    TransactionType::AiGenerationDebit,
                    "generation",
                    &RelatedEntity::default(),
                )
                .await
        }));
    }

    let mut successes = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            successes += 1;
        }
    }

    assert_eq!(successes, 3);
    assert_eq!(ledger.get_balance(user).await.unwrap(), 10);
    assert_eq!(ledger.calculated_balance(user).await.unwrap(), 10);
}

#[tokio::test]
#[ignore = "requires a Postgres database; set DATABASE_URL and run with --ignored"]
async fn concurrent_credits_never_lose_an_update() {
    let pool = test_pool().await;
    let ledger = Arc::new(LedgerRepository::new(pool.clone()));
    let user = unique_user();
    ledger.init_account(user, 0).await.unwrap();

    let a = {
        let ledger = ledger.clone();
        tokio::spawn(async move {
            ledger
                .credit(user, 10, None, TransactionType::ReferralCredit, "", &RelatedEntity::default())
                .await
        })
    };
    let b = {
        let ledger = ledger.clone();
        tokio::spawn(async move {
            ledger
                .credit(user, 20, None, TransactionType::PackageCredit, "", &RelatedEntity::default())
                .await
        })
    };
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    assert_eq!(ledger.get_balance(user).await.unwrap(), 30);

    // The before/after chain must be consistent: no lost update.
    let (mut transactions, total) = ledger.list_transactions(user, 1, 10).await.unwrap();
    assert_eq!(total, 2);
    transactions.sort_by_key(|t| t.id);
    assert_eq!(transactions[0].balance_before, 0);
    assert_eq!(transactions[0].balance_after, transactions[1].balance_before);
    assert_eq!(transactions[1].balance_after, 30);
}

#[tokio::test]
#[ignore = "requires a Postgres database; set DATABASE_URL and run with --ignored"]
async fn example_scenario_end_to_end() {
    let pool = test_pool().await;
    let (service, ledger) = reconciliation_service(&pool, true);
    let user = unique_user();

    ledger.init_account(user, 0).await.unwrap();

    let uuid_a = Uuid::new_v4().to_string();
    let account = ledger
        .credit(
            user,
            500,
            Some(uuid_a.clone()),
            TransactionType::PackageCredit,
            "package purchase",
            &RelatedEntity::new("order", "1001"),
        )
        .await
        .unwrap();
    assert_eq!(account.balance, 500);

    let account = ledger
        .debit(
            user,
            150,
            Some(Uuid::new_v4().to_string()),
            TransactionType::AiGenerationDebit,
            "generation",
            &RelatedEntity::new("project", "7"),
        )
        .await
        .unwrap();
    assert_eq!(account.balance, 350);

    // Replaying the credit must not double-credit.
    let account = ledger
        .credit(
            user,
            500,
            Some(uuid_a),
            TransactionType::PackageCredit,
            "package purchase",
            &RelatedEntity::new("order", "1001"),
        )
        .await
        .unwrap();
    assert_eq!(account.balance, 350);

    match service.run_user(user).await.unwrap() {
        UserReconciliation::Consistent { balance, .. } => assert_eq!(balance, 350),
        other => panic!("expected consistent account, got {:?}", other),
    }
}

// ========== RECONCILIATION PROPERTIES ==========

#[tokio::test]
#[ignore = "requires a Postgres database; set DATABASE_URL and run with --ignored"]
async fn injected_drift_is_detected_and_fixed() {
    let pool = test_pool().await;
    let (service, ledger) = reconciliation_service(&pool, true);
    let user = unique_user();

    ledger.init_account(user, 0).await.unwrap();
    ledger
        .credit(user, 200, None, TransactionType::PackageCredit, "", &no_entity())
        .await
        .unwrap();

    // Inject a fault outside the ledger's atomic boundary.
    sqlx::query("UPDATE token_accounts SET balance = balance + 999 WHERE user_id = $1")
        .bind(user)
        .execute(&pool)
        .await
        .unwrap();

    let outcome = service.run_user(user).await.unwrap();
    match outcome {
        UserReconciliation::Discrepancy { record, fixed } => {
            assert_eq!(record.current_balance, 1199);
            assert_eq!(record.calculated_balance, 200);
            assert_eq!(record.discrepancy, 999);
            assert!(fixed);
        }
        other => panic!("expected discrepancy, got {:?}", other),
    }

    // The corrective entry restored the conservation invariant.
    let balance = ledger.get_balance(user).await.unwrap();
    let sum = ledger.calculated_balance(user).await.unwrap();
    assert_eq!(balance, sum);

    // The adjustment itself is on the books.
    let (transactions, _) = ledger.list_transactions(user, 1, 10).await.unwrap();
    assert!(transactions
        .iter()
        .any(|t| t.transaction_type == TransactionType::ReconciliationAdjustment));

    // A second audit finds nothing.
    assert!(matches!(
        service.run_user(user).await.unwrap(),
        UserReconciliation::Consistent { .. }
    ));
}

#[tokio::test]
#[ignore = "requires a Postgres database; set DATABASE_URL and run with --ignored"]
async fn drift_below_zero_is_fixed_despite_balance_check() {
    let pool = test_pool().await;
    let (service, ledger) = reconciliation_service(&pool, true);
    let user = unique_user();

    ledger.init_account(user, 0).await.unwrap();
    ledger
        .credit(user, 50, None, TransactionType::ReferralCredit, "", &no_entity())
        .await
        .unwrap();

    // Inject a completed debit row behind the ledger's back, driving the
    // log's sum to -450 while the balance still reads 50. The corrective
    // entry must debit 500 - far past what a regular debit would allow.
    sqlx::query(
        "INSERT INTO token_transactions
             (transaction_uuid, user_id, amount, balance_before, balance_after, type, description)
         VALUES ($1, $2, -500, 50, -450, 'ai_generation_debit', 'injected fault')",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(user)
    .execute(&pool)
    .await
    .unwrap();

    match service.run_user(user).await.unwrap() {
        UserReconciliation::Discrepancy { record, fixed } => {
            assert_eq!(record.calculated_balance, -450);
            assert!(fixed);
        }
        other => panic!("expected discrepancy, got {:?}", other),
    }
    assert_eq!(ledger.get_balance(user).await.unwrap(), -450);
}

// ========== COMPENSATION QUEUE PROPERTIES ==========

struct AlwaysFails {
    attempts: AtomicUsize,
}

#[async_trait::async_trait]
impl CompensationHandler for AlwaysFails {
    async fn execute(&self, _task: &CompensationTask) -> AppResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(AppError::Internal("handler always fails".to_string()))
    }
}

async fn make_due_now(pool: &PgPool, task_id: &str) {
    sqlx::query("UPDATE compensation_tasks SET next_execute = NOW() WHERE task_id = $1")
        .bind(task_id)
        .execute(pool)
        .await
        .unwrap();
}

#[tokio::test]
#[serial]
#[ignore = "requires a Postgres database; set DATABASE_URL and run with --ignored"]
async fn two_reservers_cannot_both_take_a_task() {
    let pool = test_pool().await;
    let store = Arc::new(CompensationStore::new(pool.clone()));

    let task = store
        .add_task(NewTask::new("reservation_probe", "{}"))
        .await
        .unwrap();

    // Two scheduler instances polling the same due task concurrently.
    let a = {
        let store = store.clone();
        tokio::spawn(async move { store.reserve_due_tasks(100).await.unwrap() })
    };
    let b = {
        let store = store.clone();
        tokio::spawn(async move { store.reserve_due_tasks(100).await.unwrap() })
    };
    let reserved_a = a.await.unwrap();
    let reserved_b = b.await.unwrap();

    let in_a = reserved_a.iter().any(|t| t.task_id == task.task_id);
    let in_b = reserved_b.iter().any(|t| t.task_id == task.task_id);
    assert!(in_a ^ in_b, "exactly one reserver must win the task");

    let reloaded = store.get_task(&task.task_id).await.unwrap();
    assert_eq!(reloaded.status, TaskStatus::Processing);
    assert_eq!(reloaded.retry_count, 1);
}

#[tokio::test]
#[serial]
#[ignore = "requires a Postgres database; set DATABASE_URL and run with --ignored"]
async fn failing_task_exhausts_after_exactly_max_retries() {
    let pool = test_pool().await;
    let store = Arc::new(CompensationStore::new(pool.clone()));
    let handler = Arc::new(AlwaysFails {
        attempts: AtomicUsize::new(0),
    });

    let mut scheduler = CompensationScheduler::new(store.clone(), SchedulerSettings::default());
    scheduler.register_handler("doomed", handler.clone());

    let task = store
        .add_task(NewTask::new("doomed", "{}").with_max_retries(3))
        .await
        .unwrap();

    // Drive ticks manually, collapsing the backoff so the test stays fast.
    for _ in 0..10 {
        scheduler.process_due_tasks().await;
        let current = store.get_task(&task.task_id).await.unwrap();
        if current.status.is_terminal() {
            break;
        }
        make_due_now(&pool, &task.task_id).await;
    }

    let finished = store.get_task(&task.task_id).await.unwrap();
    assert_eq!(finished.status, TaskStatus::Failed);
    assert_eq!(finished.retry_count, 3);
    assert_eq!(handler.attempts.load(Ordering::SeqCst), 3);
    assert!(finished.last_error.is_some());

    // Exhausted tasks are never picked up again.
    make_due_now(&pool, &task.task_id).await;
    scheduler.process_due_tasks().await;
    assert_eq!(handler.attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
#[serial]
#[ignore = "requires a Postgres database; set DATABASE_URL and run with --ignored"]
async fn task_without_handler_fails_permanently() {
    let pool = test_pool().await;
    let store = Arc::new(CompensationStore::new(pool.clone()));
    let scheduler = CompensationScheduler::new(store.clone(), SchedulerSettings::default());

    let task = store
        .add_task(NewTask::new("unregistered_type", "{}"))
        .await
        .unwrap();

    scheduler.process_due_tasks().await;

    let finished = store.get_task(&task.task_id).await.unwrap();
    assert_eq!(finished.status, TaskStatus::Failed);
    assert_eq!(finished.last_error.as_deref(), Some("no handler registered"));
}

#[tokio::test]
#[serial]
#[ignore = "requires a Postgres database; set DATABASE_URL and run with --ignored"]
async fn stale_processing_tasks_are_requeued_on_startup() {
    let pool = test_pool().await;
    let store = CompensationStore::new(pool.clone());

    let task = store
        .add_task(NewTask::new("crashed_mid_flight", "{}"))
        .await
        .unwrap();

    // Simulate a crash between reservation and completion, long ago.
    sqlx::query(
        "UPDATE compensation_tasks
         SET status = 'processing', next_execute = NOW() - INTERVAL '2 hours'
         WHERE task_id = $1",
    )
    .bind(&task.task_id)
    .execute(&pool)
    .await
    .unwrap();

    let recovered = store
        .recover_stuck_tasks(Duration::from_secs(3600))
        .await
        .unwrap();
    assert!(recovered >= 1);

    let requeued = store.get_task(&task.task_id).await.unwrap();
    assert_eq!(requeued.status, TaskStatus::Pending);
}
