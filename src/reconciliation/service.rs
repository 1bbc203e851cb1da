use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{error, info, warn};

use super::models::{ReconciliationSummary, UserReconciliation};
use super::repository::ReconciliationRepository;
use crate::config::ReconciliationSettings;
use crate::error::AppResult;
use crate::ledger::repository::LedgerRepository;

struct RunState {
    stop: watch::Sender<bool>,
    #[allow(dead_code)]
    handle: JoinHandle<()>,
}

/// Reconciliation engine - the periodic audit that verifies every account
/// balance against the transaction log and self-heals drift. Drift can only
/// arise from a bug, a manual edit or a partial failure outside the ledger's
/// atomic boundary, so every finding is persisted before any fix.
pub struct ReconciliationService {
    settings: ReconciliationSettings,
    ledger: Arc<LedgerRepository>,
    records: Arc<ReconciliationRepository>,
    run_state: Mutex<Option<RunState>>,
}

impl ReconciliationService {
    pub fn new(
        settings: ReconciliationSettings,
        ledger: Arc<LedgerRepository>,
        records: Arc<ReconciliationRepository>,
    ) -> Self {
        Self {
            settings,
            ledger,
            records,
            run_state: Mutex::new(None),
        }
    }

    /// Start the periodic audit loop with an immediate first pass. A no-op
    /// if already running.
    pub fn start(self: Arc<Self>) {
        let mut state = self.run_state.lock();
        if state.is_some() {
            info!("Reconciliation service already running");
            return;
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let service = self.clone();
        let handle = tokio::spawn(async move {
            // The first tick fires immediately.
            let mut ticker = interval(service.settings.interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = service.run_full().await {
                            error!("Reconciliation pass failed: {}", err);
                        }
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Reconciliation loop stopped");
        });

        *state = Some(RunState {
            stop: stop_tx,
            handle,
        });
        info!(
            "Reconciliation service started, interval: {:?}, batch size: {}, auto-fix: {}",
            self.settings.interval, self.settings.batch_size, self.settings.auto_fix
        );
    }

    /// Stop the audit loop, letting an in-flight pass finish. A no-op if not
    /// running.
    pub fn stop(&self) {
        let mut state = self.run_state.lock();
        match state.take() {
            Some(run) => {
                let _ = run.stop.send(true);
                info!("Reconciliation service stopping");
            }
            None => info!("Reconciliation service already stopped"),
        }
    }

    pub fn is_running(&self) -> bool {
        self.run_state.lock().is_some()
    }

    /// Audit every account: compare the stored balance against the sum of
    /// completed transactions, batch by batch with bounded parallelism.
    /// Per-user failures are logged and skipped - one bad account must not
    /// abort the sweep.
    pub async fn run_full(&self) -> AppResult<ReconciliationSummary> {
        let started = Instant::now();
        let user_ids = self.ledger.all_account_user_ids().await?;
        info!("Starting reconciliation pass over {} accounts", user_ids.len());

        let scanned = user_ids.len();
        let mismatched = AtomicUsize::new(0);
        let fixed = AtomicUsize::new(0);

        let batches: Vec<Vec<i64>> = user_ids
            .chunks(self.settings.batch_size.max(1))
            .map(|chunk| chunk.to_vec())
            .collect();

        futures::stream::iter(batches)
            .for_each_concurrent(self.settings.max_concurrent_batches.max(1), |batch| {
                let mismatched = &mismatched;
                let fixed = &fixed;
                async move {
                    for user_id in batch {
                        match self.reconcile_user(user_id).await {
                            Ok(UserReconciliation::Consistent { .. }) => {}
                            Ok(UserReconciliation::Discrepancy { fixed: was_fixed, .. }) => {
                                mismatched.fetch_add(1, Ordering::Relaxed);
                                if was_fixed {
                                    fixed.fetch_add(1, Ordering::Relaxed);
                                }
                            }
                            Err(err) => {
                                error!("Reconciliation failed for user {}: {}", user_id, err)
                            }
                        }
                    }
                }
            })
            .await;

        let summary = ReconciliationSummary {
            scanned,
            mismatched: mismatched.into_inner(),
            fixed: fixed.into_inner(),
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            "Reconciliation pass completed in {}ms: {} scanned, {} mismatched, {} fixed",
            summary.duration_ms, summary.scanned, summary.mismatched, summary.fixed
        );
        Ok(summary)
    }

    /// On-demand audit of a single user.
    pub async fn run_user(&self, user_id: i64) -> AppResult<UserReconciliation> {
        info!("Running reconciliation for user {}", user_id);
        self.reconcile_user(user_id).await
    }

    async fn reconcile_user(&self, user_id: i64) -> AppResult<UserReconciliation> {
        let account = self.ledger.get_account(user_id).await?;
        let calculated = self.ledger.calculated_balance(user_id).await?;

        if account.balance == calculated {
            return Ok(UserReconciliation::Consistent {
                user_id,
                balance: account.balance,
            });
        }

        warn!(
            "Balance mismatch for user {}: current={}, calculated={}, discrepancy={}",
            user_id,
            account.balance,
            calculated,
            account.balance - calculated
        );

        let description = format!(
            "Periodic audit found drift: current balance={}, calculated from transactions={}",
            account.balance, calculated
        );
        let record = self
            .records
            .save(user_id, account.balance, calculated, &description)
            .await?;

        let mut fixed = false;
        if self.settings.auto_fix {
            // fix_discrepancy re-derives the drift under the account row
            // lock, so a mutation that landed since the read above results
            // in a no-op rather than a spurious adjustment.
            match self.ledger.fix_discrepancy(user_id).await {
                Ok(adjustment) => {
                    if adjustment.is_none() {
                        info!(
                            "Drift for user {} resolved concurrently, no adjustment written",
                            user_id
                        );
                    }
                    match self.records.mark_fixed(record.id).await {
                        Ok(()) => fixed = true,
                        Err(err) => {
                            error!(
                                "Failed to mark reconciliation record {} fixed: {}",
                                record.id, err
                            )
                        }
                    }
                }
                Err(err) => {
                    // Record stays unfixed for manual follow-up.
                    error!("Auto-fix failed for user {}: {}", user_id, err);
                }
            }
        }

        Ok(UserReconciliation::Discrepancy { record, fixed })
    }
}
