use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{error, info, warn};

use super::models::CompensationTask;
use super::store::CompensationStore;
use crate::config::SchedulerSettings;
use crate::error::AppResult;

/// Re-executes the original operation from a task's payload. Handlers must
/// tolerate repeated invocation - the ledger's transaction-UUID idempotency
/// makes the calls safe under at-least-once delivery.
#[async_trait]
pub trait CompensationHandler: Send + Sync {
    async fn execute(&self, task: &CompensationTask) -> AppResult<()>;
}

/// Compensation scheduler - polls the store on a fixed tick, dispatches due
/// tasks to registered handlers, and manages retry backoff and stuck-task
/// recovery.
pub struct CompensationScheduler {
    store: Arc<CompensationStore>,
    handlers: HashMap<String, Arc<dyn CompensationHandler>>,
    settings: SchedulerSettings,
}

impl CompensationScheduler {
    pub fn new(store: Arc<CompensationStore>, settings: SchedulerSettings) -> Self {
        info!(
            "Initializing compensation scheduler, tick interval: {:?}",
            settings.tick_interval
        );
        Self {
            store,
            handlers: HashMap::new(),
            settings,
        }
    }

    pub fn register_handler(
        &mut self,
        task_type: impl Into<String>,
        handler: Arc<dyn CompensationHandler>,
    ) {
        let task_type = task_type.into();
        info!("Registered compensation handler for type {}", task_type);
        self.handlers.insert(task_type, handler);
    }

    /// Start the dispatch loop in the background. Stuck-task recovery runs
    /// once before the first tick. There is no external cancellation; the
    /// loop lives as long as the process and in-flight ticks always finish.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        let scheduler = self;

        tokio::spawn(async move {
            match scheduler
                .store
                .recover_stuck_tasks(scheduler.settings.stuck_threshold)
                .await
            {
                Ok(0) => info!("No stuck compensation tasks found"),
                Ok(count) => info!("Re-queued {} stuck compensation tasks", count),
                Err(err) => error!("Stuck-task recovery failed: {}", err),
            }

            let mut ticker = interval(scheduler.settings.tick_interval);
            loop {
                ticker.tick().await;
                scheduler.process_due_tasks().await;
            }
        })
    }

    /// One dispatch pass: reserve due tasks and run each through its handler.
    /// Errors are recorded on the task, never propagated - a bad task must
    /// not take the loop down.
    pub async fn process_due_tasks(&self) -> usize {
        let tasks = match self.store.reserve_due_tasks(self.settings.reserve_limit).await {
            Ok(tasks) => tasks,
            Err(err) => {
                error!("Failed to reserve due compensation tasks: {}", err);
                return 0;
            }
        };

        if tasks.is_empty() {
            return 0;
        }

        info!("Dispatching {} due compensation tasks", tasks.len());
        for task in &tasks {
            self.dispatch(task).await;
        }
        tasks.len()
    }

    async fn dispatch(&self, task: &CompensationTask) {
        let Some(handler) = self.handlers.get(&task.task_type) else {
            // A missing handler is a deployment defect, not a transient
            // condition: no amount of retrying will register one.
            warn!(
                "Task {} has no handler for type {}, marking failed",
                task.task_id, task.task_type
            );
            if let Err(err) = self
                .store
                .mark_failed(&task.task_id, "no handler registered")
                .await
            {
                error!("Failed to update task {}: {}", task.task_id, err);
            }
            return;
        };

        info!(
            "Executing task {} (type {}, attempt {}/{})",
            task.task_id, task.task_type, task.retry_count, task.max_retries
        );

        let outcome = match handler.execute(task).await {
            Ok(()) => {
                info!("Task {} succeeded", task.task_id);
                self.store.mark_succeeded(&task.task_id).await
            }
            Err(err) if task.retries_exhausted() => {
                warn!(
                    "Task {} exhausted its {} retries, marking failed: {}",
                    task.task_id, task.max_retries, err
                );
                self.store.mark_failed(&task.task_id, &err.to_string()).await
            }
            Err(err) => {
                let delay = backoff_delay(task.retry_count);
                let next_execute = Utc::now() + delay;
                info!(
                    "Task {} failed ({}), retrying at {} (+{}s)",
                    task.task_id,
                    err,
                    next_execute,
                    delay.num_seconds()
                );
                self.store
                    .reschedule(&task.task_id, next_execute, &err.to_string())
                    .await
            }
        };

        if let Err(err) = outcome {
            error!("Failed to update task {}: {}", task.task_id, err);
        }
    }
}

/// Quadratic backoff: the Nth attempt waits N² seconds before the next one.
fn backoff_delay(retry_count: i32) -> chrono::Duration {
    let attempts = i64::from(retry_count.max(0));
    chrono::Duration::seconds(attempts * attempts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_quadratic() {
        assert_eq!(backoff_delay(1).num_seconds(), 1);
        assert_eq!(backoff_delay(2).num_seconds(), 4);
        assert_eq!(backoff_delay(3).num_seconds(), 9);
        assert_eq!(backoff_delay(5).num_seconds(), 25);
    }

    #[test]
    fn test_backoff_never_negative() {
        assert_eq!(backoff_delay(-1).num_seconds(), 0);
        assert_eq!(backoff_delay(0).num_seconds(), 0);
    }
}
