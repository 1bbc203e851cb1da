use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use super::models::{CompensationTask, NewTask, TaskStatus};
use crate::error::{AppResult, TaskError};

/// Durable queue of retryable tasks. Holds no business logic: rows carry an
/// opaque payload keyed by task type, and only the scheduler mutates them.
/// Tasks are never deleted - terminal rows remain as an audit trail.
pub struct CompensationStore {
    pub pool: PgPool,
}

const TASK_COLUMNS: &str = "task_id, task_type, payload, status, retry_count, max_retries, \
     created_at, next_execute, last_error";

impl CompensationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn add_task(&self, task: NewTask) -> AppResult<CompensationTask> {
        let task_id = Uuid::new_v4().to_string();
        let next_execute = task.next_execute.unwrap_or_else(Utc::now);

        let row = sqlx::query(&format!(
            "INSERT INTO compensation_tasks
                 (task_id, task_type, payload, status, retry_count, max_retries, next_execute)
             VALUES ($1, $2, $3, $4, 0, $5, $6)
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(&task_id)
        .bind(&task.task_type)
        .bind(&task.payload)
        .bind(TaskStatus::Pending.as_str())
        .bind(task.max_retries)
        .bind(next_execute)
        .fetch_one(&self.pool)
        .await?;

        let task = CompensationTask::from_row(&row)?;
        info!(
            "Enqueued compensation task {} of type {}",
            task.task_id, task.task_type
        );
        Ok(task)
    }

    /// Atomically reserve due tasks: flip `pending` rows whose time has come
    /// to `processing` and bump `retry_count`, under a row lock, in one
    /// statement. Two schedulers polling the same rows cannot both reserve a
    /// task - the locked rows are skipped, so the loser sees nothing.
    pub async fn reserve_due_tasks(&self, limit: i64) -> AppResult<Vec<CompensationTask>> {
        let rows = sqlx::query(&format!(
            "UPDATE compensation_tasks
             SET status = $1, retry_count = retry_count + 1
             WHERE task_id IN (
                 SELECT task_id FROM compensation_tasks
                 WHERE status = $2 AND next_execute <= NOW()
                 ORDER BY next_execute
                 LIMIT $3
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(TaskStatus::Processing.as_str())
        .bind(TaskStatus::Pending.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(CompensationTask::from_row).collect()
    }

    pub async fn mark_succeeded(&self, task_id: &str) -> AppResult<()> {
        self.update_status(task_id, TaskStatus::Succeeded, None, None)
            .await
    }

    pub async fn mark_failed(&self, task_id: &str, last_error: &str) -> AppResult<()> {
        self.update_status(task_id, TaskStatus::Failed, Some(last_error), None)
            .await
    }

    /// Put a failed attempt back in the queue for a later retry.
    pub async fn reschedule(
        &self,
        task_id: &str,
        next_execute: DateTime<Utc>,
        last_error: &str,
    ) -> AppResult<()> {
        self.update_status(
            task_id,
            TaskStatus::Pending,
            Some(last_error),
            Some(next_execute),
        )
        .await
    }

    /// Re-queue tasks stranded in `processing` by a crash between the
    /// reservation step and completion. Only rows older than the staleness
    /// threshold are touched so in-flight work is left alone.
    pub async fn recover_stuck_tasks(&self, staleness: std::time::Duration) -> AppResult<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(staleness)
                .unwrap_or_else(|_| chrono::Duration::hours(1));

        let result = sqlx::query(
            "UPDATE compensation_tasks
             SET status = $1
             WHERE status = $2 AND next_execute <= $3",
        )
        .bind(TaskStatus::Pending.as_str())
        .bind(TaskStatus::Processing.as_str())
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn get_task(&self, task_id: &str) -> AppResult<CompensationTask> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM compensation_tasks WHERE task_id = $1"
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| TaskError::NotFound(task_id.to_string()))?;

        CompensationTask::from_row(&row)
    }

    async fn update_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        last_error: Option<&str>,
        next_execute: Option<DateTime<Utc>>,
    ) -> AppResult<()> {
        let result = sqlx::query(
            "UPDATE compensation_tasks
             SET status = $2,
                 last_error = COALESCE($3, last_error),
                 next_execute = COALESCE($4, next_execute)
             WHERE task_id = $1",
        )
        .bind(task_id)
        .bind(status.as_str())
        .bind(last_error)
        .bind(next_execute)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(TaskError::NotFound(task_id.to_string()).into());
        }

        Ok(())
    }
}
