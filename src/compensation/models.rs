use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

/// Task status enum
///
/// `pending -> processing -> succeeded | pending (retry) | failed`.
/// `succeeded` and `failed` are terminal; `failed` rows are kept as an audit
/// trail and need operator intervention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "processing" => Some(TaskStatus::Processing),
            "succeeded" => Some(TaskStatus::Succeeded),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }
}

/// Compensation task entity - a durable, retryable record of an operation
/// that failed synchronously and must be completed asynchronously.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationTask {
    pub task_id: String,
    /// Key into the scheduler's handler registry.
    pub task_type: String,
    /// Serialized parameters of the original operation.
    pub payload: String,
    pub status: TaskStatus,
    pub retry_count: i32,
    pub max_retries: i32,
    pub created_at: DateTime<Utc>,
    pub next_execute: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl CompensationTask {
    /// Create from database row
    pub fn from_row(row: &sqlx::postgres::PgRow) -> AppResult<Self> {
        use sqlx::Row;

        let status_str: String = row.try_get("status")?;
        let status = TaskStatus::parse(&status_str).ok_or_else(|| {
            AppError::Internal(format!("Unknown task status in store: {}", status_str))
        })?;

        Ok(CompensationTask {
            task_id: row.try_get("task_id")?,
            task_type: row.try_get("task_type")?,
            payload: row.try_get("payload")?,
            status,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            created_at: row.try_get("created_at")?,
            next_execute: row.try_get("next_execute")?,
            last_error: row.try_get("last_error")?,
        })
    }

    /// Attempts already spent against the retry budget. `retry_count` is
    /// bumped at reservation time, so during dispatch it equals the number
    /// of processing attempts including the current one.
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

/// Parameters for enqueueing a new task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_type: String,
    pub payload: String,
    pub max_retries: i32,
    pub next_execute: Option<DateTime<Utc>>,
}

impl NewTask {
    pub fn new(task_type: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            payload: payload.into(),
            max_retries: 3,
            next_execute: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Delay the first execution instead of running on the next tick.
    pub fn delayed_by(mut self, delay: Duration) -> Self {
        self.next_execute = Some(Utc::now() + delay);
        self
    }
}
