use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;

/// Result of one audit pass for one user. Created only when drift is found;
/// updated once, to set `is_fixed`/`fixed_at` after a corrective entry.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ReconciliationRecord {
    pub id: i64,
    pub user_id: i64,
    pub current_balance: i64,
    pub calculated_balance: i64,
    /// `current_balance - calculated_balance`
    pub discrepancy: i64,
    pub is_fixed: bool,
    pub fixed_at: Option<DateTime<Utc>>,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// Outcome of a full reconciliation pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconciliationSummary {
    /// Accounts audited.
    pub scanned: usize,
    /// Accounts whose balance disagreed with their transaction log.
    pub mismatched: usize,
    /// Mismatches corrected (or found already resolved at fix time).
    pub fixed: usize,
    pub duration_ms: u64,
}

/// Outcome of a single-user audit.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum UserReconciliation {
    /// Balance matches the transaction log.
    Consistent { user_id: i64, balance: i64 },
    /// Drift was found and recorded.
    Discrepancy {
        record: ReconciliationRecord,
        fixed: bool,
    },
}
