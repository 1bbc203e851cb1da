use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    pub reconciliation: ReconciliationSettings,
    pub scheduler: SchedulerSettings,
}

/// Settings for the periodic balance audit.
#[derive(Debug, Deserialize, Clone)]
pub struct ReconciliationSettings {
    /// Time between full audit passes.
    pub interval: Duration,
    /// Users per batch during a full pass.
    pub batch_size: usize,
    /// Batches audited concurrently.
    pub max_concurrent_batches: usize,
    /// Apply corrective entries automatically when drift is found.
    pub auto_fix: bool,
}

/// Settings for the compensation task scheduler.
#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerSettings {
    /// Time between dispatch ticks.
    pub tick_interval: Duration,
    /// A `processing` task older than this is assumed crashed and re-queued.
    pub stuck_threshold: Duration,
    /// Maximum tasks reserved per tick.
    pub reserve_limit: i64,
    /// Default retry budget for newly enqueued tasks.
    pub default_max_retries: i32,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgresql://localhost/token_ledger".to_string()),
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            reconciliation: ReconciliationSettings {
                interval: Duration::from_secs(
                    env_u64("RECONCILIATION_INTERVAL_SECS", 24 * 3600),
                ),
                batch_size: env_u64("RECONCILIATION_BATCH_SIZE", 500) as usize,
                max_concurrent_batches: env_u64("RECONCILIATION_MAX_CONCURRENT_BATCHES", 4)
                    as usize,
                auto_fix: std::env::var("RECONCILIATION_AUTO_FIX")
                    .map(|v| v != "false" && v != "0")
                    .unwrap_or(true),
            },
            scheduler: SchedulerSettings {
                tick_interval: Duration::from_secs(env_u64("SCHEDULER_TICK_SECS", 30)),
                stuck_threshold: Duration::from_secs(env_u64("SCHEDULER_STUCK_SECS", 3600)),
                reserve_limit: env_u64("SCHEDULER_RESERVE_LIMIT", 100) as i64,
                default_max_retries: env_u64("SCHEDULER_DEFAULT_MAX_RETRIES", 5) as i32,
            },
        })
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Default for ReconciliationSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(24 * 3600),
            batch_size: 500,
            max_concurrent_batches: 4,
            auto_fix: true,
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            stuck_threshold: Duration::from_secs(3600),
            reserve_limit: 100,
            default_max_retries: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconciliation_defaults() {
        let settings = ReconciliationSettings::default();
        assert_eq!(settings.interval, Duration::from_secs(86400));
        assert_eq!(settings.batch_size, 500);
        assert!(settings.auto_fix);
    }

    #[test]
    fn test_scheduler_defaults() {
        let settings = SchedulerSettings::default();
        assert_eq!(settings.tick_interval, Duration::from_secs(30));
        assert_eq!(settings.stuck_threshold, Duration::from_secs(3600));
        assert_eq!(settings.default_max_retries, 5);
    }
}
