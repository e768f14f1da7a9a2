use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub executor: ExecutorConfig,
    pub recurrence: RecurrenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between scheduler ticks
    pub tick_interval_secs: u64,
    /// How far back a schedule may catch up on missed occurrences
    pub catchup_window_hours: i64,
    /// How long completed jobs and schedule runs are retained before pruning
    pub history_retention_days: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Milliseconds between queue polls
    pub poll_interval_ms: u64,
    /// Lease duration and execution deadline for a single job attempt
    pub lease_secs: u64,
    /// How long shutdown waits for in-flight jobs before giving up
    pub shutdown_grace_secs: u64,
    /// Base delay for the exponential retry backoff
    pub retry_base_secs: u64,
    /// Ceiling for the retry backoff
    pub retry_max_backoff_secs: u64,
    /// Maximum concurrent jobs per queue
    pub queues: HashMap<String, usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurrenceConfig {
    /// How far ahead series are expanded
    pub horizon_days: i64,
    /// How often an expanded series re-enqueues itself to roll the horizon
    pub reexpand_interval_hours: i64,
}

impl Default for Config {
    fn default() -> Self {
        let mut queues = HashMap::new();
        queues.insert("notifications".to_string(), 4);
        queues.insert("recurrence".to_string(), 2);
        queues.insert("schedules".to_string(), 2);

        Self {
            database: DatabaseConfig {
                url: "sqlite://./opsqueue.db".to_string(),
                max_connections: Some(10),
            },
            scheduler: SchedulerConfig {
                tick_interval_secs: 60,
                catchup_window_hours: 24,
                history_retention_days: 14,
            },
            executor: ExecutorConfig {
                poll_interval_ms: 2000,
                lease_secs: 300,
                shutdown_grace_secs: 30,
                retry_base_secs: 30,
                retry_max_backoff_secs: 3600,
                queues,
            },
            recurrence: RecurrenceConfig {
                horizon_days: 90,
                reexpand_interval_hours: 24,
            },
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_file =
            std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.toml".to_string());

        let config = if std::path::Path::new(&config_file).exists() {
            let contents = std::fs::read_to_string(&config_file)?;
            toml::from_str(&contents)?
        } else {
            let default_config = Self::default();
            let contents = toml::to_string_pretty(&default_config)?;
            std::fs::write(&config_file, contents)?;
            default_config
        };

        config.validate();
        Ok(config)
    }

    /// Sanity checks that are worth a warning but never fatal
    fn validate(&self) {
        if self.scheduler.history_retention_days * 24 < self.scheduler.catchup_window_hours {
            warn!(
                "history retention ({} days) is shorter than the catch-up window ({} hours); \
                 pruned jobs could be re-enqueued for old occurrences",
                self.scheduler.history_retention_days, self.scheduler.catchup_window_hours
            );
        }
        if self.executor.queues.is_empty() {
            warn!("no queues configured; the execution framework will be idle");
        }
    }
}
