use crate::duration::ConfigDuration;
use preagg_asyncutils::{PollOptions, RetryPolicy};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Root of the pipeline configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub queue: QueueConfig,
    /// Per data source overrides of [`queue`](Self::queue), keyed by data
    /// source name.
    pub data_sources: BTreeMap<String, QueueOverrides>,
    pub mover: MoverConfig,
    pub poll: PollConfig,
    pub refresh: RefreshConfig,
    pub registry: RegistryConfig,
}

impl Config {
    /// Queue settings for one data source, with its overrides applied.
    pub fn queue_for(&self, data_source: &str) -> QueueConfig {
        let Some(overrides) = self.data_sources.get(data_source) else {
            return self.queue.clone();
        };
        QueueConfig {
            concurrency: overrides.concurrency.unwrap_or(self.queue.concurrency),
            continue_wait_timeout: overrides.continue_wait_timeout.unwrap_or(self.queue.continue_wait_timeout),
            execution_timeout: overrides.execution_timeout.unwrap_or(self.queue.execution_timeout),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Builds running at once per data source; the rest wait in FIFO order.
    pub concurrency: usize,
    /// How long a caller waits for a build before getting "still building".
    pub continue_wait_timeout: ConfigDuration,
    /// How long a build may run before it is canceled.
    pub execution_timeout: ConfigDuration,
}
impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            continue_wait_timeout: ConfigDuration::from_secs(5),
            execution_timeout: ConfigDuration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueOverrides {
    pub concurrency: Option<usize>,
    pub continue_wait_timeout: Option<ConfigDuration>,
    pub execution_timeout: Option<ConfigDuration>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MoverConfig {
    /// Size limit of each unloaded CSV file.
    pub max_file_size_mb: u64,
    /// Rows buffered ahead of a streaming upload.
    pub high_water_mark: usize,
    pub retry: RetryConfig,
}
impl Default for MoverConfig {
    fn default() -> Self {
        Self {
            max_file_size_mb: 64,
            high_water_mark: 10_000,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff: ConfigDuration,
    pub max_backoff: ConfigDuration,
}
impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: ConfigDuration::from_millis(100),
            max_backoff: ConfigDuration::from_secs(5),
        }
    }
}
impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_backoff: config.initial_backoff.get(),
            max_backoff: config.max_backoff.get(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PollConfig {
    pub interval: ConfigDuration,
    pub max_interval: ConfigDuration,
    pub timeout: ConfigDuration,
}
impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: ConfigDuration::from_secs(1),
            max_interval: ConfigDuration::from_secs(10),
            timeout: ConfigDuration::from_secs(600),
        }
    }
}
impl From<&PollConfig> for PollOptions {
    fn from(config: &PollConfig) -> Self {
        Self {
            interval: config.interval.get(),
            max_interval: config.max_interval.get(),
            timeout: config.timeout.get(),
        }
    }
}

/// What to do when an invalidation key query fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationFailure {
    /// Report the failure to the caller.
    #[default]
    Fail,
    /// Treat the table as stale and rebuild it.
    AssumeStale,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RefreshConfig {
    /// How long superseded generations of the same structure are kept.
    pub structure_version_persist_time: ConfigDuration,
    /// Lease length of a table that was served to readers.
    pub used_table_ttl: ConfigDuration,
    /// Lease length of a table that was requested or built.
    pub touch_table_ttl: ConfigDuration,
    /// Keep only used and touched tables when collecting orphans.
    pub drop_without_touch: bool,
    pub invalidation_failure: InvalidationFailure,
}
impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            structure_version_persist_time: ConfigDuration::from_secs(24 * 3600),
            used_table_ttl: ConfigDuration::from_secs(600),
            touch_table_ttl: ConfigDuration::from_secs(24 * 3600),
            drop_without_touch: false,
            invalidation_failure: InvalidationFailure::Fail,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistryConfig {
    /// Registry database file. Defaults to the platform data directory.
    pub path: Option<PathBuf>,
}
