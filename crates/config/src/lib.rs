//! Layered configuration for the pre-aggregation pipeline.
//!
//! Sources, lowest priority first:
//! 1. Built-in defaults.
//! 2. A config file (`.toml`, `.yaml`/`.yml` or `.json`). Without an explicit
//!    path, `config.toml` in the platform config directory is used if it
//!    exists.
//! 3. `PREAGG_*` environment variables, with `__` separating nested keys:
//!    `PREAGG_QUEUE__CONCURRENCY=4`, `PREAGG_DATA_SOURCES__WAREHOUSE__EXECUTION_TIMEOUT=30m`.

mod duration;
pub mod error;
mod model;

pub use crate::duration::ConfigDuration;
pub use crate::model::{
    Config, InvalidationFailure, MoverConfig, PollConfig, QueueConfig, QueueOverrides, RefreshConfig, RegistryConfig,
    RetryConfig,
};
use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Toml, Yaml};
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "PREAGG_";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "preagg")
}

impl Config {
    /// Default config file location, whether or not it exists.
    pub fn default_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Registry database file: the configured path, or `registry.db` in the
    /// platform data directory.
    pub fn registry_path(&self) -> Option<PathBuf> {
        self.registry
            .path
            .clone()
            .or_else(|| project_dirs().map(|dirs| dirs.data_dir().join("registry.db")))
    }

    /// Assemble the providers without extracting anything.
    ///
    /// An explicit `path` must exist; the default location is optional.
    pub fn figment(path: Option<&Path>) -> Result<Figment> {
        let mut figment = Figment::new();
        let file = match path {
            Some(path) if !path.is_file() => exn::bail!(ErrorKind::NotFound(path.to_path_buf())),
            Some(path) => Some(path.to_path_buf()),
            None => Self::default_path().filter(|path| path.is_file()),
        };
        if let Some(file) = file {
            tracing::debug!(path = %file.display(), "Loading configuration file");
            figment = match file.extension().and_then(|ext| ext.to_str()) {
                Some("toml") => figment.merge(Toml::file(&file)),
                Some("yaml" | "yml") => figment.merge(Yaml::file(&file)),
                Some("json") => figment.merge(Json::file(&file)),
                _ => exn::bail!(ErrorKind::UnsupportedFormat(file)),
            };
        }
        Ok(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Load and validate the configuration.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::from_figment(&Self::figment(path)?)
    }

    pub fn from_figment(figment: &Figment) -> Result<Self> {
        let config: Self = figment.extract().or_raise(|| ErrorKind::Load)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline can't run with.
    pub fn validate(&self) -> Result<()> {
        let queues = std::iter::once(("queue".to_string(), self.queue.clone())).chain(
            self.data_sources
                .keys()
                .map(|name| (format!("data_sources.{name}"), self.queue_for(name))),
        );
        for (key, queue) in queues {
            if queue.concurrency == 0 {
                exn::bail!(ErrorKind::Invalid(format!("{key}.concurrency must be at least 1")));
            }
            if queue.continue_wait_timeout.is_zero() {
                exn::bail!(ErrorKind::Invalid(format!("{key}.continue_wait_timeout must not be zero")));
            }
            if queue.execution_timeout.is_zero() {
                exn::bail!(ErrorKind::Invalid(format!("{key}.execution_timeout must not be zero")));
            }
        }
        if self.poll.timeout.is_zero() || self.poll.interval.is_zero() {
            exn::bail!(ErrorKind::Invalid("poll.interval and poll.timeout must not be zero".into()));
        }
        if self.poll.max_interval < self.poll.interval {
            exn::bail!(ErrorKind::Invalid("poll.max_interval must not be below poll.interval".into()));
        }
        if self.mover.retry.max_attempts == 0 {
            exn::bail!(ErrorKind::Invalid("mover.retry.max_attempts must be at least 1".into()));
        }
        if self.mover.max_file_size_mb == 0 || self.mover.high_water_mark == 0 {
            exn::bail!(ErrorKind::Invalid("mover.max_file_size_mb and mover.high_water_mark must not be zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use preagg_asyncutils::{PollOptions, RetryPolicy};
    use rstest::rstest;
    use std::time::Duration;

    #[test]
    fn test_defaults() {
        let config = Config::from_figment(&Figment::new()).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.queue.concurrency, 2);
        assert_eq!(config.queue.continue_wait_timeout.get(), Duration::from_secs(5));
        assert_eq!(config.refresh.invalidation_failure, InvalidationFailure::Fail);
        assert_eq!(RetryPolicy::from(&config.mover.retry), RetryPolicy::default());
        assert_eq!(PollOptions::from(&config.poll), PollOptions::default());
    }

    #[test]
    fn test_file_then_env() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "preagg.toml",
                r#"
                    [queue]
                    concurrency = 4
                    continue_wait_timeout = "250ms"

                    [data_sources.warehouse]
                    execution_timeout = "30m"

                    [refresh]
                    invalidation_failure = "assume_stale"
                "#,
            )?;
            jail.set_env("PREAGG_QUEUE__CONCURRENCY", "8");
            jail.set_env("PREAGG_POLL__TIMEOUT", "20m");

            let config = Config::load(Some(Path::new("preagg.toml"))).unwrap();
            assert_eq!(config.queue.concurrency, 8);
            assert_eq!(config.queue.continue_wait_timeout.get(), Duration::from_millis(250));
            assert_eq!(config.poll.timeout.get(), Duration::from_secs(1200));
            assert_eq!(config.refresh.invalidation_failure, InvalidationFailure::AssumeStale);

            let warehouse = config.queue_for("warehouse");
            assert_eq!(warehouse.concurrency, 8);
            assert_eq!(warehouse.execution_timeout.get(), Duration::from_secs(1800));
            assert_eq!(config.queue_for("other"), config.queue);
            Ok(())
        });
    }

    #[test]
    fn test_yaml_file() {
        Jail::expect_with(|jail| {
            jail.create_file("preagg.yaml", "mover:\n  max_file_size_mb: 16\n  retry:\n    max_attempts: 5\n")?;
            let config = Config::load(Some(Path::new("preagg.yaml"))).unwrap();
            assert_eq!(config.mover.max_file_size_mb, 16);
            assert_eq!(config.mover.retry.max_attempts, 5);
            Ok(())
        });
    }

    #[test]
    fn test_missing_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[test]
    fn test_unsupported_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preagg.ini");
        std::fs::write(&path, "concurrency=1").unwrap();
        let err = Config::load(Some(&path)).unwrap_err();
        assert!(matches!(&*err, ErrorKind::UnsupportedFormat(_)));
    }

    #[rstest]
    #[case("PREAGG_QUEUE__CONCURRENCY", "0")]
    #[case("PREAGG_QUEUE__EXECUTION_TIMEOUT", "0")]
    #[case("PREAGG_DATA_SOURCES__WAREHOUSE__CONCURRENCY", "0")]
    #[case("PREAGG_POLL__MAX_INTERVAL", "1ms")]
    #[case("PREAGG_MOVER__RETRY__MAX_ATTEMPTS", "0")]
    fn test_validation(#[case] key: &str, #[case] value: &str) {
        Jail::expect_with(|jail| {
            jail.set_env(key, value);
            let err = Config::from_figment(&Figment::new().merge(Env::prefixed(ENV_PREFIX).split("__"))).unwrap_err();
            assert!(matches!(&*err, ErrorKind::Invalid(_)));
            Ok(())
        });
    }

    #[test]
    fn test_rejects_unknown_keys() {
        Jail::expect_with(|jail| {
            jail.set_env("PREAGG_QUEUE__PARALLELISM", "3");
            let figment = Figment::new().merge(Env::prefixed(ENV_PREFIX).split("__"));
            let err = Config::from_figment(&figment).unwrap_err();
            assert!(matches!(&*err, ErrorKind::Load));
            Ok(())
        });
    }
}
