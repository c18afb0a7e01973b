use std::env;
use std::time::Duration;

use aide_de_camp::core::DateTime;
use anyhow::{Context, Result};
use dotenvy::dotenv;
use uuid::Uuid;

use crate::error::Error;

/// Delay before the next attempt of a failed job: `attempts^exponent + base_delay`
/// seconds. The defaults give 6s, 21s, 86s, 261s, ...
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub exponent: u32,
    pub base_delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            exponent: 4,
            base_delay: Duration::from_secs(5),
        }
    }
}

impl Backoff {
    pub fn delay(&self, attempts: u32) -> chrono::Duration {
        // chrono panics past i64::MAX milliseconds
        const MAX_SECS: i64 = i64::MAX / 4_000;

        let growth = i64::from(attempts)
            .checked_pow(self.exponent)
            .map_or(MAX_SECS, |secs| secs.min(MAX_SECS));
        let base = i64::try_from(self.base_delay.as_millis())
            .map_or(MAX_SECS, |ms| ms.min(MAX_SECS));
        chrono::Duration::seconds(growth) + chrono::Duration::milliseconds(base)
    }
}

/// Settings shared by the queue and the worker loop.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Lease owner identity. The default is unique per config, so loops in
    /// one process never share leases. Set a stable name to resume jobs
    /// this worker held when it went down.
    pub worker_name: String,
    /// Attempts before a job is given up, unless the payload overrides it.
    pub max_attempts: u32,
    /// Lease duration, and the hard deadline for one `perform()`.
    pub max_run_time: Duration,
    /// Delete jobs that exhausted their attempts instead of marking them failed.
    pub destroy_failed_jobs: bool,
    pub min_priority: Option<i32>,
    pub max_priority: Option<i32>,
    /// Candidates fetched per round.
    pub batch_size: usize,
    /// Rounds per `work_off` call made by the worker loop.
    pub rounds_per_batch: usize,
    /// Total idle wait after a batch that did no work.
    pub sleep_delay: Duration,
    /// Granularity at which the idle wait checks for shutdown.
    pub sleep_step: Duration,
    pub backoff: Backoff,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            worker_name: default_worker_name(),
            max_attempts: 25,
            max_run_time: Duration::from_secs(4 * 60 * 60),
            destroy_failed_jobs: true,
            min_priority: None,
            max_priority: None,
            batch_size: 5,
            rounds_per_batch: 100,
            sleep_delay: Duration::from_secs(5),
            sleep_step: Duration::from_millis(500),
            backoff: Backoff::default(),
        }
    }
}

fn default_worker_name() -> String {
    let host = gethostname::gethostname()
        .into_string()
        .unwrap_or_else(|_| "unknown".to_string());
    let instance = Uuid::new_v4().simple().to_string();
    format!("host:{} pid:{} {}", host, std::process::id(), &instance[..8])
}

impl QueueConfig {
    pub fn with_worker_name(worker_name: impl Into<String>) -> Self {
        Self {
            worker_name: worker_name.into(),
            ..Default::default()
        }
    }

    /// Load overrides from the environment (and a `.env` file when present).
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();

        let mut config = Self::default();

        if let Ok(name) = env::var("JOBS_WORKER_NAME") {
            config.worker_name = name;
        }
        if let Ok(index) = env::var("JOBS_WORKER_INDEX") {
            config.worker_name = format!("jobs.{} {}", index, config.worker_name);
        }
        config.min_priority = parse_var("MIN_PRIORITY")?;
        config.max_priority = parse_var("MAX_PRIORITY")?;
        if let Some(attempts) = parse_var("JOBS_MAX_ATTEMPTS")? {
            config.max_attempts = attempts;
        }
        if let Some(secs) = parse_var("JOBS_MAX_RUN_TIME_SECS")? {
            config.max_run_time = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var("JOBS_SLEEP_DELAY_SECS")? {
            config.sleep_delay = Duration::from_secs(secs);
        }
        if let Some(destroy) = parse_var("JOBS_DESTROY_FAILED")? {
            config.destroy_failed_jobs = destroy;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), Error> {
        if self.worker_name.trim().is_empty() {
            return Err(Error::Config("worker_name must not be empty".into()));
        }
        if self.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".into()));
        }
        if self.sleep_step.is_zero() {
            return Err(Error::Config("sleep_step must be positive".into()));
        }
        lease_cutoff(chrono::Utc::now(), self.max_run_time)?;
        if let (Some(min), Some(max)) = (self.min_priority, self.max_priority) {
            if min > max {
                return Err(Error::Config(format!(
                    "min_priority {} is above max_priority {}",
                    min, max
                )));
            }
        }
        Ok(())
    }
}

/// Oldest `locked_at` that still counts as a live lease at `now`.
pub(crate) fn lease_cutoff(
    now: DateTime,
    lease_duration: Duration,
) -> std::result::Result<DateTime, Error> {
    chrono::Duration::from_std(lease_duration)
        .ok()
        .and_then(|lease| now.checked_sub_signed(lease))
        .ok_or_else(|| {
            Error::Config(format!("lease duration {:?} is out of range", lease_duration))
        })
}

fn parse_var<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("{} must be a valid value, got {:?}", key, raw)),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::{Mutex, PoisonError};

    const ENV_KEYS: &[&str] = &[
        "JOBS_WORKER_NAME",
        "JOBS_WORKER_INDEX",
        "MIN_PRIORITY",
        "MAX_PRIORITY",
        "JOBS_MAX_ATTEMPTS",
        "JOBS_MAX_RUN_TIME_SECS",
        "JOBS_SLEEP_DELAY_SECS",
        "JOBS_DESTROY_FAILED",
    ];

    // the process environment is shared between test threads
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn with_env<T>(vars: &[(&str, &str)], f: impl FnOnce() -> T) -> T {
        let _guard = ENV_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        for key in ENV_KEYS {
            env::remove_var(key);
        }
        for (key, value) in vars {
            env::set_var(key, value);
        }
        let out = f();
        for key in ENV_KEYS {
            env::remove_var(key);
        }
        out
    }

    #[test]
    fn test_config_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.max_attempts, 25);
        assert_eq!(config.max_run_time, Duration::from_secs(14_400));
        assert_eq!(config.batch_size, 5);
        assert!(config.destroy_failed_jobs);
        assert!(config.worker_name.starts_with("host:"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_with_worker_name() {
        let config = QueueConfig::with_worker_name("worker-a");
        assert_eq!(config.worker_name, "worker-a");
        assert_eq!(config.max_attempts, 25);
    }

    #[test]
    fn validate_rejects_inverted_priority_range() {
        let config = QueueConfig {
            min_priority: Some(10),
            max_priority: Some(1),
            ..QueueConfig::with_worker_name("w")
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn validate_rejects_zero_attempts() {
        let config = QueueConfig {
            max_attempts: 0,
            ..QueueConfig::with_worker_name("w")
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_backoff_grows_with_the_fourth_power() {
        let backoff = Backoff::default();
        let secs: Vec<i64> = (1..=4).map(|n| backoff.delay(n).num_seconds()).collect();
        assert_eq!(secs, vec![6, 21, 86, 261]);
    }

    #[test]
    fn backoff_is_tunable() {
        let backoff = Backoff {
            exponent: 2,
            base_delay: Duration::from_secs(1),
        };
        assert_eq!(backoff.delay(3).num_seconds(), 10);
    }

    #[test]
    fn default_identities_are_distinct() {
        let a = QueueConfig::default();
        let b = QueueConfig::default();
        assert_ne!(a.worker_name, b.worker_name);
        assert!(a.worker_name.contains(&format!("pid:{}", std::process::id())));
    }

    #[test]
    fn validate_rejects_a_lease_reaching_past_the_calendar() {
        let config = QueueConfig {
            max_run_time: Duration::from_secs(500_000 * 365 * 24 * 60 * 60),
            ..QueueConfig::with_worker_name("w")
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn from_env_prefixes_the_worker_index() {
        let config = with_env(
            &[("JOBS_WORKER_NAME", "alpha"), ("JOBS_WORKER_INDEX", "3")],
            QueueConfig::from_env,
        )
        .unwrap();
        assert_eq!(config.worker_name, "jobs.3 alpha");
    }

    #[test]
    fn from_env_applies_overrides() {
        let config = with_env(
            &[
                ("MIN_PRIORITY", "1"),
                ("MAX_PRIORITY", "9"),
                ("JOBS_MAX_ATTEMPTS", "3"),
                ("JOBS_MAX_RUN_TIME_SECS", "60"),
                ("JOBS_SLEEP_DELAY_SECS", "2"),
                ("JOBS_DESTROY_FAILED", "false"),
            ],
            QueueConfig::from_env,
        )
        .unwrap();

        assert_eq!(config.min_priority, Some(1));
        assert_eq!(config.max_priority, Some(9));
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.max_run_time, Duration::from_secs(60));
        assert_eq!(config.sleep_delay, Duration::from_secs(2));
        assert!(!config.destroy_failed_jobs);
        assert!(config.worker_name.starts_with("host:"));
    }

    #[test]
    fn from_env_ignores_blank_values() {
        let config = with_env(
            &[("MIN_PRIORITY", "  "), ("JOBS_MAX_ATTEMPTS", "")],
            QueueConfig::from_env,
        )
        .unwrap();
        assert_eq!(config.min_priority, None);
        assert_eq!(config.max_attempts, 25);
    }

    #[test]
    fn from_env_names_the_unparseable_variable() {
        let err = with_env(&[("JOBS_MAX_ATTEMPTS", "lots")], QueueConfig::from_env).unwrap_err();
        assert!(err.to_string().contains("JOBS_MAX_ATTEMPTS"));
        assert!(err.to_string().contains("lots"));
    }

    #[test]
    fn from_env_validates_the_result() {
        let err = with_env(&[("MIN_PRIORITY", "5"), ("MAX_PRIORITY", "1")], QueueConfig::from_env)
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Config(_))));
    }
}
