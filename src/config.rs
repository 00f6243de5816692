//! Configuration types.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::resilience::circuit::CircuitBreakerConfig;
use crate::resilience::retry::RetryConfig;

/// Queue and scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Instance name for identification in logs.
    pub name: String,
    /// Maximum number of concurrently running jobs.
    pub concurrency_limit: usize,
    /// Readiness sweep interval (time-based readiness, stuck detection).
    pub sweep_interval: Duration,
    /// Per-attempt deadline for jobs that do not set one.
    pub default_timeout: Duration,
    /// Pending jobs blocked on dependencies for this long are reported.
    pub stuck_threshold: Duration,
    /// Fail jobs whose dependencies can never complete once they have been
    /// pending for `stuck_threshold`.
    pub fail_starved_jobs: bool,
    /// Settled records kept for lookups before the oldest are pruned.
    pub retained_records: usize,
    /// Capacity of the lifecycle event broadcast channel.
    pub event_capacity: usize,
    /// Sample resident memory around each attempt.
    pub capture_memory: bool,
    /// Backoff used between attempts.
    pub retry: RetryConfig,
    /// Default breaker tuning for every resource.
    pub breaker: CircuitBreakerConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: "jobgate".to_string(),
            concurrency_limit: 4,
            sweep_interval: Duration::from_secs(1),
            default_timeout: Duration::from_secs(300), // 5 minutes
            stuck_threshold: Duration::from_secs(300), // 5 minutes
            fail_starved_jobs: true,
            retained_records: 1000,
            event_capacity: 256,
            capture_memory: true,
            retry: RetryConfig::default(),
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Build from `JOBGATE_*` environment variables, falling back to the
    /// defaults for anything unset.
    pub fn from_env() -> crate::Result<Self> {
        Ok(Self::from_lookup(|key| std::env::var(key).ok())?)
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(name) = lookup("JOBGATE_NAME") {
            config.name = name;
        }
        if let Some(limit) = parse::<usize>(&lookup, "JOBGATE_CONCURRENCY")? {
            if limit == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "JOBGATE_CONCURRENCY".to_string(),
                    message: "must be at least 1".to_string(),
                });
            }
            config.concurrency_limit = limit;
        }
        if let Some(ms) = parse::<u64>(&lookup, "JOBGATE_SWEEP_INTERVAL_MS")? {
            config.sweep_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(secs) = parse::<u64>(&lookup, "JOBGATE_JOB_TIMEOUT_SECS")? {
            config.default_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64>(&lookup, "JOBGATE_STUCK_THRESHOLD_SECS")? {
            config.stuck_threshold = Duration::from_secs(secs);
        }
        if let Some(fail) = parse::<bool>(&lookup, "JOBGATE_FAIL_STARVED")? {
            config.fail_starved_jobs = fail;
        }
        if let Some(keep) = parse::<usize>(&lookup, "JOBGATE_RETAINED_RECORDS")? {
            config.retained_records = keep;
        }
        if let Some(capacity) = parse::<usize>(&lookup, "JOBGATE_EVENT_CAPACITY")? {
            config.event_capacity = capacity.max(1);
        }
        if let Some(capture) = parse::<bool>(&lookup, "JOBGATE_CAPTURE_MEMORY")? {
            config.capture_memory = capture;
        }

        if let Some(retries) = parse::<u32>(&lookup, "JOBGATE_MAX_RETRIES")? {
            config.retry.max_retries = retries;
        }
        if let Some(ms) = parse::<u64>(&lookup, "JOBGATE_RETRY_BASE_DELAY_MS")? {
            config.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64>(&lookup, "JOBGATE_RETRY_MAX_DELAY_MS")? {
            config.retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(multiplier) = parse::<f64>(&lookup, "JOBGATE_RETRY_MULTIPLIER")? {
            if !multiplier.is_finite() || multiplier < 1.0 {
                return Err(ConfigError::InvalidValue {
                    key: "JOBGATE_RETRY_MULTIPLIER".to_string(),
                    message: format!("{multiplier} is not a finite value >= 1"),
                });
            }
            config.retry.backoff_multiplier = multiplier;
        }
        if let Some(jitter) = parse::<bool>(&lookup, "JOBGATE_RETRY_JITTER")? {
            config.retry.jitter = jitter;
        }

        if let Some(threshold) = parse::<u32>(&lookup, "JOBGATE_BREAKER_THRESHOLD")? {
            config.breaker.failure_threshold = threshold.max(1);
        }
        if let Some(secs) = parse::<u64>(&lookup, "JOBGATE_BREAKER_OPEN_SECS")? {
            config.breaker.open_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64>(&lookup, "JOBGATE_BREAKER_WINDOW_SECS")? {
            config.breaker.monitoring_period = Duration::from_secs(secs);
        }

        Ok(config)
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
    }
}
