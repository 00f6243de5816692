//! Backoff and retry eligibility.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::resilience::classify::{ClassifiedError, ErrorClassifier, ErrorKind, Failure};

/// Fraction of the delay used as the upper bound for jitter.
const JITTER_FRACTION: f64 = 0.1;

/// Retry tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// A config that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// This config adjusted for a failure kind. The classification table
    /// suggests a budget per kind (rate limits get 5) and `max_retries`
    /// caps it.
    pub fn for_kind(&self, kind: ErrorKind) -> Self {
        let (_, _, suggested) = kind.defaults();
        Self {
            max_retries: self.max_retries.min(suggested),
            ..self.clone()
        }
    }

    /// `min(base * multiplier^attempt, max)`, without jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = base_ms * self.backoff_multiplier.powi(exponent);
        let capped = if raw.is_finite() { raw.min(max_ms) } else { max_ms };
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// [`delay`](Self::delay) plus, when jitter is on, a uniform random
    /// amount up to 10% of it.
    pub fn delay_with_jitter(&self, attempt: u32) -> Duration {
        let delay = self.delay(attempt);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let bound = delay.as_millis() as f64 * JITTER_FRACTION;
        let extra = rand::thread_rng().gen_range(0.0..=bound);
        delay + Duration::from_millis(extra as u64)
    }

    /// Whether another attempt is allowed after `attempts_made` attempts.
    pub fn should_retry(&self, error: &ClassifiedError, attempts_made: u32) -> bool {
        error.retryable && attempts_made <= self.max_retries
    }
}

/// Run `op` until it succeeds or classification says stop.
///
/// `op` receives the zero-based attempt number. The retry budget is
/// [`RetryConfig::for_kind`] of each classified failure.
pub async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    classifier: &ErrorClassifier,
    mut op: F,
) -> Result<T, ClassifiedError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, Failure>>,
{
    let mut attempt = 0u32;
    loop {
        let failure = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(failure) => failure,
        };

        let error = classifier.classify(&failure);
        if !config.for_kind(error.kind).should_retry(&error, attempt + 1) {
            return Err(error);
        }

        let delay = config.delay_with_jitter(attempt);
        warn!(
            attempt = attempt + 1,
            kind = %error.kind,
            delay_ms = delay.as_millis() as u64,
            "Operation failed, retrying: {}",
            error.message
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
