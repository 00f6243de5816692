//! Per-resource circuit breakers.
//!
//! Closed → Open after `failure_threshold` consecutive failures. While Open
//! every call fails fast until `next_attempt_at`; then a single trial call is
//! admitted (HalfOpen) and its outcome decides between Closed and Open again.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::{Clock, after, elapsed_between};
use crate::resilience::classify::{Alert, AlertSink};

/// Breaker tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,
    /// How long the breaker stays open before admitting a trial call.
    pub open_timeout: Duration,
    /// A failure older than this no longer counts toward the threshold.
    pub monitoring_period: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(60),
            monitoring_period: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        };
        write!(f, "{s}")
    }
}

/// Returned instead of invoking the operation while the breaker is open.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("circuit open for {resource}, next attempt at {retry_at}")]
pub struct CircuitOpen {
    pub resource: String,
    pub retry_at: DateTime<Utc>,
}

/// Outcome of a guarded call.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    #[error(transparent)]
    Open(#[from] CircuitOpen),

    #[error("{0}")]
    Inner(E),
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub resource: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<DateTime<Utc>>,
    next_attempt_at: Option<DateTime<Utc>>,
    trial_in_flight: bool,
}

/// Fast-fail guard for one named resource.
pub struct CircuitBreaker {
    resource: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    alerts: Option<Arc<dyn AlertSink>>,
    state: Mutex<BreakerState>,
}

/// Admission ticket for one call. Settle it with [`CallPermit::succeed`] or
/// [`CallPermit::fail`]; dropping it unsettled releases a HalfOpen trial slot
/// without recording an outcome.
#[must_use = "a permit must be settled with succeed() or fail()"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl CallPermit<'_> {
    /// Whether this is the single HalfOpen trial call.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn succeed(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    pub fn fail(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_trial();
        }
    }
}

impl CircuitBreaker {
    pub fn new(
        resource: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            resource: resource.into(),
            config,
            clock,
            alerts: None,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_at: None,
                next_attempt_at: None,
                trial_in_flight: false,
            }),
        }
    }

    /// Report Open transitions to an alert sink.
    pub fn with_alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current state, without promoting Open to HalfOpen.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let s = self.lock();
        CircuitSnapshot {
            resource: self.resource.clone(),
            state: s.state,
            failure_count: s.failure_count,
            next_attempt_at: s.next_attempt_at,
        }
    }

    /// Ask to make a call. Fails fast while Open.
    pub fn try_acquire(&self) -> Result<CallPermit<'_>, CircuitOpen> {
        let now = self.clock.now();
        let mut s = self.lock();

        let trial = match s.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let retry_at = s.next_attempt_at.unwrap_or(now);
                if now < retry_at {
                    return Err(self.open_error(retry_at));
                }
                s.state = CircuitState::HalfOpen;
                s.trial_in_flight = true;
                debug!(resource = %self.resource, "Circuit half-open, admitting trial call");
                true
            }
            CircuitState::HalfOpen => {
                if s.trial_in_flight {
                    return Err(self.open_error(s.next_attempt_at.unwrap_or(now)));
                }
                s.trial_in_flight = true;
                true
            }
        };

        Ok(CallPermit {
            breaker: self,
            trial,
            settled: false,
        })
    }

    fn open_error(&self, retry_at: DateTime<Utc>) -> CircuitOpen {
        CircuitOpen {
            resource: self.resource.clone(),
            retry_at,
        }
    }

    fn on_success(&self, trial: bool) {
        let mut s = self.lock();
        match s.state {
            CircuitState::Closed => s.failure_count = 0,
            CircuitState::HalfOpen if trial => {
                s.state = CircuitState::Closed;
                s.failure_count = 0;
                s.last_failure_at = None;
                s.next_attempt_at = None;
                s.trial_in_flight = false;
                info!(resource = %self.resource, "Circuit closed after successful trial");
            }
            // A call admitted before the breaker opened; its outcome is stale.
            _ => {}
        }
    }

    fn on_failure(&self, trial: bool) {
        let now = self.clock.now();
        let mut s = self.lock();
        match s.state {
            CircuitState::Closed => {
                if let Some(last) = s.last_failure_at
                    && elapsed_between(last, now) > self.config.monitoring_period
                {
                    s.failure_count = 0;
                }
                s.failure_count += 1;
                s.last_failure_at = Some(now);
                if s.failure_count >= self.config.failure_threshold {
                    self.trip(&mut s, now);
                }
            }
            CircuitState::HalfOpen if trial => {
                s.failure_count += 1;
                s.last_failure_at = Some(now);
                s.trial_in_flight = false;
                warn!(resource = %self.resource, "Trial call failed, circuit re-opened");
                self.trip(&mut s, now);
            }
            _ => {}
        }
    }

    fn release_trial(&self) {
        let mut s = self.lock();
        if s.state == CircuitState::HalfOpen {
            s.trial_in_flight = false;
        }
    }

    fn trip(&self, s: &mut BreakerState, now: DateTime<Utc>) {
        let next_attempt_at = after(now, self.config.open_timeout);
        s.state = CircuitState::Open;
        s.next_attempt_at = Some(next_attempt_at);

        info!(
            resource = %self.resource,
            failures = s.failure_count,
            retry_at = %next_attempt_at,
            "Circuit opened"
        );
        if let Some(ref alerts) = self.alerts {
            alerts.alert(&Alert::CircuitOpened {
                resource: self.resource.clone(),
                failure_count: s.failure_count,
                next_attempt_at,
            });
        }
    }

    /// Run `op` under the breaker.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.try_acquire()?;
        match op().await {
            Ok(value) => {
                permit.succeed();
                Ok(value)
            }
            Err(e) => {
                permit.fail();
                Err(CircuitError::Inner(e))
            }
        }
    }

    /// Run `op` under the breaker, degrading to `fallback` while it is open.
    pub async fn call_with_fallback<F, Fut, FB, FbFut, T, E>(
        &self,
        op: F,
        fallback: FB,
    ) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        FB: FnOnce(CircuitOpen) -> FbFut,
        FbFut: Future<Output = Result<T, E>>,
    {
        match self.try_acquire() {
            Err(open) => {
                debug!(resource = %self.resource, "Circuit open, using fallback");
                fallback(open).await.map_err(CircuitError::Inner)
            }
            Ok(permit) => match op().await {
                Ok(value) => {
                    permit.succeed();
                    Ok(value)
                }
                Err(e) => {
                    permit.fail();
                    Err(CircuitError::Inner(e))
                }
            },
        }
    }
}

// ── Registry ────────────────────────────────────────────────────────

/// One breaker per resource name, created on first use.
pub struct CircuitBreakerRegistry {
    defaults: CircuitBreakerConfig,
    overrides: HashMap<String, CircuitBreakerConfig>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    clock: Arc<dyn Clock>,
    alerts: Arc<dyn AlertSink>,
}

impl CircuitBreakerRegistry {
    pub fn new(
        defaults: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            defaults,
            overrides: HashMap::new(),
            breakers: RwLock::new(HashMap::new()),
            clock,
            alerts,
        }
    }

    /// Use a dedicated config for one resource.
    pub fn with_override(mut self, resource: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        self.overrides.insert(resource.into(), config);
        self
    }

    /// Get (or lazily create) the breaker for `resource`.
    pub fn get(&self, resource: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self
            .breakers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(resource)
        {
            return breaker.clone();
        }

        let mut breakers = self.breakers.write().unwrap_or_else(|e| e.into_inner());
        breakers
            .entry(resource.to_string())
            .or_insert_with(|| {
                let config = self
                    .overrides
                    .get(resource)
                    .cloned()
                    .unwrap_or_else(|| self.defaults.clone());
                debug!(resource = %resource, "Created circuit breaker");
                Arc::new(
                    CircuitBreaker::new(resource, config, self.clock.clone())
                        .with_alerts(self.alerts.clone()),
                )
            })
            .clone()
    }

    /// State of every breaker created so far, sorted by resource name.
    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let mut all: Vec<CircuitSnapshot> = self
            .breakers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|b| b.snapshot())
            .collect();
        all.sort_by(|a, b| a.resource.cmp(&b.resource));
        all
    }
}
