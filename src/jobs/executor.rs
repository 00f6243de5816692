//! Single-attempt job execution.
//!
//! Each attempt runs the registered handler exactly once, guarded by the
//! circuit breaker for its resource and raced against a hard deadline. Any
//! failure (error, panic, timeout, open circuit) is classified here and never
//! escapes to the dispatch loop.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use sysinfo::System;
use tracing::{debug, warn};

use crate::clock::{Clock, elapsed_between};
use crate::jobs::handler::{HandlerError, HandlerRegistry, JobContext};
use crate::jobs::model::{ExecutionMetrics, JobDescriptor, JobPayload};
use crate::resilience::circuit::CircuitBreakerRegistry;
use crate::resilience::classify::{ClassifiedError, ErrorClassifier, ErrorKind, Failure};
use crate::resilience::retry::RetryConfig;

/// How an attempt ended.
#[derive(Debug)]
pub enum ExecutionOutcome {
    Succeeded {
        result: JobPayload,
        metrics: ExecutionMetrics,
    },
    /// The handler failed, panicked or timed out.
    Failed {
        error: ClassifiedError,
        handler_retryable: bool,
        metrics: ExecutionMetrics,
    },
    /// The circuit breaker refused the call; the handler never ran.
    Rejected {
        error: ClassifiedError,
        retry_at: DateTime<Utc>,
        handler_retryable: bool,
        metrics: ExecutionMetrics,
    },
    /// The handler honored the cancellation hint.
    Cancelled { metrics: ExecutionMetrics },
}

impl ExecutionOutcome {
    pub fn metrics(&self) -> &ExecutionMetrics {
        match self {
            Self::Succeeded { metrics, .. }
            | Self::Failed { metrics, .. }
            | Self::Rejected { metrics, .. }
            | Self::Cancelled { metrics } => metrics,
        }
    }

    pub fn error(&self) -> Option<&ClassifiedError> {
        match self {
            Self::Failed { error, .. } | Self::Rejected { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Runs handler invocations.
pub struct JobExecutor {
    handlers: Arc<HandlerRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    classifier: Arc<ErrorClassifier>,
    retry: RetryConfig,
    clock: Arc<dyn Clock>,
    capture_memory: bool,
}

impl JobExecutor {
    pub fn new(
        handlers: Arc<HandlerRegistry>,
        breakers: Arc<CircuitBreakerRegistry>,
        classifier: Arc<ErrorClassifier>,
        retry: RetryConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            handlers,
            breakers,
            classifier,
            retry,
            clock,
            capture_memory: false,
        }
    }

    /// Sample resident memory around every attempt.
    pub fn with_memory_capture(mut self, enabled: bool) -> Self {
        self.capture_memory = enabled;
        self
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn classifier(&self) -> &Arc<ErrorClassifier> {
        &self.classifier
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Run one attempt of `job`.
    pub async fn execute(&self, job: &JobDescriptor, ctx: JobContext) -> ExecutionOutcome {
        let started_at = self.clock.now();
        let timer = Instant::now();
        let memory_before = self.sample_memory();
        let metrics = |timer: Instant| {
            let memory_bytes = self.sample_memory();
            ExecutionMetrics {
                attempt: job.attempt,
                started_at,
                duration: timer.elapsed(),
                memory_bytes,
                memory_delta_bytes: memory_before
                    .zip(memory_bytes)
                    .map(|(before, after)| after as i64 - before as i64),
            }
        };

        let Some(handler) = self.handlers.get(&job.job_type).await else {
            let failure =
                Failure::internal(format!("no handler registered for job type {}", job.job_type));
            return ExecutionOutcome::Failed {
                error: self.classifier.classify(&failure),
                handler_retryable: false,
                metrics: metrics(timer),
            };
        };
        let handler_retryable = handler.retryable();
        let resource = handler.resource().unwrap_or(job.job_type.as_str()).to_string();
        let breaker = self.breakers.get(&resource);

        let permit = match breaker.try_acquire() {
            Ok(permit) => permit,
            Err(open) => {
                debug!(job_id = %job.id, resource = %resource, "Circuit open, attempt rejected");
                let error = ClassifiedError::new(ErrorKind::Processing, open.to_string(), started_at)
                    .with_context("circuit", "open")
                    .with_context("resource", resource);
                return ExecutionOutcome::Rejected {
                    error,
                    retry_at: open.retry_at,
                    handler_retryable,
                    metrics: metrics(timer),
                };
            }
        };

        let invocation = AssertUnwindSafe(handler.handle(&job.payload, &ctx)).catch_unwind();
        let failure = match tokio::time::timeout(job.effective_timeout(), invocation).await {
            Ok(Ok(Ok(result))) => {
                permit.succeed();
                return ExecutionOutcome::Succeeded {
                    result,
                    metrics: metrics(timer),
                };
            }
            Ok(Ok(Err(HandlerError::Cancelled))) => {
                drop(permit);
                return ExecutionOutcome::Cancelled {
                    metrics: metrics(timer),
                };
            }
            Ok(Ok(Err(HandlerError::Failed(failure)))) => failure,
            Ok(Err(panic)) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Failure::internal(format!("handler panicked: {detail}"))
            }
            Err(_) => {
                let timeout = job.effective_timeout();
                warn!(job_id = %job.id, timeout = ?timeout, "Job attempt timed out");
                Failure::new(format!("job timed out after {timeout:?}")).with_code("ETIMEDOUT")
            }
        };

        permit.fail();
        ExecutionOutcome::Failed {
            error: self.classifier.classify(&failure),
            handler_retryable,
            metrics: metrics(timer),
        }
    }

    /// Delay before the retry of a failed attempt, or `None` when the job
    /// must fail for good.
    pub fn plan_retry(&self, job: &JobDescriptor, outcome: &ExecutionOutcome) -> Option<Duration> {
        let (error, handler_retryable, not_before) = match outcome {
            ExecutionOutcome::Failed {
                error,
                handler_retryable,
                ..
            } => (error, *handler_retryable, None),
            ExecutionOutcome::Rejected {
                error,
                retry_at,
                handler_retryable,
                ..
            } => (error, *handler_retryable, Some(*retry_at)),
            _ => return None,
        };

        if !handler_retryable {
            return None;
        }
        let policy = match job.max_attempts {
            Some(max_attempts) => self
                .retry
                .clone()
                .with_max_retries(max_attempts.saturating_sub(1)),
            None => self.retry.for_kind(error.kind),
        };
        if !policy.should_retry(error, job.attempts_made()) {
            return None;
        }

        let backoff = self.retry.delay_with_jitter(job.attempt);
        let breaker_wait = not_before
            .map(|at| elapsed_between(self.clock.now(), at))
            .unwrap_or(Duration::ZERO);
        Some(backoff.max(breaker_wait))
    }

    fn sample_memory(&self) -> Option<u64> {
        if !self.capture_memory {
            return None;
        }
        let pid = sysinfo::get_current_pid().ok()?;
        let mut sys = System::new();
        sys.refresh_process(pid);
        sys.process(pid).map(|p| p.memory())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::clock::ManualClock;
    use crate::jobs::handler::handler_fn;
    use crate::resilience::circuit::{CircuitBreakerConfig, CircuitState};
    use crate::resilience::classify::TracingAlertSink;

    struct Fixture {
        executor: JobExecutor,
        clock: Arc<ManualClock>,
    }

    fn fixture(threshold: u32) -> Fixture {
        let clock = Arc::new(ManualClock::starting_now());
        let breakers = CircuitBreakerRegistry::new(
            CircuitBreakerConfig {
                failure_threshold: threshold,
                open_timeout: Duration::from_secs(10),
                monitoring_period: Duration::from_secs(60),
            },
            clock.clone(),
            Arc::new(TracingAlertSink),
        );
        let classifier = ErrorClassifier::new(clock.clone(), Arc::new(TracingAlertSink));
        let executor = JobExecutor::new(
            Arc::new(HandlerRegistry::new()),
            Arc::new(breakers),
            Arc::new(classifier),
            RetryConfig::default().without_jitter(),
            clock.clone(),
        );
        Fixture { executor, clock }
    }

    fn ctx(job: &JobDescriptor) -> JobContext {
        JobContext::new(job.id, job.job_type.clone(), job.attempt)
    }

    #[tokio::test]
    async fn success_returns_result() {
        let f = fixture(3);
        f.executor
            .handlers()
            .register(
                "echo",
                Arc::new(handler_fn(|p, _| async move { Ok(p) })),
            )
            .await;

        let job = JobDescriptor::new("echo", JobPayload::json(serde_json::json!({"n": 1})));
        match f.executor.execute(&job, ctx(&job)).await {
            ExecutionOutcome::Succeeded { result, metrics } => {
                assert_eq!(result, job.payload);
                assert_eq!(metrics.attempt, 0);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_handler_is_internal_and_final() {
        let f = fixture(3);
        let job = JobDescriptor::new("nobody", JobPayload::Empty);
        let outcome = f.executor.execute(&job, ctx(&job)).await;
        assert_eq!(outcome.error().unwrap().kind, ErrorKind::SystemInternal);
        assert!(f.executor.plan_retry(&job, &outcome).is_none());
    }

    #[tokio::test]
    async fn timeout_wins_over_late_result() {
        let f = fixture(3);
        f.executor
            .handlers()
            .register(
                "slow",
                Arc::new(handler_fn(|_, _| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(JobPayload::Empty)
                })),
            )
            .await;

        let job = JobDescriptor::new("slow", JobPayload::Empty)
            .with_timeout(Duration::from_millis(20));
        let outcome = f.executor.execute(&job, ctx(&job)).await;
        let error = outcome.error().expect("timed out");
        assert!(error.message.contains("timed out"));
        assert_eq!(error.kind, ErrorKind::Processing);
    }

    #[tokio::test]
    async fn panics_are_caught_and_classified() {
        let f = fixture(3);
        f.executor
            .handlers()
            .register(
                "boom",
                Arc::new(handler_fn(|_, _| async {
                    if true {
                        panic!("index out of bounds");
                    }
                    Ok(JobPayload::Empty)
                })),
            )
            .await;

        let job = JobDescriptor::new("boom", JobPayload::Empty);
        let outcome = f.executor.execute(&job, ctx(&job)).await;
        let error = outcome.error().unwrap();
        assert_eq!(error.kind, ErrorKind::SystemInternal);
        assert!(error.message.contains("index out of bounds"));
    }

    #[tokio::test]
    async fn open_circuit_rejects_without_invoking_handler() {
        let f = fixture(2);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        f.executor
            .handlers()
            .register(
                "embed",
                Arc::new(
                    handler_fn(move |_, _| {
                        let counter = counter.clone();
                        async move {
                            counter.fetch_add(1, Ordering::SeqCst);
                            Err(Failure::new("embedding service 503").into())
                        }
                    })
                    .with_resource("embeddings"),
                ),
            )
            .await;

        let job = JobDescriptor::new("embed", JobPayload::Empty);
        for _ in 0..2 {
            let outcome = f.executor.execute(&job, ctx(&job)).await;
            assert!(matches!(outcome, ExecutionOutcome::Failed { .. }));
        }
        assert_eq!(
            f.executor.breakers().get("embeddings").state(),
            CircuitState::Open
        );

        let outcome = f.executor.execute(&job, ctx(&job)).await;
        assert!(matches!(outcome, ExecutionOutcome::Rejected { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Retry waits at least until the breaker admits a trial.
        let delay = f.executor.plan_retry(&job, &outcome).unwrap();
        assert_eq!(delay, Duration::from_secs(10));

        f.clock.advance(Duration::from_secs(10));
        let outcome = f.executor.execute(&job, ctx(&job)).await;
        assert!(matches!(outcome, ExecutionOutcome::Failed { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancellation_is_reported() {
        let f = fixture(3);
        f.executor
            .handlers()
            .register(
                "polite",
                Arc::new(handler_fn(|_, _| async { Err(HandlerError::Cancelled) })),
            )
            .await;
        let job = JobDescriptor::new("polite", JobPayload::Empty);
        let outcome = f.executor.execute(&job, ctx(&job)).await;
        assert!(matches!(outcome, ExecutionOutcome::Cancelled { .. }));
        assert!(f.executor.plan_retry(&job, &outcome).is_none());
    }

    #[test]
    fn plan_retry_budget() {
        let f = fixture(3);
        let now = f.clock.now();
        let network = ErrorClassifier::default().classify(&Failure::new("network timeout"));
        let failed = |error: ClassifiedError| ExecutionOutcome::Failed {
            error,
            handler_retryable: true,
            metrics: ExecutionMetrics {
                attempt: 0,
                started_at: now,
                duration: Duration::ZERO,
                memory_bytes: None,
                memory_delta_bytes: None,
            },
        };

        // Explicit budget: 2 retries.
        let mut job = JobDescriptor::new("t", JobPayload::Empty).with_max_retries(2);
        let outcome = failed(network.clone());
        assert_eq!(f.executor.plan_retry(&job, &outcome), Some(Duration::from_secs(1)));
        job.attempt = 1;
        assert_eq!(f.executor.plan_retry(&job, &outcome), Some(Duration::from_secs(2)));
        job.attempt = 2;
        assert_eq!(f.executor.plan_retry(&job, &outcome), None);

        // Classification budget, capped by the configured max_retries (3).
        let rate = ErrorClassifier::default().classify(&Failure::new("x").with_status(429));
        let mut job = JobDescriptor::new("t", JobPayload::Empty);
        job.attempt = 2;
        assert!(f.executor.plan_retry(&job, &failed(rate.clone())).is_some());
        job.attempt = 3;
        assert!(f.executor.plan_retry(&job, &failed(rate.clone())).is_none());

        // A per-job budget lifts the ceiling: rate limits get 5 retries.
        let mut job = JobDescriptor::new("t", JobPayload::Empty).with_max_retries(5);
        job.attempt = 4;
        assert!(f.executor.plan_retry(&job, &failed(rate.clone())).is_some());
        job.attempt = 5;
        assert!(f.executor.plan_retry(&job, &failed(rate)).is_none());

        // Storage suggests fewer retries than the ceiling.
        let storage = ErrorClassifier::default().classify(&Failure::new("database locked"));
        let mut job = JobDescriptor::new("t", JobPayload::Empty);
        job.attempt = 2;
        assert!(f.executor.plan_retry(&job, &failed(storage)).is_none());

        // Non-retryable handler.
        let outcome = ExecutionOutcome::Failed {
            error: network,
            handler_retryable: false,
            metrics: outcome.metrics().clone(),
        };
        assert!(f.executor.plan_retry(&JobDescriptor::new("t", JobPayload::Empty), &outcome).is_none());
    }

    #[test]
    fn zero_max_retries_disables_default_retries() {
        let f = fixture(3);
        let executor = JobExecutor::new(
            f.executor.handlers().clone(),
            f.executor.breakers().clone(),
            f.executor.classifier().clone(),
            RetryConfig::no_retry(),
            f.clock.clone(),
        );
        let network = ErrorClassifier::default().classify(&Failure::new("network timeout"));
        let outcome = ExecutionOutcome::Failed {
            error: network,
            handler_retryable: true,
            metrics: ExecutionMetrics {
                attempt: 0,
                started_at: f.clock.now(),
                duration: Duration::ZERO,
                memory_bytes: None,
                memory_delta_bytes: None,
            },
        };
        let job = JobDescriptor::new("t", JobPayload::Empty);
        assert!(executor.plan_retry(&job, &outcome).is_none());

        // An explicit per-job budget still applies.
        let job = job.with_max_retries(1);
        assert!(executor.plan_retry(&job, &outcome).is_some());
    }

    #[tokio::test]
    async fn memory_is_sampled_when_enabled() {
        let f = fixture(3);
        let executor = JobExecutor::new(
            f.executor.handlers().clone(),
            f.executor.breakers().clone(),
            f.executor.classifier().clone(),
            RetryConfig::default(),
            f.clock.clone(),
        )
        .with_memory_capture(true);
        executor
            .handlers()
            .register("echo", Arc::new(handler_fn(|p, _| async move { Ok(p) })))
            .await;

        let job = JobDescriptor::new("echo", JobPayload::Empty);
        let outcome = executor.execute(&job, ctx(&job)).await;
        let metrics = outcome.metrics();
        assert!(matches!(outcome, ExecutionOutcome::Succeeded { .. }));
        assert!(metrics.memory_bytes.is_some_and(|bytes| bytes > 0));
        assert!(metrics.memory_delta_bytes.is_some());
        assert_eq!(metrics.started_at, f.clock.now());
    }
}
