//! Fault tolerance: failure classification, circuit breakers, retry/backoff.

pub mod circuit;
pub mod classify;
pub mod retry;

pub use circuit::{
    CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitError,
    CircuitOpen, CircuitSnapshot, CircuitState,
};
pub use classify::{
    Alert, AlertSink, ClassifiedError, ErrorClassifier, ErrorKind, Failure, Severity,
    TracingAlertSink,
};
pub use retry::{RetryConfig, with_retry};
