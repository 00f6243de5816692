//! Failure classification.
//!
//! Every failed attempt is mapped exactly once to a [`ClassifiedError`] that
//! carries a kind, a severity, a retry decision and a suggested retry budget.
//!
//! | Signal | Kind | Severity | Retryable | max retries |
//! |---|---|---|---|---|
//! | programming/type error | SystemInternal | High | no | 0 |
//! | status 429, "rate limit" | RateLimit | Medium | yes | 5 |
//! | "network", connection refused | Network | Medium | yes | 3 |
//! | "database", storage error code | Storage | High | yes | 2 |
//! | "embedding", model provider name | ModelInference | Medium | yes | 3 |
//! | status 401/403 | Authentication | High | no | 0 |
//! | other 4xx | Validation | Low | no | 0 |
//! | anything else | Processing | Medium | yes | 2 |

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};

static RATE_LIMIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)rate[\s_-]?limit").unwrap());

static NETWORK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)network|econnrefused|connection refused|connection reset").unwrap()
});

static STORAGE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)database").unwrap());

/// Error codes that identify a storage-layer failure (SQLSTATE-style).
const DEFAULT_STORAGE_CODES: &[&str] = &[
    "23505", "23503", "23502", "40001", "40P01", "53300", "57P01", "08006", "SQLITE_BUSY",
];

/// Message fragments that identify a model/embedding provider failure.
const DEFAULT_MODEL_MARKERS: &[&str] = &["embedding", "openai", "anthropic", "cohere", "voyage"];

/// Error codes that identify a transport failure.
const NETWORK_CODES: &[&str] = &["ECONNREFUSED", "ECONNRESET", "ENOTFOUND", "EHOSTUNREACH"];

// ── Raw failures ────────────────────────────────────────────────────

/// A raw failure as reported by a handler or produced by the executor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub message: String,
    /// HTTP-like status code, if the failure came from a remote service.
    pub status: Option<u16>,
    /// Machine-readable error code (e.g. `ECONNREFUSED`, a SQLSTATE).
    pub code: Option<String>,
    /// Programming or type error inside the handler itself.
    pub internal: bool,
    /// Forces the classified severity (the kind still follows the table).
    pub severity: Option<Severity>,
    pub context: HashMap<String, String>,
}

impl Failure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    /// A programming/type error: never retried.
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            internal: true,
            ..Default::default()
        }
    }

    /// A failure that must page someone.
    pub fn critical(message: impl Into<String>) -> Self {
        Self::new(message).with_severity(Severity::Critical)
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.status, &self.code) {
            (Some(status), _) => write!(f, "{} (status {})", self.message, status),
            (None, Some(code)) => write!(f, "{} ({})", self.message, code),
            (None, None) => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for Failure {}

impl From<anyhow::Error> for Failure {
    fn from(err: anyhow::Error) -> Self {
        // Keep a typed io::Error code if one is in the chain.
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            let mut failure = Failure::from_io(io);
            failure.message = format!("{err:#}");
            return failure;
        }
        Failure::new(format!("{err:#}"))
    }
}

impl From<std::io::Error> for Failure {
    fn from(err: std::io::Error) -> Self {
        Failure::from_io(&err)
    }
}

impl From<serde_json::Error> for Failure {
    fn from(err: serde_json::Error) -> Self {
        Failure::internal(format!("payload decode error: {err}"))
    }
}

impl Failure {
    fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind as Io;

        let code = match err.kind() {
            Io::ConnectionRefused => Some("ECONNREFUSED"),
            Io::ConnectionReset | Io::ConnectionAborted => Some("ECONNRESET"),
            Io::TimedOut => Some("ETIMEDOUT"),
            _ => None,
        };
        let failure = Failure::new(err.to_string());
        match code {
            Some(code) => failure.with_code(code),
            None => failure,
        }
    }
}

// ── Taxonomy ────────────────────────────────────────────────────────

/// What went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SystemInternal,
    RateLimit,
    Network,
    Storage,
    ModelInference,
    Authentication,
    Validation,
    Processing,
}

impl ErrorKind {
    /// Severity, retryability and retry budget for this kind.
    pub fn defaults(&self) -> (Severity, bool, u32) {
        match self {
            Self::SystemInternal => (Severity::High, false, 0),
            Self::RateLimit => (Severity::Medium, true, 5),
            Self::Network => (Severity::Medium, true, 3),
            Self::Storage => (Severity::High, true, 2),
            Self::ModelInference => (Severity::Medium, true, 3),
            Self::Authentication => (Severity::High, false, 0),
            Self::Validation => (Severity::Low, false, 0),
            Self::Processing => (Severity::Medium, true, 2),
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SystemInternal => "system_internal",
            Self::RateLimit => "rate_limit",
            Self::Network => "network",
            Self::Storage => "storage",
            Self::ModelInference => "model_inference",
            Self::Authentication => "authentication",
            Self::Validation => "validation",
            Self::Processing => "processing",
        };
        write!(f, "{s}")
    }
}

/// How bad it is. Ordered: `Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// A failure after classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind} error ({severity:?}): {message}")]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub retryable: bool,
    /// Suggested retry budget for this kind of failure.
    pub max_retries: u32,
    pub message: String,
    pub context: HashMap<String, String>,
    pub correlation_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

impl ClassifiedError {
    /// Build an error directly, bypassing the signal table.
    pub fn new(kind: ErrorKind, message: impl Into<String>, at: DateTime<Utc>) -> Self {
        let (severity, retryable, max_retries) = kind.defaults();
        Self {
            kind,
            severity,
            retryable,
            max_retries,
            message: message.into(),
            context: HashMap::new(),
            correlation_id: Uuid::new_v4(),
            timestamp: at,
        }
    }

    pub fn non_retryable(mut self) -> Self {
        self.retryable = false;
        self.max_retries = 0;
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

// ── Alerts ──────────────────────────────────────────────────────────

/// Something an operator should hear about.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Alert {
    /// A failure classified as Critical.
    CriticalError { error: ClassifiedError },
    /// A circuit breaker tripped open.
    CircuitOpened {
        resource: String,
        failure_count: u32,
        next_attempt_at: DateTime<Utc>,
    },
}

/// Receives alerts. Side effect only; never influences control flow.
pub trait AlertSink: Send + Sync {
    fn alert(&self, alert: &Alert);
}

/// Default sink: logs alerts at error level.
#[derive(Debug, Default)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn alert(&self, alert: &Alert) {
        match alert {
            Alert::CriticalError { error } => tracing::error!(
                kind = %error.kind,
                correlation_id = %error.correlation_id,
                "CRITICAL: {}",
                error.message
            ),
            Alert::CircuitOpened {
                resource,
                failure_count,
                next_attempt_at,
            } => tracing::error!(
                resource = %resource,
                failures = failure_count,
                retry_at = %next_attempt_at,
                "Circuit breaker opened"
            ),
        }
    }
}

// ── Classifier ──────────────────────────────────────────────────────

/// Maps raw failures into typed, severity-ranked errors.
pub struct ErrorClassifier {
    clock: Arc<dyn Clock>,
    alerts: Arc<dyn AlertSink>,
    storage_codes: Vec<String>,
    model_markers: Vec<String>,
}

impl ErrorClassifier {
    /// Create a classifier with the default signal lists.
    pub fn new(clock: Arc<dyn Clock>, alerts: Arc<dyn AlertSink>) -> Self {
        Self {
            clock,
            alerts,
            storage_codes: DEFAULT_STORAGE_CODES.iter().map(|s| s.to_string()).collect(),
            model_markers: DEFAULT_MODEL_MARKERS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Recognize an additional model provider name in failure messages.
    pub fn with_model_marker(mut self, marker: impl Into<String>) -> Self {
        self.model_markers.push(marker.into().to_lowercase());
        self
    }

    /// Recognize an additional storage error code.
    pub fn with_storage_code(mut self, code: impl Into<String>) -> Self {
        self.storage_codes.push(code.into());
        self
    }

    /// Determine the kind from the raw signal. Order matters: first match wins.
    pub fn kind_of(&self, failure: &Failure) -> ErrorKind {
        let message = failure.message.as_str();
        let code = failure.code.as_deref().unwrap_or_default();

        if failure.internal {
            return ErrorKind::SystemInternal;
        }
        if failure.status == Some(429) || RATE_LIMIT.is_match(message) {
            return ErrorKind::RateLimit;
        }
        if NETWORK.is_match(message) || NETWORK_CODES.contains(&code) {
            return ErrorKind::Network;
        }
        if STORAGE.is_match(message) || self.storage_codes.iter().any(|c| c == code) {
            return ErrorKind::Storage;
        }
        let lowered = message.to_lowercase();
        if self.model_markers.iter().any(|m| lowered.contains(m.as_str())) {
            return ErrorKind::ModelInference;
        }
        match failure.status {
            Some(401) | Some(403) => ErrorKind::Authentication,
            Some(400..=499) => ErrorKind::Validation,
            _ => ErrorKind::Processing,
        }
    }

    /// Classify a failure. Critical results are forwarded to the alert sink.
    pub fn classify(&self, failure: &Failure) -> ClassifiedError {
        let kind = self.kind_of(failure);
        let mut error = ClassifiedError::new(kind, failure.message.clone(), self.clock.now());
        if let Some(severity) = failure.severity {
            error.severity = severity;
        }
        error.context = failure.context.clone();
        if let Some(status) = failure.status {
            error.context.insert("status".to_string(), status.to_string());
        }
        if let Some(ref code) = failure.code {
            error.context.insert("code".to_string(), code.clone());
        }

        if error.severity == Severity::Critical {
            self.alerts.alert(&Alert::CriticalError {
                error: error.clone(),
            });
        }

        error
    }

    /// The sink used for alerts (shared with circuit breakers).
    pub fn alerts(&self) -> &Arc<dyn AlertSink> {
        &self.alerts
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock), Arc::new(TracingAlertSink))
    }
}
