//! Job descriptors, payloads and the status state machine.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::resilience::classify::{ClassifiedError, Failure};

/// Default per-attempt deadline when a descriptor does not set one.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(300);

/// Opaque job input/output. Only the handler registered for the job type
/// decodes it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "encoding", content = "data", rename_all = "snake_case")]
pub enum JobPayload {
    #[default]
    Empty,
    Json(serde_json::Value),
    Bytes(Vec<u8>),
}

impl JobPayload {
    pub fn json(value: serde_json::Value) -> Self {
        Self::Json(value)
    }

    /// Serialize any value into a JSON payload.
    pub fn encode<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::Json(serde_json::to_value(value)?))
    }

    /// Decode a JSON (or JSON-bytes) payload into `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, Failure> {
        match self {
            Self::Json(value) => Ok(serde_json::from_value(value.clone())?),
            Self::Bytes(bytes) => Ok(serde_json::from_slice(bytes)?),
            Self::Empty => Err(Failure::internal("payload is empty")),
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

/// Measurements taken around one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    /// Zero-based attempt number.
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    /// Wall time spent in the handler, measured with a monotonic timer.
    pub duration: Duration,
    /// Resident memory of the process after the attempt.
    pub memory_bytes: Option<u64>,
    /// Change in resident memory across the attempt.
    pub memory_delta_bytes: Option<i64>,
}

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for its time, its dependencies or a free slot.
    Pending,
    /// A handler invocation is in flight.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with a non-retryable error or exhausted retries.
    Failed,
    /// Removed before running, or the handler honored a cancellation hint.
    Cancelled,
    /// This attempt failed and a descendant job carries the retry.
    Retrying,
}

impl JobStatus {
    /// Check if this status allows transitioning to another one.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Pending, Running) | (Pending, Cancelled) | (Pending, Failed) |
            (Running, Completed) | (Running, Failed) |
            (Running, Retrying) | (Running, Cancelled)
        )
    }

    /// Completed, Failed or Cancelled.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// No further transitions for this descriptor (terminal, or superseded
    /// by a retry).
    pub fn is_settled(&self) -> bool {
        self.is_terminal() || *self == Self::Retrying
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Retrying => "retrying",
        };
        write!(f, "{s}")
    }
}

/// A unit of work as seen by the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub id: Uuid,
    /// Routing tag; selects the handler.
    pub job_type: String,
    /// Higher dispatches first among ready jobs.
    pub priority: i32,
    pub payload: JobPayload,
    /// Zero-based attempt number of this descriptor.
    pub attempt: u32,
    /// Hard cap on attempts across the retry lineage. `None` lets the
    /// failure classification decide.
    pub max_attempts: Option<u32>,
    /// Per-attempt deadline. The queue fills in its configured default.
    pub timeout: Option<Duration>,
    /// Not ready before this instant.
    pub scheduled_at: Option<DateTime<Utc>>,
    pub dependencies: Vec<Uuid>,
    pub status: JobStatus,
    pub result: Option<JobPayload>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// 0.0..=1.0 as last reported by the handler.
    pub progress: f32,
    pub message: Option<String>,
    pub last_error: Option<ClassifiedError>,
    /// Measurements of this descriptor's attempt, once it has run.
    pub metrics: Option<ExecutionMetrics>,
    /// The attempt this descriptor retries.
    pub retry_of: Option<Uuid>,
    /// The descendant that retries this attempt.
    pub retried_as: Option<Uuid>,
    /// Schedule key that produced this job, if any.
    pub origin: Option<String>,
}

impl JobDescriptor {
    /// Create a new pending job.
    pub fn new(job_type: impl Into<String>, payload: JobPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type: job_type.into(),
            priority: 0,
            payload,
            attempt: 0,
            max_attempts: None,
            timeout: None,
            scheduled_at: None,
            dependencies: Vec::new(),
            status: JobStatus::Pending,
            result: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            progress: 0.0,
            message: None,
            last_error: None,
            metrics: None,
            retry_of: None,
            retried_as: None,
            origin: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Allow `retries` retries after the first attempt.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_attempts = Some(retries.saturating_add(1));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn depends_on(mut self, id: Uuid) -> Self {
        if !self.dependencies.contains(&id) {
            self.dependencies.push(id);
        }
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn effective_timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_JOB_TIMEOUT)
    }

    /// Instant used for ordering: `scheduled_at`, or creation time.
    pub fn effective_at(&self) -> DateTime<Utc> {
        self.scheduled_at.unwrap_or(self.created_at)
    }

    /// Whether `self` must sit ahead of `other` in the waiting list.
    pub fn outranks(&self, other: &JobDescriptor) -> bool {
        self.priority > other.priority
            || (self.priority == other.priority && self.effective_at() < other.effective_at())
    }

    /// Attempts made so far, counting the one this descriptor represents
    /// once it has started.
    pub fn attempts_made(&self) -> u32 {
        self.attempt + 1
    }

    /// Move to `target`, stamping timestamps.
    pub fn transition_to(&mut self, target: JobStatus, at: DateTime<Utc>) -> Result<(), String> {
        if !self.status.can_transition_to(target) {
            return Err(format!("Cannot transition from {} to {}", self.status, target));
        }
        self.status = target;
        match target {
            JobStatus::Running => self.started_at = Some(at),
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
            | JobStatus::Retrying => self.completed_at = Some(at),
            JobStatus::Pending => {}
        }
        Ok(())
    }

    /// Build the descendant that retries this attempt.
    pub fn retry_descendant(&self, scheduled_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type: self.job_type.clone(),
            priority: self.priority,
            payload: self.payload.clone(),
            attempt: self.attempt + 1,
            max_attempts: self.max_attempts,
            timeout: self.timeout,
            scheduled_at: Some(scheduled_at),
            dependencies: self.dependencies.clone(),
            status: JobStatus::Pending,
            result: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            progress: 0.0,
            message: None,
            last_error: self.last_error.clone(),
            metrics: None,
            retry_of: Some(self.id),
            retried_as: None,
            origin: self.origin.clone(),
        }
    }

    /// Status-record view for external persistence.
    pub fn record(&self) -> JobRecord {
        JobRecord {
            id: self.id,
            job_type: self.job_type.clone(),
            status: self.status,
            progress: self.progress,
            message: self.message.clone(),
            error: self.last_error.clone(),
            attempt: self.attempts_made(),
            started_at: self.started_at,
            completed_at: self.completed_at,
            result: self.result.clone(),
            metrics: self.metrics.clone(),
            retry_of: self.retry_of,
            retried_as: self.retried_as,
        }
    }
}

/// The shape external stores persist for each job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub job_type: String,
    pub status: JobStatus,
    pub progress: f32,
    pub message: Option<String>,
    pub error: Option<ClassifiedError>,
    /// One-based attempt number.
    pub attempt: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<JobPayload>,
    #[serde(default)]
    pub metrics: Option<ExecutionMetrics>,
    pub retry_of: Option<Uuid>,
    pub retried_as: Option<Uuid>,
}

impl JobRecord {
    /// Measured attempt duration, or the time between start and
    /// settlement when the attempt was never measured.
    pub fn processing_time(&self) -> Option<Duration> {
        if let Some(metrics) = &self.metrics {
            return Some(metrics.duration);
        }
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => end.signed_duration_since(start).to_std().ok(),
            _ => None,
        }
    }
}
