//! Error types for jobgate.

use uuid::Uuid;

/// Top-level error type for the scheduler.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Job submission and lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Job {id} already exists")]
    DuplicateId { id: Uuid },

    #[error("Job {id} depends on unknown job {dependency}")]
    UnknownDependency { id: Uuid, dependency: Uuid },

    #[error("Job {id} depends on itself")]
    SelfDependency { id: Uuid },

    #[error("Job {id} depends on job {dependency} which ended as {status}")]
    DependencyFailed {
        id: Uuid,
        dependency: Uuid,
        status: String,
    },

    #[error("Job {id} already in state {state}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        state: String,
        target: String,
    },

    #[error("Schedule {key} already registered")]
    DuplicateSchedule { key: String },

    #[error("Invalid schedule {key}: {reason}")]
    InvalidSchedule { key: String, reason: String },

    #[error("{component} is already running")]
    AlreadyRunning { component: String },
}

/// Result type alias for the scheduler.
pub type Result<T> = std::result::Result<T, Error>;
