//! Job system — priority queue, execution and scheduling.
//!
//! Core components:
//! - `model` — Job descriptors, payloads and the status state machine
//! - `handler` — Handler trait, job context and the per-type registry
//! - `events` — Lifecycle events for observers and persistence adapters
//! - `stats` — Historical aggregates fed by terminal events
//! - `executor` — One attempt under circuit breaker + timeout
//! - `queue` — Priority/dependency-aware dispatch with a concurrency gate
//! - `scheduler` — Recurring, cron and delayed submissions

pub mod events;
pub mod executor;
pub mod handler;
pub mod model;
pub mod queue;
pub mod scheduler;
pub mod stats;

pub use events::{JobEvent, JobEventSink};
pub use executor::{ExecutionOutcome, JobExecutor};
pub use handler::{
    FnHandler, HandlerError, HandlerRegistry, JobContext, JobHandler, ProgressReporter, handler_fn,
};
pub use model::{
    DEFAULT_JOB_TIMEOUT, ExecutionMetrics, JobDescriptor, JobPayload, JobRecord, JobStatus,
};
pub use queue::PriorityJobQueue;
pub use scheduler::{ScheduleInfo, Scheduler};
pub use stats::{QueueStats, StatsCollector};
