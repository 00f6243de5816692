//! jobgate — async job scheduling with classified retries and circuit breakers.

pub mod clock;
pub mod config;
pub mod error;
pub mod jobs;
pub mod resilience;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SchedulerConfig;
pub use error::{ConfigError, Error, JobError, Result};
