//! Lifecycle events emitted by the queue.
//!
//! Synchronous observers implement [`JobEventSink`] and see every event in
//! order; async consumers such as persistence adapters subscribe to the
//! queue's broadcast channel instead.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::jobs::model::{JobRecord, JobStatus};
use crate::resilience::classify::ClassifiedError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    /// Job accepted into the waiting list.
    Enqueued { record: JobRecord },
    /// A handler invocation started.
    Started { record: JobRecord },
    /// The handler reported progress.
    Progress {
        job_id: Uuid,
        progress: f32,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Job completed successfully.
    Completed { record: JobRecord },
    /// Job failed for good.
    Failed {
        record: JobRecord,
        error: ClassifiedError,
    },
    /// The attempt failed and a descendant job will retry it.
    Retrying {
        record: JobRecord,
        retry_id: Uuid,
        delay: Duration,
    },
    /// Job cancelled.
    Cancelled { record: JobRecord },
    /// A running job was asked to stop.
    CancelRequested { job_id: Uuid },
    /// Pending longer than the stuck threshold on dependencies that may
    /// still complete.
    Stuck {
        job_id: Uuid,
        waiting_on: Vec<Uuid>,
        pending_for: Duration,
    },
    /// A dependency can never complete.
    Starved {
        job_id: Uuid,
        dependency: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        dependency_status: Option<JobStatus>,
    },
}

impl JobEvent {
    /// Get the job ID from any variant.
    pub fn job_id(&self) -> Uuid {
        match self {
            Self::Enqueued { record }
            | Self::Started { record }
            | Self::Completed { record }
            | Self::Failed { record, .. }
            | Self::Retrying { record, .. }
            | Self::Cancelled { record } => record.id,
            Self::Progress { job_id, .. }
            | Self::CancelRequested { job_id }
            | Self::Stuck { job_id, .. }
            | Self::Starved { job_id, .. } => *job_id,
        }
    }

    /// Completed, Failed or Cancelled.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Failed { .. } | Self::Cancelled { .. }
        )
    }
}

/// Synchronous observer of every lifecycle event.
pub trait JobEventSink: Send + Sync {
    fn on_event(&self, event: &JobEvent);
}
