//! Recurring and delayed submissions layered on the queue.
//!
//! Recurring entries carry an explicit next-fire instant checked against the
//! injected clock on every [`Scheduler::tick`]; the background loop just calls
//! `tick` periodically.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, after};
use crate::error::JobError;
use crate::jobs::model::{JobDescriptor, JobPayload};
use crate::jobs::queue::PriorityJobQueue;

#[derive(Debug, Clone)]
enum Recurrence {
    Every(Duration),
    Cron(Box<cron::Schedule>),
}

impl Recurrence {
    fn next_after(&self, previous: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Every(interval) => {
                let next = after(previous, *interval);
                // Missed fires are skipped, not replayed.
                Some(if next <= now { after(now, *interval) } else { next })
            }
            Self::Cron(schedule) => schedule.after(&now).next(),
        }
    }
}

#[derive(Debug, Clone)]
struct ScheduleEntry {
    job_type: String,
    payload: JobPayload,
    priority: i32,
    recurrence: Recurrence,
    next_fire_at: Option<DateTime<Utc>>,
    fired: u64,
    last_job: Option<Uuid>,
}

impl ScheduleEntry {
    fn job(&self, key: &str) -> JobDescriptor {
        JobDescriptor::new(self.job_type.clone(), self.payload.clone())
            .with_priority(self.priority)
            .with_origin(key)
    }
}

/// Public view of one recurring schedule.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleInfo {
    pub key: String,
    pub job_type: String,
    pub priority: i32,
    pub next_fire_at: Option<DateTime<Utc>>,
    pub fired: u64,
    pub last_job: Option<Uuid>,
}

struct TickLoop {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

struct SchedulerInner {
    queue: PriorityJobQueue,
    clock: Arc<dyn Clock>,
    tick_interval: Duration,
    entries: Mutex<HashMap<String, ScheduleEntry>>,
    tick_loop: std::sync::Mutex<Option<TickLoop>>,
}

/// Recurring and delayed job submission.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Scheduler over `queue`, using the queue's clock. `tick_interval` is
    /// the resolution of the background loop.
    pub fn new(queue: PriorityJobQueue, tick_interval: Duration) -> Self {
        let clock = queue.clock().clone();
        Self {
            inner: Arc::new(SchedulerInner {
                queue,
                clock,
                tick_interval: tick_interval.max(Duration::from_millis(1)),
                entries: Mutex::new(HashMap::new()),
                tick_loop: std::sync::Mutex::new(None),
            }),
        }
    }

    pub fn queue(&self) -> &PriorityJobQueue {
        &self.inner.queue
    }

    /// Enqueue a job now and again every `interval` until unscheduled.
    /// Returns the id of the first job.
    pub async fn schedule_recurring(
        &self,
        key: impl Into<String>,
        job_type: impl Into<String>,
        payload: JobPayload,
        interval: Duration,
        priority: i32,
    ) -> Result<Uuid, JobError> {
        let key = key.into();
        if interval.is_zero() {
            return Err(JobError::InvalidSchedule {
                key,
                reason: "interval must be greater than zero".to_string(),
            });
        }

        let mut entries = self.inner.entries.lock().await;
        if entries.contains_key(&key) {
            return Err(JobError::DuplicateSchedule { key });
        }

        let now = self.inner.clock.now();
        let mut entry = ScheduleEntry {
            job_type: job_type.into(),
            payload,
            priority,
            recurrence: Recurrence::Every(interval),
            next_fire_at: Some(after(now, interval)),
            fired: 0,
            last_job: None,
        };
        let id = self.inner.queue.enqueue(entry.job(&key)).await?;
        entry.fired = 1;
        entry.last_job = Some(id);

        info!(schedule = %key, interval_ms = interval.as_millis() as u64, "Recurring job scheduled");
        entries.insert(key, entry);
        Ok(id)
    }

    /// Recur on a cron expression (seconds field first). Nothing is enqueued
    /// until the first fire time.
    pub async fn schedule_cron(
        &self,
        key: impl Into<String>,
        job_type: impl Into<String>,
        payload: JobPayload,
        expression: &str,
        priority: i32,
    ) -> Result<DateTime<Utc>, JobError> {
        let key = key.into();
        let schedule = cron::Schedule::from_str(expression).map_err(|e| JobError::InvalidSchedule {
            key: key.clone(),
            reason: format!("invalid cron: {e}"),
        })?;

        let mut entries = self.inner.entries.lock().await;
        if entries.contains_key(&key) {
            return Err(JobError::DuplicateSchedule { key });
        }

        let now = self.inner.clock.now();
        let Some(first) = schedule.after(&now).next() else {
            return Err(JobError::InvalidSchedule {
                key,
                reason: "cron expression never fires".to_string(),
            });
        };

        info!(schedule = %key, cron = %expression, next = %first, "Cron job scheduled");
        entries.insert(
            key,
            ScheduleEntry {
                job_type: job_type.into(),
                payload,
                priority,
                recurrence: Recurrence::Cron(Box::new(schedule)),
                next_fire_at: Some(first),
                fired: 0,
                last_job: None,
            },
        );
        Ok(first)
    }

    /// Enqueue a single job that becomes ready after `delay`.
    pub async fn schedule_delayed(
        &self,
        key: impl Into<String>,
        job_type: impl Into<String>,
        payload: JobPayload,
        delay: Duration,
        priority: i32,
    ) -> Result<Uuid, JobError> {
        let key = key.into();
        let at = after(self.inner.clock.now(), delay);
        let job = JobDescriptor::new(job_type, payload)
            .with_priority(priority)
            .scheduled_at(at)
            .with_origin(key.as_str());
        let id = self.inner.queue.enqueue(job).await?;
        debug!(schedule = %key, job_id = %id, at = %at, "Delayed job scheduled");
        Ok(id)
    }

    /// Stop a recurring schedule. Jobs it already enqueued are unaffected.
    pub async fn unschedule(&self, key: &str) -> bool {
        let removed = self.inner.entries.lock().await.remove(key).is_some();
        if removed {
            info!(schedule = %key, "Schedule removed");
        }
        removed
    }

    /// Recurring schedules, sorted by key.
    pub async fn schedules(&self) -> Vec<ScheduleInfo> {
        let entries = self.inner.entries.lock().await;
        let mut all: Vec<ScheduleInfo> = entries
            .iter()
            .map(|(key, entry)| ScheduleInfo {
                key: key.clone(),
                job_type: entry.job_type.clone(),
                priority: entry.priority,
                next_fire_at: entry.next_fire_at,
                fired: entry.fired,
                last_job: entry.last_job,
            })
            .collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    /// Enqueue a fresh job for every due schedule. Returns the ids enqueued.
    pub async fn tick(&self) -> Vec<Uuid> {
        self.inner.tick().await
    }

    /// Spawn the background tick loop.
    pub fn start(&self) -> Result<(), JobError> {
        let mut slot = self
            .inner
            .tick_loop
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return Err(JobError::AlreadyRunning {
                component: format!("scheduler for {}", self.inner.queue.name()),
            });
        }

        let (shutdown, mut shutdown_rx) = oneshot::channel();
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(inner.tick_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = interval.tick() => {
                        inner.tick().await;
                    }
                }
            }
            debug!("Scheduler tick loop stopped");
        });
        *slot = Some(TickLoop { shutdown, handle });
        info!(queue = %self.inner.queue.name(), "Scheduler started");
        Ok(())
    }

    /// Stop the background loop. Returns false if it was not running.
    pub async fn stop(&self) -> bool {
        let running = self
            .inner
            .tick_loop
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(TickLoop { shutdown, handle }) = running else {
            return false;
        };
        let _ = shutdown.send(());
        if let Err(e) = handle.await {
            error!("Scheduler loop ended abnormally: {e}");
        }
        info!(queue = %self.inner.queue.name(), "Scheduler stopped");
        true
    }
}

impl SchedulerInner {
    async fn tick(&self) -> Vec<Uuid> {
        let mut entries = self.entries.lock().await;
        let now = self.clock.now();
        let mut enqueued = Vec::new();

        for (key, entry) in entries.iter_mut() {
            let Some(due) = entry.next_fire_at else {
                continue;
            };
            if due > now {
                continue;
            }

            match self.queue.enqueue(entry.job(key)).await {
                Ok(id) => {
                    debug!(schedule = %key, job_id = %id, "Recurring job fired");
                    entry.fired += 1;
                    entry.last_job = Some(id);
                    enqueued.push(id);
                }
                Err(e) => warn!(schedule = %key, "Failed to enqueue recurring job: {e}"),
            }
            entry.next_fire_at = entry.recurrence.next_after(due, now);
        }
        enqueued
    }
}
