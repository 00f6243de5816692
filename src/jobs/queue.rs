//! Priority job queue with dependency readiness and a concurrency gate.
//!
//! All queue state (waiting order, running set, descriptors) lives behind one
//! async mutex; every mutation goes through it. Handler invocations run on
//! spawned tasks and report back through the same lock, so the dispatch loop
//! never waits on handler work.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify, broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, after, elapsed_between};
use crate::config::SchedulerConfig;
use crate::error::JobError;
use crate::jobs::events::{JobEvent, JobEventSink};
use crate::jobs::executor::{ExecutionOutcome, JobExecutor};
use crate::jobs::handler::{HandlerRegistry, JobContext, ProgressReporter};
use crate::jobs::model::{JobDescriptor, JobRecord, JobStatus};
use crate::jobs::stats::{QueueStats, StatsCollector};
use crate::resilience::circuit::CircuitBreakerRegistry;
use crate::resilience::classify::{ClassifiedError, ErrorClassifier, ErrorKind, TracingAlertSink};

#[derive(Default)]
struct QueueState {
    /// Pending ids, highest rank first.
    waiting: Vec<Uuid>,
    running: HashSet<Uuid>,
    jobs: HashMap<Uuid, JobDescriptor>,
    cancel_flags: HashMap<Uuid, Arc<AtomicBool>>,
    /// Settled ids in settlement order, for pruning.
    settled: VecDeque<Uuid>,
    stuck_reported: HashSet<Uuid>,
    starved_reported: HashSet<Uuid>,
}

impl QueueState {
    /// Newest descriptor in the retry lineage starting at `id`.
    fn latest(&self, id: Uuid) -> Option<&JobDescriptor> {
        let mut job = self.jobs.get(&id)?;
        while let Some(next) = job.retried_as {
            match self.jobs.get(&next) {
                Some(descendant) => job = descendant,
                None => break,
            }
        }
        Some(job)
    }

    fn dependency_status(&self, id: Uuid) -> Option<JobStatus> {
        self.latest(id).map(|job| job.status)
    }

    fn is_ready(&self, job: &JobDescriptor, now: DateTime<Utc>) -> bool {
        job.scheduled_at.is_none_or(|at| at <= now)
            && job
                .dependencies
                .iter()
                .all(|dep| self.dependency_status(*dep) == Some(JobStatus::Completed))
    }

    /// Insert before the first entry the job outranks, after all equals.
    fn insert_waiting(&mut self, job: JobDescriptor) {
        let position = self
            .waiting
            .iter()
            .position(|id| self.jobs.get(id).is_some_and(|other| job.outranks(other)))
            .unwrap_or(self.waiting.len());
        self.waiting.insert(position, job.id);
        self.jobs.insert(job.id, job);
    }

    fn mark_settled(&mut self, id: Uuid) {
        self.settled.push_back(id);
        self.stuck_reported.remove(&id);
        self.starved_reported.remove(&id);
    }

    /// Drop the oldest settled records beyond `keep`. Records a pending job
    /// may still resolve through are never dropped.
    fn prune(&mut self, keep: usize) -> usize {
        if self.settled.len() <= keep {
            return 0;
        }

        let mut protected = HashSet::new();
        for job in self.jobs.values().filter(|j| !j.status.is_settled()) {
            // Ancestors, so lookups by the original id keep working.
            let mut cursor = job.retry_of;
            while let Some(id) = cursor {
                if !protected.insert(id) {
                    break;
                }
                cursor = self.jobs.get(&id).and_then(|j| j.retry_of);
            }
            for dep in &job.dependencies {
                let mut cursor = Some(*dep);
                while let Some(id) = cursor {
                    if !protected.insert(id) {
                        break;
                    }
                    cursor = self.jobs.get(&id).and_then(|j| j.retried_as);
                }
            }
        }

        let excess = self.settled.len() - keep;
        let mut removed = 0;
        let mut kept = VecDeque::with_capacity(keep);
        while let Some(id) = self.settled.pop_front() {
            if removed < excess && !protected.contains(&id) {
                self.jobs.remove(&id);
                removed += 1;
            } else {
                kept.push_back(id);
            }
        }
        self.settled = kept;
        removed
    }
}

struct LoopHandle {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

struct QueueInner {
    name: String,
    concurrency_limit: usize,
    sweep_interval: Duration,
    default_timeout: Duration,
    stuck_threshold: Duration,
    fail_starved_jobs: bool,
    retained_records: usize,
    executor: Arc<JobExecutor>,
    clock: Arc<dyn Clock>,
    state: Mutex<QueueState>,
    wake: Notify,
    events: broadcast::Sender<JobEvent>,
    sinks: RwLock<Vec<Arc<dyn JobEventSink>>>,
    stats: Arc<StatsCollector>,
    dispatch_loop: std::sync::Mutex<Option<LoopHandle>>,
}

/// Concurrency-bounded, priority- and dependency-aware job queue.
///
/// Cheap to clone; clones share the same queue.
#[derive(Clone)]
pub struct PriorityJobQueue {
    inner: Arc<QueueInner>,
}

impl PriorityJobQueue {
    pub fn new(config: &SchedulerConfig, executor: Arc<JobExecutor>, clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let stats = Arc::new(StatsCollector::new(clock.clone()));
        let sinks: Vec<Arc<dyn JobEventSink>> = vec![stats.clone()];
        Self {
            inner: Arc::new(QueueInner {
                name: config.name.clone(),
                concurrency_limit: config.concurrency_limit.max(1),
                sweep_interval: config.sweep_interval,
                default_timeout: config.default_timeout,
                stuck_threshold: config.stuck_threshold,
                fail_starved_jobs: config.fail_starved_jobs,
                retained_records: config.retained_records,
                executor,
                clock,
                state: Mutex::new(QueueState::default()),
                wake: Notify::new(),
                events,
                sinks: RwLock::new(sinks),
                stats,
                dispatch_loop: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Queue with a full executor stack (classifier, breakers with the
    /// configured defaults, tracing alerts) around `handlers`.
    pub fn with_handlers(
        config: &SchedulerConfig,
        handlers: Arc<HandlerRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let alerts = Arc::new(TracingAlertSink);
        let classifier = ErrorClassifier::new(clock.clone(), alerts.clone());
        let breakers = CircuitBreakerRegistry::new(config.breaker.clone(), clock.clone(), alerts);
        let executor = JobExecutor::new(
            handlers,
            Arc::new(breakers),
            Arc::new(classifier),
            config.retry.clone(),
            clock.clone(),
        )
        .with_memory_capture(config.capture_memory);
        Self::new(config, Arc::new(executor), clock)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn executor(&self) -> &Arc<JobExecutor> {
        &self.inner.executor
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    /// Submit a job. Returns its id.
    ///
    /// Rejects duplicate ids and dependencies that are unknown, self-referencing
    /// or already failed/cancelled.
    pub async fn enqueue(&self, mut job: JobDescriptor) -> Result<Uuid, JobError> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        let id = job.id;

        if state.jobs.contains_key(&id) {
            return Err(JobError::DuplicateId { id });
        }
        if job.status != JobStatus::Pending {
            return Err(JobError::InvalidTransition {
                id,
                state: job.status.to_string(),
                target: JobStatus::Pending.to_string(),
            });
        }
        for &dependency in &job.dependencies {
            if dependency == id {
                return Err(JobError::SelfDependency { id });
            }
            match state.dependency_status(dependency) {
                None => return Err(JobError::UnknownDependency { id, dependency }),
                Some(status @ (JobStatus::Failed | JobStatus::Cancelled)) => {
                    return Err(JobError::DependencyFailed {
                        id,
                        dependency,
                        status: status.to_string(),
                    });
                }
                Some(_) => {}
            }
        }

        job.created_at = inner.clock.now();
        if job.timeout.is_none() {
            job.timeout = Some(inner.default_timeout);
        }
        debug!(
            job_id = %id,
            job_type = %job.job_type,
            priority = job.priority,
            "Job enqueued"
        );
        let record = job.record();
        state.insert_waiting(job);
        inner.emit(JobEvent::Enqueued { record });
        drop(state);

        inner.wake.notify_one();
        Ok(id)
    }

    /// Same as [`enqueue`](Self::enqueue).
    pub async fn add(&self, job: JobDescriptor) -> Result<Uuid, JobError> {
        self.enqueue(job).await
    }

    /// Cancel a job (following its retry lineage).
    ///
    /// A pending job is removed and marked Cancelled. A running job only
    /// receives the cooperative hint. Returns false when there was nothing
    /// left to cancel.
    pub async fn cancel(&self, id: Uuid) -> bool {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        let Some(latest) = state.latest(id) else {
            return false;
        };
        let (target, status) = (latest.id, latest.status);

        match status {
            JobStatus::Pending => {
                let now = inner.clock.now();
                state.waiting.retain(|w| *w != target);
                let Some(job) = state.jobs.get_mut(&target) else {
                    return false;
                };
                if let Err(e) = job.transition_to(JobStatus::Cancelled, now) {
                    warn!(job_id = %target, "{e}");
                    return false;
                }
                let record = job.record();
                state.mark_settled(target);
                info!(job_id = %target, "Job cancelled");
                inner.emit(JobEvent::Cancelled { record });
                true
            }
            JobStatus::Running => {
                let Some(flag) = state.cancel_flags.get(&target) else {
                    return false;
                };
                if flag.swap(true, Ordering::AcqRel) {
                    return false;
                }
                info!(job_id = %target, "Cancellation requested for running job");
                inner.emit(JobEvent::CancelRequested { job_id: target });
                true
            }
            _ => false,
        }
    }

    /// Live counts plus historical aggregates.
    pub async fn stats(&self) -> QueueStats {
        let state = self.inner.state.lock().await;
        let mut stats = QueueStats {
            pending: state.waiting.len(),
            running: state.running.len(),
            ..QueueStats::default()
        };
        drop(state);
        self.inner.stats.fill(&mut stats);
        stats
    }

    /// Snapshot of one descriptor.
    pub async fn get(&self, id: Uuid) -> Option<JobDescriptor> {
        self.inner.state.lock().await.jobs.get(&id).cloned()
    }

    /// Status of one descriptor (not following retries).
    pub async fn status(&self, id: Uuid) -> Option<JobStatus> {
        self.inner.state.lock().await.jobs.get(&id).map(|j| j.status)
    }

    /// Record of the newest attempt in the lineage of `id`.
    pub async fn record(&self, id: Uuid) -> Option<JobRecord> {
        self.inner.state.lock().await.latest(id).map(|j| j.record())
    }

    /// Every retained attempt in the lineage of `id`, oldest first.
    pub async fn lineage(&self, id: Uuid) -> Vec<JobRecord> {
        let state = self.inner.state.lock().await;
        let mut root = id;
        while let Some(parent) = state.jobs.get(&root).and_then(|j| j.retry_of) {
            if !state.jobs.contains_key(&parent) {
                break;
            }
            root = parent;
        }

        let mut records = Vec::new();
        let mut cursor = Some(root);
        while let Some(current) = cursor {
            let Some(job) = state.jobs.get(&current) else {
                break;
            };
            records.push(job.record());
            cursor = job.retried_as;
        }
        records
    }

    /// Number of retained descriptors (pending, running and settled).
    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Wait until the lineage of `id` reaches a terminal status.
    pub async fn wait_for(&self, id: Uuid) -> Result<JobRecord, JobError> {
        let mut events = self.inner.events.subscribe();
        loop {
            {
                let state = self.inner.state.lock().await;
                let latest = state.latest(id).ok_or(JobError::NotFound { id })?;
                if latest.status.is_terminal() {
                    return Ok(latest.record());
                }
            }
            match events.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return Err(JobError::NotFound { id }),
            }
        }
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    /// Lifecycle events as a stream.
    pub fn event_stream(&self) -> BroadcastStream<JobEvent> {
        BroadcastStream::new(self.subscribe())
    }

    /// Register a synchronous observer.
    pub fn add_sink(&self, sink: Arc<dyn JobEventSink>) {
        self.inner
            .sinks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(sink);
    }

    /// Start every ready job that fits under the concurrency limit.
    /// Returns the ids started.
    pub async fn dispatch(&self) -> Vec<Uuid> {
        self.inner.dispatch().await.0
    }

    /// Stuck and starvation detection, then record pruning.
    pub async fn sweep(&self) {
        self.inner.sweep().await;
    }

    /// Drop the oldest settled records beyond `keep`. Returns how many were
    /// removed.
    pub async fn prune(&self, keep: usize) -> usize {
        self.inner.state.lock().await.prune(keep)
    }

    /// Spawn the dispatch loop.
    pub fn start(&self) -> Result<(), JobError> {
        let mut slot = self
            .inner
            .dispatch_loop
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return Err(JobError::AlreadyRunning {
                component: format!("job queue {}", self.inner.name),
            });
        }

        let (shutdown, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(self.inner.clone().run(shutdown_rx));
        *slot = Some(LoopHandle { shutdown, handle });
        Ok(())
    }

    /// Stop the dispatch loop. Jobs already running finish on their own.
    /// Returns false if the loop was not running.
    pub async fn stop(&self) -> bool {
        let running = self
            .inner
            .dispatch_loop
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(LoopHandle { shutdown, handle }) = running else {
            return false;
        };
        let _ = shutdown.send(());
        if let Err(e) = handle.await {
            error!(queue = %self.inner.name, "Dispatch loop ended abnormally: {e}");
        }
        true
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .dispatch_loop
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

impl QueueInner {
    fn emit(&self, event: JobEvent) {
        for sink in self.sinks.read().unwrap_or_else(|e| e.into_inner()).iter() {
            sink.on_event(&event);
        }
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn run(self: Arc<Self>, mut shutdown: oneshot::Receiver<()>) {
        info!(
            queue = %self.name,
            concurrency = self.concurrency_limit,
            "Job queue started"
        );
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut next_due: Option<Duration> = None;

        loop {
            let due = async move {
                match next_due {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = &mut shutdown => break,
                _ = self.wake.notified() => {}
                _ = sweep.tick() => self.sweep().await,
                _ = due => {}
            }
            next_due = self.dispatch().await.1;
        }

        info!(queue = %self.name, "Job queue stopped");
    }

    /// Start ready jobs; also returns how long until the next scheduled job
    /// becomes due.
    async fn dispatch(self: &Arc<Self>) -> (Vec<Uuid>, Option<Duration>) {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        let mut started = Vec::new();

        while state.running.len() < self.concurrency_limit {
            let next = state
                .waiting
                .iter()
                .position(|id| state.jobs.get(id).is_some_and(|job| state.is_ready(job, now)));
            let Some(position) = next else {
                break;
            };
            let id = state.waiting.remove(position);
            let Some(job) = state.jobs.get_mut(&id) else {
                continue;
            };
            if let Err(e) = job.transition_to(JobStatus::Running, now) {
                warn!(job_id = %id, "{e}");
                continue;
            }
            let snapshot = job.clone();
            let flag = Arc::new(AtomicBool::new(false));
            state.cancel_flags.insert(id, flag.clone());
            state.running.insert(id);
            state.stuck_reported.remove(&id);

            debug!(
                job_id = %id,
                job_type = %snapshot.job_type,
                attempt = snapshot.attempt,
                running = state.running.len(),
                "Dispatching job"
            );
            self.emit(JobEvent::Started {
                record: snapshot.record(),
            });
            tokio::spawn(self.clone().run_job(snapshot, flag));
            started.push(id);
        }

        let next_due = state
            .waiting
            .iter()
            .filter_map(|id| state.jobs.get(id)?.scheduled_at)
            .filter(|at| *at > now)
            .min()
            .map(|at| elapsed_between(now, at));
        (started, next_due)
    }

    async fn run_job(self: Arc<Self>, job: JobDescriptor, cancel_flag: Arc<AtomicBool>) {
        let ctx = JobContext::new(job.id, job.job_type.clone(), job.attempt)
            .with_cancel_flag(cancel_flag)
            .with_reporter(self.clone());
        let outcome = self.executor.execute(&job, ctx).await;
        let retry_delay = self.executor.plan_retry(&job, &outcome);
        self.finish(job.id, outcome, retry_delay).await;
        self.wake.notify_one();
    }

    async fn finish(&self, id: Uuid, outcome: ExecutionOutcome, retry_delay: Option<Duration>) {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        state.running.remove(&id);
        let cancel_requested = state
            .cancel_flags
            .remove(&id)
            .is_some_and(|flag| flag.load(Ordering::Acquire));

        let Some(job) = state.jobs.get_mut(&id) else {
            warn!(job_id = %id, "Finished job missing from queue");
            return;
        };
        let metrics = outcome.metrics().clone();
        if let Some(delta) = metrics.memory_delta_bytes {
            debug!(
                job_id = %id,
                memory_bytes = ?metrics.memory_bytes,
                memory_delta_bytes = delta,
                "Attempt memory"
            );
        }
        let duration = metrics.duration;
        job.metrics = Some(metrics);

        let (event, retry) = match outcome {
            ExecutionOutcome::Succeeded { result, .. } => {
                job.result = Some(result);
                job.progress = 1.0;
                if let Err(e) = job.transition_to(JobStatus::Completed, now) {
                    warn!(job_id = %id, "{e}");
                }
                info!(
                    job_id = %id,
                    job_type = %job.job_type,
                    attempt = job.attempts_made(),
                    duration_ms = duration.as_millis() as u64,
                    "Job completed"
                );
                (JobEvent::Completed { record: job.record() }, None)
            }
            ExecutionOutcome::Cancelled { .. } => {
                if let Err(e) = job.transition_to(JobStatus::Cancelled, now) {
                    warn!(job_id = %id, "{e}");
                }
                info!(job_id = %id, "Job stopped after cancellation");
                (JobEvent::Cancelled { record: job.record() }, None)
            }
            ExecutionOutcome::Failed { error, .. } | ExecutionOutcome::Rejected { error, .. } => {
                job.last_error = Some(error.clone());
                match retry_delay.filter(|_| !cancel_requested) {
                    Some(delay) => {
                        let descendant = job.retry_descendant(after(now, delay), now);
                        let retry_id = descendant.id;
                        job.retried_as = Some(retry_id);
                        if let Err(e) = job.transition_to(JobStatus::Retrying, now) {
                            warn!(job_id = %id, "{e}");
                        }
                        warn!(
                            job_id = %id,
                            retry_id = %retry_id,
                            job_type = %job.job_type,
                            attempt = job.attempts_made(),
                            kind = %error.kind,
                            delay_ms = delay.as_millis() as u64,
                            "Job attempt failed, retrying: {}",
                            error.message
                        );
                        let event = JobEvent::Retrying {
                            record: job.record(),
                            retry_id,
                            delay,
                        };
                        (event, Some(descendant))
                    }
                    None => {
                        if let Err(e) = job.transition_to(JobStatus::Failed, now) {
                            warn!(job_id = %id, "{e}");
                        }
                        error!(
                            job_id = %id,
                            job_type = %job.job_type,
                            attempt = job.attempts_made(),
                            kind = %error.kind,
                            severity = ?error.severity,
                            "Job failed: {}",
                            error.message
                        );
                        let event = JobEvent::Failed {
                            record: job.record(),
                            error,
                        };
                        (event, None)
                    }
                }
            }
        };

        state.mark_settled(id);
        self.emit(event);
        if let Some(descendant) = retry {
            let record = descendant.record();
            state.insert_waiting(descendant);
            self.emit(JobEvent::Enqueued { record });
        }
    }

    async fn sweep(&self) {
        let mut state = self.state.lock().await;
        let now = self.clock.now();

        let mut starved = Vec::new();
        let mut stuck = Vec::new();
        for id in &state.waiting {
            let Some(job) = state.jobs.get(id) else {
                continue;
            };
            if job.dependencies.is_empty() {
                continue;
            }
            let pending_for = elapsed_between(job.created_at, now);
            let dead = job.dependencies.iter().find_map(|dep| {
                match state.dependency_status(*dep) {
                    None => Some((*dep, None)),
                    Some(status @ (JobStatus::Failed | JobStatus::Cancelled)) => {
                        Some((*dep, Some(status)))
                    }
                    Some(_) => None,
                }
            });
            match dead {
                Some((dependency, status)) => starved.push((*id, dependency, status, pending_for)),
                None if pending_for >= self.stuck_threshold => {
                    let waiting_on = job
                        .dependencies
                        .iter()
                        .copied()
                        .filter(|dep| state.dependency_status(*dep) != Some(JobStatus::Completed))
                        .collect::<Vec<_>>();
                    stuck.push((*id, waiting_on, pending_for));
                }
                None => {}
            }
        }

        for (id, waiting_on, pending_for) in stuck {
            if waiting_on.is_empty() || !state.stuck_reported.insert(id) {
                continue;
            }
            warn!(
                job_id = %id,
                pending_secs = pending_for.as_secs(),
                "Job stuck waiting on dependencies"
            );
            self.emit(JobEvent::Stuck {
                job_id: id,
                waiting_on,
                pending_for,
            });
        }

        for (id, dependency, status, pending_for) in starved {
            if state.starved_reported.insert(id) {
                warn!(
                    job_id = %id,
                    dependency = %dependency,
                    "Job can never become ready"
                );
                self.emit(JobEvent::Starved {
                    job_id: id,
                    dependency,
                    dependency_status: status,
                });
            }
            if self.fail_starved_jobs && pending_for >= self.stuck_threshold {
                self.fail_starved(&mut state, id, dependency, status, now);
            }
        }

        let pruned = state.prune(self.retained_records);
        if pruned > 0 {
            debug!(queue = %self.name, pruned, "Pruned settled job records");
        }
        drop(state);
        self.wake.notify_one();
    }

    fn fail_starved(
        &self,
        state: &mut QueueState,
        id: Uuid,
        dependency: Uuid,
        status: Option<JobStatus>,
        now: DateTime<Utc>,
    ) {
        let ended = status.map_or_else(|| "missing".to_string(), |s| s.to_string());
        let error = ClassifiedError::new(
            ErrorKind::Processing,
            format!("dependency {dependency} ended as {ended}"),
            now,
        )
        .non_retryable()
        .with_context("dependency", dependency.to_string());

        state.waiting.retain(|w| *w != id);
        let Some(job) = state.jobs.get_mut(&id) else {
            return;
        };
        job.last_error = Some(error.clone());
        if let Err(e) = job.transition_to(JobStatus::Failed, now) {
            warn!(job_id = %id, "{e}");
            return;
        }
        error!(job_id = %id, dependency = %dependency, "Job failed: dependency ended as {ended}");
        let record = job.record();
        state.mark_settled(id);
        self.emit(JobEvent::Failed { record, error });
    }
}

#[async_trait]
impl ProgressReporter for QueueInner {
    async fn report(&self, job_id: Uuid, progress: f32, message: Option<String>) {
        let progress = if progress.is_nan() {
            0.0
        } else {
            progress.clamp(0.0, 1.0)
        };
        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return;
        };
        if job.status != JobStatus::Running {
            return;
        }
        job.progress = progress;
        if message.is_some() {
            job.message = message.clone();
        }
        self.emit(JobEvent::Progress {
            job_id,
            progress,
            message,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::clock::ManualClock;
    use crate::jobs::handler::{HandlerError, handler_fn};
    use crate::jobs::model::JobPayload;
    use crate::resilience::classify::Failure;

    fn config() -> SchedulerConfig {
        let mut config = SchedulerConfig {
            name: "test".to_string(),
            concurrency_limit: 1,
            sweep_interval: Duration::from_millis(20),
            stuck_threshold: Duration::from_secs(60),
            capture_memory: false,
            ..SchedulerConfig::default()
        };
        config.retry = config.retry.without_jitter();
        config.retry.base_delay = Duration::from_millis(5);
        config.retry.max_delay = Duration::from_millis(20);
        config
    }

    fn queue_with(clock: Arc<ManualClock>) -> (PriorityJobQueue, Arc<HandlerRegistry>) {
        let handlers = Arc::new(HandlerRegistry::new());
        let queue = PriorityJobQueue::with_handlers(&config(), handlers.clone(), clock);
        (queue, handlers)
    }

    fn job(priority: i32) -> JobDescriptor {
        JobDescriptor::new("noop", JobPayload::Empty).with_priority(priority)
    }

    #[tokio::test]
    async fn waiting_order_is_priority_then_schedule() {
        let clock = Arc::new(ManualClock::starting_now());
        let (queue, _) = queue_with(clock.clone());
        let now = clock.now();

        let low = queue.enqueue(job(1)).await.unwrap();
        let high = queue.enqueue(job(9)).await.unwrap();
        let late = queue
            .enqueue(job(9).scheduled_at(now + chrono::Duration::seconds(30)))
            .await
            .unwrap();
        let same = queue.enqueue(job(1)).await.unwrap();

        let state = queue.inner.state.lock().await;
        assert_eq!(state.waiting, vec![high, late, low, same]);
    }

    #[tokio::test]
    async fn dispatch_respects_limit_and_readiness() {
        let clock = Arc::new(ManualClock::starting_now());
        let (queue, handlers) = queue_with(clock.clone());
        let gate = Arc::new(Notify::new());
        let release = gate.clone();
        handlers
            .register(
                "noop",
                Arc::new(handler_fn(move |_, _| {
                    let gate = gate.clone();
                    async move {
                        gate.notified().await;
                        Ok(JobPayload::Empty)
                    }
                })),
            )
            .await;

        let now = clock.now();
        let future = queue
            .enqueue(job(10).scheduled_at(now + chrono::Duration::seconds(5)))
            .await
            .unwrap();
        let first = queue.enqueue(job(1)).await.unwrap();
        let second = queue.enqueue(job(1)).await.unwrap();

        // Scheduled job is skipped; only one slot.
        assert_eq!(queue.dispatch().await, vec![first]);
        assert!(queue.dispatch().await.is_empty());
        assert_eq!(queue.stats().await.running, 1);

        release.notify_one();
        tokio::time::timeout(Duration::from_secs(2), queue.wait_for(first))
            .await
            .unwrap()
            .unwrap();

        clock.advance(Duration::from_secs(5));
        assert_eq!(queue.dispatch().await, vec![future]);
        release.notify_one();
        tokio::time::timeout(Duration::from_secs(2), queue.wait_for(future))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(queue.dispatch().await, vec![second]);
        release.notify_one();
    }

    #[tokio::test]
    async fn rejects_invalid_dependencies() {
        let clock = Arc::new(ManualClock::starting_now());
        let (queue, _) = queue_with(clock);

        let unknown = Uuid::new_v4();
        let err = queue.enqueue(job(1).depends_on(unknown)).await.unwrap_err();
        assert!(matches!(err, JobError::UnknownDependency { dependency, .. } if dependency == unknown));

        let mut selfish = job(1);
        selfish.dependencies.push(selfish.id);
        let err = queue.enqueue(selfish).await.unwrap_err();
        assert!(matches!(err, JobError::SelfDependency { .. }));

        let dead = queue.enqueue(job(1)).await.unwrap();
        assert!(queue.cancel(dead).await);
        let err = queue.enqueue(job(1).depends_on(dead)).await.unwrap_err();
        assert!(matches!(err, JobError::DependencyFailed { .. }));

        let dup = job(1);
        queue.enqueue(dup.clone()).await.unwrap();
        assert!(matches!(
            queue.enqueue(dup).await.unwrap_err(),
            JobError::DuplicateId { .. }
        ));
    }

    #[tokio::test]
    async fn cancel_pending_is_idempotent() {
        let clock = Arc::new(ManualClock::starting_now());
        let (queue, _) = queue_with(clock);
        let mut events = queue.subscribe();

        let id = queue.enqueue(job(1)).await.unwrap();
        assert!(queue.cancel(id).await);
        assert!(!queue.cancel(id).await);
        assert!(!queue.cancel(Uuid::new_v4()).await);
        assert_eq!(queue.status(id).await, Some(JobStatus::Cancelled));
        assert_eq!(queue.stats().await.pending, 0);
        assert_eq!(queue.stats().await.cancelled, 1);

        assert!(matches!(events.recv().await.unwrap(), JobEvent::Enqueued { .. }));
        assert!(matches!(events.recv().await.unwrap(), JobEvent::Cancelled { .. }));
    }

    #[tokio::test]
    async fn cancel_running_sets_hint_only() {
        let clock = Arc::new(ManualClock::starting_now());
        let (queue, handlers) = queue_with(clock);
        handlers
            .register(
                "noop",
                Arc::new(handler_fn(|_, ctx: JobContext| async move {
                    for _ in 0..200 {
                        if ctx.is_cancelled() {
                            return Err(HandlerError::Cancelled);
                        }
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                    Ok(JobPayload::Empty)
                })),
            )
            .await;

        let id = queue.enqueue(job(1)).await.unwrap();
        assert_eq!(queue.dispatch().await, vec![id]);
        assert!(queue.cancel(id).await);
        assert!(!queue.cancel(id).await);

        let record = tokio::time::timeout(Duration::from_secs(2), queue.wait_for(id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn failed_attempt_spawns_descendant() {
        let clock = Arc::new(ManualClock::starting_now());
        let (queue, handlers) = queue_with(clock.clone());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        handlers
            .register(
                "noop",
                Arc::new(handler_fn(move |_, _| {
                    let counter = counter.clone();
                    async move {
                        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                            Err(Failure::new("network unreachable").into())
                        } else {
                            Ok(JobPayload::json(serde_json::json!("ok")))
                        }
                    }
                })),
            )
            .await;

        let mut events = queue.subscribe();
        let id = queue.enqueue(job(1)).await.unwrap();
        queue.dispatch().await;
        let retry_id = loop {
            let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .unwrap()
                .unwrap();
            if let JobEvent::Retrying { retry_id, .. } = event {
                break retry_id;
            }
        };

        let original = queue.get(id).await.unwrap();
        assert_eq!(original.status, JobStatus::Retrying);
        assert_eq!(original.retried_as, Some(retry_id));

        let retry = queue.get(retry_id).await.unwrap();
        assert_eq!(retry.attempt, 1);
        assert_eq!(retry.retry_of, Some(id));
        // Not ready until the backoff elapses on the queue clock.
        assert!(queue.dispatch().await.is_empty());
        clock.advance(Duration::from_millis(5));
        assert_eq!(queue.dispatch().await, vec![retry_id]);

        let record = tokio::time::timeout(Duration::from_secs(2), queue.wait_for(id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.id, retry_id);
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.attempt, 2);
        assert_eq!(queue.lineage(retry_id).await.len(), 2);
    }

    #[tokio::test]
    async fn configured_zero_retries_fails_on_first_error() {
        let clock = Arc::new(ManualClock::starting_now());
        let env = std::collections::HashMap::from([("JOBGATE_MAX_RETRIES", "0")]);
        let mut config =
            SchedulerConfig::from_lookup(|key| env.get(key).map(|v| v.to_string())).unwrap();
        config.capture_memory = false;
        assert_eq!(config.retry.max_retries, 0);

        let handlers = Arc::new(HandlerRegistry::new());
        let queue = PriorityJobQueue::with_handlers(&config, handlers.clone(), clock);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        handlers
            .register(
                "noop",
                Arc::new(handler_fn(move |_, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Err(Failure::new("network timeout").into()) }
                })),
            )
            .await;

        let id = queue.enqueue(job(1)).await.unwrap();
        queue.dispatch().await;
        let record = tokio::time::timeout(Duration::from_secs(2), queue.wait_for(id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.attempt, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.stats().await.retried, 0);
    }

    #[tokio::test]
    async fn attempt_metrics_reach_record_and_stats() {
        let clock = Arc::new(ManualClock::starting_now());
        let config = SchedulerConfig {
            capture_memory: true,
            ..config()
        };
        let handlers = Arc::new(HandlerRegistry::new());
        let queue = PriorityJobQueue::with_handlers(&config, handlers.clone(), clock.clone());
        handlers
            .register(
                "noop",
                Arc::new(handler_fn(|_, _| async {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(JobPayload::Empty)
                })),
            )
            .await;

        let mut events = queue.subscribe();
        let id = queue.enqueue(job(1)).await.unwrap();
        queue.dispatch().await;
        let completed = loop {
            let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .unwrap()
                .unwrap();
            if let JobEvent::Completed { record } = event {
                break record;
            }
        };
        assert_eq!(completed.id, id);

        let metrics = completed.metrics.expect("attempt metrics");
        assert_eq!(metrics.attempt, 0);
        assert_eq!(metrics.started_at, clock.now());
        assert!(metrics.duration >= Duration::from_millis(20));
        assert!(metrics.memory_bytes.is_some());
        assert_eq!(queue.record(id).await.unwrap().metrics, Some(metrics.clone()));

        // The manual clock never moved, so only the measured duration counts.
        let stats = queue.stats().await;
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.avg_processing_time, metrics.duration);
    }

    #[tokio::test]
    async fn dependency_resolves_through_retry_lineage() {
        let clock = Arc::new(ManualClock::starting_now());
        let (queue, _) = queue_with(clock.clone());
        let now = clock.now();

        let first_id = queue.enqueue(job(1)).await.unwrap();
        let dependent = queue.enqueue(job(1).depends_on(first_id)).await.unwrap();

        {
            let mut state = queue.inner.state.lock().await;
            state.waiting.retain(|id| *id != first_id);
            let original = state.jobs.get_mut(&first_id).unwrap();
            original.transition_to(JobStatus::Running, now).unwrap();
            let mut retry = original.retry_descendant(now, now);
            original.retried_as = Some(retry.id);
            original.transition_to(JobStatus::Retrying, now).unwrap();
            retry.transition_to(JobStatus::Running, now).unwrap();
            retry.transition_to(JobStatus::Completed, now).unwrap();
            state.jobs.insert(retry.id, retry);

            let waiting = state.jobs[&dependent].clone();
            assert!(state.is_ready(&waiting, now));
        }
    }

    #[tokio::test]
    async fn sweep_fails_starved_dependents_after_threshold() {
        let clock = Arc::new(ManualClock::starting_now());
        let (queue, handlers) = queue_with(clock.clone());
        handlers
            .register(
                "noop",
                Arc::new(
                    handler_fn(|_, _| async { Err(Failure::new("bad input").with_status(422).into()) })
                        .non_retryable(),
                ),
            )
            .await;
        let mut events = queue.subscribe();

        let parent = queue.enqueue(job(1)).await.unwrap();
        let child = queue.enqueue(job(1).depends_on(parent)).await.unwrap();
        queue.dispatch().await;
        let record = tokio::time::timeout(Duration::from_secs(2), queue.wait_for(parent))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.error.unwrap().kind, ErrorKind::Validation);

        queue.sweep().await;
        assert_eq!(queue.status(child).await, Some(JobStatus::Pending));

        clock.advance(Duration::from_secs(61));
        queue.sweep().await;
        let child_record = queue.record(child).await.unwrap();
        assert_eq!(child_record.status, JobStatus::Failed);
        assert!(!child_record.error.unwrap().retryable);

        let mut starved = 0;
        while let Ok(event) = events.try_recv() {
            if let JobEvent::Starved { job_id, dependency, .. } = event {
                assert_eq!((job_id, dependency), (child, parent));
                starved += 1;
            }
        }
        assert_eq!(starved, 1);
    }

    #[tokio::test]
    async fn sweep_reports_stuck_once() {
        let clock = Arc::new(ManualClock::starting_now());
        let (queue, _) = queue_with(clock.clone());
        let mut events = queue.subscribe();

        let parent = queue
            .enqueue(job(1).scheduled_at(clock.now() + chrono::Duration::hours(1)))
            .await
            .unwrap();
        let child = queue.enqueue(job(1).depends_on(parent)).await.unwrap();

        clock.advance(Duration::from_secs(61));
        queue.sweep().await;
        queue.sweep().await;

        let stuck: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .filter_map(|e| match e {
                JobEvent::Stuck { job_id, waiting_on, .. } => Some((job_id, waiting_on)),
                _ => None,
            })
            .collect();
        assert_eq!(stuck, vec![(child, vec![parent])]);
    }

    #[tokio::test]
    async fn prune_keeps_depended_on_records() {
        let clock = Arc::new(ManualClock::starting_now());
        let (queue, _) = queue_with(clock);

        let kept_dep = queue.enqueue(job(1)).await.unwrap();
        let dependent = queue.enqueue(job(1).depends_on(kept_dep)).await.unwrap();
        let mut others = Vec::new();
        for _ in 0..3 {
            others.push(queue.enqueue(job(1)).await.unwrap());
        }

        {
            let now = queue.clock().now();
            let mut state = queue.inner.state.lock().await;
            for id in std::iter::once(kept_dep).chain(others.iter().copied()) {
                state.waiting.retain(|w| *w != id);
                let job = state.jobs.get_mut(&id).unwrap();
                job.transition_to(JobStatus::Running, now).unwrap();
                job.transition_to(JobStatus::Completed, now).unwrap();
                state.mark_settled(id);
            }
        }

        assert_eq!(queue.prune(1).await, 3);
        assert!(queue.get(kept_dep).await.is_some());
        assert!(queue.get(dependent).await.is_some());
        let state = queue.inner.state.lock().await;
        assert!(others.iter().all(|id| !state.jobs.contains_key(id)));
    }

    #[tokio::test]
    async fn progress_is_clamped_and_published() {
        let clock = Arc::new(ManualClock::starting_now());
        let (queue, handlers) = queue_with(clock);
        handlers
            .register(
                "noop",
                Arc::new(handler_fn(|_, ctx: JobContext| async move {
                    ctx.report_progress(0.5, Some("halfway")).await;
                    ctx.report_progress(7.0, None).await;
                    Ok(JobPayload::Empty)
                })),
            )
            .await;
        let mut events = queue.subscribe();

        let id = queue.enqueue(job(1)).await.unwrap();
        queue.dispatch().await;
        tokio::time::timeout(Duration::from_secs(2), queue.wait_for(id))
            .await
            .unwrap()
            .unwrap();

        let progress: Vec<f32> = std::iter::from_fn(|| events.try_recv().ok())
            .filter_map(|e| match e {
                JobEvent::Progress { progress, .. } => Some(progress),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![0.5, 1.0]);
        let record = queue.record(id).await.unwrap();
        assert_eq!(record.message.as_deref(), Some("halfway"));
        assert_eq!(record.progress, 1.0);
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let clock = Arc::new(ManualClock::starting_now());
        let (queue, _) = queue_with(clock);
        queue.start().unwrap();
        assert!(matches!(
            queue.start().unwrap_err(),
            JobError::AlreadyRunning { .. }
        ));
        assert!(queue.is_running());
        assert!(queue.stop().await);
        assert!(!queue.stop().await);
    }
}
