//! Handler registration: one handler per job type.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::jobs::model::JobPayload;
use crate::resilience::classify::Failure;

/// Why a handler invocation did not produce a result.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Failed(#[from] Failure),

    /// The handler observed the cancellation hint and stopped.
    #[error("cancelled")]
    Cancelled,
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(err.into())
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(err: std::io::Error) -> Self {
        Self::Failed(err.into())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Failed(err.into())
    }
}

/// Receives progress updates from running handlers.
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    async fn report(&self, job_id: Uuid, progress: f32, message: Option<String>);
}

/// What a handler can see and signal while it runs.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: Uuid,
    pub job_type: String,
    /// Zero-based attempt number.
    pub attempt: u32,
    cancelled: Arc<AtomicBool>,
    reporter: Option<Arc<dyn ProgressReporter>>,
}

impl JobContext {
    /// A context with no queue attached (progress reports are dropped).
    pub fn new(job_id: Uuid, job_type: impl Into<String>, attempt: u32) -> Self {
        Self {
            job_id,
            job_type: job_type.into(),
            attempt,
            cancelled: Arc::new(AtomicBool::new(false)),
            reporter: None,
        }
    }

    pub(crate) fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancelled = flag;
        self
    }

    pub(crate) fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Cooperative cancellation hint. Handlers may ignore it.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Report progress in `0.0..=1.0`; values outside are clamped.
    pub async fn report_progress(&self, progress: f32, message: Option<&str>) {
        if let Some(ref reporter) = self.reporter {
            reporter
                .report(self.job_id, progress, message.map(str::to_string))
                .await;
        }
    }
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .field("job_type", &self.job_type)
            .field("attempt", &self.attempt)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Executes jobs of one type.
///
/// Handlers are invoked once per attempt and must be safe to run again
/// unless [`retryable`](JobHandler::retryable) returns false.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, payload: &JobPayload, ctx: &JobContext)
    -> Result<JobPayload, HandlerError>;

    /// Whether failed attempts may be retried.
    fn retryable(&self) -> bool {
        true
    }

    /// Circuit breaker key. Defaults to the job type.
    fn resource(&self) -> Option<&str> {
        None
    }
}

/// Adapter that turns an async closure into a [`JobHandler`].
pub struct FnHandler<F> {
    f: F,
    retryable: bool,
    resource: Option<String>,
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(JobPayload, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<JobPayload, HandlerError>> + Send + 'static,
{
    FnHandler {
        f,
        retryable: true,
        resource: None,
    }
}

impl<F> FnHandler<F> {
    pub fn non_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobPayload, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<JobPayload, HandlerError>> + Send + 'static,
{
    async fn handle(
        &self,
        payload: &JobPayload,
        ctx: &JobContext,
    ) -> Result<JobPayload, HandlerError> {
        (self.f)(payload.clone(), ctx.clone()).await
    }

    fn retryable(&self) -> bool {
        self.retryable
    }

    fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }
}

/// Registry mapping job types to handlers.
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl HandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register (or replace) the handler for `job_type`.
    pub async fn register(&self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) {
        let job_type = job_type.into();
        if self
            .handlers
            .write()
            .await
            .insert(job_type.clone(), handler)
            .is_some()
        {
            tracing::warn!(job_type = %job_type, "Replaced existing job handler");
        } else {
            tracing::debug!("Registered job handler: {}", job_type);
        }
    }

    /// Unregister a handler.
    pub async fn unregister(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.write().await.remove(job_type)
    }

    /// Get the handler for a job type.
    pub async fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.read().await.get(job_type).cloned()
    }

    /// Check if a handler exists.
    pub async fn has(&self, job_type: &str) -> bool {
        self.handlers.read().await.contains_key(job_type)
    }

    /// List all registered job types, sorted.
    pub async fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        types.sort();
        types
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        reports: Mutex<Vec<(Uuid, f32, Option<String>)>>,
    }

    #[async_trait]
    impl ProgressReporter for Recorder {
        async fn report(&self, job_id: Uuid, progress: f32, message: Option<String>) {
            self.reports.lock().unwrap().push((job_id, progress, message));
        }
    }

    #[tokio::test]
    async fn register_and_lookup() {
        let registry = HandlerRegistry::new();
        registry
            .register("echo", Arc::new(handler_fn(|p, _| async move { Ok(p) })))
            .await;

        assert!(registry.has("echo").await);
        assert!(registry.get("missing").await.is_none());
        assert_eq!(registry.job_types().await, vec!["echo".to_string()]);

        let handler = registry.get("echo").await.unwrap();
        let ctx = JobContext::new(Uuid::new_v4(), "echo", 0);
        let out = handler
            .handle(&JobPayload::json(serde_json::json!("hi")), &ctx)
            .await
            .unwrap();
        assert_eq!(out, JobPayload::json(serde_json::json!("hi")));

        assert!(registry.unregister("echo").await.is_some());
        assert!(!registry.has("echo").await);
    }

    #[test]
    fn fn_handler_flags() {
        let handler = handler_fn(|_, _| async { Ok(JobPayload::Empty) })
            .non_retryable()
            .with_resource("embeddings");
        assert!(!handler.retryable());
        assert_eq!(handler.resource(), Some("embeddings"));
    }

    #[tokio::test]
    async fn context_reports_progress_and_cancellation() {
        let recorder = Arc::new(Recorder::default());
        let flag = Arc::new(AtomicBool::new(false));
        let id = Uuid::new_v4();
        let ctx = JobContext::new(id, "t", 0)
            .with_cancel_flag(flag.clone())
            .with_reporter(recorder.clone());

        ctx.report_progress(0.5, Some("halfway")).await;
        assert!(!ctx.is_cancelled());
        flag.store(true, Ordering::Release);
        assert!(ctx.is_cancelled());

        let reports = recorder.reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0], (id, 0.5, Some("halfway".to_string())));
    }

    #[test]
    fn errors_convert_into_failures() {
        let err: HandlerError = anyhow::anyhow!("network unreachable").into();
        match err {
            HandlerError::Failed(f) => assert!(f.message.contains("network")),
            HandlerError::Cancelled => panic!("expected failure"),
        }
    }
}
