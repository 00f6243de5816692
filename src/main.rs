use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use jobgate::SchedulerConfig;
use jobgate::clock::SystemClock;
use jobgate::jobs::{
    HandlerError, HandlerRegistry, JobContext, JobDescriptor, JobEvent, JobPayload,
    PriorityJobQueue, Scheduler, handler_fn,
};
use jobgate::resilience::Failure;

#[derive(Debug, Serialize, Deserialize)]
struct Document {
    doc_id: u32,
    text: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Extracted {
    doc_id: u32,
    chunks: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing; the guard flushes the file writer on exit.
    let (file_layer, _log_guard) = match std::env::var("JOBGATE_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "jobgate.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        Err(_) => (None, None),
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    let config = SchedulerConfig::from_env().context("invalid JOBGATE_* configuration")?;
    eprintln!("jobgate v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Queue: {}", config.name);
    eprintln!("   Concurrency: {}", config.concurrency_limit);

    let handlers = Arc::new(HandlerRegistry::new());
    register_demo_handlers(&handlers).await;

    let queue = PriorityJobQueue::with_handlers(&config, handlers, Arc::new(SystemClock));
    let scheduler = Scheduler::new(queue.clone(), Duration::from_millis(250));

    // Log lifecycle events the way a persistence adapter would consume them.
    let mut events = queue.event_stream();
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match event {
                Ok(JobEvent::Progress { job_id, progress, .. }) => {
                    tracing::debug!(job_id = %job_id, progress, "Progress");
                }
                Ok(event) if event.is_terminal() => {
                    if let Ok(json) = serde_json::to_string(&event) {
                        tracing::info!(job_id = %event.job_id(), "Record: {json}");
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Event stream lagged: {e}"),
            }
        }
    });

    queue.start()?;
    scheduler.start()?;

    let documents = [
        (1, "Rust is fast. Rust is safe. Rust is fun."),
        (2, "Queues order work. Breakers stop cascades."),
        (3, "Retries back off. Jitter spreads them out."),
    ];
    let mut embeds = Vec::new();
    for (doc_id, text) in documents {
        let payload = JobPayload::encode(&Document {
            doc_id,
            text: text.to_string(),
        })?;
        let extract = queue
            .enqueue(JobDescriptor::new("extract", payload).with_priority(5))
            .await?;
        let embed = queue
            .enqueue(
                JobDescriptor::new("embed", JobPayload::Empty)
                    .with_priority(8)
                    .depends_on(extract)
                    .with_max_retries(3),
            )
            .await?;
        embeds.push(embed);
    }
    scheduler
        .schedule_delayed(
            "late-extract",
            "extract",
            JobPayload::encode(&Document {
                doc_id: 4,
                text: "Delayed work runs later.".to_string(),
            })?,
            Duration::from_secs(1),
            1,
        )
        .await?;

    for id in embeds {
        let record = tokio::time::timeout(Duration::from_secs(30), queue.wait_for(id))
            .await
            .context("timed out waiting for embedding job")??;
        tracing::info!(job_id = %record.id, status = %record.status, attempt = record.attempt, "Embedding settled");
    }

    let stats = queue.stats().await;
    tracing::info!(
        completed = stats.completed,
        failed = stats.failed,
        retried = stats.retried,
        success_rate = stats.success_rate,
        avg_ms = stats.avg_processing_time.as_millis() as u64,
        "Queue stats"
    );
    for breaker in queue.executor().breakers().snapshot() {
        tracing::info!(resource = %breaker.resource, state = %breaker.state, "Circuit breaker");
    }

    scheduler.stop().await;
    queue.stop().await;
    Ok(())
}

async fn register_demo_handlers(handlers: &HandlerRegistry) {
    handlers
        .register(
            "extract",
            Arc::new(handler_fn(|payload: JobPayload, ctx: JobContext| async move {
                let doc: Document = payload.decode()?;
                let sentences: Vec<&str> = doc
                    .text
                    .split('.')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .collect();

                let mut chunks = Vec::with_capacity(sentences.len());
                for (i, sentence) in sentences.iter().enumerate() {
                    if ctx.is_cancelled() {
                        return Err(HandlerError::Cancelled);
                    }
                    chunks.push(sentence.to_string());
                    ctx.report_progress((i + 1) as f32 / sentences.len() as f32, None)
                        .await;
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                Ok(JobPayload::encode(&Extracted {
                    doc_id: doc.doc_id,
                    chunks,
                })?)
            })),
        )
        .await;

    // Every other call fails like a flaky provider.
    let calls = Arc::new(AtomicUsize::new(0));
    handlers
        .register(
            "embed",
            Arc::new(
                handler_fn(move |_payload: JobPayload, ctx: JobContext| {
                    let calls = calls.clone();
                    async move {
                        if calls.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
                            return Err(Failure::new("embedding provider returned 503")
                                .with_context("attempt", ctx.attempt.to_string())
                                .into());
                        }
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok(JobPayload::json(serde_json::json!({ "vectors": 3 })))
                    }
                })
                .with_resource("embeddings"),
            ),
        )
        .await;
}
