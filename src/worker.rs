//! Background job worker.
//!
//! `microblog worker` claims queued jobs one at a time and dispatches them
//! by name to a [`Job`] from the [`JobRegistry`].
//!
//! ```text
//!   JobQueue::claim_next ──▶ JobRegistry::find(func_name)
//!                                   │
//!                                   ▼
//!                 tokio::spawn(job.run(ctx, args))
//!                   │ Ok      │ Err        │ panic
//!                   ▼         ▼            ▼
//!               finished    failed      failed
//!                   └─────────┴────────────┘
//!                             │
//!                   ctx.set_progress(100)   (always)
//!                             │
//!                   JobQueue::finish(status)
//! ```
//!
//! Every job ends with a progress-100 report whatever happened inside it, so
//! its task is marked complete and never stays "in progress" after a crash.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::app::AppContext;
use crate::config::Config;
use crate::export::ExportPostsJob;
use crate::queue::{JobQueue, JobRecord, JobStatus, SqliteQueue};
use crate::tasks::set_task_progress;

/// Attempts at the closing progress-100 report before giving up.
const FINAL_PROGRESS_ATTEMPTS: u32 = 5;
const FINAL_PROGRESS_BACKOFF: Duration = Duration::from_millis(200);

/// A named job body executed by the worker.
#[async_trait]
pub trait Job: Send + Sync {
    /// Name the job is enqueued under.
    fn name(&self) -> &str;

    /// Run the job. `args` is the JSON value given to
    /// [`launch_task`](crate::tasks::launch_task).
    async fn run(&self, ctx: &JobContext, args: Value) -> Result<()>;
}

/// What a running job knows about itself.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: String,
    pub user_id: i64,
    pub app: AppContext,
}

impl JobContext {
    pub async fn set_progress(&self, progress: i64) -> Result<()> {
        set_task_progress(&self.app, &self.job_id, progress).await
    }
}

pub struct JobRegistry {
    jobs: Vec<Arc<dyn Job>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self { jobs: Vec::new() }
    }

    /// Registry with every job the application launches.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ExportPostsJob));
        registry
    }

    pub fn register(&mut self, job: Arc<dyn Job>) {
        self.jobs.push(job);
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn Job>> {
        self.jobs.iter().find(|j| j.name() == name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.jobs.iter().map(|j| j.name()).collect()
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Worker {
    app: AppContext,
    registry: Arc<JobRegistry>,
}

impl Worker {
    pub fn new(app: AppContext, registry: JobRegistry) -> Self {
        Self {
            app,
            registry: Arc::new(registry),
        }
    }

    /// Claim and run one job. Returns `false` when the queue was empty.
    pub async fn run_once(&self) -> Result<bool> {
        let Some(record) = self.app.queue.claim_next().await? else {
            return Ok(false);
        };
        self.execute(record).await;
        Ok(true)
    }

    /// Process jobs until interrupted, or until the queue is empty when
    /// `burst` is set. Returns the number of jobs processed.
    pub async fn run(&self, burst: bool) -> Result<usize> {
        let interval = Duration::from_millis(self.app.config.queue.poll_interval_ms);
        let mut processed = 0usize;

        tracing::info!(jobs = ?self.registry.names(), burst, "worker started");

        loop {
            match self.run_once().await {
                Ok(true) => {
                    processed += 1;
                    continue;
                }
                Ok(false) if burst => break,
                Ok(false) => {
                    self.purge_expired().await;
                }
                Err(e) => {
                    tracing::error!(error = ?e, "failed to claim job");
                    if burst {
                        return Err(e);
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("worker interrupted");
                    break;
                }
            }
        }

        tracing::info!(processed, "worker stopped");
        Ok(processed)
    }

    async fn purge_expired(&self) {
        let ttl = self.app.config.queue.result_ttl_secs;
        match self.app.queue.purge_expired(ttl).await {
            Ok(0) => {}
            Ok(n) => tracing::debug!(evicted = n, "expired jobs purged"),
            Err(e) => tracing::warn!(error = %e, "failed to purge expired jobs"),
        }
    }

    async fn execute(&self, record: JobRecord) {
        let ctx = JobContext {
            job_id: record.id.clone(),
            user_id: record.user_id,
            app: self.app.clone(),
        };

        tracing::info!(job_id = %record.id, name = %record.func_name, "job started");

        let (status, exc_info) = match self.registry.find(&record.func_name) {
            None => {
                tracing::error!(job_id = %record.id, name = %record.func_name, "unknown job");
                (
                    JobStatus::Failed,
                    Some(format!("unknown job: {}", record.func_name)),
                )
            }
            Some(job) => {
                let job_ctx = ctx.clone();
                let args = record.args.clone();
                let handle = tokio::spawn(async move { job.run(&job_ctx, args).await });
                match handle.await {
                    Ok(Ok(())) => (JobStatus::Finished, None),
                    Ok(Err(e)) => {
                        tracing::error!(job_id = %record.id, error = ?e, "job failed");
                        (JobStatus::Failed, Some(format!("{:#}", e)))
                    }
                    Err(join_err) => {
                        let message = if join_err.is_panic() {
                            panic_message(join_err.into_panic())
                        } else {
                            join_err.to_string()
                        };
                        tracing::error!(job_id = %record.id, panic = %message, "job panicked");
                        (JobStatus::Failed, Some(format!("panic: {}", message)))
                    }
                }
            }
        };

        let mut attempt: u32 = 1;
        while let Err(e) = ctx.set_progress(100).await {
            if attempt >= FINAL_PROGRESS_ATTEMPTS {
                tracing::error!(job_id = %record.id, error = ?e, attempt, "failed to record final progress");
                break;
            }
            tracing::warn!(job_id = %record.id, error = ?e, attempt, "retrying final progress");
            tokio::time::sleep(FINAL_PROGRESS_BACKOFF * attempt).await;
            attempt += 1;
        }

        if let Err(e) = self.app.queue.finish(&record.id, status, exc_info).await {
            tracing::error!(job_id = %record.id, error = %e, "failed to mark job ended");
        }

        tracing::info!(job_id = %record.id, status = status.as_str(), "job ended");
    }
}

/// `microblog worker`.
pub async fn run_worker(config: &Config, burst: bool) -> Result<()> {
    let app = AppContext::build(config.clone()).await?;
    let worker = Worker::new(app, JobRegistry::with_builtins());
    let processed = worker.run(burst).await?;
    println!("worker");
    println!("  jobs processed: {}", processed);
    Ok(())
}

/// `microblog purge-jobs`.
pub async fn run_purge_jobs(config: &Config) -> Result<()> {
    let queue = SqliteQueue::open(&config.queue.path).await?;
    let evicted = queue.purge_expired(config.queue.result_ttl_secs).await?;
    queue.close().await;
    println!("purge-jobs");
    println!("  jobs evicted: {}", evicted);
    Ok(())
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
