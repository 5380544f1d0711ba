use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};

pub type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Body of a scheduled task. Errors are expected to be logged inside the task.
pub type TaskFn = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

pub fn task<F, Fut>(run: F) -> TaskFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move || Box::pin(run()) as TaskFuture)
}

/// A named task that refuses to start while its previous run is still in flight.
#[derive(Clone)]
struct GuardedTask {
    name: String,
    guard: Arc<Mutex<()>>,
    run: TaskFn,
}

impl GuardedTask {
    fn new(name: &str, run: TaskFn) -> Self {
        Self {
            name: name.to_string(),
            guard: Arc::new(Mutex::new(())),
            run,
        }
    }

    /// Returns false when the tick was skipped.
    async fn tick(&self) -> bool {
        let Ok(_running) = self.guard.try_lock() else {
            tracing::warn!(task = %self.name, "previous run still in progress; skipping tick");
            return false;
        };
        tracing::debug!(task = %self.name, "running scheduled task");
        (self.run)().await;
        true
    }
}

/// Accepts classic five-field cron expressions by prepending a seconds field.
pub fn normalize_cron(expr: &str) -> String {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() == 5 {
        format!("0 {}", fields.join(" "))
    } else {
        fields.join(" ")
    }
}

pub struct Scheduler {
    inner: JobScheduler,
}

impl Scheduler {
    pub async fn new() -> anyhow::Result<Self> {
        let inner = JobScheduler::new().await.context("creating scheduler")?;
        Ok(Self { inner })
    }

    pub async fn add_interval(&self, name: &str, every: Duration, run: TaskFn) -> anyhow::Result<()> {
        let task = GuardedTask::new(name, run);
        let job = Job::new_repeated_async(every, move |_id, _lock| {
            let task = task.clone();
            Box::pin(async move {
                task.tick().await;
            })
        })
        .with_context(|| format!("creating interval job {name}"))?;

        self.inner
            .add(job)
            .await
            .with_context(|| format!("adding interval job {name}"))?;
        tracing::info!(task = name, every = %humantime::format_duration(every), "scheduled interval task");
        Ok(())
    }

    /// Schedules `run` on `expr` in local time, falling back to `default_expr` when `expr` is invalid.
    /// Returns the expression in effect.
    pub async fn add_cron(
        &self,
        name: &str,
        expr: &str,
        default_expr: &str,
        run: TaskFn,
    ) -> anyhow::Result<String> {
        let task = GuardedTask::new(name, run);

        let requested = normalize_cron(expr);
        let (effective, job) = match cron_job(&requested, task.clone()) {
            Ok(job) => (requested, job),
            Err(err) => {
                tracing::error!(
                    task = name,
                    expression = expr,
                    error = %err,
                    fallback = default_expr,
                    "invalid cron expression; falling back to default schedule"
                );
                let fallback = normalize_cron(default_expr);
                let job = cron_job(&fallback, task).with_context(|| {
                    format!("creating cron job {name} with default schedule {default_expr}")
                })?;
                (fallback, job)
            }
        };

        self.inner
            .add(job)
            .await
            .with_context(|| format!("adding cron job {name}"))?;
        tracing::info!(task = name, schedule = %effective, "scheduled cron task");
        Ok(effective)
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.inner.start().await.context("starting scheduler")?;
        Ok(())
    }

    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        self.inner.shutdown().await.context("stopping scheduler")?;
        Ok(())
    }
}

fn cron_job(expr: &str, task: GuardedTask) -> anyhow::Result<Job> {
    let job = Job::new_async_tz(expr, chrono::Local, move |_id, _lock| {
        let task = task.clone();
        Box::pin(async move {
            task.tick().await;
        })
    })?;
    Ok(job)
}
