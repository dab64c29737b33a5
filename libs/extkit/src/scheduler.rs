//! Shared cron service and the per-module scheduling facade.
//!
//! One [`CronService`] is owned by the runtime. Every job runs on its own
//! background task that sleeps until the next fire time; a job never overlaps
//! with itself because each run is awaited before the next fire time is
//! computed.

use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use cron::Schedule;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{ExtError, Result};
use crate::isolate::{run_isolated, Outcome};

/// A scheduled callback.
pub type JobFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Snapshot of one scheduled job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInfo {
    pub name: String,
    pub expr: String,
    pub next_run: Option<DateTime<Utc>>,
}

struct JobHandle {
    expr: String,
    schedule: Schedule,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Jobs {
    by_key: HashMap<(String, String), JobHandle>,
    stopped: bool,
}

pub struct CronService {
    jobs: Mutex<Jobs>,
    root: CancellationToken,
}

impl Default for CronService {
    fn default() -> Self {
        Self::new()
    }
}

impl CronService {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(Jobs::default()),
            root: CancellationToken::new(),
        }
    }

    /// Schedule `job` as `(module, name)`, replacing any job with the same key.
    /// Must be called from within a tokio runtime.
    pub fn schedule(&self, module: &str, name: &str, expr: &str, job: JobFn) -> Result<()> {
        let schedule = parse_cron(expr)?;

        let mut jobs = self.jobs.lock();
        if jobs.stopped {
            return Err(ExtError::SchedulerStopped);
        }

        let cancel = self.root.child_token();
        let task = tokio::spawn(drive(
            module.to_string(),
            name.to_string(),
            schedule.clone(),
            job,
            cancel.clone(),
        ));

        let handle = JobHandle {
            expr: expr.to_string(),
            schedule,
            cancel,
            task,
        };
        // Swap and cancel under one lock so two schedules never run side by side.
        if let Some(old) = jobs.by_key.insert((module.to_string(), name.to_string()), handle) {
            old.cancel.cancel();
            tracing::info!(module, job = name, old = %old.expr, new = expr, "scheduled job replaced");
        } else {
            tracing::info!(module, job = name, expr, "job scheduled");
        }
        Ok(())
    }

    pub fn remove(&self, module: &str, name: &str) -> bool {
        let removed = self
            .jobs
            .lock()
            .by_key
            .remove(&(module.to_string(), name.to_string()));
        match removed {
            Some(job) => {
                job.cancel.cancel();
                tracing::debug!(module, job = name, "job removed");
                true
            }
            None => false,
        }
    }

    /// Cancel every job owned by `module`. Returns how many were removed.
    pub fn remove_all(&self, module: &str) -> usize {
        let mut jobs = self.jobs.lock();
        let keys: Vec<(String, String)> = jobs
            .by_key
            .keys()
            .filter(|(m, _)| m == module)
            .cloned()
            .collect();
        for key in &keys {
            if let Some(job) = jobs.by_key.remove(key) {
                job.cancel.cancel();
            }
        }
        if !keys.is_empty() {
            tracing::debug!(module, removed = keys.len(), "jobs removed");
        }
        keys.len()
    }

    pub fn is_scheduled(&self, module: &str, name: &str) -> bool {
        self.jobs
            .lock()
            .by_key
            .contains_key(&(module.to_string(), name.to_string()))
    }

    /// Jobs owned by `module`, sorted by name.
    pub fn list_jobs(&self, module: &str) -> Vec<JobInfo> {
        let now = Utc::now();
        let mut out: Vec<JobInfo> = self
            .jobs
            .lock()
            .by_key
            .iter()
            .filter(|((m, _), _)| m == module)
            .map(|((_, name), job)| JobInfo {
                name: name.clone(),
                expr: job.expr.clone(),
                next_run: job.schedule.after(&now).next(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn job_count(&self) -> usize {
        self.jobs.lock().by_key.len()
    }

    /// Stop every job and wait for runs already in flight. Scheduling after
    /// this returns [`ExtError::SchedulerStopped`].
    pub async fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = {
            let mut jobs = self.jobs.lock();
            jobs.stopped = true;
            jobs.by_key.drain().map(|(_, job)| job.task).collect()
        };
        self.root.cancel();

        let count = tasks.len();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "scheduler task ended abnormally");
            }
        }
        tracing::info!(jobs = count, "scheduler stopped");
    }
}

async fn drive(module: String, name: String, schedule: Schedule, job: JobFn, cancel: CancellationToken) {
    loop {
        let Some(next) = schedule.upcoming(Utc).next() else {
            tracing::debug!(module = %module, job = %name, "no upcoming fire time; job finished");
            break;
        };
        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
        if cancel.is_cancelled() {
            break;
        }

        let started = Instant::now();
        match run_isolated(job(), None).await {
            Outcome::Ok => {
                tracing::debug!(module = %module, job = %name, elapsed_ms = started.elapsed().as_millis() as u64, "job run completed")
            }
            outcome => {
                tracing::warn!(module = %module, job = %name, outcome = %outcome.describe(), "job run failed")
            }
        }
    }
}

/// Parse a cron expression. Five-field expressions get a leading `0` seconds
/// field; six/seven-field and `@`-shorthands are passed through.
pub fn parse_cron(expr: &str) -> Result<Schedule> {
    let trimmed = expr.trim();
    let normalized = if !trimmed.starts_with('@') && trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };
    Schedule::from_str(&normalized).map_err(|e| ExtError::InvalidCron {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

/// Translate a human interval shorthand into a cron expression.
pub fn interval_to_cron(interval: &str) -> Result<&'static str> {
    let normalized = interval.trim().to_ascii_lowercase();
    let expr = match normalized.as_str() {
        "1m" | "1 minute" | "every minute" => "* * * * *",
        "5m" | "5 minutes" => "*/5 * * * *",
        "10m" | "10 minutes" => "*/10 * * * *",
        "15m" | "15 minutes" => "*/15 * * * *",
        "30m" | "30 minutes" => "*/30 * * * *",
        "1h" | "1 hour" | "hourly" => "@hourly",
        "2h" | "2 hours" => "0 */2 * * *",
        "4h" | "4 hours" => "0 */4 * * *",
        "6h" | "6 hours" => "0 */6 * * *",
        "12h" | "12 hours" => "0 */12 * * *",
        "24h" | "1d" | "1 day" | "daily" => "@daily",
        "7d" | "1 week" | "weekly" => "@weekly",
        "1 month" | "monthly" => "@monthly",
        _ => return Err(ExtError::UnsupportedInterval(interval.to_string())),
    };
    Ok(expr)
}

/// Per-module view of the cron service. Job names are scoped to the module.
#[derive(Clone)]
pub struct ModuleScheduler {
    module: Arc<str>,
    service: Arc<CronService>,
}

impl ModuleScheduler {
    pub(crate) fn new(module: Arc<str>, service: Arc<CronService>) -> Self {
        Self { module, service }
    }

    /// Schedule `f` under `name`, replacing any previous job of that name.
    pub fn schedule<F, Fut>(&self, name: &str, expr: &str, f: F) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let job: JobFn = Arc::new(move || f().boxed());
        self.service.schedule(&self.module, name, expr, job)
    }

    /// Like [`schedule`](Self::schedule) with a shorthand such as `5m`, `hourly` or `daily`.
    pub fn schedule_interval<F, Fut>(&self, name: &str, interval: &str, f: F) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let expr = interval_to_cron(interval)?;
        self.schedule(name, expr, f)
    }

    pub fn remove(&self, name: &str) -> bool {
        self.service.remove(&self.module, name)
    }

    pub fn remove_all(&self) -> usize {
        self.service.remove_all(&self.module)
    }

    pub fn list_jobs(&self) -> Vec<JobInfo> {
        self.service.list_jobs(&self.module)
    }

    pub fn is_scheduled(&self, name: &str) -> bool {
        self.service.is_scheduled(&self.module, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn five_field_expressions_are_normalized() {
        assert!(parse_cron("*/5 * * * *").is_ok());
        assert!(parse_cron("0 0 * * * *").is_ok());
        assert!(parse_cron("@daily").is_ok());
        assert!(matches!(parse_cron("every tuesday"), Err(ExtError::InvalidCron { .. })));
    }

    #[test]
    fn interval_vocabulary() {
        assert_eq!(interval_to_cron("5m").unwrap(), "*/5 * * * *");
        assert_eq!(interval_to_cron(" Hourly ").unwrap(), "@hourly");
        assert_eq!(interval_to_cron("1 day").unwrap(), "@daily");
        assert_eq!(interval_to_cron("6h").unwrap(), "0 */6 * * *");
        for shorthand in ["1m", "10m", "15m", "30m", "2h", "4h", "12h", "24h", "weekly", "monthly"] {
            let expr = interval_to_cron(shorthand).unwrap();
            assert!(parse_cron(expr).is_ok(), "{shorthand} -> {expr}");
        }
        assert!(matches!(
            interval_to_cron("fortnightly"),
            Err(ExtError::UnsupportedInterval(s)) if s == "fortnightly"
        ));
    }

    #[tokio::test]
    async fn jobs_are_scoped_per_module() {
        let svc = Arc::new(CronService::new());
        let a = ModuleScheduler::new(Arc::from("a"), svc.clone());
        let b = ModuleScheduler::new(Arc::from("b"), svc.clone());

        a.schedule_interval("sync", "hourly", || async { anyhow::Ok(()) }).unwrap();
        a.schedule("report", "0 0 * * *", || async { anyhow::Ok(()) }).unwrap();
        b.schedule_interval("sync", "daily", || async { anyhow::Ok(()) }).unwrap();

        let names: Vec<String> = a.list_jobs().into_iter().map(|j| j.name).collect();
        assert_eq!(names, ["report", "sync"]);
        assert!(a.list_jobs().iter().all(|j| j.next_run.is_some()));

        assert_eq!(a.remove_all(), 2);
        assert!(!a.is_scheduled("sync"));
        assert!(b.is_scheduled("sync"));
        assert!(!a.remove("sync"));
        svc.shutdown().await;
    }

    #[tokio::test]
    async fn failing_job_keeps_its_schedule() {
        let svc = Arc::new(CronService::new());
        let sched = ModuleScheduler::new(Arc::from("m"), svc.clone());
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();

        sched
            .schedule("flaky", "* * * * * *", move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        panic!("first run explodes");
                    }
                    anyhow::Ok(())
                }
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(runs.load(Ordering::SeqCst) >= 2);
        assert!(sched.is_scheduled("flaky"));

        svc.shutdown().await;
        assert_eq!(svc.job_count(), 0);
        assert!(matches!(
            sched.schedule("late", "@daily", || async { anyhow::Ok(()) }),
            Err(ExtError::SchedulerStopped)
        ));
    }
}
