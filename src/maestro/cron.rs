//! Named recurring jobs on the scheduler timeline.
//!
//! Each job is its own tokio task looping `callback → sleep(interval)`.
//! Callback errors are logged per iteration and never stop the loop.
//! Adding a job under an existing name cancels and replaces the old one.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::error::Error;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Result of one cron callback iteration.
pub type CronResult = Result<(), Box<dyn Error + Send + Sync>>;

type CronCallback =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = CronResult> + Send>> + Send + Sync>;

struct CronJob {
    interval: Duration,
    last_run: Arc<Mutex<Option<DateTime<Utc>>>>,
    handle: JoinHandle<()>,
}

/// Summary row returned by [`CronService::list_jobs`].
#[derive(Debug, Clone, PartialEq)]
pub struct CronJobInfo {
    pub name: String,
    pub interval: Duration,
    pub last_run: Option<DateTime<Utc>>,
}

/// Registry of named recurring jobs.
#[derive(Default)]
pub struct CronService {
    jobs: Mutex<HashMap<String, CronJob>>,
}

impl CronService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `callback` to run every `interval`, replacing any job with
    /// the same name.
    pub async fn add_job<F, Fut>(&self, name: impl Into<String>, interval: Duration, callback: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CronResult> + Send + 'static,
    {
        let name = name.into();
        let callback: CronCallback = Arc::new(move || Box::pin(callback()));
        let last_run = Arc::new(Mutex::new(None));

        let mut jobs = self.jobs.lock().await;
        if let Some(old) = jobs.remove(&name) {
            log::warn!("cron job '{}' already exists, replacing", name);
            old.handle.abort();
        }

        let job_name = name.clone();
        let job_last_run = Arc::clone(&last_run);
        let handle = tokio::spawn(async move {
            loop {
                *job_last_run.lock().await = Some(Utc::now());
                if let Err(err) = callback().await {
                    log::error!("cron job '{}' iteration failed: {}", job_name, err);
                }
                tokio::time::sleep(interval).await;
            }
        });

        log::info!("scheduled cron job '{}' every {:?}", name, interval);
        jobs.insert(
            name,
            CronJob {
                interval,
                last_run,
                handle,
            },
        );
    }

    /// Cancel and remove a job. Returns whether it existed.
    pub async fn stop_job(&self, name: &str) -> bool {
        let mut jobs = self.jobs.lock().await;
        match jobs.remove(name) {
            Some(job) => {
                job.handle.abort();
                log::info!("stopped cron job '{}'", name);
                true
            }
            None => false,
        }
    }

    /// Cancel every job. Used during graceful shutdown.
    pub async fn stop_all(&self) {
        let mut jobs = self.jobs.lock().await;
        for (name, job) in jobs.drain() {
            job.handle.abort();
            log::info!("stopped cron job '{}'", name);
        }
    }

    /// Name, interval, and last run time of every registered job.
    pub async fn list_jobs(&self) -> Vec<CronJobInfo> {
        let jobs = self.jobs.lock().await;
        let mut infos = Vec::with_capacity(jobs.len());
        for (name, job) in jobs.iter() {
            infos.push(CronJobInfo {
                name: name.clone(),
                interval: job.interval,
                last_run: *job.last_run.lock().await,
            });
        }
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }
}

impl Drop for CronService {
    fn drop(&mut self) {
        // Job tasks must not outlive the service.
        if let Ok(jobs) = self.jobs.try_lock() {
            for job in jobs.values() {
                job.handle.abort();
            }
        }
    }
}
