//! Periodic background jobs.
//!
//! Each job runs on its own task. The next run is due one interval after the
//! last recorded run, so a restart neither skips nor repeats work: a run that
//! was missed while the process was down fires once at startup.

pub mod jobs;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::store::PersistentStore;

pub use jobs::{AutoEndJob, FlushJob, SweepJob};

#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    async fn run(&self, now: DateTime<Utc>) -> JobReport;
}

/// What one run of a job did. Per-chat failures are counted, never propagated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobReport {
    pub examined: usize,
    pub acted: usize,
    pub warned: usize,
    pub failed: usize,
}

impl fmt::Display for JobReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "examined={} acted={} warned={} failed={}",
            self.examined, self.acted, self.warned, self.failed
        )
    }
}

/// When a job should next run. A job that never ran is due immediately.
pub fn next_due(
    last_run: Option<DateTime<Utc>>,
    interval: Duration,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    match last_run {
        Some(last) => chrono::Duration::from_std(interval)
            .ok()
            .and_then(|interval| last.checked_add_signed(interval))
            .unwrap_or(DateTime::<Utc>::MAX_UTC),
        None => now,
    }
}

pub struct Scheduler {
    jobs: Vec<Arc<dyn Job>>,
    store: Arc<dyn PersistentStore>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn PersistentStore>) -> Self {
        Self {
            jobs: Vec::new(),
            store,
        }
    }

    pub fn with_job(mut self, job: Arc<dyn Job>) -> Self {
        self.jobs.push(job);
        self
    }

    /// Spawn one task per job.
    pub fn start(self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = self
            .jobs
            .into_iter()
            .map(|job| tokio::spawn(run_job(job, self.store.clone(), shutdown_rx.clone())))
            .collect();

        info!("Scheduler started");
        SchedulerHandle { shutdown_tx, tasks }
    }
}

pub struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Signal every job loop and wait for in-flight runs to finish.
    pub async fn shutdown(self) {
        if self.shutdown_tx.send(true).is_err() {
            debug!("All job loops already exited");
        }
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = ?e, "Job task panicked during shutdown");
            }
        }
        info!("Scheduler stopped");
    }
}

async fn run_job(job: Arc<dyn Job>, store: Arc<dyn PersistentStore>, mut shutdown: watch::Receiver<bool>) {
    let name = job.name();
    let interval = job.interval();

    let mut last_run = match store.last_job_run(name).await {
        Ok(last) => last,
        Err(e) => {
            warn!(job = name, error = %e, "Could not read last run, running now");
            None
        }
    };
    info!(job = name, interval_secs = interval.as_secs(), last_run = ?last_run, "Job scheduled");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let now = Utc::now();
        let delay = (next_due(last_run, interval, now) - now)
            .to_std()
            .unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }

        let started = Utc::now();
        let report = job.run(started).await;
        if report.failed > 0 {
            warn!(job = name, %report, "Job finished with failures");
        } else {
            info!(job = name, %report, "Job finished");
        }

        last_run = Some(started);
        if let Err(e) = store.record_job_run(name, started).await {
            warn!(job = name, error = %e, "Failed to record job run");
        }
    }

    debug!(job = name, "Job loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FlakyStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingJob {
        runs: AtomicUsize,
        interval: Duration,
    }

    impl CountingJob {
        fn every(interval: Duration) -> Arc<Self> {
            Arc::new(Self {
                runs: AtomicUsize::new(0),
                interval,
            })
        }

        fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Job for CountingJob {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn interval(&self) -> Duration {
            self.interval
        }

        async fn run(&self, _now: DateTime<Utc>) -> JobReport {
            self.runs.fetch_add(1, Ordering::SeqCst);
            JobReport::default()
        }
    }

    #[test]
    fn never_run_job_is_due_now() {
        let now = Utc::now();
        assert_eq!(next_due(None, Duration::from_secs(60), now), now);
    }

    #[test]
    fn due_one_interval_after_last_run() {
        let now = Utc::now();
        let last = now - chrono::Duration::hours(1);
        assert_eq!(
            next_due(Some(last), Duration::from_secs(6 * 3600), now),
            last + chrono::Duration::hours(6)
        );
    }

    #[test]
    fn missed_run_is_due_in_the_past() {
        let now = Utc::now();
        let last = now - chrono::Duration::days(3);
        assert!(next_due(Some(last), Duration::from_secs(3600), now) < now);
    }

    #[tokio::test]
    async fn first_run_happens_at_startup_and_is_recorded() {
        let store = Arc::new(FlakyStore::new().await);
        let job = CountingJob::every(Duration::from_secs(3600));

        let handle = Scheduler::new(store.clone()).with_job(job.clone()).start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown().await;

        assert_eq!(job.runs(), 1);
        assert!(store.last_job_run("counting").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn recent_run_is_not_repeated_after_restart() {
        let store = Arc::new(FlakyStore::new().await);
        store
            .record_job_run("counting", Utc::now() - chrono::Duration::minutes(30))
            .await
            .unwrap();
        let job = CountingJob::every(Duration::from_secs(3600));

        let handle = Scheduler::new(store.clone()).with_job(job.clone()).start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown().await;

        assert_eq!(job.runs(), 0);
    }

    #[tokio::test]
    async fn long_outage_runs_once_not_per_missed_interval() {
        let store = Arc::new(FlakyStore::new().await);
        store
            .record_job_run("counting", Utc::now() - chrono::Duration::days(2))
            .await
            .unwrap();
        let job = CountingJob::every(Duration::from_secs(3600));

        let handle = Scheduler::new(store.clone()).with_job(job.clone()).start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown().await;

        assert_eq!(job.runs(), 1);
    }

    #[tokio::test]
    async fn unreadable_clock_still_runs() {
        let store = Arc::new(FlakyStore::new().await);
        store.set_failing(true);
        let job = CountingJob::every(Duration::from_secs(3600));

        let handle = Scheduler::new(store.clone()).with_job(job.clone()).start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown().await;

        assert_eq!(job.runs(), 1);
    }
}
