//! Cron scheduling for digest jobs.
//!
//! Each tick goes through a `JobRunner`: take the run lock, run the job,
//! record the outcome, release. A tick that finds the lock held is skipped.
//! A failed or panicking run is logged and the next tick runs normally.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::jobs::{DigestJob, RunReport};
use crate::lock::RunLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Idle,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Failed,
}

/// Point-in-time view of one job, served by the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub name: &'static str,
    pub schedule: String,
    pub state: JobState,
    pub last_outcome: Option<RunOutcome>,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub runs: u64,
    pub overlapping_ticks: u64,
    pub sent: u64,
    pub skipped: u64,
    pub failed: u64,
}

pub struct JobRunner {
    job: Arc<dyn DigestJob>,
    lock: Arc<dyn RunLock>,
    snapshot: Mutex<JobSnapshot>,
}

impl JobRunner {
    pub fn new(schedule: impl Into<String>, job: Arc<dyn DigestJob>, lock: Arc<dyn RunLock>) -> Self {
        let snapshot = JobSnapshot {
            name: job.name(),
            schedule: schedule.into(),
            state: JobState::Idle,
            last_outcome: None,
            last_started_at: None,
            last_finished_at: None,
            last_error: None,
            runs: 0,
            overlapping_ticks: 0,
            sent: 0,
            skipped: 0,
            failed: 0,
        };
        Self {
            job,
            lock,
            snapshot: Mutex::new(snapshot),
        }
    }

    pub fn snapshot(&self) -> JobSnapshot {
        self.state().clone()
    }

    /// Run the job once, unless a previous run still holds the lock.
    pub async fn tick(&self) {
        let name = self.job.name();

        let lease = match self.lock.try_acquire(name).await {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                tracing::warn!(job = name, "Previous digest run still in progress, skipping tick");
                self.state().overlapping_ticks += 1;
                return;
            }
            Err(e) => {
                tracing::error!(job = name, error = %e, "Failed to acquire digest run lock");
                let mut state = self.state();
                state.last_outcome = Some(RunOutcome::Failed);
                state.last_error = Some(e.to_string());
                return;
            }
        };

        {
            let mut state = self.state();
            state.state = JobState::Running;
            state.last_started_at = Some(Utc::now());
            state.runs += 1;
        }
        tracing::info!(job = name, "Digest run started");

        // Run on its own task so a panic is contained and the lease still released.
        let job = self.job.clone();
        let result = match tokio::spawn(async move { job.run().await }).await {
            Ok(result) => result,
            Err(e) => Err(anyhow::anyhow!("digest run aborted: {}", e)),
        };

        self.finish(name, result);

        if let Err(e) = self.lock.release(lease).await {
            tracing::warn!(job = name, error = %e, "Failed to release digest run lock");
        }
    }

    fn finish(&self, name: &'static str, result: anyhow::Result<RunReport>) {
        let mut state = self.state();
        state.state = JobState::Idle;
        state.last_finished_at = Some(Utc::now());

        match result {
            Ok(report) => {
                tracing::info!(
                    job = name,
                    sent = report.sent,
                    skipped = report.skipped,
                    failed = report.failed,
                    "Digest run finished"
                );
                state.last_outcome = Some(RunOutcome::Succeeded);
                state.last_error = None;
                state.sent += report.sent as u64;
                state.skipped += report.skipped as u64;
                state.failed += report.failed as u64;
            }
            Err(e) => {
                tracing::error!(job = name, error = %e, "Digest run failed");
                state.last_outcome = Some(RunOutcome::Failed);
                state.last_error = Some(e.to_string());
            }
        }
    }

    fn state(&self) -> MutexGuard<'_, JobSnapshot> {
        // Counters stay usable even if a holder panicked.
        self.snapshot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Read handle over every registered job's stats.
#[derive(Clone, Default)]
pub struct DigestStats {
    runners: Arc<Vec<Arc<JobRunner>>>,
}

impl DigestStats {
    pub fn snapshot(&self) -> Vec<JobSnapshot> {
        self.runners.iter().map(|r| r.snapshot()).collect()
    }
}

pub struct DigestScheduler {
    lock: Arc<dyn RunLock>,
    runners: Vec<(String, Arc<JobRunner>)>,
}

impl DigestScheduler {
    pub fn new(lock: Arc<dyn RunLock>) -> Self {
        Self {
            lock,
            runners: Vec::new(),
        }
    }

    /// Register `job` on a six-field cron expression (seconds first).
    pub fn register(&mut self, schedule: impl Into<String>, job: Arc<dyn DigestJob>) -> Arc<JobRunner> {
        let schedule = schedule.into();
        let runner = Arc::new(JobRunner::new(schedule.clone(), job, self.lock.clone()));
        self.runners.push((schedule, runner.clone()));
        runner
    }

    pub fn stats(&self) -> DigestStats {
        DigestStats {
            runners: Arc::new(self.runners.iter().map(|(_, r)| r.clone()).collect()),
        }
    }

    /// Start every registered job. Keep the returned scheduler alive for as long as jobs should run.
    pub async fn start(&self) -> anyhow::Result<JobScheduler> {
        let sched = JobScheduler::new().await?;

        for (schedule, runner) in &self.runners {
            let name = runner.snapshot().name;
            let runner = runner.clone();
            let job = Job::new_async(schedule.as_str(), move |_uuid, _l| {
                let runner = runner.clone();
                Box::pin(async move {
                    runner.tick().await;
                })
            })
            .map_err(|e| anyhow::anyhow!("invalid schedule '{}' for {}: {}", schedule, name, e))?;

            sched.add(job).await?;
            tracing::info!(job = name, schedule = %schedule, "Digest job scheduled");
        }

        sched.start().await?;
        Ok(sched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LocalRunLock;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Fails on the runs listed in `fail_on`, panics on those in `panic_on`.
    #[derive(Default)]
    struct ScriptedJob {
        calls: AtomicUsize,
        fail_on: Vec<usize>,
        panic_on: Vec<usize>,
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl DigestJob for ScriptedJob {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn run(&self) -> anyhow::Result<RunReport> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.panic_on.contains(&call) {
                panic!("digest job exploded");
            }
            if self.fail_on.contains(&call) {
                anyhow::bail!("aggregate query failed");
            }
            Ok(RunReport {
                sent: 2,
                skipped: 1,
                failed: 0,
            })
        }
    }

    fn runner(job: ScriptedJob) -> Arc<JobRunner> {
        Arc::new(JobRunner::new(
            "0 */10 * * * *",
            Arc::new(job),
            Arc::new(LocalRunLock::new()),
        ))
    }

    #[tokio::test]
    async fn test_overlapping_tick_is_skipped() {
        let gate = Arc::new(Notify::new());
        let runner = runner(ScriptedJob {
            gate: Some(gate.clone()),
            ..Default::default()
        });

        let first = tokio::spawn({
            let runner = runner.clone();
            async move { runner.tick().await }
        });
        while runner.snapshot().state != JobState::Running {
            tokio::task::yield_now().await;
        }

        runner.tick().await;
        assert_eq!(runner.snapshot().overlapping_ticks, 1);

        gate.notify_one();
        first.await.unwrap();

        let snapshot = runner.snapshot();
        assert_eq!(snapshot.state, JobState::Idle);
        assert_eq!(snapshot.last_outcome, Some(RunOutcome::Succeeded));
        assert_eq!(snapshot.runs, 1);
        assert_eq!(snapshot.sent, 2);
    }

    #[tokio::test]
    async fn test_failed_run_does_not_block_next_tick() {
        let runner = runner(ScriptedJob {
            fail_on: vec![0],
            ..Default::default()
        });

        runner.tick().await;
        let snapshot = runner.snapshot();
        assert_eq!(snapshot.last_outcome, Some(RunOutcome::Failed));
        assert_eq!(snapshot.last_error.as_deref(), Some("aggregate query failed"));

        runner.tick().await;
        let snapshot = runner.snapshot();
        assert_eq!(snapshot.last_outcome, Some(RunOutcome::Succeeded));
        assert!(snapshot.last_error.is_none());
        assert_eq!(snapshot.runs, 2);
    }

    #[tokio::test]
    async fn test_panicking_run_releases_lock() {
        let runner = runner(ScriptedJob {
            panic_on: vec![0],
            ..Default::default()
        });

        runner.tick().await;
        assert_eq!(runner.snapshot().last_outcome, Some(RunOutcome::Failed));

        runner.tick().await;
        let snapshot = runner.snapshot();
        assert_eq!(snapshot.last_outcome, Some(RunOutcome::Succeeded));
        assert_eq!(snapshot.overlapping_ticks, 0);
    }

    #[tokio::test]
    async fn test_stats_cover_registered_jobs() {
        let mut scheduler = DigestScheduler::new(Arc::new(LocalRunLock::new()));
        scheduler.register("0 0 11 * * Mon-Fri", Arc::new(ScriptedJob::default()));

        let stats = scheduler.stats().snapshot();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].name, "scripted");
        assert_eq!(stats[0].schedule, "0 0 11 * * Mon-Fri");
        assert_eq!(stats[0].state, JobState::Idle);
        assert!(stats[0].last_outcome.is_none());
    }

    #[tokio::test]
    async fn test_invalid_schedule_fails_start() {
        let mut scheduler = DigestScheduler::new(Arc::new(LocalRunLock::new()));
        scheduler.register("every tuesday", Arc::new(ScriptedJob::default()));

        let Err(err) = scheduler.start().await else {
            panic!("start should reject an invalid cron expression");
        };
        assert!(err.to_string().contains("every tuesday"));
    }
}
