//! Queue worker: one handler per named queue, polled with bounded concurrency.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, info_span, warn, Instrument};

use crate::processor::{JobError, JobReport};
use crate::queue::{FailOutcome, JobId, JobQueue, QueuedJob};

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &QueuedJob) -> Result<JobReport, JobError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Jobs of this queue processed at the same time.
    pub concurrency: usize,
    /// A job running longer is failed through the queue's retry policy.
    pub timeout: Option<Duration>,
    pub poll_interval: Duration,
    /// An active job without a heartbeat for this long is reclaimed. Heartbeats
    /// are sent at a third of it.
    pub stall_timeout: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: 1,
            timeout: None,
            poll_interval: Duration::from_secs(1),
            stall_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
pub enum JobOutcome {
    Completed {
        job_id: JobId,
        queue: String,
        report: JobReport,
    },
    Failed {
        job_id: JobId,
        queue: String,
        error: String,
        next: FailOutcome,
    },
}

impl JobOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

struct Registration {
    queue: String,
    handler: Arc<dyn JobHandler>,
    settings: WorkerSettings,
}

pub struct Worker {
    queue: Arc<dyn JobQueue>,
    registrations: Vec<Registration>,
}

impl Worker {
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self {
            queue,
            registrations: Vec::new(),
        }
    }

    pub fn register(
        mut self,
        queue: impl Into<String>,
        handler: Arc<dyn JobHandler>,
        settings: WorkerSettings,
    ) -> Self {
        self.registrations.push(Registration {
            queue: queue.into(),
            handler,
            settings,
        });
        self
    }

    pub fn queues(&self) -> Vec<&str> {
        self.registrations.iter().map(|r| r.queue.as_str()).collect()
    }

    /// Runs at most one due job of `queue`.
    pub async fn process_next(&self, queue: &str) -> Result<Option<JobOutcome>> {
        let registration = self
            .registrations
            .iter()
            .find(|r| r.queue == queue)
            .with_context(|| format!("no handler registered for queue {queue}"))?;
        self.run_one(registration).await
    }

    /// Runs every due job of every queue until none is left, one at a time.
    pub async fn drain(&self) -> Result<Vec<JobOutcome>> {
        let mut outcomes = Vec::new();
        loop {
            let before = outcomes.len();
            for registration in &self.registrations {
                while let Some(outcome) = self.run_one(registration).await? {
                    outcomes.push(outcome);
                }
            }
            if outcomes.len() == before {
                return Ok(outcomes);
            }
        }
    }

    /// Polls every registered queue until `shutdown` flips to `true`. Jobs in
    /// flight are finished before returning.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let worker = Arc::new(self);
        let mut pollers = JoinSet::new();
        for (index, registration) in worker.registrations.iter().enumerate() {
            info!(
                queue = %registration.queue,
                concurrency = registration.settings.concurrency,
                "worker listening"
            );
            for _ in 0..registration.settings.concurrency.max(1) {
                pollers.spawn(poll_loop(Arc::clone(&worker), index, shutdown.clone()));
            }
        }

        while let Some(joined) = pollers.join_next().await {
            joined.context("queue poller panicked")?;
        }
        info!("worker stopped");
        Ok(())
    }

    async fn run_one(&self, registration: &Registration) -> Result<Option<JobOutcome>> {
        let reclaimed = self
            .queue
            .reclaim_stalled(&registration.queue, registration.settings.stall_timeout)
            .await?;
        if reclaimed > 0 {
            warn!(queue = %registration.queue, reclaimed, "stalled jobs returned to the queue");
        }

        let Some(job) = self.queue.dequeue(&registration.queue).await? else {
            return Ok(None);
        };
        let span = info_span!(
            "job",
            queue = %job.queue,
            job_id = %job.id,
            attempt = job.attempts_made
        );
        self.execute(registration, job).instrument(span).await.map(Some)
    }

    async fn execute(&self, registration: &Registration, job: QueuedJob) -> Result<JobOutcome> {
        let heartbeat = tokio::spawn(
            keep_alive(
                Arc::clone(&self.queue),
                job.clone(),
                registration.settings.stall_timeout / 3,
            )
            .in_current_span(),
        );
        let handled = match registration.settings.timeout {
            Some(limit) => tokio::time::timeout(limit, registration.handler.handle(&job))
                .await
                .unwrap_or(Err(JobError::TimedOut(limit))),
            None => registration.handler.handle(&job).await,
        };
        heartbeat.abort();

        match handled {
            Ok(report) => {
                self.queue.complete(&job).await?;
                info!(inserted = report.stats.inserted, failed = report.stats.failed, "job completed");
                Ok(JobOutcome::Completed {
                    job_id: job.id,
                    queue: job.queue,
                    report,
                })
            }
            Err(err) => {
                let message = err.to_string();
                let next = self.queue.fail(&job, &message).await?;
                match next {
                    FailOutcome::RetryScheduled { delay } => {
                        warn!(error = %message, retry_in_ms = delay.as_millis() as u64, "job failed, retry scheduled")
                    }
                    FailOutcome::Exhausted => error!(error = %message, "job failed, attempts exhausted"),
                }
                Ok(JobOutcome::Failed {
                    job_id: job.id,
                    queue: job.queue,
                    error: message,
                    next,
                })
            }
        }
    }
}

async fn keep_alive(queue: Arc<dyn JobQueue>, job: QueuedJob, every: Duration) {
    let every = every.max(Duration::from_millis(10));
    loop {
        tokio::time::sleep(every).await;
        if let Err(err) = queue.heartbeat(&job).await {
            warn!(error = %format!("{err:#}"), "heartbeat failed");
        }
    }
}

async fn poll_loop(worker: Arc<Worker>, index: usize, mut shutdown: watch::Receiver<bool>) {
    let registration = &worker.registrations[index];
    loop {
        if *shutdown.borrow() {
            break;
        }
        let idle = match worker.run_one(registration).await {
            Ok(Some(_)) => false,
            Ok(None) => true,
            Err(err) => {
                error!(queue = %registration.queue, error = %format!("{err:#}"), "queue poll failed");
                true
            }
        };
        if idle {
            tokio::select! {
                _ = tokio::time::sleep(registration.settings.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use crate::processor::{JobState, JobStats};
    use crate::queue::{JobOptions, JobStatus, MemoryJobQueue};

    fn report() -> JobReport {
        JobReport {
            source_id: "test".into(),
            final_state: JobState::Archived,
            history: vec![JobState::Dequeued, JobState::Archived],
            stats: JobStats::default(),
            archived_to: None,
            failures_artifact: None,
        }
    }

    /// Fails the first `failures` calls, then succeeds.
    struct CountingHandler {
        calls: AtomicUsize,
        failures: usize,
        delay: Duration,
    }

    impl CountingHandler {
        fn new(failures: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                failures,
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn handle(&self, _job: &QueuedJob) -> Result<JobReport, JobError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if call < self.failures {
                return Err(JobError::Internal(format!("failure {call}")));
            }
            Ok(report())
        }
    }

    fn immediate_retries(attempts: u32) -> JobOptions {
        JobOptions {
            attempts,
            backoff_ms: 0,
            ..JobOptions::default()
        }
    }

    #[tokio::test]
    async fn failed_job_is_retried_by_the_queue() {
        let queue = Arc::new(MemoryJobQueue::new());
        let handler = Arc::new(CountingHandler::new(1));
        let worker = Worker::new(queue.clone()).register("q", handler.clone(), WorkerSettings::default());

        let id = queue.enqueue("q", json!({}), immediate_retries(3)).await.unwrap();
        let outcomes = worker.drain().await.unwrap();

        assert_eq!(outcomes.len(), 2);
        assert!(!outcomes[0].is_completed());
        assert!(outcomes[1].is_completed());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert_eq!(queue.status(id), Some(JobStatus::Completed));
    }

    #[tokio::test]
    async fn exhausted_job_ends_failed() {
        let queue = Arc::new(MemoryJobQueue::new());
        let handler = Arc::new(CountingHandler::new(usize::MAX));
        let worker = Worker::new(queue.clone()).register("q", handler.clone(), WorkerSettings::default());

        let id = queue.enqueue("q", json!({}), immediate_retries(2)).await.unwrap();
        let outcomes = worker.drain().await.unwrap();

        assert_eq!(outcomes.len(), 2);
        assert!(matches!(
            outcomes.last(),
            Some(JobOutcome::Failed { next: FailOutcome::Exhausted, .. })
        ));
        assert_eq!(queue.status(id), Some(JobStatus::Failed));
        assert_eq!(queue.last_error(id).as_deref(), Some("internal error: failure 1"));
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_job_is_failed_not_dropped() {
        let queue = Arc::new(MemoryJobQueue::new());
        let handler = Arc::new(CountingHandler {
            delay: Duration::from_secs(60),
            ..CountingHandler::new(0)
        });
        let settings = WorkerSettings {
            timeout: Some(Duration::from_millis(50)),
            ..WorkerSettings::default()
        };
        let worker = Worker::new(queue.clone()).register("q", handler, settings);

        let id = queue.enqueue("q", json!({}), immediate_retries(1)).await.unwrap();
        let outcome = worker.process_next("q").await.unwrap().unwrap();

        assert!(matches!(outcome, JobOutcome::Failed { .. }));
        assert_eq!(queue.status(id), Some(JobStatus::Failed));
        assert!(queue.last_error(id).unwrap().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn job_abandoned_by_a_dead_worker_is_redelivered() {
        let queue = Arc::new(MemoryJobQueue::new());
        let handler = Arc::new(CountingHandler::new(0));
        let worker = Worker::new(queue.clone()).register("q", handler.clone(), WorkerSettings::default());

        let id = queue.enqueue("q", json!({}), immediate_retries(3)).await.unwrap();
        // claimed by a process that never reports back
        queue.dequeue("q").await.unwrap().unwrap();
        assert!(worker.process_next("q").await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(31)).await;
        let outcome = worker.process_next("q").await.unwrap().unwrap();

        assert!(outcome.is_completed());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.status(id), Some(JobStatus::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn long_running_job_keeps_its_lease() {
        let queue = Arc::new(MemoryJobQueue::new());
        let handler = Arc::new(CountingHandler {
            delay: Duration::from_secs(90),
            ..CountingHandler::new(0)
        });
        let settings = WorkerSettings::default();
        let worker = Arc::new(Worker::new(queue.clone()).register("q", handler.clone(), settings));

        let id = queue.enqueue("q", json!({}), immediate_retries(3)).await.unwrap();
        let running = {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move { worker.process_next("q").await })
        };

        // a second poller sweeps while the first job is still running
        for _ in 0..8 {
            tokio::time::sleep(Duration::from_secs(10)).await;
            assert_eq!(queue.reclaim_stalled("q", settings.stall_timeout).await.unwrap(), 0);
            assert_eq!(queue.status(id), Some(JobStatus::Active));
        }

        let outcome = running.await.unwrap().unwrap().unwrap();
        assert!(outcome.is_completed());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_queue_is_an_error() {
        let worker = Worker::new(Arc::new(MemoryJobQueue::new()));
        assert!(worker.process_next("nope").await.is_err());
    }

    #[tokio::test]
    async fn run_processes_jobs_until_shutdown() {
        let queue = Arc::new(MemoryJobQueue::new());
        let handler = Arc::new(CountingHandler::new(0));
        let settings = WorkerSettings {
            concurrency: 2,
            poll_interval: Duration::from_millis(10),
            ..WorkerSettings::default()
        };
        let worker = Worker::new(queue.clone()).register("q", handler.clone(), settings);
        for n in 0..3 {
            queue.enqueue("q", json!({ "n": n }), JobOptions::default()).await.unwrap();
        }

        let (stop, shutdown) = watch::channel(false);
        let running = tokio::spawn(worker.run(shutdown));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while queue.counts("q").completed < 3 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        stop.send(true).unwrap();
        running.await.unwrap().unwrap();

        assert_eq!(queue.counts("q").completed, 3);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }
}
