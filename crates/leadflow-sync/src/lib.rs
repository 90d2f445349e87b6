//! Ingestion pipeline orchestration: matching, enrichment, persistence, queue and worker.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate, Utc};
use leadflow_adapters::{DeathRegistryAdapter, ListingFeedAdapter};
use leadflow_core::{DeathRegistryJob, ListingFeedJob};
use leadflow_storage::{FsObjectStore, ObjectStore, RateLimitedClient};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::watch;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

pub mod config;
pub mod enrichment;
pub mod jobs;
pub mod matching;
pub mod persistence;
pub mod processor;
pub mod queue;
pub mod worker;

pub use config::{PipelineConfig, QueueFile, QueueSettings};
pub use enrichment::{Enricher, EnrichmentSource, MairieDirectory, MemoryDirectory, SingleSlotCache};
pub use jobs::{DeathRegistryHandler, ListingFeedHandler};
pub use matching::{calculate_match_score, DiagnosticLinker, MAX_LINKS_PER_OPPORTUNITY};
pub use persistence::{BatchWriter, OpportunityStore, PgStore};
pub use processor::{IngestionProcessor, JobError, JobReport, JobState, JobStats};
pub use queue::{JobId, JobOptions, JobQueue, MemoryJobQueue, PgJobQueue};
pub use worker::{JobHandler, Worker, WorkerSettings};

pub const CRATE_NAME: &str = "leadflow-sync";

pub const DEATH_REGISTRY_QUEUE: &str = "death-registry";
pub const LISTING_FEED_QUEUE: &str = "listing-feed";

/// Answer of the job trigger surface. Enqueue problems are reported here,
/// never raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerResponse {
    pub success: bool,
    #[serde(rename = "jobId", skip_serializing_if = "Option::is_none", default)]
    pub job_id: Option<JobId>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

impl TriggerResponse {
    pub fn accepted(job_id: JobId) -> Self {
        Self {
            success: true,
            job_id: Some(job_id),
            error: None,
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            job_id: None,
            error: Some(error.into()),
        }
    }
}

pub async fn trigger_job(
    queue: &dyn JobQueue,
    queue_name: &str,
    payload: serde_json::Value,
    options: JobOptions,
) -> TriggerResponse {
    match queue.enqueue(queue_name, payload, options).await {
        Ok(job_id) => {
            info!(queue = queue_name, %job_id, "job enqueued");
            TriggerResponse::accepted(job_id)
        }
        Err(err) => {
            error!(queue = queue_name, error = %format!("{err:#}"), "enqueue failed");
            TriggerResponse::rejected(format!("{err:#}"))
        }
    }
}

pub async fn trigger_death_registry(
    queue: &dyn JobQueue,
    job: &DeathRegistryJob,
    options: JobOptions,
) -> TriggerResponse {
    if let Err(err) = job.validate() {
        return TriggerResponse::rejected(err.to_string());
    }
    match serde_json::to_value(job) {
        Ok(payload) => trigger_job(queue, DEATH_REGISTRY_QUEUE, payload, options).await,
        Err(err) => TriggerResponse::rejected(err.to_string()),
    }
}

pub async fn trigger_listing_feed(
    queue: &dyn JobQueue,
    job: &ListingFeedJob,
    options: JobOptions,
) -> TriggerResponse {
    if let Err(err) = job.validate() {
        return TriggerResponse::rejected(err.to_string());
    }
    match serde_json::to_value(job) {
        Ok(payload) => trigger_job(queue, LISTING_FEED_QUEUE, payload, options).await,
        Err(err) => TriggerResponse::rejected(err.to_string()),
    }
}

/// Year and month of the calendar month before `today`.
pub fn previous_month(today: NaiveDate) -> (i32, u32) {
    if today.month() == 1 {
        (today.year() - 1, 12)
    } else {
        (today.year(), today.month() - 1)
    }
}

/// Scheduler enqueuing last month's registry window on `cron`.
pub async fn build_scheduler(
    queue: Arc<dyn JobQueue>,
    cron: &str,
    options: JobOptions,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let queue = Arc::clone(&queue);
        Box::pin(async move {
            let (year, month) = previous_month(Utc::now().date_naive());
            let payload = DeathRegistryJob::ScheduledWindow { year, month };
            let response = trigger_death_registry(queue.as_ref(), &payload, options).await;
            if !response.success {
                warn!(year, month, error = ?response.error, "scheduled registry job not enqueued");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

pub async fn connect(config: &PipelineConfig) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("connecting to DATABASE_URL")
}

/// Worker with both ingestion queues registered against Postgres and the
/// filesystem object store.
pub fn build_worker(
    config: &PipelineConfig,
    pool: PgPool,
    queues: &QueueFile,
) -> Result<(Arc<dyn JobQueue>, Worker)> {
    let store = Arc::new(PgStore::new(pool.clone()));
    let queue: Arc<dyn JobQueue> = Arc::new(PgJobQueue::new(pool));
    let objects: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(&config.object_store_dir));
    let client = RateLimitedClient::new(config.http_client_config())?;
    let writer = BatchWriter::new(store.clone(), config.batch_size);

    let deaths = IngestionProcessor::new(
        Arc::new(DeathRegistryAdapter),
        Arc::clone(&objects),
        writer.clone(),
    )
    .with_enrichment(Arc::new(MairieDirectory::new(
        client.clone(),
        config.directory_api_url.clone(),
    )))
    .with_settings(config.ingestion_settings());

    let listings = IngestionProcessor::new(Arc::new(ListingFeedAdapter), objects, writer)
        .with_http(client)
        .with_linker(DiagnosticLinker::new(store.clone(), store))
        .with_settings(config.ingestion_settings());

    let worker = Worker::new(Arc::clone(&queue))
        .register(
            DEATH_REGISTRY_QUEUE,
            Arc::new(DeathRegistryHandler::new(deaths)),
            queues.settings_for(DEATH_REGISTRY_QUEUE).worker_settings(),
        )
        .register(
            LISTING_FEED_QUEUE,
            Arc::new(ListingFeedHandler::new(listings, config.listing_api_url.clone())),
            queues.settings_for(LISTING_FEED_QUEUE).worker_settings(),
        );
    Ok((queue, worker))
}

/// Runs the worker (and the scheduler when enabled) until `shutdown` fires.
pub async fn run_worker_from_env(shutdown: watch::Receiver<bool>) -> Result<()> {
    let config = PipelineConfig::from_env();
    let queues = QueueFile::load(&config.queues_file)?;
    let pool = connect(&config).await?;
    let (queue, worker) = build_worker(&config, pool, &queues)?;

    let mut scheduler = if config.scheduler_enabled {
        let options = queues.settings_for(DEATH_REGISTRY_QUEUE).job_options();
        let sched = build_scheduler(queue, &config.death_registry_cron, options).await?;
        sched.start().await.context("starting scheduler")?;
        info!(cron = %config.death_registry_cron, "scheduler started");
        Some(sched)
    } else {
        None
    };

    let outcome = worker.run(shutdown).await;
    if let Some(sched) = scheduler.as_mut() {
        if let Err(err) = sched.shutdown().await {
            warn!(error = ?err, "scheduler shutdown failed");
        }
    }
    outcome
}

/// Enqueue helper for the CLI: Postgres queue, options from `queues.yaml`.
pub async fn enqueue_from_env(queue_name: &str, payload: serde_json::Value) -> Result<TriggerResponse> {
    let config = PipelineConfig::from_env();
    let queues = QueueFile::load(&config.queues_file)?;
    let queue = PgJobQueue::new(connect(&config).await?);
    let options = queues.settings_for(queue_name).job_options();
    Ok(trigger_job(&queue, queue_name, payload, options).await)
}
