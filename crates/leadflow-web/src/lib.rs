//! Axum job-trigger surface for leadflow.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use leadflow_core::{DeathRegistryJob, ListingFeedJob};
use leadflow_sync::{
    connect, trigger_job, JobOptions, JobQueue, PgJobQueue, PipelineConfig, QueueFile,
    TriggerResponse, DEATH_REGISTRY_QUEUE, LISTING_FEED_QUEUE,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "leadflow-web";

#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<dyn JobQueue>,
    pub queues: QueueFile,
}

impl AppState {
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self {
            queue,
            queues: QueueFile::default(),
        }
    }

    pub fn with_queue_settings(mut self, queues: QueueFile) -> Self {
        self.queues = queues;
        self
    }

    fn options_for(&self, queue: &str) -> JobOptions {
        self.queues.settings_for(queue).job_options()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/jobs/death-registry", post(death_registry_handler))
        .route("/jobs/listing-feed", post(listing_feed_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = PipelineConfig::from_env();
    let queues = QueueFile::load(&config.queues_file)?;
    let queue: Arc<dyn JobQueue> = Arc::new(PgJobQueue::new(connect(&config).await?));
    let state = AppState::new(queue).with_queue_settings(queues);

    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, "job trigger listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: CRATE_NAME,
    })
}

async fn death_registry_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<serde_json::Value>, JsonRejection>,
) -> Response {
    let job: DeathRegistryJob = match decode(body) {
        Ok(job) => job,
        Err(resp) => return resp,
    };
    if let Err(err) = job.validate() {
        return bad_request(err.to_string());
    }
    enqueue(&state, DEATH_REGISTRY_QUEUE, &job).await
}

async fn listing_feed_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<serde_json::Value>, JsonRejection>,
) -> Response {
    let job: ListingFeedJob = match decode(body) {
        Ok(job) => job,
        Err(resp) => return resp,
    };
    if let Err(err) = job.validate() {
        return bad_request(err.to_string());
    }
    enqueue(&state, LISTING_FEED_QUEUE, &job).await
}

fn decode<T: DeserializeOwned>(
    body: Result<Json<serde_json::Value>, JsonRejection>,
) -> Result<T, Response> {
    let Json(value) = body.map_err(|rejection| bad_request(rejection.body_text()))?;
    serde_json::from_value(value).map_err(|err| bad_request(format!("invalid payload: {err}")))
}

async fn enqueue<T: Serialize>(state: &AppState, queue: &str, job: &T) -> Response {
    let payload = match serde_json::to_value(job) {
        Ok(payload) => payload,
        Err(err) => return respond(TriggerResponse::rejected(err.to_string())),
    };
    let response = trigger_job(state.queue.as_ref(), queue, payload, state.options_for(queue)).await;
    respond(response)
}

fn respond(response: TriggerResponse) -> Response {
    let status = if response.success {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(response)).into_response()
}

fn bad_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(TriggerResponse::rejected(message)),
    )
        .into_response()
}
