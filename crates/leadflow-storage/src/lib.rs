//! Rate-limited HTTP client and object-storage collaborator for leadflow.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

mod objects;

pub use objects::{FsObjectStore, MemoryObjectStore, ObjectStore, StorageError};

pub const CRATE_NAME: &str = "leadflow-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Success,
    RateLimited,
    Retryable,
    NonRetryable,
}

/// 404 and 410 are definitive answers. Every other non-2xx status except 429
/// is retried against the attempt budget.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_success() {
        RetryDisposition::Success
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::RateLimited
    } else if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
        RetryDisposition::NonRetryable
    } else {
        RetryDisposition::Retryable
    }
}

/// Timeouts and connection failures, including ones hit while streaming the body.
pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout()
        || err.is_connect()
        || err.is_request()
        || err.is_body()
        || err.is_decode()
    {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Linear backoff: attempt `n` (1-based) waits `base_delay * n`, capped at `max_delay`.
///
/// `max_attempts` bounds transient failures (5xx, timeouts, connection errors).
/// 429 responses are tracked separately against `max_rate_limit_retries` and do
/// not consume `max_attempts`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub max_rate_limit_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_rate_limit_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_number: usize) -> Duration {
        let factor = u32::try_from(attempt_number.max(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Server-provided delay from `Retry-After`: delta-seconds or an HTTP date.
pub fn retry_after_delay(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub min_request_interval: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            min_request_interval: Duration::from_millis(200),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Enforces a minimum gap between consecutive request starts.
///
/// The lock is held while sleeping, so concurrent callers queue up and the
/// spacing is exact rather than a lower bound.
#[derive(Debug)]
pub struct RequestSpacer {
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RequestSpacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request: Mutex::new(None),
        }
    }

    pub async fn wait_turn(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + self.min_interval;
            if ready_at > Instant::now() {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn json<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        serde_json::from_slice(&self.body)
            .with_context(|| format!("decoding JSON body from {}", self.final_url))
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("still rate limited after {retries} retries for {url}")]
    RateLimited { retries: usize, url: String },
}

/// Outbound client shared by every enrichment call of a process.
///
/// Cloning is cheap and clones share the same spacing state.
#[derive(Debug, Clone)]
pub struct RateLimitedClient {
    client: reqwest::Client,
    spacer: Arc<RequestSpacer>,
    backoff: BackoffPolicy,
}

impl RateLimitedClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            spacer: Arc::new(RequestSpacer::new(config.min_request_interval)),
            backoff: config.backoff,
        })
    }

    pub async fn fetch_with_retry(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        self.execute(url, || self.client.get(url))
            .instrument(info_span!("http_fetch", method = "GET", url))
            .await
    }

    pub async fn post_json_with_retry<T>(
        &self,
        url: &str,
        body: &T,
    ) -> Result<FetchedResponse, FetchError>
    where
        T: Serialize + ?Sized,
    {
        self.execute(url, || self.client.post(url).json(body))
            .instrument(info_span!("http_fetch", method = "POST", url))
            .await
    }

    async fn execute<F>(&self, url: &str, build: F) -> Result<FetchedResponse, FetchError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut failed_attempts = 0usize;
        let mut rate_limited = 0usize;

        loop {
            self.spacer.wait_turn().await;

            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    match classify_status(status) {
                        RetryDisposition::Success => match resp.bytes().await {
                            Ok(body) => {
                                return Ok(FetchedResponse {
                                    status,
                                    final_url,
                                    body: body.to_vec(),
                                });
                            }
                            Err(err) => {
                                failed_attempts += 1;
                                if classify_reqwest_error(&err) == RetryDisposition::NonRetryable
                                    || failed_attempts >= self.backoff.max_attempts
                                {
                                    return Err(FetchError::Request(err));
                                }
                                debug!(attempt = failed_attempts, error = %err, url, "body read failed, retrying");
                                tokio::time::sleep(self.backoff.delay_for_attempt(failed_attempts)).await;
                            }
                        },
                        RetryDisposition::RateLimited => {
                            rate_limited += 1;
                            if rate_limited > self.backoff.max_rate_limit_retries {
                                return Err(FetchError::RateLimited {
                                    retries: self.backoff.max_rate_limit_retries,
                                    url: final_url,
                                });
                            }
                            let delay = retry_after_delay(resp.headers(), Utc::now())
                                .unwrap_or_else(|| self.backoff.delay_for_attempt(rate_limited));
                            warn!(retry = rate_limited, delay_ms = delay.as_millis() as u64, "rate limited");
                            tokio::time::sleep(delay).await;
                        }
                        RetryDisposition::NonRetryable => {
                            return Err(FetchError::HttpStatus {
                                status: status.as_u16(),
                                url: final_url,
                            });
                        }
                        RetryDisposition::Retryable => {
                            failed_attempts += 1;
                            if failed_attempts >= self.backoff.max_attempts {
                                return Err(FetchError::HttpStatus {
                                    status: status.as_u16(),
                                    url: final_url,
                                });
                            }
                            debug!(attempt = failed_attempts, status = status.as_u16(), "retrying");
                            tokio::time::sleep(self.backoff.delay_for_attempt(failed_attempts)).await;
                        }
                    }
                }
                Err(err) => {
                    failed_attempts += 1;
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable
                        || failed_attempts >= self.backoff.max_attempts
                    {
                        return Err(FetchError::Request(err));
                    }
                    debug!(attempt = failed_attempts, error = %err, url, "retrying");
                    tokio::time::sleep(self.backoff.delay_for_attempt(failed_attempts)).await;
                }
            }
        }
    }
}
