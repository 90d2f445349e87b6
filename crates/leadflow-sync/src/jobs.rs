//! Queue handlers turning job payloads into ingestion runs.

use async_trait::async_trait;
use chrono::NaiveDate;
use leadflow_core::{DeathRegistryJob, ListingFeedJob};

use crate::processor::{ArtifactSource, IngestionProcessor, IngestionRequest, JobError, JobReport};
use crate::queue::QueuedJob;
use crate::worker::JobHandler;

/// Object name of the monthly registry file published for `year`/`month`.
pub fn scheduled_file_name(year: i32, month: u32) -> String {
    format!("deces-{year}-m{month:02}.csv")
}

fn invalid(err: impl std::fmt::Display) -> JobError {
    JobError::InvalidPayload(err.to_string())
}

pub struct DeathRegistryHandler {
    processor: IngestionProcessor,
}

impl DeathRegistryHandler {
    pub fn new(processor: IngestionProcessor) -> Self {
        Self { processor }
    }

    pub fn request_for(&self, job: &DeathRegistryJob) -> IngestionRequest {
        let artifact = match job {
            DeathRegistryJob::ManualPath { path, file_name } => ArtifactSource::Stored {
                path: path.clone(),
                file_name: file_name.clone(),
            },
            DeathRegistryJob::ScheduledWindow { year, month } => {
                let file_name = scheduled_file_name(*year, *month);
                ArtifactSource::Stored {
                    path: format!("{}/{}", self.processor.settings().incoming_prefix, file_name),
                    file_name,
                }
            }
        };
        IngestionRequest {
            artifact,
            published_window: None,
        }
    }
}

#[async_trait]
impl JobHandler for DeathRegistryHandler {
    async fn handle(&self, job: &QueuedJob) -> Result<JobReport, JobError> {
        let payload: DeathRegistryJob = job.payload_as().map_err(invalid)?;
        payload.validate().map_err(invalid)?;
        self.processor.run(&self.request_for(&payload)).await
    }
}

pub struct ListingFeedHandler {
    processor: IngestionProcessor,
    listing_api_url: String,
}

impl ListingFeedHandler {
    pub fn new(processor: IngestionProcessor, listing_api_url: impl Into<String>) -> Self {
        Self {
            processor,
            listing_api_url: listing_api_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn export_url(&self, since: NaiveDate, until: NaiveDate) -> String {
        format!(
            "{}/exports/listings.csv?since={since}&until={until}",
            self.listing_api_url
        )
    }

    pub fn request_for(&self, job: &ListingFeedJob) -> IngestionRequest {
        IngestionRequest {
            artifact: ArtifactSource::Fetched {
                url: self.export_url(job.since, job.until),
                file_name: format!("listings-{}-{}.csv", job.since, job.until),
            },
            published_window: Some((job.since, job.until)),
        }
    }
}

#[async_trait]
impl JobHandler for ListingFeedHandler {
    async fn handle(&self, job: &QueuedJob) -> Result<JobReport, JobError> {
        let payload: ListingFeedJob = job.payload_as().map_err(invalid)?;
        payload.validate().map_err(invalid)?;
        self.processor.run(&self.request_for(&payload)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::extract::Query;
    use axum::routing::get;
    use axum::Router;
    use leadflow_adapters::{DeathRegistryAdapter, ListingFeedAdapter};
    use leadflow_core::CorpusRecord;
    use leadflow_storage::{HttpClientConfig, MemoryObjectStore, RateLimitedClient};
    use serde::Deserialize;
    use serde_json::json;

    use crate::matching::DiagnosticLinker;
    use crate::persistence::{BatchWriter, MemoryCorpus, MemoryLinkStore, MemoryOpportunityStore};
    use crate::queue::JobOptions;

    fn queued(payload: serde_json::Value) -> QueuedJob {
        QueuedJob {
            id: uuid::Uuid::new_v4(),
            queue: "test".into(),
            payload,
            attempts_made: 1,
            options: JobOptions::default(),
        }
    }

    #[test]
    fn scheduled_window_maps_to_monthly_file() {
        assert_eq!(scheduled_file_name(2023, 1), "deces-2023-m01.csv");
        let handler = DeathRegistryHandler::new(IngestionProcessor::new(
            Arc::new(DeathRegistryAdapter),
            Arc::new(MemoryObjectStore::new()),
            BatchWriter::new(Arc::new(MemoryOpportunityStore::new()), 10),
        ));
        let request = handler.request_for(&DeathRegistryJob::ScheduledWindow { year: 2023, month: 12 });
        assert_eq!(
            request.artifact,
            ArtifactSource::Stored {
                path: "incoming/deces-2023-m12.csv".into(),
                file_name: "deces-2023-m12.csv".into(),
            }
        );
    }

    #[tokio::test]
    async fn bad_payloads_are_rejected_before_any_io() {
        let objects = Arc::new(MemoryObjectStore::new());
        let handler = DeathRegistryHandler::new(IngestionProcessor::new(
            Arc::new(DeathRegistryAdapter),
            objects,
            BatchWriter::new(Arc::new(MemoryOpportunityStore::new()), 10),
        ));

        let err = handler.handle(&queued(json!({ "kind": "nope" }))).await.unwrap_err();
        assert!(matches!(err, JobError::InvalidPayload(_)));

        let err = handler
            .handle(&queued(json!({ "kind": "scheduled_window", "year": 2023, "month": 0 })))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidPayload(msg) if msg.contains("month")));
    }

    #[derive(Deserialize)]
    struct Window {
        since: String,
        until: String,
    }

    const LISTINGS: &str = "\
source,external_id,title,address,zip_code,city,square_footage,price,published_at,latitude,longitude
seloger,1,T2 lumineux,12 rue de la Paix,75002,Paris,50,420000,2024-01-10,48.869,2.331
seloger,2,Studio,3 rue Saint-Denis,75002,Paris,20,210000,2023-12-20,48.866,2.349
leboncoin,9,T3,8 rue Montorgueil,75002,Paris,,650000,2024-01-15,48.864,2.347
";

    async fn listings(Query(window): Query<Window>) -> String {
        assert_eq!(window.since, "2024-01-01");
        assert_eq!(window.until, "2024-01-31");
        LISTINGS.to_string()
    }

    #[tokio::test]
    async fn listing_feed_is_fetched_filtered_linked_and_archived() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = Router::new().route("/exports/listings.csv", get(listings));
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let objects = Arc::new(MemoryObjectStore::new());
        let store = Arc::new(MemoryOpportunityStore::new());
        let links = Arc::new(MemoryLinkStore::new());
        let corpus = Arc::new(MemoryCorpus::new(vec![CorpusRecord {
            external_id: "DPE-75002-1".into(),
            street: Some("12 rue de la Paix".into()),
            zip_code: "75002".into(),
            city: Some("Paris".into()),
            square_footage: Some(60.0),
        }]));
        let client = RateLimitedClient::new(HttpClientConfig {
            min_request_interval: Duration::ZERO,
            ..HttpClientConfig::default()
        })
        .unwrap();

        let processor = IngestionProcessor::new(
            Arc::new(ListingFeedAdapter),
            objects.clone(),
            BatchWriter::new(store.clone(), 500),
        )
        .with_http(client)
        .with_linker(DiagnosticLinker::new(corpus, links.clone()));
        let handler = ListingFeedHandler::new(processor, format!("http://{addr}/"));

        let report = handler
            .handle(&queued(json!({ "since": "2024-01-01", "until": "2024-01-31" })))
            .await
            .unwrap();

        assert_eq!(report.stats.total_records, 3);
        assert_eq!(report.stats.records_filtered, 1);
        assert_eq!(report.stats.inserted, 2);
        assert_eq!(report.stats.links_created, 2);
        assert!(store.get("seloger-2").is_none());

        let paix = store.get("seloger-1").unwrap();
        let paix_links = links.links_for(paix.id);
        assert_eq!(paix_links.len(), 1);
        assert_eq!(paix_links[0].match_score, 94);

        let archived = report.archived_to.unwrap();
        assert_eq!(archived, "processed/listings-2024-01-01-2024-01-31.csv");
        assert_eq!(objects.get(&archived).unwrap(), LISTINGS.as_bytes());
    }
}
