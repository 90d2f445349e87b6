//! File-ingestion job: download, parse, enrich and persist in chunks, then archive.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{NaiveDate, Utc};
use leadflow_adapters::{ParseError, RecordParser, SourceAdapter};
use leadflow_core::{FailureRecord, Opportunity, RawRow, RowError};
use leadflow_storage::{FetchError, ObjectStore, RateLimitedClient, StorageError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::enrichment::{Enricher, EnrichmentSource};
use crate::matching::DiagnosticLinker;
use crate::persistence::BatchWriter;

pub const DEFAULT_CHUNK_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Dequeued,
    Downloading,
    Parsing,
    ProcessingBatches,
    Finalizing,
    Archived,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Archived | Self::Failed)
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Dequeued, Downloading)
            | (Downloading, Parsing)
            | (Parsing, ProcessingBatches)
            | (ProcessingBatches, Finalizing)
            | (Finalizing, Archived) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Job-fatal errors. Anything here sends the job back to the queue's retry policy.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid job payload: {0}")]
    InvalidPayload(String),
    #[error("download failed: {0}")]
    Download(#[from] StorageError),
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("persistence failed: {0:#}")]
    Persist(anyhow::Error),
    #[error("job timed out after {0:?}")]
    TimedOut(Duration),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Current state plus every state visited, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLifecycle {
    state: JobState,
    history: Vec<JobState>,
}

impl Default for JobLifecycle {
    fn default() -> Self {
        Self {
            state: JobState::Dequeued,
            history: vec![JobState::Dequeued],
        }
    }
}

impl JobLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn history(&self) -> &[JobState] {
        &self.history
    }

    pub fn advance(&mut self, next: JobState) -> Result<(), JobError> {
        if !self.state.can_transition_to(next) {
            return Err(JobError::Internal(format!(
                "illegal job transition {:?} -> {:?}",
                self.state, next
            )));
        }
        info!(from = ?self.state, to = ?next, "job state");
        self.state = next;
        self.history.push(next);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub total_records: usize,
    pub records_filtered: usize,
    pub rows_processed: usize,
    pub inserted: usize,
    pub failed: usize,
    pub links_created: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobReport {
    pub source_id: String,
    pub final_state: JobState,
    pub history: Vec<JobState>,
    pub stats: JobStats,
    pub archived_to: Option<String>,
    pub failures_artifact: Option<String>,
}

/// Where a job's input file comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactSource {
    /// Already in object storage; moved to the processed prefix on success.
    Stored { path: String, file_name: String },
    /// Pulled over HTTP; the raw bytes are uploaded to the processed prefix.
    Fetched { url: String, file_name: String },
}

impl ArtifactSource {
    pub fn file_name(&self) -> &str {
        match self {
            Self::Stored { file_name, .. } | Self::Fetched { file_name, .. } => file_name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestionRequest {
    pub artifact: ArtifactSource,
    pub published_window: Option<(NaiveDate, NaiveDate)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestionSettings {
    pub chunk_size: usize,
    pub min_age_years: u32,
    pub incoming_prefix: String,
    pub processed_prefix: String,
    pub failed_prefix: String,
}

impl Default for IngestionSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            min_age_years: 0,
            incoming_prefix: "incoming".to_string(),
            processed_prefix: "processed".to_string(),
            failed_prefix: "failed".to_string(),
        }
    }
}

pub struct IngestionProcessor {
    adapter: Arc<dyn SourceAdapter>,
    objects: Arc<dyn ObjectStore>,
    writer: BatchWriter,
    enrichment: Option<Arc<dyn EnrichmentSource>>,
    linker: Option<DiagnosticLinker>,
    http: Option<RateLimitedClient>,
    settings: IngestionSettings,
}

impl IngestionProcessor {
    pub fn new(
        adapter: Arc<dyn SourceAdapter>,
        objects: Arc<dyn ObjectStore>,
        writer: BatchWriter,
    ) -> Self {
        Self {
            adapter,
            objects,
            writer,
            enrichment: None,
            linker: None,
            http: None,
            settings: IngestionSettings::default(),
        }
    }

    pub fn with_enrichment(mut self, source: Arc<dyn EnrichmentSource>) -> Self {
        self.enrichment = Some(source);
        self
    }

    pub fn with_linker(mut self, linker: DiagnosticLinker) -> Self {
        self.linker = Some(linker);
        self
    }

    pub fn with_http(mut self, client: RateLimitedClient) -> Self {
        self.http = Some(client);
        self
    }

    pub fn with_settings(mut self, settings: IngestionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &IngestionSettings {
        &self.settings
    }

    pub fn source_id(&self) -> &'static str {
        self.adapter.source_id()
    }

    /// Runs one job to `Archived`, or to `Failed` with the error that caused it.
    pub async fn run(&self, request: &IngestionRequest) -> Result<JobReport, JobError> {
        let mut lifecycle = JobLifecycle::new();
        let mut report = JobReport {
            source_id: self.adapter.source_id().to_string(),
            final_state: JobState::Dequeued,
            history: Vec::new(),
            stats: JobStats::default(),
            archived_to: None,
            failures_artifact: None,
        };

        match self.execute(request, &mut lifecycle, &mut report).await {
            Ok(()) => {
                report.final_state = lifecycle.state();
                report.history = lifecycle.history().to_vec();
                info!(
                    file = request.artifact.file_name(),
                    total = report.stats.total_records,
                    filtered = report.stats.records_filtered,
                    inserted = report.stats.inserted,
                    failed = report.stats.failed,
                    links = report.stats.links_created,
                    "ingestion finished"
                );
                Ok(report)
            }
            Err(err) => {
                if lifecycle.state().can_transition_to(JobState::Failed) {
                    lifecycle.advance(JobState::Failed)?;
                }
                error!(file = request.artifact.file_name(), error = %err, "ingestion failed");
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        request: &IngestionRequest,
        lifecycle: &mut JobLifecycle,
        report: &mut JobReport,
    ) -> Result<(), JobError> {
        lifecycle.advance(JobState::Downloading)?;
        let bytes = Arc::new(self.download(&request.artifact).await?);

        lifecycle.advance(JobState::Parsing)?;
        let mut parser =
            RecordParser::new(self.adapter.layout()).min_age_years(self.settings.min_age_years);
        if let Some((since, until)) = request.published_window {
            parser = parser.published_between(since, until);
        }
        let input = Arc::clone(&bytes);
        let parsed = tokio::task::spawn_blocking(move || parser.parse_bytes(&input))
            .await
            .map_err(|e| JobError::Internal(format!("parser task: {e}")))??;
        report.stats.total_records = parsed.stats.total_records;
        report.stats.records_filtered = parsed.stats.records_filtered;

        lifecycle.advance(JobState::ProcessingBatches)?;
        let failures = self.process_rows(&parsed.rows, &mut report.stats).await?;

        lifecycle.advance(JobState::Finalizing)?;
        report.archived_to = self.archive(&request.artifact, &bytes).await;
        report.failures_artifact = self
            .export_failures(request.artifact.file_name(), &failures)
            .await;

        lifecycle.advance(JobState::Archived)?;
        Ok(())
    }

    async fn download(&self, artifact: &ArtifactSource) -> Result<Vec<u8>, JobError> {
        match artifact {
            ArtifactSource::Stored { path, .. } => Ok(self.objects.download(path).await?),
            ArtifactSource::Fetched { url, .. } => {
                let client = self.http.as_ref().ok_or_else(|| {
                    JobError::Internal("no HTTP client configured for fetched artifacts".into())
                })?;
                Ok(client.fetch_with_retry(url).await?.body)
            }
        }
    }

    /// Rows are handled in file order, one chunk at a time; each chunk is
    /// persisted before the next one starts.
    async fn process_rows(
        &self,
        rows: &[RawRow],
        stats: &mut JobStats,
    ) -> Result<Vec<FailureRecord>, JobError> {
        let policy = self.adapter.conflict_policy();
        let mut enricher = self.enrichment.clone().map(Enricher::new);
        let mut failures = Vec::new();

        for (index, chunk) in rows.chunks(self.settings.chunk_size.max(1)).enumerate() {
            let mut opportunities = Vec::with_capacity(chunk.len());
            for row in chunk {
                match self.build_row(row, enricher.as_mut()).await {
                    Ok(opportunity) => opportunities.push(opportunity),
                    Err(err) => {
                        debug!(error = %err, "row skipped");
                        failures.push(FailureRecord {
                            original_row: row.clone(),
                            error_message: err.to_string(),
                        });
                    }
                }
            }

            stats.rows_processed += chunk.len();
            stats.inserted += self
                .writer
                .insert_opportunities(&opportunities, &policy)
                .await
                .map_err(JobError::Persist)?;
            stats.links_created += self.link(&opportunities).await?;
            stats.failed = failures.len();
            info!(
                chunk = index + 1,
                processed = stats.rows_processed,
                inserted = stats.inserted,
                failed = stats.failed,
                "chunk done"
            );
        }

        if let Some(enricher) = &enricher {
            debug!(
                lookups = enricher.lookups(),
                memo_hits = enricher.memo_hits(),
                "enrichment summary"
            );
        }
        Ok(failures)
    }

    async fn build_row(
        &self,
        row: &RawRow,
        enricher: Option<&mut Enricher>,
    ) -> Result<Opportunity, RowError> {
        let enrichment = match (self.adapter.lookup_key(row)?, enricher) {
            (Some(key), Some(enricher)) => enricher.enrich(&key).await,
            _ => None,
        };
        self.adapter.build_opportunity(row, enrichment.as_ref())
    }

    async fn link(&self, opportunities: &[Opportunity]) -> Result<usize, JobError> {
        let Some(linker) = &self.linker else {
            return Ok(0);
        };
        let mut created = 0;
        for opportunity in opportunities {
            if let Some(query) = self.adapter.match_query(opportunity) {
                created += linker
                    .search_and_link_for_opportunity(opportunity, &query)
                    .await
                    .map_err(JobError::Persist)?
                    .len();
            }
        }
        Ok(created)
    }

    /// Finalization never fails the job: the data is already persisted.
    async fn archive(&self, artifact: &ArtifactSource, bytes: &[u8]) -> Option<String> {
        let target = format!("{}/{}", self.settings.processed_prefix, artifact.file_name());
        let outcome = match artifact {
            ArtifactSource::Stored { path, .. } => self.objects.move_object(path, &target).await,
            ArtifactSource::Fetched { .. } => self.objects.upload(bytes, &target).await.map(|_| ()),
        };
        match outcome {
            Ok(()) => Some(target),
            Err(err) => {
                warn!(target = %target, error = %err, "archiving source artifact failed");
                None
            }
        }
    }

    async fn export_failures(&self, file_name: &str, failures: &[FailureRecord]) -> Option<String> {
        if failures.is_empty() {
            return None;
        }
        let stem = file_name.rsplit_once('.').map_or(file_name, |(stem, _)| stem);
        let target = format!(
            "{}/{}-failed-{}.csv",
            self.settings.failed_prefix,
            stem,
            Utc::now().format("%Y%m%dT%H%M%SZ")
        );

        let uploaded = match failures_csv(failures, self.adapter.layout().delimiter) {
            Ok(bytes) => self
                .objects
                .upload(&bytes, &target)
                .await
                .map_err(anyhow::Error::from),
            Err(err) => Err(err),
        };
        match uploaded {
            Ok(stored) => {
                info!(path = %stored, failures = failures.len(), "failed rows exported");
                Some(stored)
            }
            Err(err) => {
                warn!(target = %target, error = %format!("{err:#}"), "exporting failed rows failed");
                None
            }
        }
    }
}

/// Quarantine file: the original columns followed by `error_message`.
pub fn failures_csv(failures: &[FailureRecord], delimiter: u8) -> anyhow::Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(delimiter)
        .from_writer(Vec::new());

    if let Some(first) = failures.first() {
        let header: Vec<&str> = first
            .original_row
            .columns()
            .chain(std::iter::once("error_message"))
            .collect();
        writer.write_record(&header).context("writing failure header")?;
    }
    for failure in failures {
        let record: Vec<&str> = failure
            .original_row
            .values()
            .chain(std::iter::once(failure.error_message.as_str()))
            .collect();
        writer.write_record(&record).context("writing failure row")?;
    }
    writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("flushing failure csv: {}", e.error()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadflow_adapters::DeathRegistryAdapter;
    use leadflow_core::{ContactInfo, Coordinates, EnrichmentResult};
    use leadflow_storage::MemoryObjectStore;

    use crate::enrichment::MemoryDirectory;
    use crate::persistence::{MemoryOpportunityStore, DEFAULT_BATCH_SIZE};

    const FILE: &str = "\
nomprenom;sexe;datenaiss;lieunaiss;commnaiss;paysnaiss;datedeces;lieudeces;actedeces
MARTIN*JEAN/;1;19300105;75056;PARIS;;20231201;75001;001
DURAND*MARIE/;2;19400310;69123;LYON;;20231202;75001;002
PETIT*LUC/;1;19350101;33063;BORDEAUX;;20231203;99999;003
";

    fn mairie_75001() -> EnrichmentResult {
        EnrichmentResult {
            coordinates: Coordinates {
                latitude: 48.8606,
                longitude: 2.341,
            },
            contact_info: ContactInfo {
                name: "Mairie du 1er arrondissement".into(),
                ..ContactInfo::default()
            },
            resolved_zip_code: "75001".into(),
            resolved_address: "4 place du Louvre 75001 Paris".into(),
        }
    }

    struct Fixture {
        objects: Arc<MemoryObjectStore>,
        store: Arc<MemoryOpportunityStore>,
        directory: Arc<MemoryDirectory>,
        processor: IngestionProcessor,
    }

    fn fixture() -> Fixture {
        let objects = Arc::new(MemoryObjectStore::new());
        objects.insert("incoming/deces-2023-m12.csv", FILE.as_bytes().to_vec());
        let store = Arc::new(MemoryOpportunityStore::new());
        let directory = Arc::new(MemoryDirectory::new().with_entry("75001", mairie_75001()));
        let processor = IngestionProcessor::new(
            Arc::new(DeathRegistryAdapter),
            objects.clone(),
            BatchWriter::new(store.clone(), DEFAULT_BATCH_SIZE),
        )
        .with_enrichment(directory.clone());
        Fixture {
            objects,
            store,
            directory,
            processor,
        }
    }

    fn stored_request() -> IngestionRequest {
        IngestionRequest {
            artifact: ArtifactSource::Stored {
                path: "incoming/deces-2023-m12.csv".into(),
                file_name: "deces-2023-m12.csv".into(),
            },
            published_window: None,
        }
    }

    #[test]
    fn transitions_follow_the_pipeline() {
        assert!(JobState::Dequeued.can_transition_to(JobState::Downloading));
        assert!(JobState::Finalizing.can_transition_to(JobState::Archived));
        assert!(JobState::Parsing.can_transition_to(JobState::Failed));
        assert!(!JobState::Dequeued.can_transition_to(JobState::Parsing));
        assert!(!JobState::Archived.can_transition_to(JobState::Failed));
        assert!(!JobState::Failed.can_transition_to(JobState::Downloading));

        let mut lifecycle = JobLifecycle::new();
        assert!(lifecycle.advance(JobState::Finalizing).is_err());
        assert_eq!(lifecycle.state(), JobState::Dequeued);
    }

    #[tokio::test]
    async fn row_failures_are_quarantined_and_the_file_archived() {
        let f = fixture();
        let report = f.processor.run(&stored_request()).await.unwrap();

        assert_eq!(report.final_state, JobState::Archived);
        assert_eq!(
            report.history,
            vec![
                JobState::Dequeued,
                JobState::Downloading,
                JobState::Parsing,
                JobState::ProcessingBatches,
                JobState::Finalizing,
                JobState::Archived,
            ]
        );
        assert_eq!(report.stats.total_records, 3);
        assert_eq!(report.stats.inserted, 2);
        assert_eq!(report.stats.failed, 1);
        assert_eq!(f.store.len(), 2);
        // 75001 twice in a row, then 99999
        assert_eq!(f.directory.calls(), 2);

        assert_eq!(report.archived_to.as_deref(), Some("processed/deces-2023-m12.csv"));
        assert!(f.objects.get("incoming/deces-2023-m12.csv").is_none());

        let failed_path = report.failures_artifact.unwrap();
        assert!(failed_path.starts_with("failed/deces-2023-m12-failed-"));
        let quarantine = String::from_utf8(f.objects.get(&failed_path).unwrap()).unwrap();
        let mut lines = quarantine.lines();
        assert!(lines.next().unwrap().ends_with("actedeces;error_message"));
        let failed_row = lines.next().unwrap();
        assert!(failed_row.starts_with("PETIT*LUC/;"));
        assert!(failed_row.contains("99999"));
    }

    #[tokio::test]
    async fn small_chunks_keep_file_order_and_totals() {
        let f = fixture();
        let processor = f.processor.with_settings(IngestionSettings {
            chunk_size: 1,
            ..IngestionSettings::default()
        });
        let report = processor.run(&stored_request()).await.unwrap();
        assert_eq!(report.stats.rows_processed, 3);
        assert_eq!(report.stats.inserted, 2);
        assert_eq!(f.store.upsert_calls(), 2);
    }

    #[tokio::test]
    async fn missing_artifact_fails_the_job() {
        let f = fixture();
        let request = IngestionRequest {
            artifact: ArtifactSource::Stored {
                path: "incoming/missing.csv".into(),
                file_name: "missing.csv".into(),
            },
            published_window: None,
        };
        let err = f.processor.run(&request).await.unwrap_err();
        assert!(matches!(err, JobError::Download(StorageError::NotFound(_))));
        assert_eq!(f.store.upsert_calls(), 0);
    }

    #[tokio::test]
    async fn malformed_file_processes_no_rows() {
        let f = fixture();
        f.objects.insert(
            "incoming/deces-2023-m12.csv",
            b"MARTIN*JEAN/;1;19300105;75056;PARIS;;20231201;75001;001\nshort;row\n".to_vec(),
        );
        let err = f.processor.run(&stored_request()).await.unwrap_err();
        assert!(matches!(err, JobError::Parse(_)));
        assert_eq!(f.store.upsert_calls(), 0);
        assert!(f.objects.get("incoming/deces-2023-m12.csv").is_some());
    }

    #[tokio::test]
    async fn batch_failure_is_fatal() {
        let f = fixture();
        f.store.fail_on_call(1);
        let err = f.processor.run(&stored_request()).await.unwrap_err();
        assert!(matches!(err, JobError::Persist(_)));
        assert!(f.objects.get("incoming/deces-2023-m12.csv").is_some());
    }

    /// Serves downloads but rejects every write.
    struct ReadOnlyStore(Arc<MemoryObjectStore>);

    #[async_trait::async_trait]
    impl ObjectStore for ReadOnlyStore {
        async fn download(&self, path: &str) -> Result<Vec<u8>, StorageError> {
            self.0.download(path).await
        }

        async fn upload(&self, _bytes: &[u8], path: &str) -> Result<String, StorageError> {
            Err(StorageError::Io {
                path: path.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
            })
        }

        async fn delete(&self, path: &str) -> Result<(), StorageError> {
            Err(StorageError::Io {
                path: path.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
            })
        }
    }

    #[tokio::test]
    async fn finalization_failures_do_not_fail_the_job() {
        let f = fixture();
        let processor = IngestionProcessor::new(
            Arc::new(DeathRegistryAdapter),
            Arc::new(ReadOnlyStore(f.objects.clone())),
            BatchWriter::new(f.store.clone(), DEFAULT_BATCH_SIZE),
        )
        .with_enrichment(f.directory.clone());

        let report = processor.run(&stored_request()).await.unwrap();

        assert_eq!(report.final_state, JobState::Archived);
        assert_eq!(report.archived_to, None);
        assert_eq!(report.failures_artifact, None);
        assert_eq!(report.stats.inserted, 2);
        assert_eq!(report.stats.failed, 1);
        assert_eq!(f.store.len(), 2);
        assert!(f.objects.get("incoming/deces-2023-m12.csv").is_some());
    }

    #[test]
    fn failures_csv_without_rows_is_empty() {
        assert!(failures_csv(&[], b';').unwrap().is_empty());
    }
}
