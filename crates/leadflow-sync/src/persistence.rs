//! Batch persistence: idempotent opportunity upserts, corpus reads and link writes.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use leadflow_core::{
    ConflictPolicy, CorpusRecord, DiagnosticLink, Opportunity, OpportunityColumn,
};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::info;
use uuid::Uuid;

pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Persistence collaborator for opportunities, keyed by `business_key`.
#[async_trait]
pub trait OpportunityStore: Send + Sync {
    /// Writes one batch and returns the number of rows inserted or updated.
    async fn upsert(&self, records: &[Opportunity], policy: &ConflictPolicy) -> Result<u64>;
}

/// Read side of the canonical address corpus.
#[async_trait]
pub trait DiagnosticCorpus: Send + Sync {
    /// Candidates sharing `zip_code`, in a stable order.
    async fn candidates_in_zip(&self, zip_code: &str) -> Result<Vec<CorpusRecord>>;
}

#[async_trait]
pub trait LinkStore: Send + Sync {
    /// Replaces every stored link of `opportunity_id` with `links`.
    async fn replace_links(&self, opportunity_id: Uuid, links: &[DiagnosticLink]) -> Result<()>;
}

/// Splits records into bounded batches and upserts them in order.
#[derive(Clone)]
pub struct BatchWriter {
    store: Arc<dyn OpportunityStore>,
    batch_size: usize,
}

impl BatchWriter {
    pub fn new(store: Arc<dyn OpportunityStore>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Returns the number of rows written. The first failing batch aborts the
    /// remaining ones and its error is returned.
    pub async fn insert_opportunities(
        &self,
        records: &[Opportunity],
        policy: &ConflictPolicy,
    ) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let records = dedupe_by_business_key(records, policy);
        let total = records.len();
        let mut inserted = 0usize;

        for (index, batch) in records.chunks(self.batch_size).enumerate() {
            let written = self
                .store
                .upsert(batch, policy)
                .await
                .with_context(|| format!("persisting batch {} ({} records)", index + 1, batch.len()))?;
            inserted += written as usize;
            info!(batch = index + 1, inserted, total, "batch persisted");
        }

        Ok(inserted)
    }
}

/// A single upsert statement cannot touch the same key twice, so duplicates are
/// collapsed first: the first occurrence survives under `DoNothing`, the last
/// under `Overwrite`.
fn dedupe_by_business_key(records: &[Opportunity], policy: &ConflictPolicy) -> Vec<Opportunity> {
    let mut positions: HashMap<&str, usize> = HashMap::with_capacity(records.len());
    let mut out: Vec<Opportunity> = Vec::with_capacity(records.len());
    for record in records {
        match positions.get(record.business_key.as_str()) {
            Some(&at) => {
                if matches!(policy, ConflictPolicy::Overwrite(_)) {
                    out[at] = record.clone();
                }
            }
            None => {
                positions.insert(&record.business_key, out.len());
                out.push(record.clone());
            }
        }
    }
    out
}

/// Postgres-backed stores. The schema is owned elsewhere; see DESIGN.md for
/// the table shapes this expects.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn push_conflict_clause(builder: &mut QueryBuilder<'_, Postgres>, policy: &ConflictPolicy) {
    builder.push(" ON CONFLICT (business_key) ");
    match policy {
        ConflictPolicy::Overwrite(columns) if !columns.is_empty() => {
            builder.push("DO UPDATE SET ");
            for (i, column) in columns.iter().enumerate() {
                if i > 0 {
                    builder.push(", ");
                }
                let name = column.as_str();
                builder.push(format!("{name} = EXCLUDED.{name}"));
            }
            builder.push(", updated_at = NOW()");
        }
        _ => {
            builder.push("DO NOTHING");
        }
    }
}

#[async_trait]
impl OpportunityStore for PgStore {
    async fn upsert(&self, records: &[Opportunity], policy: &ConflictPolicy) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut builder = QueryBuilder::<Postgres>::new(
            "INSERT INTO opportunities (id, business_key, source_id, label, address, zip_code, \
             department, latitude, longitude, opportunity_date, contact, square_footage, price, status) ",
        );
        builder.push_values(records, |mut row, r| {
            row.push_bind(r.id)
                .push_bind(r.business_key.clone())
                .push_bind(r.source_id.clone())
                .push_bind(r.label.clone())
                .push_bind(r.address.clone())
                .push_bind(r.zip_code.clone())
                .push_bind(r.department.clone())
                .push_bind(r.coordinates.latitude)
                .push_bind(r.coordinates.longitude)
                .push_bind(r.opportunity_date)
                .push_bind(r.contact.clone().map(Json))
                .push_bind(r.square_footage)
                .push_bind(r.price)
                .push_bind(r.status.as_str());
        });
        push_conflict_clause(&mut builder, policy);

        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .context("upserting opportunities")?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl DiagnosticCorpus for PgStore {
    async fn candidates_in_zip(&self, zip_code: &str) -> Result<Vec<CorpusRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT external_id, street, zip_code, city, square_footage
              FROM diagnostics
             WHERE zip_code = $1
             ORDER BY external_id
            "#,
        )
        .bind(zip_code)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("loading diagnostics for {zip_code}"))?;

        rows.into_iter()
            .map(|row| {
                Ok(CorpusRecord {
                    external_id: row.try_get("external_id")?,
                    street: row.try_get("street")?,
                    zip_code: row.try_get("zip_code")?,
                    city: row.try_get("city")?,
                    square_footage: row.try_get("square_footage")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl LinkStore for PgStore {
    async fn replace_links(&self, opportunity_id: Uuid, links: &[DiagnosticLink]) -> Result<()> {
        let mut tx = self.pool.begin().await.context("opening link transaction")?;
        sqlx::query("DELETE FROM diagnostic_links WHERE opportunity_id = $1")
            .bind(opportunity_id)
            .execute(&mut *tx)
            .await
            .context("clearing previous links")?;

        if !links.is_empty() {
            let mut builder = QueryBuilder::<Postgres>::new(
                "INSERT INTO diagnostic_links (id, external_record_id, match_score, opportunity_id) ",
            );
            builder.push_values(links, |mut row, link| {
                row.push_bind(link.id)
                    .push_bind(link.external_record_id.clone())
                    .push_bind(link.match_score)
                    .push_bind(link.opportunity_id);
            });
            builder
                .build()
                .execute(&mut *tx)
                .await
                .context("inserting links")?;
        }

        tx.commit().await.context("committing links")?;
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
struct MemoryOpportunityState {
    rows: BTreeMap<String, Opportunity>,
    upsert_calls: usize,
    fail_on_call: Option<usize>,
}

/// In-memory store with the same conflict semantics as [`PgStore`].
#[derive(Debug, Default)]
pub struct MemoryOpportunityStore {
    state: Mutex<MemoryOpportunityState>,
}

impl MemoryOpportunityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the `call`-th upsert (1-based) fail.
    pub fn fail_on_call(&self, call: usize) {
        lock(&self.state).fail_on_call = Some(call);
    }

    pub fn upsert_calls(&self) -> usize {
        lock(&self.state).upsert_calls
    }

    pub fn len(&self) -> usize {
        lock(&self.state).rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, business_key: &str) -> Option<Opportunity> {
        lock(&self.state).rows.get(business_key).cloned()
    }

    pub fn all(&self) -> Vec<Opportunity> {
        lock(&self.state).rows.values().cloned().collect()
    }
}

fn overwrite_column(existing: &mut Opportunity, incoming: &Opportunity, column: OpportunityColumn) {
    match column {
        OpportunityColumn::Label => existing.label = incoming.label.clone(),
        OpportunityColumn::Address => existing.address = incoming.address.clone(),
        OpportunityColumn::ZipCode => existing.zip_code = incoming.zip_code.clone(),
        OpportunityColumn::Department => existing.department = incoming.department.clone(),
        OpportunityColumn::Latitude => existing.coordinates.latitude = incoming.coordinates.latitude,
        OpportunityColumn::Longitude => {
            existing.coordinates.longitude = incoming.coordinates.longitude
        }
        OpportunityColumn::OpportunityDate => existing.opportunity_date = incoming.opportunity_date,
        OpportunityColumn::Contact => existing.contact = incoming.contact.clone(),
        OpportunityColumn::SquareFootage => existing.square_footage = incoming.square_footage,
        OpportunityColumn::Price => existing.price = incoming.price,
        OpportunityColumn::Status => existing.status = incoming.status,
    }
}

#[async_trait]
impl OpportunityStore for MemoryOpportunityStore {
    async fn upsert(&self, records: &[Opportunity], policy: &ConflictPolicy) -> Result<u64> {
        let mut state = lock(&self.state);
        state.upsert_calls += 1;
        if state.fail_on_call == Some(state.upsert_calls) {
            bail!("simulated persistence failure on call {}", state.upsert_calls);
        }

        let rows = &mut state.rows;
        let mut written = 0u64;
        for record in records {
            if let Some(existing) = rows.get_mut(&record.business_key) {
                if let ConflictPolicy::Overwrite(columns) = policy {
                    if !columns.is_empty() {
                        for column in columns {
                            overwrite_column(existing, record, *column);
                        }
                        written += 1;
                    }
                }
                continue;
            }
            rows.insert(record.business_key.clone(), record.clone());
            written += 1;
        }
        Ok(written)
    }
}

/// In-memory corpus; candidates come back in insertion order.
#[derive(Debug, Default)]
pub struct MemoryCorpus {
    records: Mutex<Vec<CorpusRecord>>,
}

impl MemoryCorpus {
    pub fn new(records: Vec<CorpusRecord>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }
}

#[async_trait]
impl DiagnosticCorpus for MemoryCorpus {
    async fn candidates_in_zip(&self, zip_code: &str) -> Result<Vec<CorpusRecord>> {
        Ok(lock(&self.records)
            .iter()
            .filter(|r| r.zip_code == zip_code)
            .cloned()
            .collect())
    }
}

#[derive(Debug, Default)]
pub struct MemoryLinkStore {
    links: Mutex<BTreeMap<Uuid, Vec<DiagnosticLink>>>,
}

impl MemoryLinkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn links_for(&self, opportunity_id: Uuid) -> Vec<DiagnosticLink> {
        lock(&self.links)
            .get(&opportunity_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn total(&self) -> usize {
        lock(&self.links).values().map(Vec::len).sum()
    }
}

#[async_trait]
impl LinkStore for MemoryLinkStore {
    async fn replace_links(&self, opportunity_id: Uuid, links: &[DiagnosticLink]) -> Result<()> {
        lock(&self.links).insert(opportunity_id, links.to_vec());
        Ok(())
    }
}
