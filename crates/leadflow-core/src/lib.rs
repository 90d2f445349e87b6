//! Core domain model for leadflow: raw rows, enrichment results, opportunities and job payloads.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "leadflow-core";

/// One record exactly as read from an external file, keyed by source column name.
///
/// Column order is preserved so quarantine files can be written back in the
/// same shape the source used.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawRow {
    fields: Vec<(String, String)>,
}

impl RawRow {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            fields: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value.as_str())
    }

    /// Trimmed, non-empty value of `column` or a [`RowError::MissingField`].
    pub fn require(&self, column: &str) -> Result<&str, RowError> {
        match self.get(column).map(str::trim) {
            Some(value) if !value.is_empty() => Ok(value),
            _ => Err(RowError::MissingField(column.to_string())),
        }
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(_, value)| value.as_str())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContactInfo {
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub street: Option<String>,
    pub zip_code: Option<String>,
    pub city: Option<String>,
}

/// Geocoding + contact data resolved for one lookup key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentResult {
    pub coordinates: Coordinates,
    pub contact_info: ContactInfo,
    pub resolved_zip_code: String,
    pub resolved_address: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpportunityStatus {
    #[default]
    PendingReview,
    Qualified,
    Rejected,
}

impl OpportunityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingReview => "pending_review",
            Self::Qualified => "qualified",
            Self::Rejected => "rejected",
        }
    }
}

/// Canonical persisted opportunity. `business_key` is globally unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: Uuid,
    pub business_key: String,
    pub source_id: String,
    pub label: String,
    pub address: String,
    pub zip_code: String,
    pub department: String,
    pub coordinates: Coordinates,
    pub opportunity_date: NaiveDate,
    pub contact: Option<ContactInfo>,
    pub square_footage: Option<f64>,
    pub price: Option<f64>,
    pub status: OpportunityStatus,
}

impl Opportunity {
    /// Deterministic id so re-ingesting a row always addresses the same opportunity.
    pub fn id_for_business_key(business_key: &str) -> Uuid {
        Uuid::new_v5(&Uuid::NAMESPACE_OID, business_key.as_bytes())
    }

    /// ISO `YYYY-MM-DD` form of the opportunity date.
    pub fn opportunity_date_iso(&self) -> String {
        self.opportunity_date.format("%Y-%m-%d").to_string()
    }
}

/// Columns an upsert may overwrite when the business key already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpportunityColumn {
    Label,
    Address,
    ZipCode,
    Department,
    Latitude,
    Longitude,
    OpportunityDate,
    Contact,
    SquareFootage,
    Price,
    Status,
}

impl OpportunityColumn {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Label => "label",
            Self::Address => "address",
            Self::ZipCode => "zip_code",
            Self::Department => "department",
            Self::Latitude => "latitude",
            Self::Longitude => "longitude",
            Self::OpportunityDate => "opportunity_date",
            Self::Contact => "contact",
            Self::SquareFootage => "square_footage",
            Self::Price => "price",
            Self::Status => "status",
        }
    }
}

/// What an upsert does when the business key already exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictPolicy {
    /// First write wins.
    DoNothing,
    /// Last write wins for the listed columns.
    Overwrite(Vec<OpportunityColumn>),
}

/// Query side of a fuzzy address match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchQuery {
    pub target_address: String,
    pub zip_code: String,
    pub square_footage: Option<f64>,
}

/// One record of the canonical address corpus (building/energy registry).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorpusRecord {
    pub external_id: String,
    pub street: Option<String>,
    pub zip_code: String,
    pub city: Option<String>,
    pub square_footage: Option<f64>,
}

/// Transient pairing of a query with one corpus record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchCandidate {
    pub external_record_id: String,
    pub match_score: f64,
    pub record: CorpusRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticLink {
    pub id: Uuid,
    pub external_record_id: String,
    pub match_score: i32,
    pub opportunity_id: Uuid,
}

impl DiagnosticLink {
    pub fn new(opportunity_id: Uuid, candidate: &MatchCandidate) -> Self {
        let seed = format!("{opportunity_id}:{}", candidate.external_record_id);
        Self {
            id: Uuid::new_v5(&Uuid::NAMESPACE_OID, seed.as_bytes()),
            external_record_id: candidate.external_record_id.clone(),
            match_score: candidate.match_score.round() as i32,
            opportunity_id,
        }
    }
}

/// A row that could not become an opportunity. Exported, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureRecord {
    pub original_row: RawRow,
    pub error_message: String,
}

/// Row-level failure: the row is quarantined and the job carries on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowError {
    #[error("missing required field `{0}`")]
    MissingField(String),
    #[error("invalid date in `{field}`: {value:?}")]
    InvalidDate { field: String, value: String },
    #[error("invalid value in `{field}`: {value:?}")]
    InvalidField { field: String, value: String },
    #[error("no enrichment result for lookup key {0:?}")]
    EnrichmentUnavailable(String),
}

/// Death-registry job payload: an explicit file or a monthly publication window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeathRegistryJob {
    ManualPath { path: String, file_name: String },
    ScheduledWindow { year: i32, month: u32 },
}

impl DeathRegistryJob {
    pub fn validate(&self) -> Result<(), PayloadError> {
        match self {
            Self::ManualPath { path, .. } if path.trim().is_empty() => {
                Err(PayloadError::EmptyPath)
            }
            Self::ScheduledWindow { month, .. } if !(1..=12).contains(month) => {
                Err(PayloadError::InvalidMonth(*month))
            }
            _ => Ok(()),
        }
    }
}

/// Listing-feed job payload: publication window to pull from the listing API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingFeedJob {
    pub since: NaiveDate,
    pub until: NaiveDate,
}

impl ListingFeedJob {
    pub fn validate(&self) -> Result<(), PayloadError> {
        if self.since > self.until {
            return Err(PayloadError::InvertedWindow {
                since: self.since,
                until: self.until,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("path must not be empty")]
    EmptyPath,
    #[error("month must be within 1..=12, got {0}")]
    InvalidMonth(u32),
    #[error("window start {since} is after window end {until}")]
    InvertedWindow { since: NaiveDate, until: NaiveDate },
}

/// Fixed-width (5 digit) zip code, restoring leading zeros lost by spreadsheets.
pub fn normalize_zip_code(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() || digits.len() > 5 {
        return None;
    }
    Some(format!("{digits:0>5}"))
}

/// Department code from a normalized zip: overseas (97x/98x) keep three digits.
pub fn department_from_zip(zip_code: &str) -> String {
    let width = if zip_code.starts_with("97") || zip_code.starts_with("98") {
        3
    } else {
        2
    };
    zip_code.chars().take(width).collect()
}

/// `YYYYMMDD` to a calendar date. Registry files use `00` for unknown day/month.
pub fn parse_compact_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.len() != 8 || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let year = raw[0..4].parse().ok()?;
    let month = raw[4..6].parse().ok()?;
    let day = raw[6..8].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

pub fn title_case(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut capitalize = true;
    for ch in input.trim().chars() {
        if capitalize {
            out.extend(ch.to_uppercase());
        } else {
            out.extend(ch.to_lowercase());
        }
        capitalize = matches!(ch, ' ' | '-' | '\'');
    }
    out
}

/// Registry name `SURNAME*GIVEN NAMES/` split into its two parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersonName {
    pub surname: String,
    pub given_names: String,
}

impl PersonName {
    pub fn parse_registry(raw: &str) -> Self {
        let raw = raw.trim().trim_end_matches('/');
        let (surname, given) = raw.split_once('*').unwrap_or((raw, ""));
        Self {
            surname: surname.trim().to_string(),
            given_names: given.trim_end_matches('/').trim().to_string(),
        }
    }

    pub fn display(&self) -> String {
        let joined = format!("{} {}", title_case(&self.surname), title_case(&self.given_names));
        joined.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}
