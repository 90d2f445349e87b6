//! Streaming delimited-record parser with cheap per-row filters.

use std::io::Read;

use chrono::NaiveDate;
use csv::{ReaderBuilder, StringRecord, Trim};
use leadflow_core::{parse_compact_date, RawRow};
use serde::Serialize;
use thiserror::Error;

/// Column layout of one external file family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLayout {
    pub name: &'static str,
    pub delimiter: u8,
    pub columns: &'static [&'static str],
}

/// INSEE monthly death file.
pub const DEATH_REGISTRY: RecordLayout = RecordLayout {
    name: "death-registry",
    delimiter: b';',
    columns: &[
        "nomprenom",
        "sexe",
        "datenaiss",
        "lieunaiss",
        "commnaiss",
        "paysnaiss",
        "datedeces",
        "lieudeces",
        "actedeces",
    ],
};

/// Real-estate listing export.
pub const LISTING_FEED: RecordLayout = RecordLayout {
    name: "listing-feed",
    delimiter: b',',
    columns: &[
        "source",
        "external_id",
        "title",
        "address",
        "zip_code",
        "city",
        "square_footage",
        "price",
        "published_at",
        "latitude",
        "longitude",
    ],
};

pub const BIRTH_DATE_COLUMN: &str = "datenaiss";
pub const DEATH_DATE_COLUMN: &str = "datedeces";
pub const PUBLISHED_AT_COLUMN: &str = "published_at";

impl RecordLayout {
    /// Best-effort header detection: at least half the fields name known columns.
    pub fn looks_like_header(&self, record: &StringRecord) -> bool {
        let matches = record
            .iter()
            .filter(|field| {
                let field = normalize_header(field);
                self.columns.iter().any(|c| *c == field)
            })
            .count();
        matches > 0 && matches * 2 >= record.len().min(self.columns.len())
    }
}

fn normalize_header(field: &str) -> String {
    field.trim().trim_matches('"').trim_start_matches('\u{feff}').to_ascii_lowercase()
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("line {line}: expected {expected} columns, found {found}")]
    ColumnCount {
        line: u64,
        expected: usize,
        found: usize,
    },
    #[error("malformed input: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ParseStats {
    pub total_records: usize,
    pub records_filtered: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedRecords {
    pub rows: Vec<RawRow>,
    pub stats: ParseStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowFilter {
    MinAge(u32),
    PublishedBetween(NaiveDate, NaiveDate),
}

/// Column names in file order plus the positions the filters look at.
struct ColumnMap {
    names: Vec<String>,
    birth: Option<usize>,
    death: Option<usize>,
    published: Option<usize>,
}

impl ColumnMap {
    fn new(names: Vec<String>) -> Self {
        let position = |name: &str| names.iter().position(|n| n == name);
        Self {
            birth: position(BIRTH_DATE_COLUMN),
            death: position(DEATH_DATE_COLUMN),
            published: position(PUBLISHED_AT_COLUMN),
            names,
        }
    }
}

/// Parses a whole file row by row. Malformed input fails the stream; filtered
/// rows are only counted.
#[derive(Debug, Clone)]
pub struct RecordParser {
    layout: RecordLayout,
    filters: Vec<RowFilter>,
}

impl RecordParser {
    pub fn new(layout: RecordLayout) -> Self {
        Self {
            layout,
            filters: Vec::new(),
        }
    }

    /// Drop rows whose age at death is below `years`. Zero disables the filter.
    pub fn min_age_years(mut self, years: u32) -> Self {
        if years > 0 {
            self.filters.push(RowFilter::MinAge(years));
        }
        self
    }

    /// Drop rows published outside `[since, until]`.
    pub fn published_between(mut self, since: NaiveDate, until: NaiveDate) -> Self {
        self.filters.push(RowFilter::PublishedBetween(since, until));
        self
    }

    pub fn layout(&self) -> &RecordLayout {
        &self.layout
    }

    pub fn parse_bytes(&self, bytes: &[u8]) -> Result<ParsedRecords, ParseError> {
        self.parse(bytes)
    }

    pub fn parse<R: Read>(&self, reader: R) -> Result<ParsedRecords, ParseError> {
        let mut reader = ReaderBuilder::new()
            .delimiter(self.layout.delimiter)
            .has_headers(false)
            .flexible(true)
            .trim(Trim::All)
            .from_reader(reader);

        let mut record = StringRecord::new();
        let mut columns: Option<ColumnMap> = None;
        let mut parsed = ParsedRecords::default();

        while reader.read_record(&mut record)? {
            if columns.is_none() && self.layout.looks_like_header(&record) {
                columns = Some(ColumnMap::new(record.iter().map(normalize_header).collect()));
                continue;
            }
            let map = columns.get_or_insert_with(|| {
                ColumnMap::new(self.layout.columns.iter().map(|c| c.to_string()).collect())
            });

            if record.len() != map.names.len() {
                return Err(ParseError::ColumnCount {
                    line: record.position().map(|p| p.line()).unwrap_or_default(),
                    expected: map.names.len(),
                    found: record.len(),
                });
            }

            parsed.stats.total_records += 1;
            if !self.keep(map, &record) {
                parsed.stats.records_filtered += 1;
                continue;
            }

            parsed
                .rows
                .push(RawRow::from_pairs(map.names.iter().cloned().zip(record.iter())));
        }

        Ok(parsed)
    }

    fn keep(&self, map: &ColumnMap, record: &StringRecord) -> bool {
        self.filters.iter().all(|filter| match *filter {
            RowFilter::MinAge(years) => {
                let field = |idx: Option<usize>| idx.and_then(|i| record.get(i));
                match age_in_years(field(map.birth), field(map.death)) {
                    Some(age) => age >= i64::from(years),
                    None => true,
                }
            }
            RowFilter::PublishedBetween(since, until) => {
                match map.published.and_then(|i| record.get(i)).and_then(parse_feed_date) {
                    Some(date) => date >= since && date <= until,
                    None => true,
                }
            }
        })
    }
}

/// Whole years between two `YYYYMMDD` dates without building calendar dates.
///
/// Registry files use `00` for unknown months and days; those still compare
/// numerically, which errs towards the older age.
pub fn age_in_years(birth: Option<&str>, death: Option<&str>) -> Option<i64> {
    let split = |raw: &str| -> Option<(i64, i64)> {
        let raw = raw.trim();
        if raw.len() != 8 || !raw.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some((raw[..4].parse().ok()?, raw[4..].parse().ok()?))
    };
    let (birth_year, birth_day) = split(birth?)?;
    let (death_year, death_day) = split(death?)?;
    let age = death_year - birth_year - i64::from(death_day < birth_day);
    (age >= 0).then_some(age)
}

/// Listing feeds publish ISO dates; compact registry dates are accepted too.
pub fn parse_feed_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    let date_part = raw.split(['T', ' ']).next().unwrap_or(raw);
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
        .ok()
        .or_else(|| parse_compact_date(date_part))
}
