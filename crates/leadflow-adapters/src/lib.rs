//! Source adapter contracts: how each external file family becomes opportunities.

use chrono::NaiveDate;
use leadflow_core::{
    department_from_zip, normalize_zip_code, parse_compact_date, ConflictPolicy, Coordinates,
    EnrichmentResult, MatchQuery, Opportunity, OpportunityColumn, OpportunityStatus, PersonName,
    RawRow, RowError,
};

mod parser;

pub use parser::{
    age_in_years, parse_feed_date, ParseError, ParseStats, ParsedRecords, RecordLayout,
    RecordParser, DEATH_REGISTRY, LISTING_FEED,
};

pub const CRATE_NAME: &str = "leadflow-adapters";

pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;
    fn layout(&self) -> RecordLayout;
    fn conflict_policy(&self) -> ConflictPolicy;

    /// Enrichment lookup key for `row`, or `None` when the source needs no enrichment.
    fn lookup_key(&self, row: &RawRow) -> Result<Option<String>, RowError>;

    fn build_opportunity(
        &self,
        row: &RawRow,
        enrichment: Option<&EnrichmentResult>,
    ) -> Result<Opportunity, RowError>;

    /// Address query used to link the opportunity to the canonical corpus.
    fn match_query(&self, _opportunity: &Opportunity) -> Option<MatchQuery> {
        None
    }
}

pub fn adapter_for_source(source_id: &str) -> Option<Box<dyn SourceAdapter>> {
    match source_id {
        "death-registry" => Some(Box::new(DeathRegistryAdapter)),
        "listing-feed" => Some(Box::new(ListingFeedAdapter)),
        _ => None,
    }
}

/// Government death registry. One opportunity per death act, located at the
/// town hall of the place of death.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeathRegistryAdapter;

impl SourceAdapter for DeathRegistryAdapter {
    fn source_id(&self) -> &'static str {
        "death-registry"
    }

    fn layout(&self) -> RecordLayout {
        DEATH_REGISTRY
    }

    fn conflict_policy(&self) -> ConflictPolicy {
        ConflictPolicy::DoNothing
    }

    fn lookup_key(&self, row: &RawRow) -> Result<Option<String>, RowError> {
        Ok(Some(row.require("lieudeces")?.to_string()))
    }

    fn build_opportunity(
        &self,
        row: &RawRow,
        enrichment: Option<&EnrichmentResult>,
    ) -> Result<Opportunity, RowError> {
        let place = row.require("lieudeces")?;
        let raw_date = row.require("datedeces")?;
        let act = row.require("actedeces")?;
        let name = PersonName::parse_registry(row.require("nomprenom")?);

        let opportunity_date = parse_compact_date(raw_date).ok_or_else(|| RowError::InvalidDate {
            field: "datedeces".into(),
            value: raw_date.into(),
        })?;
        let enrichment =
            enrichment.ok_or_else(|| RowError::EnrichmentUnavailable(place.to_string()))?;
        let zip_code = normalize_zip_code(&enrichment.resolved_zip_code).ok_or_else(|| {
            RowError::InvalidField {
                field: "resolved_zip_code".into(),
                value: enrichment.resolved_zip_code.clone(),
            }
        })?;

        let business_key = format!("{place}_{raw_date}_{act}");
        Ok(Opportunity {
            id: Opportunity::id_for_business_key(&business_key),
            business_key,
            source_id: self.source_id().to_string(),
            label: format!("Succession {}", name.display()),
            address: enrichment.resolved_address.clone(),
            department: department_from_zip(&zip_code),
            zip_code,
            coordinates: enrichment.coordinates,
            opportunity_date,
            contact: Some(enrichment.contact_info.clone()),
            square_footage: None,
            price: None,
            status: OpportunityStatus::PendingReview,
        })
    }
}

/// Real-estate listing feed. Listings are re-published with new prices, so
/// the latest row wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListingFeedAdapter;

impl SourceAdapter for ListingFeedAdapter {
    fn source_id(&self) -> &'static str {
        "listing-feed"
    }

    fn layout(&self) -> RecordLayout {
        LISTING_FEED
    }

    fn conflict_policy(&self) -> ConflictPolicy {
        ConflictPolicy::Overwrite(vec![
            OpportunityColumn::Label,
            OpportunityColumn::Address,
            OpportunityColumn::ZipCode,
            OpportunityColumn::Department,
            OpportunityColumn::Latitude,
            OpportunityColumn::Longitude,
            OpportunityColumn::OpportunityDate,
            OpportunityColumn::SquareFootage,
            OpportunityColumn::Price,
        ])
    }

    fn lookup_key(&self, _row: &RawRow) -> Result<Option<String>, RowError> {
        Ok(None)
    }

    fn build_opportunity(
        &self,
        row: &RawRow,
        _enrichment: Option<&EnrichmentResult>,
    ) -> Result<Opportunity, RowError> {
        let source = row.require("source")?;
        let external_id = row.require("external_id")?;
        let street = row.require("address")?;
        let city = row.require("city")?;
        let raw_zip = row.require("zip_code")?;
        let zip_code = normalize_zip_code(raw_zip).ok_or_else(|| RowError::InvalidField {
            field: "zip_code".into(),
            value: raw_zip.into(),
        })?;
        let published = row.require("published_at")?;
        let opportunity_date: NaiveDate =
            parse_feed_date(published).ok_or_else(|| RowError::InvalidDate {
                field: "published_at".into(),
                value: published.into(),
            })?;
        let latitude = required_number(row, "latitude")?;
        let longitude = required_number(row, "longitude")?;
        if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
            return Err(RowError::InvalidField {
                field: "latitude/longitude".into(),
                value: format!("{latitude},{longitude}"),
            });
        }

        let business_key = format!("{source}-{external_id}");
        let label = row
            .get("title")
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(street)
            .to_string();

        Ok(Opportunity {
            id: Opportunity::id_for_business_key(&business_key),
            business_key,
            source_id: self.source_id().to_string(),
            label,
            address: format!("{street} {zip_code} {city}"),
            department: department_from_zip(&zip_code),
            zip_code,
            coordinates: Coordinates {
                latitude,
                longitude,
            },
            opportunity_date,
            contact: None,
            square_footage: optional_number(row, "square_footage")?,
            price: optional_number(row, "price")?,
            status: OpportunityStatus::PendingReview,
        })
    }

    fn match_query(&self, opportunity: &Opportunity) -> Option<MatchQuery> {
        Some(MatchQuery {
            target_address: opportunity.address.clone(),
            zip_code: opportunity.zip_code.clone(),
            square_footage: opportunity.square_footage,
        })
    }
}

/// Accepts both `.` and `,` as decimal separator.
fn parse_number(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| if c == ',' { '.' } else { c })
        .collect();
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn required_number(row: &RawRow, column: &str) -> Result<f64, RowError> {
    let raw = row.require(column)?;
    parse_number(raw).ok_or_else(|| RowError::InvalidField {
        field: column.into(),
        value: raw.into(),
    })
}

fn optional_number(row: &RawRow, column: &str) -> Result<Option<f64>, RowError> {
    match row.get(column).map(str::trim) {
        None | Some("") => Ok(None),
        Some(_) => required_number(row, column).map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadflow_core::ContactInfo;

    fn death_row(date: &str) -> RawRow {
        RawRow::from_pairs([
            ("nomprenom", "MARTIN*JEAN/"),
            ("sexe", "1"),
            ("datenaiss", "19300105"),
            ("lieunaiss", "75056"),
            ("commnaiss", "PARIS"),
            ("paysnaiss", ""),
            ("datedeces", date),
            ("lieudeces", "75001"),
            ("actedeces", "001"),
        ])
    }

    fn mairie() -> EnrichmentResult {
        EnrichmentResult {
            coordinates: Coordinates {
                latitude: 48.8606,
                longitude: 2.3410,
            },
            contact_info: ContactInfo {
                name: "Mairie du 1er arrondissement".into(),
                phone: Some("01 44 50 75 01".into()),
                email: None,
                street: Some("4 place du Louvre".into()),
                zip_code: Some("75001".into()),
                city: Some("Paris".into()),
            },
            resolved_zip_code: "75001".into(),
            resolved_address: "4 place du Louvre 75001 Paris".into(),
        }
    }

    #[test]
    fn death_row_becomes_keyed_opportunity() {
        let adapter = DeathRegistryAdapter;
        let row = death_row("20231201");
        assert_eq!(adapter.lookup_key(&row).unwrap().as_deref(), Some("75001"));

        let opp = adapter.build_opportunity(&row, Some(&mairie())).unwrap();
        assert_eq!(opp.business_key, "75001_20231201_001");
        assert!(opp.label.contains("Martin Jean"));
        assert_eq!(opp.department, "75");
        assert_eq!(opp.opportunity_date_iso(), "2023-12-01");
        assert_eq!(opp.status, OpportunityStatus::PendingReview);
        assert_eq!(opp.id, Opportunity::id_for_business_key("75001_20231201_001"));
    }

    #[test]
    fn death_row_failures_are_row_errors() {
        let adapter = DeathRegistryAdapter;
        assert_eq!(
            adapter.build_opportunity(&death_row("20231201"), None),
            Err(RowError::EnrichmentUnavailable("75001".into()))
        );
        assert!(matches!(
            adapter.build_opportunity(&death_row("20230000"), Some(&mairie())),
            Err(RowError::InvalidDate { .. })
        ));
        let missing = RawRow::from_pairs([("nomprenom", "X*Y/")]);
        assert!(matches!(
            adapter.build_opportunity(&missing, Some(&mairie())),
            Err(RowError::MissingField(_))
        ));
    }

    fn listing_row(zip: &str, lat: &str) -> RawRow {
        RawRow::from_pairs([
            ("source", "seloger"),
            ("external_id", "42"),
            ("title", "T2 lumineux"),
            ("address", "12 rue de la Paix"),
            ("zip_code", zip),
            ("city", "Paris"),
            ("square_footage", "50,5"),
            ("price", ""),
            ("published_at", "2024-01-10"),
            ("latitude", lat),
            ("longitude", "2.331"),
        ])
    }

    #[test]
    fn listing_row_builds_queryable_opportunity() {
        let adapter = ListingFeedAdapter;
        let opp = adapter.build_opportunity(&listing_row("75002", "48.869"), None).unwrap();
        assert_eq!(opp.business_key, "seloger-42");
        assert_eq!(opp.address, "12 rue de la Paix 75002 Paris");
        assert_eq!(opp.square_footage, Some(50.5));
        assert_eq!(opp.price, None);

        let query = adapter.match_query(&opp).unwrap();
        assert_eq!(query.zip_code, "75002");
        assert_eq!(query.square_footage, Some(50.5));
        assert!(matches!(adapter.conflict_policy(), ConflictPolicy::Overwrite(cols) if cols.contains(&OpportunityColumn::Price)));
    }

    #[test]
    fn listing_row_rejects_bad_coordinates_and_zip() {
        let adapter = ListingFeedAdapter;
        assert!(matches!(
            adapter.build_opportunity(&listing_row("75002", "123.0"), None),
            Err(RowError::InvalidField { .. })
        ));
        assert!(matches!(
            adapter.build_opportunity(&listing_row("7500222", "48.8"), None),
            Err(RowError::InvalidField { .. })
        ));
    }

    #[test]
    fn registry_lookup() {
        assert_eq!(adapter_for_source("death-registry").unwrap().source_id(), "death-registry");
        assert!(adapter_for_source("unknown").is_none());
    }
}
