//! Geocoding and contact enrichment with a one-entry memo.
//!
//! Registry files are sorted by place of death, so consecutive rows very often
//! share a lookup key. Remembering only the latest answer catches those runs
//! without an unbounded cache.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use leadflow_core::{ContactInfo, Coordinates, EnrichmentResult};
use leadflow_storage::{FetchError, RateLimitedClient};
use serde::Deserialize;
use tracing::{debug, warn};

/// Cache holding at most one key/value pair.
#[derive(Debug, Clone)]
pub struct SingleSlotCache<K, V> {
    slot: Option<(K, V)>,
}

impl<K, V> Default for SingleSlotCache<K, V> {
    fn default() -> Self {
        Self { slot: None }
    }
}

impl<K: Eq, V> SingleSlotCache<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        match &self.slot {
            Some((cached, value)) if cached.borrow() == key => Some(value),
            _ => None,
        }
    }

    /// Replaces whatever the slot held.
    pub fn put(&mut self, key: K, value: V) {
        self.slot = Some((key, value));
    }

    pub fn clear(&mut self) {
        self.slot = None;
    }

    pub fn is_empty(&self) -> bool {
        self.slot.is_none()
    }
}

#[async_trait]
pub trait EnrichmentSource: Send + Sync {
    /// `Ok(None)` when the directory knows nothing for `key`.
    async fn lookup(&self, key: &str) -> Result<Option<EnrichmentResult>>;
}

/// Job-local enrichment front end. Create one per job run.
pub struct Enricher {
    source: Arc<dyn EnrichmentSource>,
    memo: SingleSlotCache<String, EnrichmentResult>,
    lookups: usize,
    memo_hits: usize,
}

impl Enricher {
    pub fn new(source: Arc<dyn EnrichmentSource>) -> Self {
        Self {
            source,
            memo: SingleSlotCache::new(),
            lookups: 0,
            memo_hits: 0,
        }
    }

    /// Resolves `key`, calling the source only when the memo misses.
    ///
    /// Failures and empty answers yield `None` and leave the memo as it was,
    /// so the next row with the same key tries again.
    pub async fn enrich(&mut self, key: &str) -> Option<EnrichmentResult> {
        if let Some(hit) = self.memo.get(key) {
            self.memo_hits += 1;
            return Some(hit.clone());
        }

        self.lookups += 1;
        match self.source.lookup(key).await {
            Ok(Some(result)) => {
                self.memo.put(key.to_string(), result.clone());
                Some(result)
            }
            Ok(None) => {
                debug!(key, "no enrichment result");
                None
            }
            Err(err) => {
                warn!(key, error = %format!("{err:#}"), "enrichment lookup failed");
                None
            }
        }
    }

    /// Calls made to the underlying source.
    pub fn lookups(&self) -> usize {
        self.lookups
    }

    pub fn memo_hits(&self) -> usize {
        self.memo_hits
    }
}

/// Town-hall directory API: one mairie per commune code.
#[derive(Debug, Clone)]
pub struct MairieDirectory {
    client: RateLimitedClient,
    base_url: String,
}

impl MairieDirectory {
    pub fn new(client: RateLimitedClient, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn url_for(&self, commune_code: &str) -> String {
        format!("{}/communes/{}/mairie", self.base_url, commune_code.trim())
    }
}

#[async_trait]
impl EnrichmentSource for MairieDirectory {
    async fn lookup(&self, key: &str) -> Result<Option<EnrichmentResult>> {
        let url = self.url_for(key);
        let response = match self.client.fetch_with_retry(&url).await {
            Ok(response) => response,
            Err(FetchError::HttpStatus { status: 404, .. }) => {
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        let payload: DirectoryPayload = response.json()?;
        Ok(parse_directory_payload(payload))
    }
}

#[derive(Debug, Deserialize)]
pub struct DirectoryPayload {
    #[serde(default)]
    features: Vec<DirectoryFeature>,
}

#[derive(Debug, Deserialize)]
struct DirectoryFeature {
    properties: DirectoryProperties,
}

#[derive(Debug, Deserialize)]
struct DirectoryProperties {
    nom: String,
    #[serde(default)]
    telephone: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    adresses: Option<Addresses>,
}

/// The directory sends either one address object or a list of them.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Addresses {
    Many(Vec<RawAddress>),
    Single(RawAddress),
}

#[derive(Debug, Clone, Deserialize)]
struct RawAddress {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    lignes: Vec<String>,
    #[serde(rename = "codePostal", default)]
    code_postal: Option<String>,
    #[serde(default)]
    commune: Option<String>,
    /// `[longitude, latitude]`
    #[serde(default)]
    coordonnees: Option<[f64; 2]>,
}

impl RawAddress {
    fn is_postal(&self) -> bool {
        self.kind
            .as_deref()
            .is_some_and(|k| k.eq_ignore_ascii_case("postale"))
    }
}

/// First feature of a directory answer as an [`EnrichmentResult`].
///
/// Coordinates come from the geocoded address; street, zip and city prefer the
/// postal address when the directory lists one. `None` when no address carries
/// coordinates or a zip code.
pub fn parse_directory_payload(payload: DirectoryPayload) -> Option<EnrichmentResult> {
    let properties = payload.features.into_iter().next()?.properties;
    let addresses = match properties.adresses? {
        Addresses::Many(list) => list,
        Addresses::Single(one) => vec![one],
    };

    let geocoded = addresses.iter().find(|a| a.coordonnees.is_some())?;
    let display = addresses
        .iter()
        .find(|a| a.is_postal())
        .unwrap_or(geocoded);
    let [longitude, latitude] = geocoded.coordonnees?;

    let zip_code = display
        .code_postal
        .clone()
        .or_else(|| geocoded.code_postal.clone())?;
    let city = display.commune.clone().or_else(|| geocoded.commune.clone());
    let street = non_empty(display.lignes.join(" "));

    let resolved_address = [street.as_deref(), Some(zip_code.as_str()), city.as_deref()]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ");

    Some(EnrichmentResult {
        coordinates: Coordinates {
            latitude,
            longitude,
        },
        contact_info: ContactInfo {
            name: properties.nom,
            phone: properties.telephone.and_then(non_empty),
            email: properties.email.and_then(non_empty),
            street,
            zip_code: Some(zip_code.clone()),
            city,
        },
        resolved_zip_code: zip_code,
        resolved_address,
    })
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Fixed answers keyed by lookup key, counting every call.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    entries: HashMap<String, EnrichmentResult>,
    calls: AtomicUsize,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(mut self, key: impl Into<String>, result: EnrichmentResult) -> Self {
        self.entries.insert(key.into(), result);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EnrichmentSource for MemoryDirectory {
    async fn lookup(&self, key: &str) -> Result<Option<EnrichmentResult>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.entries.get(key).cloned())
    }
}
