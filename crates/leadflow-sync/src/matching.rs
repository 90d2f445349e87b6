//! Fuzzy address matching: normalization, edit distance, penalties and the composite score.

use std::cmp::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use leadflow_core::{CorpusRecord, DiagnosticLink, MatchCandidate, MatchQuery, Opportunity};
use tracing::debug;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::persistence::{DiagnosticCorpus, LinkStore};

pub const MAX_LINKS_PER_OPPORTUNITY: usize = 5;

/// Penalty when one normalized string contains the other.
pub const CONTAINMENT_PENALTY: f64 = 0.1;

/// Best-match scores above this count as "no match found".
pub const BEST_MATCH_THRESHOLD: f64 = 0.6;

const SIZE_WEIGHT: f64 = 30.0;
const CITY_WEIGHT: f64 = 40.0;
const STREET_WEIGHT: f64 = 30.0;

/// Lowercase, strip diacritics, turn `-`, `_` and apostrophes into spaces,
/// drop remaining punctuation, collapse whitespace.
pub fn normalize(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.nfd() {
        if is_combining_mark(ch) {
            continue;
        }
        let ch = match ch {
            '-' | '_' | '\'' | '\u{2019}' => ' ',
            other => other,
        };
        if ch.is_alphanumeric() || ch.is_whitespace() {
            out.extend(ch.to_lowercase());
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Optimal-string-alignment distance: insertions, deletions, substitutions and
/// adjacent transpositions each cost 1.
pub fn damerau_levenshtein_distance(a: &str, b: &str) -> usize {
    strsim::osa_distance(a, b)
}

/// Fuzzy rank of `candidate` against `query` in `[0, 1]` (0 = identical), or
/// `None` when nothing close enough is found.
pub fn best_match_score(query: &str, candidate: &str) -> Option<f64> {
    let query = normalize(query);
    let candidate = normalize(candidate);
    let longest = query.chars().count().max(candidate.chars().count());
    if query.is_empty() || candidate.is_empty() {
        return None;
    }
    let score = damerau_levenshtein_distance(&query, &candidate) as f64 / longest as f64;
    (score <= BEST_MATCH_THRESHOLD).then_some(score)
}

/// Fraction of a sub-score weight to subtract for this pair of strings.
pub fn match_penalty(target: &str, candidate: &str) -> f64 {
    let target = normalize(target);
    let candidate = normalize(candidate);
    if target == candidate {
        return 0.0;
    }
    if !target.is_empty()
        && !candidate.is_empty()
        && (target.contains(&candidate) || candidate.contains(&target))
    {
        return CONTAINMENT_PENALTY;
    }
    best_match_score(&target, &candidate).unwrap_or(1.0)
}

/// Relative difference of `candidate` against `target`. `None` when the target
/// size cannot anchor a ratio.
pub fn percentage_difference(target: f64, candidate: f64) -> Option<f64> {
    (target > 0.0).then(|| (target - candidate).abs() / target)
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AddressParts {
    pub street: Option<String>,
    pub city: Option<String>,
}

/// Splits free text around its first five-digit zip token: street before, city after.
pub fn split_address(text: &str) -> AddressParts {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    let Some(zip_at) = tokens.iter().position(|token| {
        let token = token.trim_matches(|c: char| c == ',' || c == ';');
        token.len() == 5 && token.bytes().all(|b| b.is_ascii_digit())
    }) else {
        return AddressParts::default();
    };
    let join = |parts: &[&str]| {
        let joined = parts.join(" ");
        let joined = joined.trim().trim_matches(',').trim().to_string();
        (!joined.is_empty()).then_some(joined)
    };
    AddressParts {
        street: join(&tokens[..zip_at]),
        city: join(&tokens[zip_at + 1..]),
    }
}

fn present(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Composite 0–100 score. Every term is subtractive; the size term is not
/// capped, so very large size differences dominate and floor the score at 0.
pub fn calculate_match_score(query: &MatchQuery, candidate: &CorpusRecord) -> f64 {
    let mut score = 100.0;

    if let (Some(target), Some(found)) = (query.square_footage, candidate.square_footage) {
        if let Some(diff) = percentage_difference(target, found) {
            score -= diff * SIZE_WEIGHT;
        }
    }

    let parts = split_address(&query.target_address);
    if let (Some(target), Some(found)) = (present(parts.city.as_deref()), present(candidate.city.as_deref())) {
        score -= match_penalty(target, found) * CITY_WEIGHT;
    }
    if let (Some(target), Some(found)) = (
        present(parts.street.as_deref()),
        present(candidate.street.as_deref()),
    ) {
        score -= match_penalty(target, found) * STREET_WEIGHT;
    }

    f64::max(score, 0.0)
}

/// Scores every candidate, sorts by descending score (stable on ties) and keeps `limit`.
pub fn rank_candidates(
    query: &MatchQuery,
    candidates: Vec<CorpusRecord>,
    limit: usize,
) -> Vec<MatchCandidate> {
    let mut scored: Vec<MatchCandidate> = candidates
        .into_iter()
        .map(|record| MatchCandidate {
            external_record_id: record.external_id.clone(),
            match_score: calculate_match_score(query, &record),
            record,
        })
        .collect();
    scored.sort_by(|a, b| {
        b.match_score
            .partial_cmp(&a.match_score)
            .unwrap_or(Ordering::Equal)
    });
    scored.truncate(limit);
    scored
}

/// Links opportunities to their best corpus records.
#[derive(Clone)]
pub struct DiagnosticLinker {
    corpus: Arc<dyn DiagnosticCorpus>,
    links: Arc<dyn LinkStore>,
    max_links: usize,
}

impl DiagnosticLinker {
    pub fn new(corpus: Arc<dyn DiagnosticCorpus>, links: Arc<dyn LinkStore>) -> Self {
        Self {
            corpus,
            links,
            max_links: MAX_LINKS_PER_OPPORTUNITY,
        }
    }

    /// Recomputes scores against the current corpus and replaces the
    /// opportunity's stored links with the top ones.
    pub async fn search_and_link_for_opportunity(
        &self,
        opportunity: &Opportunity,
        query: &MatchQuery,
    ) -> Result<Vec<DiagnosticLink>> {
        let candidates = self
            .corpus
            .candidates_in_zip(&query.zip_code)
            .await
            .with_context(|| format!("loading corpus candidates for {}", query.zip_code))?;
        let considered = candidates.len();
        let ranked = rank_candidates(query, candidates, self.max_links);
        let links: Vec<DiagnosticLink> = ranked
            .iter()
            .map(|candidate| DiagnosticLink::new(opportunity.id, candidate))
            .collect();

        self.links
            .replace_links(opportunity.id, &links)
            .await
            .with_context(|| format!("storing links for {}", opportunity.business_key))?;
        debug!(
            business_key = %opportunity.business_key,
            considered,
            linked = links.len(),
            "diagnostic links replaced"
        );
        Ok(links)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, street: &str, city: &str, size: Option<f64>) -> CorpusRecord {
        CorpusRecord {
            external_id: id.into(),
            street: Some(street.into()),
            zip_code: "75002".into(),
            city: Some(city.into()),
            square_footage: size,
        }
    }

    fn query(size: Option<f64>) -> MatchQuery {
        MatchQuery {
            target_address: "12 rue de la Paix 75002 Paris".into(),
            zip_code: "75002".into(),
            square_footage: size,
        }
    }

    #[test]
    fn normalization_strips_case_accents_and_punctuation() {
        assert_eq!(normalize("  Rue de l'Église-Saint_Marc,  n°3 "), "rue de l eglise saint marc n3");
        assert_eq!(normalize("ÎLE-DE-FRANCE"), "ile de france");
        assert_eq!(normalize("!!!"), "");
    }

    #[test]
    fn distance_properties() {
        for s in ["", "a", "paris", "rue de la paix"] {
            assert_eq!(damerau_levenshtein_distance(s, s), 0);
            assert_eq!(damerau_levenshtein_distance("", s), s.chars().count());
            assert_eq!(damerau_levenshtein_distance(s, ""), s.chars().count());
        }
        assert_eq!(damerau_levenshtein_distance("paris", "pairs"), 1);
        assert_eq!(
            damerau_levenshtein_distance("lyon", "lion"),
            damerau_levenshtein_distance("lion", "lyon")
        );
        assert_eq!(damerau_levenshtein_distance("kitten", "sitting"), 3);
    }

    #[test]
    fn penalties_follow_exact_containment_fuzzy_order() {
        assert_eq!(match_penalty("Paris", "PARIS"), 0.0);
        assert_eq!(match_penalty("Saint-Étienne", "saint etienne"), 0.0);
        assert_eq!(match_penalty("Paris", "Paris 2e Arrondissement"), CONTAINMENT_PENALTY);

        let fuzzy = match_penalty("rue de la paix", "rue de la pax");
        assert!(fuzzy > 0.0 && fuzzy < CONTAINMENT_PENALTY);
        assert_eq!(match_penalty("Paris", "Marseille"), 1.0);
        assert_eq!(match_penalty("Paris", ""), 1.0);
    }

    #[test]
    fn address_is_split_around_zip_token() {
        let parts = split_address("12 rue de la Paix, 75002 Paris");
        assert_eq!(parts.street.as_deref(), Some("12 rue de la Paix"));
        assert_eq!(parts.city.as_deref(), Some("Paris"));

        assert_eq!(split_address("12 rue de la Paix Paris"), AddressParts::default());
        let no_city = split_address("12 rue de la Paix 75002");
        assert_eq!(no_city.city, None);
    }

    #[test]
    fn identical_address_and_size_scores_full_marks() {
        let score = calculate_match_score(&query(Some(50.0)), &record("a", "12 rue de la Paix", "Paris", Some(50.0)));
        assert_eq!(score, 100.0);
    }

    #[test]
    fn twenty_percent_size_difference_costs_six_points() {
        let score = calculate_match_score(&query(Some(50.0)), &record("a", "12 rue de la Paix", "Paris", Some(60.0)));
        assert!((score - 94.0).abs() < 1e-9, "score was {score}");
    }

    #[test]
    fn score_is_monotonic_in_size_difference_and_never_negative() {
        let mut previous = f64::MAX;
        for candidate_size in [10.0, 11.0, 15.0, 20.0, 40.0, 100.0, 1000.0] {
            let score = calculate_match_score(
                &query(Some(10.0)),
                &record("a", "12 rue de la Paix", "Paris", Some(candidate_size)),
            );
            assert!(score <= previous);
            assert!(score >= 0.0);
            previous = score;
        }
        assert_eq!(previous, 0.0);
    }

    #[test]
    fn missing_components_skip_their_penalty() {
        let mut candidate = record("a", "", "", Some(50.0));
        candidate.street = None;
        assert_eq!(calculate_match_score(&query(Some(50.0)), &candidate), 100.0);

        let unsplittable = MatchQuery {
            target_address: "somewhere in Paris".into(),
            zip_code: "75002".into(),
            square_footage: None,
        };
        assert_eq!(
            calculate_match_score(&unsplittable, &record("a", "1 avenue Foch", "Lyon", None)),
            100.0
        );
    }

    #[test]
    fn city_mismatch_weighs_forty_points() {
        let score = calculate_match_score(&query(None), &record("a", "12 rue de la Paix", "Marseille", None));
        assert_eq!(score, 60.0);
    }

    #[test]
    fn ranking_is_descending_stable_and_truncated() {
        let candidates = vec![
            record("far", "8 boulevard Haussmann", "Paris", Some(50.0)),
            record("tie-1", "12 rue de la Paix", "Paris", Some(60.0)),
            record("best", "12 rue de la Paix", "Paris", Some(50.0)),
            record("tie-2", "12 rue de la Paix", "Paris", Some(40.0)),
        ];
        let ranked = rank_candidates(&query(Some(50.0)), candidates, 3);
        let ids: Vec<_> = ranked.iter().map(|c| c.external_record_id.as_str()).collect();
        assert_eq!(ids, vec!["best", "tie-1", "tie-2"]);
        assert_eq!(ranked[1].match_score, ranked[2].match_score);
    }
}
