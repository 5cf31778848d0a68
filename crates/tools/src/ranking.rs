//! Ranking and deduplication of law-text search results.
//!
//! A batch of fragments from one sub-query is ordered by currency first
//! (effective date, newest first, undated last) and similarity second, then
//! reduced to one fragment per regulation. The sort is stable, so equal keys
//! keep their input order and the output is deterministic.
//!
//! When the caller knows that several regulation identifiers are versions
//! of the same instrument, an older version whose score is within the
//! configured tolerance of a newer one is dropped as well.

use esquire_core::retrieval::{RetrievalDocument, SearchHit};
use serde::Deserialize;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Maps regulation identifiers to the instrument they are a version of.
///
/// Deserializes from a flat JSON object: `{ "76/2023": "labour-code" }`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct VersionLinks {
    instrument_of: HashMap<String, String>,
}

impl VersionLinks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `regulation_id` is a version of `instrument`.
    pub fn link(
        &mut self,
        regulation_id: impl Into<String>,
        instrument: impl Into<String>,
    ) -> &mut Self {
        self.instrument_of.insert(regulation_id.into(), instrument.into());
        self
    }

    pub fn instrument(&self, regulation_id: &str) -> Option<&str> {
        self.instrument_of.get(regulation_id).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.instrument_of.is_empty()
    }
}

/// Rank order: newest effective date first, undated last, then higher score.
pub fn rank_order(a: &RetrievalDocument, b: &RetrievalDocument) -> Ordering {
    let by_date = match (a.effective_on(), b.effective_on()) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_date.then_with(|| b.score.total_cmp(&a.score))
}

#[derive(Debug, Clone, Default)]
pub struct RetrievalRanker {
    links: VersionLinks,
    tolerance: f64,
}

impl RetrievalRanker {
    /// A ranker with per-regulation dedup only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Also drop older versions of a linked instrument whose score is
    /// within `tolerance` of a newer version's score.
    pub fn with_version_links(links: VersionLinks, tolerance: f64) -> Self {
        Self {
            links,
            tolerance: if tolerance.is_finite() { tolerance.max(0.0) } else { 0.0 },
        }
    }

    /// Validate raw hits, dropping malformed ones, then rank them.
    pub fn rank_hits(&self, hits: Vec<SearchHit>) -> Vec<RetrievalDocument> {
        let docs = hits
            .into_iter()
            .filter_map(|hit| match RetrievalDocument::try_from(hit) {
                Ok(doc) => Some(doc),
                Err(e) => {
                    warn!("Dropping search hit: {e}");
                    None
                }
            })
            .collect();
        self.rank(docs)
    }

    /// Order a batch and keep one fragment per regulation.
    pub fn rank(&self, mut docs: Vec<RetrievalDocument>) -> Vec<RetrievalDocument> {
        let input = docs.len();
        docs.sort_by(rank_order);

        let mut seen = HashSet::new();
        docs.retain(|doc| seen.insert(doc.regulation_id.clone()));

        if !self.links.is_empty() {
            docs = self.prefer_newer_versions(docs);
        }

        debug!(input, kept = docs.len(), "Ranked retrieval batch");
        docs
    }

    fn prefer_newer_versions(&self, docs: Vec<RetrievalDocument>) -> Vec<RetrievalDocument> {
        let superseded: Vec<bool> = docs
            .iter()
            .map(|older| {
                let Some(instrument) = self.links.instrument(&older.regulation_id) else {
                    return false;
                };
                docs.iter().any(|newer| {
                    newer.regulation_id != older.regulation_id
                        && self.links.instrument(&newer.regulation_id) == Some(instrument)
                        && is_newer(newer, older)
                        && (newer.score - older.score).abs() <= self.tolerance
                })
            })
            .collect();

        docs.into_iter()
            .zip(superseded)
            .filter_map(|(doc, dropped)| {
                if dropped {
                    debug!(regulation = %doc.regulation_id, "Older version superseded");
                    None
                } else {
                    Some(doc)
                }
            })
            .collect()
    }
}

fn is_newer(a: &RetrievalDocument, b: &RetrievalDocument) -> bool {
    match (a.effective_on(), b.effective_on()) {
        (Some(x), Some(y)) => x > y,
        (Some(_), None) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn date(s: &str) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
    }

    fn doc(reg: &str, valid_from: Option<&str>, score: f64) -> RetrievalDocument {
        RetrievalDocument {
            score,
            regulation_id: reg.into(),
            effective_date: valid_from.and_then(date),
            announced_date: None,
            approved_date: None,
            text: format!("{reg} @ {score}"),
        }
    }

    fn summary(docs: &[RetrievalDocument]) -> Vec<(String, f64)> {
        docs.iter().map(|d| (d.regulation_id.clone(), d.score)).collect()
    }

    #[test]
    fn newest_fragment_wins_dedup() {
        let mut b = doc("B", None, 0.95);
        b.announced_date = date("2022-01-01");
        let batch = vec![doc("A", Some("2020-01-01"), 0.9), doc("A", Some("2023-05-01"), 0.7), b];

        let ranked = RetrievalRanker::new().rank(batch);
        assert_eq!(summary(&ranked), vec![("A".into(), 0.7), ("B".into(), 0.95)]);
        assert_eq!(ranked[0].effective_on(), date("2023-05-01"));
        assert_eq!(ranked[1].effective_on(), date("2022-01-01"));
    }

    #[test]
    fn undated_batch_orders_by_score() {
        let batch = vec![doc("X", None, 0.5), doc("Y", None, 0.9), doc("Z", None, 0.7)];
        let ranked = RetrievalRanker::new().rank(batch);
        let scores: Vec<f64> = ranked.iter().map(|d| d.score).collect();
        assert_eq!(scores, vec![0.9, 0.7, 0.5]);
    }

    #[test]
    fn undated_sorts_after_dated() {
        let batch = vec![doc("U", None, 0.99), doc("D", Some("1990-01-01"), 0.1)];
        let ranked = RetrievalRanker::new().rank(batch);
        assert_eq!(ranked[0].regulation_id, "D");
        assert_eq!(ranked[1].regulation_id, "U");
    }

    #[test]
    fn same_date_breaks_tie_by_score() {
        let batch = vec![doc("A", Some("2021-01-01"), 0.3), doc("A", Some("2021-01-01"), 0.8)];
        let ranked = RetrievalRanker::new().rank(batch);
        assert_eq!(summary(&ranked), vec![("A".into(), 0.8)]);
    }

    #[test]
    fn equal_keys_keep_input_order() {
        let first = doc("P", Some("2020-06-01"), 0.5);
        let mut second = doc("Q", Some("2020-06-01"), 0.5);
        second.text = "second".into();
        let ranked = RetrievalRanker::new().rank(vec![first.clone(), second.clone()]);
        assert_eq!(ranked, vec![first.clone(), second.clone()]);

        let ranked = RetrievalRanker::new().rank(vec![second.clone(), first.clone()]);
        assert_eq!(ranked, vec![second, first]);
    }

    #[test]
    fn ranking_is_idempotent() {
        let batch = vec![
            doc("A", Some("2019-01-01"), 0.4),
            doc("B", None, 0.8),
            doc("C", Some("2024-02-01"), 0.6),
            doc("A", Some("2022-01-01"), 0.2),
            doc("D", None, 0.8),
        ];
        let ranker = RetrievalRanker::new();
        let once = ranker.rank(batch);
        let twice = ranker.rank(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn output_has_unique_regulations() {
        let batch: Vec<_> = (0..20)
            .map(|i| doc(&format!("R{}", i % 4), Some(&format!("20{:02}-01-01", 10 + i)), 0.5))
            .collect();
        let ranked = RetrievalRanker::new().rank(batch);
        let unique: HashSet<_> = ranked.iter().map(|d| d.regulation_id.as_str()).collect();
        assert_eq!(unique.len(), ranked.len());
        assert_eq!(ranked.len(), 4);
    }

    #[test]
    fn empty_batch_is_empty() {
        assert!(RetrievalRanker::new().rank(Vec::new()).is_empty());
        assert!(RetrievalRanker::new().rank_hits(Vec::new()).is_empty());
    }

    #[test]
    fn malformed_hits_are_dropped() {
        let hits: Vec<SearchHit> = serde_json::from_value(serde_json::json!([
            { "score": 0.9, "payload": { "metadata": {} } },
            { "payload": { "metadata": { "regulation": "A" } } },
            { "score": 0.4, "payload": { "page_content": "ok", "metadata": { "regulation": "B" } } }
        ]))
        .unwrap();
        let ranked = RetrievalRanker::new().rank_hits(hits);
        assert_eq!(summary(&ranked), vec![("B".into(), 0.4)]);
        assert_eq!(ranked[0].text, "ok");

        let only_bad: Vec<SearchHit> = serde_json::from_value(serde_json::json!([
            { "payload": {} }
        ]))
        .unwrap();
        assert!(RetrievalRanker::new().rank_hits(only_bad).is_empty());
    }

    #[test]
    fn linked_older_version_with_comparable_score_is_dropped() {
        let mut links = VersionLinks::new();
        links.link("311/2001", "labour-code").link("76/2023", "labour-code");
        let ranker = RetrievalRanker::with_version_links(links, 0.05);

        let batch = vec![
            doc("311/2001", Some("2001-04-01"), 0.82),
            doc("76/2023", Some("2023-03-01"), 0.80),
            doc("40/1964", Some("1964-04-01"), 0.60),
        ];
        let ranked = ranker.rank(batch);
        assert_eq!(
            summary(&ranked),
            vec![("76/2023".into(), 0.80), ("40/1964".into(), 0.60)]
        );
    }

    #[test]
    fn linked_older_version_with_much_higher_score_is_kept() {
        let mut links = VersionLinks::new();
        links.link("old", "act").link("new", "act");
        let ranker = RetrievalRanker::with_version_links(links, 0.05);

        let ranked = ranker.rank(vec![doc("old", Some("2001-01-01"), 0.9), doc("new", Some("2020-01-01"), 0.5)]);
        assert_eq!(summary(&ranked), vec![("new".into(), 0.5), ("old".into(), 0.9)]);
    }

    #[test]
    fn links_load_from_json_map() {
        let links: VersionLinks =
            serde_json::from_str(r#"{ "311/2001": "labour-code", "76/2023": "labour-code" }"#).unwrap();
        assert_eq!(links.instrument("76/2023"), Some("labour-code"));
        assert_eq!(links.instrument("40/1964"), None);
    }

    #[test]
    fn without_links_versions_are_independent() {
        let ranked = RetrievalRanker::with_version_links(VersionLinks::new(), 1.0)
            .rank(vec![doc("old", Some("2001-01-01"), 0.8), doc("new", Some("2020-01-01"), 0.8)]);
        assert_eq!(ranked.len(), 2);
    }
}
