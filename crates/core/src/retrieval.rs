//! Retrieval types: law-text fragments returned by semantic search.
//!
//! The hosted vector index returns hits as `{ id, score, payload }` where the
//! payload holds the fragment text and a `metadata` object. Only the fields
//! the ranking needs are modelled; anything else in the payload is ignored.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};
use crate::error::RetrievalError;

/// A query sent to the semantic search collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    /// Short natural-language sub-query
    pub query: String,

    /// Maximum number of hits to return
    pub limit: usize,

    /// Only fragments still in force on this date (open-ended validity included)
    pub valid_on: NaiveDate,
}

/// A raw hit as returned by the vector index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchHit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,

    #[serde(default)]
    pub score: Option<f64>,

    #[serde(default)]
    pub payload: HitPayload,
}

/// Hit payload: fragment text plus regulation metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HitPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_content: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    #[serde(default)]
    pub metadata: HitMetadata,
}

/// The recognised metadata fields of a hit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HitMetadata {
    #[serde(
        default,
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub regulation: Option<String>,

    #[serde(rename = "validFrom", default, skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<String>,

    #[serde(rename = "announcedOn", default, skip_serializing_if = "Option::is_none")]
    pub announced_on: Option<String>,

    #[serde(rename = "approvedOn", default, skip_serializing_if = "Option::is_none")]
    pub approved_on: Option<String>,
}

/// Regulation identifiers show up both as strings and as bare numbers.
fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Parse a metadata date. Accepts `YYYY-MM-DD` optionally followed by a time part.
pub fn parse_metadata_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    let day = raw.get(..10).unwrap_or(raw);
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

/// One law-text fragment, validated and ready for ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalDocument {
    /// Similarity score, higher is better; comparable within one batch only
    pub score: f64,

    /// Identifier of the source legal instrument
    pub regulation_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_date: Option<NaiveDate>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub announced_date: Option<NaiveDate>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_date: Option<NaiveDate>,

    pub text: String,
}

impl RetrievalDocument {
    /// The date used to rank currency: effective, else announced, else approved.
    pub fn effective_on(&self) -> Option<NaiveDate> {
        self.effective_date
            .or(self.announced_date)
            .or(self.approved_date)
    }
}

impl TryFrom<SearchHit> for RetrievalDocument {
    type Error = RetrievalError;

    fn try_from(hit: SearchHit) -> Result<Self, Self::Error> {
        let HitPayload { page_content, text, metadata } = hit.payload;
        let score = hit
            .score
            .filter(|s| s.is_finite())
            .ok_or_else(|| RetrievalError::MalformedHit("missing score".into()))?;
        let regulation_id = metadata
            .regulation
            .filter(|r| !r.trim().is_empty())
            .ok_or_else(|| RetrievalError::MalformedHit("missing regulation".into()))?;
        let date = |raw: Option<String>| raw.as_deref().and_then(parse_metadata_date);

        Ok(Self {
            score,
            regulation_id,
            effective_date: date(metadata.valid_from),
            announced_date: date(metadata.announced_on),
            approved_date: date(metadata.approved_on),
            text: page_content.or(text).unwrap_or_default(),
        })
    }
}

/// The semantic search collaborator (embedding + vector index lookup).
#[async_trait]
pub trait SemanticSearch: Send + Sync {
    /// The backend name (e.g., "qdrant").
    fn name(&self) -> &str;

    /// Run one sub-query against the law-text index.
    async fn search(
        &self,
        request: SearchRequest,
    ) -> std::result::Result<Vec<SearchHit>, RetrievalError>;
}
