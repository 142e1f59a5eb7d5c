//! Core data models used throughout docket.
//!
//! These types represent the raw documents, canonical records, filters and
//! ranked results that flow through the ingestion and retrieval pipeline.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Where a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordSource {
    /// The static, pre-embedded corpus.
    Historical,
    /// Fetched on demand from the live filings source.
    Live,
}

impl RecordSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordSource::Historical => "HISTORICAL",
            RecordSource::Live => "LIVE",
        }
    }
}

impl fmt::Display for RecordSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "HISTORICAL" => Ok(RecordSource::Historical),
            "LIVE" => Ok(RecordSource::Live),
            other => Err(format!(
                "unknown record source '{}': expected HISTORICAL or LIVE",
                other
            )),
        }
    }
}

/// Structured metadata attached to a record.
///
/// Known fields are typed so they can be filtered on; anything else a source
/// provides goes into the ordered `extra` map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filing_date: Option<NaiveDate>,
    /// Contract type (e.g. `Employment`, `M&A`, `Lease`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<String>,
    /// Regulatory form the document was filed under (e.g. `8-K`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clause_tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

/// Inclusive date range. Either bound may be open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<NaiveDate>,
}

impl DateRange {
    pub fn new(from: Option<NaiveDate>, to: Option<NaiveDate>) -> Self {
        Self { from, to }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.from.map_or(true, |f| date >= f) && self.to.map_or(true, |t| date <= t)
    }

    pub fn is_open(&self) -> bool {
        self.from.is_none() && self.to.is_none()
    }
}

/// Metadata restrictions applied to the candidate set before ranking.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchFilters {
    /// Matches `doc_type` or `form_type`, case-insensitively.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<String>,
    /// Matches `entity` or `ticker`, case-insensitively.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
    /// Records without a filing date never match a date range.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_range: Option<DateRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<RecordSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clause_tag: Option<String>,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        self.doc_type.is_none()
            && self.entity.is_none()
            && self.date_range.map_or(true, |r| r.is_open())
            && self.source.is_none()
            && self.clause_tag.is_none()
    }

    pub fn matches(&self, source: RecordSource, meta: &RecordMetadata) -> bool {
        if self.source.is_some_and(|s| s != source) {
            return false;
        }
        if let Some(ref want) = self.doc_type {
            let hit = [&meta.doc_type, &meta.form_type]
                .iter()
                .any(|v| v.as_deref().is_some_and(|v| same_folded(v, want)));
            if !hit {
                return false;
            }
        }
        if let Some(ref want) = self.entity {
            let hit = [&meta.entity, &meta.ticker]
                .iter()
                .any(|v| v.as_deref().is_some_and(|v| same_folded(v, want)));
            if !hit {
                return false;
            }
        }
        if let Some(range) = self.date_range.filter(|r| !r.is_open()) {
            match meta.filing_date {
                Some(d) if range.contains(d) => {}
                _ => return false,
            }
        }
        if let Some(ref want) = self.clause_tag {
            if !meta.clause_tags.iter().any(|t| same_folded(t, want)) {
                return false;
            }
        }
        true
    }

    /// Trimmed, lowercased copy so that equivalent filters hash identically.
    pub fn canonical(&self) -> Self {
        let norm = |v: &Option<String>| {
            v.as_deref()
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
        };
        Self {
            doc_type: norm(&self.doc_type),
            entity: norm(&self.entity),
            date_range: self.date_range.filter(|r| !r.is_open()),
            source: self.source,
            clause_tag: norm(&self.clause_tag),
        }
    }
}

/// Case- and padding-insensitive comparison, using the same Unicode
/// lowercasing as [`SearchFilters::canonical`].
pub fn same_folded(a: &str, b: &str) -> bool {
    let (a, b) = (a.trim(), b.trim());
    a == b || a.to_lowercase() == b.to_lowercase()
}

/// Structured criteria handed to the live fetcher.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FetchCriteria {
    pub entity: Option<String>,
    pub date_range: Option<DateRange>,
    pub doc_type: Option<String>,
}

/// A document as produced by the corpus loader or the live fetcher, before
/// normalization.
#[derive(Debug, Clone)]
pub struct RawDocument {
    /// Identifier in the originating system (corpus path, exhibit URL).
    pub source_native_id: String,
    pub text: String,
    pub metadata: RecordMetadata,
}

/// Canonical, immutable unit stored in the index.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentRecord {
    pub id: String,
    pub source: RecordSource,
    pub source_native_id: String,
    pub revision: u32,
    pub text: String,
    #[serde(skip)]
    pub embedding: Vec<f32>,
    pub content_hash: String,
    pub model: String,
    pub metadata: RecordMetadata,
    pub ingested_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<String>,
}

/// Which duplicate key matched an existing record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateKey {
    RecordId,
    NativeId,
    ContentHash,
}

/// Reference to the record an ingested document resolved to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateRef {
    pub id: String,
    pub source: RecordSource,
    pub matched_on: DuplicateKey,
}

/// Result of ingesting one document.
#[derive(Debug, Clone)]
pub enum IngestOutcome {
    Inserted(Box<DocumentRecord>),
    Duplicate(DuplicateRef),
}

impl IngestOutcome {
    pub fn id(&self) -> &str {
        match self {
            IngestOutcome::Inserted(r) => &r.id,
            IngestOutcome::Duplicate(d) => &d.id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, IngestOutcome::Duplicate(_))
    }
}

/// One entry of a ranked result set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedResult {
    pub id: String,
    /// Cosine similarity clamped to `[0.0, 1.0]`.
    pub score: f32,
    pub source: RecordSource,
    pub ingested_at: DateTime<Utc>,
    pub metadata: RecordMetadata,
}

impl RankedResult {
    /// Score desc, then newer `ingested_at`, then `id` asc.
    pub fn rank_cmp(&self, other: &Self) -> Ordering {
        rank_order(
            (self.score, self.ingested_at, &self.id),
            (other.score, other.ingested_at, &other.id),
        )
    }
}

/// Total order shared by the index and the query engine.
pub fn rank_order(a: (f32, DateTime<Utc>, &str), b: (f32, DateTime<Utc>, &str)) -> Ordering {
    b.0.total_cmp(&a.0)
        .then_with(|| b.1.cmp(&a.1))
        .then_with(|| a.2.cmp(b.2))
}

/// Input of [`HybridQueryEngine::query`](crate::query::HybridQueryEngine::query).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryRequest {
    pub text: String,
    #[serde(default)]
    pub filters: SearchFilters,
    #[serde(default)]
    pub include_live: bool,
    #[serde(default)]
    pub top_k: Option<usize>,
}

/// Envelope returned for every successful query.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResponse {
    pub results: Vec<RankedResult>,
    pub warnings: Vec<String>,
}
