//! Hybrid query engine.
//!
//! Answers a query from the vector index and, when the query needs data the
//! historical corpus cannot have, from the live source:
//!
//! 1. Embed the query text (failure aborts with `EMBEDDING_FAILED`).
//! 2. Collect `max(k_corpus, top_k)` filtered candidates from the index.
//! 3. Take the live path when it is requested, when the date filter reaches
//!    past the corpus coverage end, or when the requested entity (filter or
//!    `$TICKER` in the text) is unknown to the index. Fetched documents go
//!    through the ingestion pipeline and are scored against the same query
//!    vector.
//! 4. Merge by id keeping the best score, sort, truncate to `top_k`.
//!
//! A failing or slow live source only adds a `LIVE_FETCH_UNAVAILABLE`
//! warning. Responses with warnings are not cached.

use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{QuerySignature, ResultCache};
use crate::embedding::{embed_document, EmbeddingProvider};
use crate::error::{QueryError, LIVE_FETCH_UNAVAILABLE};
use crate::index::VectorIndex;
use crate::ingest::IngestionPipeline;
use crate::live::LiveFetcher;
use crate::models::{
    FetchCriteria, QueryRequest, QueryResponse, RankedResult, RecordSource, SearchFilters,
};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub k_corpus: usize,
    pub default_top_k: usize,
    pub max_top_k: usize,
    pub live_timeout: Duration,
    pub coverage_end: Option<NaiveDate>,
    /// Longest single embedding input; longer query texts are chunked.
    pub max_input_chars: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            k_corpus: 50,
            default_top_k: 10,
            max_top_k: 100,
            live_timeout: Duration::from_secs(20),
            coverage_end: None,
            max_input_chars: usize::MAX,
        }
    }
}

/// Why a query took the live path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveReason {
    Requested,
    BeyondCoverage,
    UnknownEntity,
}

pub struct HybridQueryEngine {
    index: Arc<VectorIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    pipeline: Arc<IngestionPipeline>,
    fetcher: Arc<dyn LiveFetcher>,
    cache: Arc<ResultCache>,
    settings: EngineSettings,
}

impl HybridQueryEngine {
    pub fn new(
        index: Arc<VectorIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        pipeline: Arc<IngestionPipeline>,
        fetcher: Arc<dyn LiveFetcher>,
        cache: Arc<ResultCache>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            index,
            embedder,
            pipeline,
            fetcher,
            cache,
            settings,
        }
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn effective_top_k(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.settings.default_top_k)
            .clamp(1, self.settings.max_top_k)
    }

    pub async fn query(&self, req: &QueryRequest) -> Result<QueryResponse, QueryError> {
        let text = req.text.trim();
        if text.is_empty() {
            return Err(QueryError::EmptyQuery);
        }
        let top_k = self.effective_top_k(req.top_k);
        let signature = QuerySignature::new(text, &req.filters, req.include_live, top_k);

        if let Some(cached) = self.cache.get(&signature) {
            tracing::debug!(top_k, "query answered from cache");
            return Ok(QueryResponse {
                results: cached.as_ref().clone(),
                warnings: Vec::new(),
            });
        }

        // Embed exactly the text the cache is keyed on
        let text = signature.text();
        let query_vector = embed_document(self.embedder.as_ref(), text, self.settings.max_input_chars)
            .await
            .map_err(QueryError::EmbeddingFailed)?;

        let filters = req.filters.canonical();
        let k = self.settings.k_corpus.max(top_k);
        let mut candidates = self.index.search(&query_vector, k, &filters)?;
        let mut warnings = Vec::new();

        let entity = req
            .filters
            .entity
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(String::from)
            .or_else(|| extract_cashtag(text));
        if let Some(reason) = self.live_reason(req, entity.as_deref())? {
            let criteria = FetchCriteria {
                entity,
                date_range: filters.date_range,
                doc_type: req
                    .filters
                    .doc_type
                    .as_deref()
                    .map(str::trim)
                    .filter(|d| !d.is_empty())
                    .map(String::from),
            };
            tracing::debug!(?reason, ?criteria, "taking live path");
            let live = self
                .live_candidates(&query_vector, &criteria, &filters, &mut warnings)
                .await?;
            candidates.extend(live);
        }

        let results = merge_ranked(candidates, top_k);

        if warnings.is_empty() {
            self.cache
                .put(signature, Arc::new(results.clone()), self.cache.default_ttl());
        }

        tracing::info!(
            top_k,
            results = results.len(),
            warnings = warnings.len(),
            "query answered"
        );
        Ok(QueryResponse { results, warnings })
    }

    /// Decide whether the live source must be consulted.
    pub fn live_reason(
        &self,
        req: &QueryRequest,
        entity: Option<&str>,
    ) -> Result<Option<LiveReason>, QueryError> {
        // Live records can never satisfy a historical-only filter
        if req.filters.source == Some(RecordSource::Historical) {
            return Ok(None);
        }
        if req.include_live {
            return Ok(Some(LiveReason::Requested));
        }
        if let (Some(end), Some(range)) = (self.settings.coverage_end, req.filters.date_range) {
            let past_end = |d: Option<NaiveDate>| d.is_some_and(|d| d > end);
            if !range.is_open() && (range.to.is_none() || past_end(range.to) || past_end(range.from))
            {
                return Ok(Some(LiveReason::BeyondCoverage));
            }
        }
        if let Some(entity) = entity {
            if !self.index.knows_entity(entity)? {
                return Ok(Some(LiveReason::UnknownEntity));
            }
        }
        Ok(None)
    }

    async fn live_candidates(
        &self,
        query_vector: &[f32],
        criteria: &FetchCriteria,
        filters: &SearchFilters,
        warnings: &mut Vec<String>,
    ) -> Result<Vec<RankedResult>, QueryError> {
        let fetched =
            tokio::time::timeout(self.settings.live_timeout, self.fetcher.fetch(criteria)).await;

        let docs = match fetched {
            Ok(Ok(docs)) => docs,
            Ok(Err(e)) => {
                tracing::warn!(fetcher = self.fetcher.name(), error = %e, "live fetch failed");
                warnings.push(format!("{}: {}", LIVE_FETCH_UNAVAILABLE, e));
                return Ok(Vec::new());
            }
            Err(_) => {
                tracing::warn!(
                    fetcher = self.fetcher.name(),
                    timeout_secs = self.settings.live_timeout.as_secs_f64(),
                    "live fetch timed out"
                );
                warnings.push(format!(
                    "{}: live source did not answer within {:.1}s",
                    LIVE_FETCH_UNAVAILABLE,
                    self.settings.live_timeout.as_secs_f64()
                ));
                return Ok(Vec::new());
            }
        };

        if docs.is_empty() {
            return Ok(Vec::new());
        }

        let report = self.pipeline.ingest_batch(docs, RecordSource::Live).await;
        if report.failed() > 0 {
            for outcome in report.outcomes.iter().filter(|o| o.result.is_err()) {
                if let Err(e) = &outcome.result {
                    tracing::warn!(native_id = %outcome.source_native_id, code = e.code(), error = %e, "live document not ingested");
                }
            }
            warnings.push(format!(
                "{}: {} live document(s) could not be ingested",
                LIVE_FETCH_UNAVAILABLE,
                report.failed()
            ));
        }

        let mut live = Vec::new();
        for id in report.record_ids() {
            if let Some(hit) = self.index.ranked_or_stored(id, query_vector).await? {
                if filters.matches(hit.source, &hit.metadata) {
                    live.push(hit);
                }
            }
        }
        Ok(live)
    }
}

/// Deduplicate by id keeping the best score, then sort and truncate.
pub fn merge_ranked(candidates: Vec<RankedResult>, top_k: usize) -> Vec<RankedResult> {
    let mut best: HashMap<String, RankedResult> = HashMap::with_capacity(candidates.len());
    for candidate in candidates {
        match best.get(&candidate.id) {
            Some(existing) if existing.score >= candidate.score => {}
            _ => {
                best.insert(candidate.id.clone(), candidate);
            }
        }
    }
    let mut merged: Vec<RankedResult> = best.into_values().collect();
    merged.sort_by(|a, b| a.rank_cmp(b));
    merged.truncate(top_k);
    merged
}

/// First `$TICKER` mention in `text` (1-5 capitals, optional `.X` class
/// suffix).
pub fn extract_cashtag(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' && (i == 0 || !bytes[i - 1].is_ascii_alphanumeric()) {
            let start = i + 1;
            let mut end = start;
            while end < bytes.len() && bytes[end].is_ascii_uppercase() && end - start < 5 {
                end += 1;
            }
            if end > start {
                // Optional share-class suffix such as BRK.B
                if end + 1 < bytes.len() && bytes[end] == b'.' && bytes[end + 1].is_ascii_uppercase() {
                    let mut suffix_end = end + 1;
                    while suffix_end < bytes.len() && bytes[suffix_end].is_ascii_uppercase() && suffix_end - end <= 2 {
                        suffix_end += 1;
                    }
                    if suffix_end >= bytes.len() || !bytes[suffix_end].is_ascii_alphanumeric() {
                        end = suffix_end;
                    }
                }
                if end >= bytes.len() || !bytes[end].is_ascii_alphanumeric() {
                    return Some(text[start..end].to_string());
                }
            }
            i = end.max(i + 1);
        } else {
            i += 1;
        }
    }
    None
}
