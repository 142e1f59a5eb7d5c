//! Composition root.
//!
//! [`Docket`] wires the configured database, embedding provider, vector
//! index, ingestion pipeline, live fetcher, result cache and query engine
//! together. The CLI and the HTTP server both go through it.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CacheStats, ResultCache};
use crate::config::Config;
use crate::corpus::open_corpus;
use crate::db;
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::error::{IndexError, QueryError};
use crate::index::{IndexStats, VectorIndex};
use crate::ingest::{BatchReport, IngestionPipeline, PipelineSettings};
use crate::live::{create_fetcher, LiveFetcher};
use crate::migrate;
use crate::models::{DocumentRecord, FetchCriteria, QueryRequest, QueryResponse, RecordSource};
use crate::query::{EngineSettings, HybridQueryEngine};

/// Counts accumulated over a corpus or live ingestion run.
#[derive(Debug, Default, Clone, Serialize)]
pub struct IngestSummary {
    pub discovered: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub failed: usize,
    pub skipped_short: usize,
    pub unreadable: usize,
}

impl IngestSummary {
    fn absorb(&mut self, report: &BatchReport) {
        self.inserted += report.inserted();
        self.duplicates += report.duplicates();
        self.failed += report.failed();
        for outcome in report.outcomes.iter() {
            if let Err(e) = &outcome.result {
                tracing::warn!(
                    native_id = %outcome.source_native_id,
                    code = e.code(),
                    error = %e,
                    "document not ingested"
                );
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DocketStats {
    pub index: IndexStats,
    pub cache: CacheStats,
    pub cache_enabled: bool,
}

pub struct Docket {
    config: Arc<Config>,
    index: Arc<VectorIndex>,
    pipeline: Arc<IngestionPipeline>,
    fetcher: Arc<dyn LiveFetcher>,
    engine: Arc<HybridQueryEngine>,
}

impl Docket {
    /// Open with the providers named in `config`.
    pub async fn open(config: Config) -> Result<Self> {
        let embedder = create_provider(&config.embedding)?;
        let fetcher: Arc<dyn LiveFetcher> = Arc::from(create_fetcher(&config.live)?);
        Self::with_components(config, embedder, fetcher).await
    }

    /// Open with caller-supplied providers.
    pub async fn with_components(
        config: Config,
        embedder: Arc<dyn EmbeddingProvider>,
        fetcher: Arc<dyn LiveFetcher>,
    ) -> Result<Self> {
        let pool = db::connect(&config).await?;
        migrate::migrate(&pool).await?;

        let index = VectorIndex::open(
            pool,
            embedder.model_name(),
            embedder.dims(),
            config.retrieval.exact_scan_threshold,
        )
        .await
        .with_context(|| format!("Failed to open index at {}", config.db.path.display()))?;
        let index = Arc::new(index);

        let pipeline = Arc::new(IngestionPipeline::new(
            index.clone(),
            embedder.clone(),
            PipelineSettings {
                max_chars: config.corpus.max_chars,
                batch_size: config.embedding.batch_size,
                max_input_chars: config.embedding.input_limit(),
            },
        ));

        let cache = Arc::new(ResultCache::from_config(&config.cache));
        let settings = EngineSettings {
            k_corpus: config.retrieval.k_corpus,
            default_top_k: config.retrieval.default_top_k,
            max_top_k: config.retrieval.max_top_k,
            live_timeout: Duration::from_secs(config.retrieval.live_timeout_secs),
            coverage_end: config.corpus.coverage_end,
            max_input_chars: config.embedding.input_limit(),
        };
        let engine = Arc::new(HybridQueryEngine::new(
            index.clone(),
            embedder,
            pipeline.clone(),
            fetcher.clone(),
            cache,
            settings,
        ));

        Ok(Self {
            config: Arc::new(config),
            index,
            pipeline,
            fetcher,
            engine,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    pub fn pipeline(&self) -> &Arc<IngestionPipeline> {
        &self.pipeline
    }

    pub fn engine(&self) -> &Arc<HybridQueryEngine> {
        &self.engine
    }

    /// Ingest the historical corpus, optionally from another root and
    /// stopping after `limit` loaded documents.
    pub async fn ingest_corpus(
        &self,
        root_override: Option<&Path>,
        limit: Option<usize>,
    ) -> Result<IngestSummary> {
        let mut loader = open_corpus(&self.config.corpus, root_override)?;
        let chunk_size = self.config.embedding.batch_size.max(1);
        let mut remaining = limit.unwrap_or(usize::MAX);
        let mut summary = IngestSummary::default();

        while remaining > 0 {
            let chunk: Vec<_> = loader.by_ref().take(chunk_size.min(remaining)).collect();
            if chunk.is_empty() {
                break;
            }
            remaining -= chunk.len();
            let report = self
                .pipeline
                .ingest_batch(chunk, RecordSource::Historical)
                .await;
            summary.absorb(&report);
            tracing::info!(
                inserted = summary.inserted,
                duplicates = summary.duplicates,
                failed = summary.failed,
                "corpus batch committed"
            );
        }

        summary.discovered = loader.discovered();
        summary.skipped_short = loader.skipped_short();
        summary.unreadable = loader.unreadable();
        self.invalidate_cache_after(&summary);
        Ok(summary)
    }

    /// Pull documents from the live source and ingest them as live records.
    pub async fn fetch_live(&self, criteria: &FetchCriteria) -> Result<IngestSummary> {
        let docs = self
            .fetcher
            .fetch(criteria)
            .await
            .with_context(|| format!("Live fetch via {} failed", self.fetcher.name()))?;

        let mut summary = IngestSummary {
            discovered: docs.len(),
            ..Default::default()
        };
        if !docs.is_empty() {
            let report = self.pipeline.ingest_batch(docs, RecordSource::Live).await;
            summary.absorb(&report);
        }
        self.invalidate_cache_after(&summary);
        Ok(summary)
    }

    /// Cached result sets predate records inserted by an explicit run.
    fn invalidate_cache_after(&self, summary: &IngestSummary) {
        if summary.inserted > 0 {
            self.engine.cache().clear();
        }
    }

    pub async fn query(&self, req: &QueryRequest) -> Result<QueryResponse, QueryError> {
        self.engine.query(req).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<DocumentRecord>, IndexError> {
        self.index.get(id).await
    }

    pub async fn stats(&self) -> Result<DocketStats, IndexError> {
        let cache = self.engine.cache();
        Ok(DocketStats {
            index: self.index.stats().await?,
            cache: cache.stats(),
            cache_enabled: cache.is_enabled(),
        })
    }
}
