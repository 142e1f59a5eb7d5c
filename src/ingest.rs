//! Ingestion pipeline.
//!
//! Turns raw documents into committed records:
//!
//! ```text
//! RawDocument ─▶ normalize ─▶ duplicate check ─▶ embed ─▶ insert_if_absent
//!                                   │                            │
//!                                   └── Duplicate(existing id) ◀─┘ (lost race)
//! ```
//!
//! The duplicate check runs before embedding, so re-ingesting a known
//! document costs no model call. The final insert is atomic and resolves
//! concurrent ingestions of the same document to a single record.

use chrono::Utc;
use std::sync::Arc;

use crate::embedding::{embed_document, embed_documents, EmbeddingProvider};
use crate::error::{IndexError, IngestError};
use crate::index::VectorIndex;
use crate::models::{
    DocumentRecord, DuplicateKey, DuplicateRef, IngestOutcome, RawDocument, RecordMetadata,
    RecordSource,
};
use crate::normalize::{normalize, record_id};

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Excerpt length in characters.
    pub max_chars: usize,
    /// Texts per embedding request.
    pub batch_size: usize,
    /// Longest single embedding input; longer excerpts are chunked.
    pub max_input_chars: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_chars: 50_000,
            batch_size: 64,
            max_input_chars: usize::MAX,
        }
    }
}

/// Outcome of one document in a batch.
#[derive(Debug)]
pub struct DocOutcome {
    pub source_native_id: String,
    pub result: Result<IngestOutcome, IngestError>,
}

/// Per-document outcomes of [`IngestionPipeline::ingest_batch`], in input
/// order.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub outcomes: Vec<DocOutcome>,
}

impl BatchReport {
    pub fn inserted(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.result, Ok(IngestOutcome::Inserted(_))))
            .count()
    }

    pub fn duplicates(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.result, Ok(IngestOutcome::Duplicate(_))))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_err()).count()
    }

    /// Ids of every document that resolved to a record.
    pub fn record_ids(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok().map(IngestOutcome::id))
            .collect()
    }
}

/// A normalized document ready to be embedded.
struct Prepared {
    native_id: String,
    text: String,
    content_hash: String,
    metadata: RecordMetadata,
}

pub struct IngestionPipeline {
    index: Arc<VectorIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    settings: PipelineSettings,
}

impl IngestionPipeline {
    pub fn new(
        index: Arc<VectorIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            index,
            embedder,
            settings,
        }
    }

    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, IngestError> {
        Ok(embed_document(self.embedder.as_ref(), text, self.settings.max_input_chars).await?)
    }

    fn prepare(&self, raw: RawDocument) -> Result<Prepared, IngestError> {
        let native_id = raw.source_native_id.trim().to_string();
        if native_id.is_empty() {
            return Err(IngestError::MissingNativeId(truncate_for_log(&raw.text)));
        }
        let normalized = normalize(&raw.text, self.settings.max_chars);
        if normalized.text.is_empty() {
            return Err(IngestError::EmptyDocument(native_id));
        }
        Ok(Prepared {
            native_id,
            text: normalized.text,
            content_hash: normalized.content_hash,
            metadata: raw.metadata,
        })
    }

    fn build_record(
        &self,
        prepared: Prepared,
        source: RecordSource,
        revision: u32,
        embedding: Vec<f32>,
    ) -> DocumentRecord {
        DocumentRecord {
            id: record_id(source, &prepared.native_id, revision),
            source,
            source_native_id: prepared.native_id,
            revision,
            text: prepared.text,
            embedding,
            content_hash: prepared.content_hash,
            model: self.embedder.model_name().to_string(),
            metadata: prepared.metadata,
            ingested_at: Utc::now(),
            superseded_by: None,
        }
    }

    async fn commit(
        &self,
        prepared: Prepared,
        source: RecordSource,
        embedding: Vec<f32>,
    ) -> Result<IngestOutcome, IngestError> {
        let record = self.build_record(prepared, source, 0, embedding);
        Ok(self.index.insert_if_absent(record).await?)
    }

    /// Ingest one document. Idempotent: a document whose native id or
    /// normalized text is already indexed resolves to the existing record.
    pub async fn ingest(
        &self,
        raw: RawDocument,
        source: RecordSource,
    ) -> Result<IngestOutcome, IngestError> {
        let prepared = self.prepare(raw)?;

        if let Some(dup) = self
            .index
            .find_duplicate(&prepared.native_id, &prepared.content_hash)
            .await?
        {
            tracing::debug!(native_id = %prepared.native_id, existing = %dup.id, "duplicate document");
            return Ok(IngestOutcome::Duplicate(dup));
        }

        let embedding = self.embed(&prepared.text).await?;
        self.commit(prepared, source, embedding).await
    }

    /// Ingest many documents, embedding in batches of `batch_size`.
    ///
    /// A failed batch request falls back to embedding its documents one at a
    /// time, so an embedding failure only fails the documents it affects.
    pub async fn ingest_batch(&self, docs: Vec<RawDocument>, source: RecordSource) -> BatchReport {
        let total = docs.len();
        let mut results: Vec<Option<DocOutcome>> = (0..total).map(|_| None).collect();
        let mut pending: Vec<(usize, Prepared)> = Vec::new();

        for (i, raw) in docs.into_iter().enumerate() {
            let native_id = raw.source_native_id.clone();
            let result = match self.prepare(raw) {
                Ok(prepared) => match self
                    .index
                    .find_duplicate(&prepared.native_id, &prepared.content_hash)
                    .await
                {
                    Ok(Some(dup)) => Ok(IngestOutcome::Duplicate(dup)),
                    Ok(None) => {
                        pending.push((i, prepared));
                        continue;
                    }
                    Err(e) => Err(e.into()),
                },
                Err(e) => Err(e),
            };
            results[i] = Some(DocOutcome {
                source_native_id: native_id,
                result,
            });
        }

        let batch_size = self.settings.batch_size.max(1);
        let mut pending = pending.into_iter().peekable();
        while pending.peek().is_some() {
            let batch: Vec<(usize, Prepared)> = pending.by_ref().take(batch_size).collect();
            let texts: Vec<String> = batch.iter().map(|(_, p)| p.text.clone()).collect();

            match embed_documents(
                self.embedder.as_ref(),
                &texts,
                self.settings.max_input_chars,
                batch_size,
            )
            .await
            {
                Ok(vectors) if vectors.len() == batch.len() => {
                    for ((i, prepared), vector) in batch.into_iter().zip(vectors) {
                        let native_id = prepared.native_id.clone();
                        let result = self.commit(prepared, source, vector).await;
                        results[i] = Some(DocOutcome {
                            source_native_id: native_id,
                            result,
                        });
                    }
                }
                batch_result => {
                    if let Err(e) = batch_result {
                        tracing::warn!(size = batch.len(), error = %e, "batch embedding failed, retrying per document");
                    }
                    for (i, prepared) in batch {
                        let native_id = prepared.native_id.clone();
                        let result = match self.embed(&prepared.text).await {
                            Ok(vector) => self.commit(prepared, source, vector).await,
                            Err(e) => Err(e.into()),
                        };
                        results[i] = Some(DocOutcome {
                            source_native_id: native_id,
                            result,
                        });
                    }
                }
            }
        }

        let report = BatchReport {
            outcomes: results.into_iter().flatten().collect(),
        };
        tracing::info!(
            source = %source,
            total,
            inserted = report.inserted(),
            duplicates = report.duplicates(),
            failed = report.failed(),
            "batch ingested"
        );
        report
    }

    /// Insert `raw` as the next revision of `existing_id` and mark the old
    /// record superseded. The new revision keeps the source and native id of
    /// the record it replaces.
    pub async fn revise(
        &self,
        existing_id: &str,
        raw: RawDocument,
    ) -> Result<IngestOutcome, IngestError> {
        let existing = self
            .index
            .get(existing_id)
            .await?
            .ok_or_else(|| IndexError::NotFound(existing_id.to_string()))?;
        if existing.superseded_by.is_some() {
            return Err(IndexError::AlreadySuperseded(existing_id.to_string()).into());
        }

        let mut prepared = self.prepare(raw)?;
        if prepared.content_hash == existing.content_hash {
            return Ok(IngestOutcome::Duplicate(DuplicateRef {
                id: existing.id,
                source: existing.source,
                matched_on: DuplicateKey::ContentHash,
            }));
        }
        prepared.native_id = existing.source_native_id.clone();

        let embedding = self.embed(&prepared.text).await?;
        let record = self.build_record(prepared, existing.source, existing.revision + 1, embedding);
        Ok(self.index.supersede(existing_id, record).await?)
    }
}

fn truncate_for_log(text: &str) -> String {
    crate::normalize::truncate_chars(text.trim(), 40).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashProvider;
    use crate::migrate::migrate;
    use tempfile::TempDir;

    async fn pipeline(tmp: &TempDir) -> IngestionPipeline {
        let pool = crate::db::connect_path(&tmp.path().join("t.sqlite")).await.unwrap();
        migrate(&pool).await.unwrap();
        let index = VectorIndex::open(pool, "hash-64", 64, 1000).await.unwrap();
        IngestionPipeline::new(
            Arc::new(index),
            Arc::new(HashProvider::new("hash-64", 64)),
            PipelineSettings::default(),
        )
    }

    fn raw(native_id: &str, text: &str) -> RawDocument {
        RawDocument {
            source_native_id: native_id.into(),
            text: text.into(),
            metadata: RecordMetadata::default(),
        }
    }

    #[tokio::test]
    async fn test_ingest_twice_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let p = pipeline(&tmp).await;

        let first = p
            .ingest(raw("a.txt", "Exclusivity clause governs distribution."), RecordSource::Historical)
            .await
            .unwrap();
        let second = p
            .ingest(raw("b.txt", "<p>exclusivity CLAUSE governs distribution</p>"), RecordSource::Live)
            .await
            .unwrap();

        assert!(!first.is_duplicate());
        match second {
            IngestOutcome::Duplicate(d) => {
                assert_eq!(d.id, first.id());
                assert_eq!(d.source, RecordSource::Historical);
                assert_eq!(d.matched_on, DuplicateKey::ContentHash);
            }
            other => panic!("expected duplicate, got {:?}", other),
        }
        assert_eq!(p.index().active_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_empty_and_anonymous_documents_rejected() {
        let tmp = TempDir::new().unwrap();
        let p = pipeline(&tmp).await;

        let err = p
            .ingest(raw("x.htm", "<script>only()</script>"), RecordSource::Historical)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_DOCUMENT");

        let err = p
            .ingest(raw("  ", "some text"), RecordSource::Historical)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::MissingNativeId(_)));
    }

    #[tokio::test]
    async fn test_batch_reports_each_document() {
        let tmp = TempDir::new().unwrap();
        let p = pipeline(&tmp).await;

        let report = p
            .ingest_batch(
                vec![
                    raw("1.txt", "Lease of the premises at 10 Main Street."),
                    raw("2.txt", ""),
                    raw("3.txt", "Consulting services agreement with fees."),
                    raw("1.txt", "Lease of the premises at 10 Main Street, revised."),
                ],
                RecordSource::Historical,
            )
            .await;

        assert_eq!(report.outcomes.len(), 4);
        assert_eq!(report.inserted(), 2);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.duplicates(), 1);
        assert_eq!(report.outcomes[1].source_native_id, "2.txt");
    }

    #[tokio::test]
    async fn test_revise_supersedes_old_record() {
        let tmp = TempDir::new().unwrap();
        let p = pipeline(&tmp).await;

        let first = p
            .ingest(raw("lease.txt", "Rent is 100 dollars per month."), RecordSource::Historical)
            .await
            .unwrap();
        let old_id = first.id().to_string();

        let revised = p
            .revise(&old_id, raw("ignored", "Rent is 120 dollars per month."))
            .await
            .unwrap();
        let new_id = revised.id().to_string();
        assert_ne!(new_id, old_id);

        let old = p.index().get(&old_id).await.unwrap().unwrap();
        assert_eq!(old.superseded_by.as_deref(), Some(new_id.as_str()));
        let new = p.index().get(&new_id).await.unwrap().unwrap();
        assert_eq!(new.revision, 1);
        assert_eq!(new.source_native_id, "lease.txt");
        assert_eq!(p.index().active_count().unwrap(), 1);

        let err = p
            .revise(&old_id, raw("x", "Rent is 130 dollars per month."))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ALREADY_SUPERSEDED");
    }

    /// Hash embedder that lies about its output size or model.
    struct SkewedProvider {
        inner: HashProvider,
        model: &'static str,
        emit_dims: usize,
    }

    #[async_trait::async_trait]
    impl EmbeddingProvider for SkewedProvider {
        fn model_name(&self) -> &str {
            self.model
        }
        fn dims(&self) -> usize {
            64
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, crate::error::EmbedError> {
            let mut vectors = self.inner.embed(texts).await?;
            vectors.iter_mut().for_each(|v| v.truncate(self.emit_dims));
            Ok(vectors)
        }
    }

    async fn skewed_pipeline(tmp: &TempDir, model: &'static str, emit_dims: usize) -> IngestionPipeline {
        let pool = crate::db::connect_path(&tmp.path().join("t.sqlite")).await.unwrap();
        migrate(&pool).await.unwrap();
        let index = VectorIndex::open(pool, "hash-64", 64, 1000).await.unwrap();
        IngestionPipeline::new(
            Arc::new(index),
            Arc::new(SkewedProvider {
                inner: HashProvider::new("hash-64", 64),
                model,
                emit_dims,
            }),
            PipelineSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_ingest_rejects_wrong_dimension_embedding() {
        let tmp = TempDir::new().unwrap();
        let p = skewed_pipeline(&tmp, "hash-64", 63).await;

        let err = p
            .ingest(raw("a.txt", "Indemnification obligations survive termination."), RecordSource::Historical)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INCOMPATIBLE_EMBEDDING");
        assert_eq!(p.index().active_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ingest_rejects_other_model_embedding() {
        let tmp = TempDir::new().unwrap();
        let p = skewed_pipeline(&tmp, "hash-64-v2", 64).await;

        let report = p
            .ingest_batch(
                vec![raw("a.txt", "Indemnification obligations survive termination.")],
                RecordSource::Historical,
            )
            .await;
        assert_eq!(report.failed(), 1);
        let err = report.outcomes[0].result.as_ref().unwrap_err();
        assert_eq!(err.code(), "INCOMPATIBLE_EMBEDDING");
    }

    #[tokio::test]
    async fn test_ingested_at_is_non_decreasing() {
        let tmp = TempDir::new().unwrap();
        let p = pipeline(&tmp).await;

        let mut previous = None;
        for i in 0..8 {
            let outcome = p
                .ingest(
                    raw(&format!("{}.txt", i), &format!("Supply agreement number {} for widgets.", i)),
                    RecordSource::Historical,
                )
                .await
                .unwrap();
            let record = p.index().get(outcome.id()).await.unwrap().unwrap();
            if let Some(prev) = previous {
                assert!(record.ingested_at >= prev);
            }
            previous = Some(record.ingested_at);
        }
    }

    /// Counts embedding inputs and their longest length.
    struct RecordingProvider {
        inner: HashProvider,
        inputs: std::sync::Mutex<Vec<usize>>,
    }

    #[async_trait::async_trait]
    impl EmbeddingProvider for RecordingProvider {
        fn model_name(&self) -> &str {
            self.inner.model_name()
        }
        fn dims(&self) -> usize {
            self.inner.dims()
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, crate::error::EmbedError> {
            self.inputs
                .lock()
                .unwrap()
                .extend(texts.iter().map(|t| t.chars().count()));
            self.inner.embed(texts).await
        }
    }

    #[tokio::test]
    async fn test_long_document_embedded_in_chunks() {
        let tmp = TempDir::new().unwrap();
        let pool = crate::db::connect_path(&tmp.path().join("t.sqlite")).await.unwrap();
        migrate(&pool).await.unwrap();
        let index = Arc::new(VectorIndex::open(pool, "hash-64", 64, 1000).await.unwrap());
        let provider = Arc::new(RecordingProvider {
            inner: HashProvider::new("hash-64", 64),
            inputs: std::sync::Mutex::new(Vec::new()),
        });
        let p = IngestionPipeline::new(
            index,
            provider.clone(),
            PipelineSettings {
                max_input_chars: 200,
                ..Default::default()
            },
        );

        let text = "The licensee shall pay royalties quarterly on net sales. ".repeat(40);
        let outcome = p.ingest(raw("license.txt", &text), RecordSource::Historical).await.unwrap();

        let inputs = provider.inputs.lock().unwrap().clone();
        assert!(inputs.len() > 1);
        assert!(inputs.iter().all(|n| *n <= 200));

        // Full text is kept on the record
        let record = p.index().get(outcome.id()).await.unwrap().unwrap();
        assert!(record.text.chars().count() > 2000);
        let norm: f32 = record.embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }
}
