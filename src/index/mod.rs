//! Durable vector index.
//!
//! [`VectorIndex`] pairs a SQLite table of records (the source of truth)
//! with an in-memory HNSW graph over the vectors of active records:
//!
//! ```text
//!  insert_if_absent ──▶ SQLite INSERT OR IGNORE ──commit──▶ graph.insert (write lock)
//!  search           ──▶ graph.search (read lock, filters during collection)
//!  open             ──▶ stream active rows ──▶ rebuild graph
//! ```
//!
//! Duplicate resolution happens inside SQLite: the `id` column is unique and
//! partial unique indexes cover the active native id and the active content
//! hash. Two racing inserts of the same document therefore produce exactly
//! one row; the loser reads back the winner's id.
//!
//! The stored model name and dimensionality are checked when the index is
//! opened. A mismatch, or any row whose vector or metadata cannot be decoded,
//! is reported as [`IndexError::Corrupt`].

mod ann;
mod store;

use futures::TryStreamExt;
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::embedding::cosine_similarity;
use crate::error::IndexError;
use crate::models::{
    DocumentRecord, DuplicateRef, IngestOutcome, RankedResult, RecordSource, SearchFilters,
};
use ann::AnnGraph;

/// Model identifier used when no embedding provider is configured. An index
/// opened with it can be read but not searched or written.
pub const NO_MODEL: &str = "disabled";

/// Record counts and index parameters.
#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub model: String,
    pub dims: usize,
    pub total_records: i64,
    pub active_records: i64,
    pub superseded_records: i64,
    pub historical_records: i64,
    pub live_records: i64,
    pub graph_nodes: usize,
    pub last_ingested_at: Option<chrono::DateTime<chrono::Utc>>,
}

pub struct VectorIndex {
    pool: SqlitePool,
    model: String,
    dims: usize,
    exact_scan_threshold: usize,
    graph: RwLock<AnnGraph>,
}

impl VectorIndex {
    /// Open the index stored in `pool`, validating the persisted model and
    /// dimensionality and rebuilding the graph from active rows.
    ///
    /// The schema must already exist (see [`crate::migrate::migrate`]).
    pub async fn open(
        pool: SqlitePool,
        model: &str,
        dims: usize,
        exact_scan_threshold: usize,
    ) -> Result<Self, IndexError> {
        let index = Self {
            pool,
            model: model.to_string(),
            dims,
            exact_scan_threshold,
            graph: RwLock::new(AnnGraph::new(exact_scan_threshold)),
        };

        if model == NO_MODEL || dims == 0 {
            tracing::debug!("no embedding model configured, graph not loaded");
            return Ok(index);
        }

        match store::read_meta(&index.pool).await? {
            Some((stored_model, stored_dims)) => {
                if stored_model != model || stored_dims != dims {
                    return Err(IndexError::Corrupt(format!(
                        "index was built with model '{}' ({} dims), configured model is '{}' ({} dims)",
                        stored_model, stored_dims, model, dims
                    )));
                }
            }
            None => store::write_meta(&index.pool, model, dims).await?,
        }

        index.load_graph().await?;
        Ok(index)
    }

    async fn load_graph(&self) -> Result<(), IndexError> {
        let sql = format!(
            "SELECT {} FROM records WHERE superseded_by IS NULL ORDER BY seq",
            store::RECORD_COLUMNS
        );
        let mut rows = sqlx::query(&sql).fetch(&self.pool);
        let mut graph = AnnGraph::new(self.exact_scan_threshold);
        let mut loaded = 0usize;

        while let Some(row) = rows.try_next().await? {
            let record = store::row_to_record(&row)?;
            if record.embedding.len() != self.dims || record.model != self.model {
                return Err(IndexError::Corrupt(format!(
                    "record {} was embedded with '{}' ({} dims)",
                    record.id,
                    record.model,
                    record.embedding.len()
                )));
            }
            graph.insert(
                &record.id,
                record.source,
                record.metadata,
                record.ingested_at,
                record.embedding,
            );
            loaded += 1;
        }

        *self.write_graph()? = graph;
        tracing::info!(records = loaded, model = %self.model, dims = self.dims, "vector index loaded");
        Ok(())
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn read_graph(&self) -> Result<RwLockReadGuard<'_, AnnGraph>, IndexError> {
        self.graph.read().map_err(|_| IndexError::Poisoned)
    }

    fn write_graph(&self) -> Result<RwLockWriteGuard<'_, AnnGraph>, IndexError> {
        self.graph.write().map_err(|_| IndexError::Poisoned)
    }

    /// Reject vectors from another model or of another dimensionality.
    pub fn check_vector(&self, model: &str, vector: &[f32]) -> Result<(), IndexError> {
        if vector.len() != self.dims || self.dims == 0 {
            return Err(IndexError::DimensionMismatch {
                expected: self.dims,
                actual: vector.len(),
            });
        }
        if model != self.model {
            return Err(IndexError::ModelMismatch {
                expected: self.model.clone(),
                actual: model.to_string(),
            });
        }
        Ok(())
    }

    /// Atomically insert `record` unless a duplicate exists.
    ///
    /// On success the returned record carries the assigned `ingested_at` and
    /// is already visible to searches. Otherwise the outcome references the
    /// existing record.
    pub async fn insert_if_absent(&self, mut record: DocumentRecord) -> Result<IngestOutcome, IndexError> {
        self.check_vector(&record.model, &record.embedding)?;

        let mut conn = self.pool.acquire().await?;
        match store::insert_if_absent(&mut conn, &record).await? {
            Some(ingested_at) => {
                record.ingested_at = ingested_at;
                self.write_graph()?.insert(
                    &record.id,
                    record.source,
                    record.metadata.clone(),
                    ingested_at,
                    record.embedding.clone(),
                );
                tracing::debug!(id = %record.id, source = %record.source, "record inserted");
                Ok(IngestOutcome::Inserted(Box::new(record)))
            }
            None => {
                let dup = self.resolve_conflict(&record).await?;
                tracing::debug!(id = %dup.id, matched_on = ?dup.matched_on, "insert resolved to existing record");
                Ok(IngestOutcome::Duplicate(dup))
            }
        }
    }

    async fn resolve_conflict(&self, record: &DocumentRecord) -> Result<DuplicateRef, IndexError> {
        store::find_duplicate(
            &self.pool,
            Some(&record.id),
            &record.source_native_id,
            &record.content_hash,
        )
        .await?
        .ok_or_else(|| {
            IndexError::Corrupt(format!(
                "insert of {} was ignored but no conflicting record exists",
                record.id
            ))
        })
    }

    /// Active record with the same native id, or else the same content hash.
    pub async fn find_duplicate(
        &self,
        native_id: &str,
        content_hash: &str,
    ) -> Result<Option<DuplicateRef>, IndexError> {
        store::find_duplicate(&self.pool, None, native_id, content_hash).await
    }

    /// Insert `record` as the next revision of `old_id` and mark `old_id`
    /// superseded, in one transaction.
    pub async fn supersede(&self, old_id: &str, mut record: DocumentRecord) -> Result<IngestOutcome, IndexError> {
        self.check_vector(&record.model, &record.embedding)?;

        let mut tx = self.pool.begin().await?;

        let current: Option<(Option<String>,)> =
            sqlx::query_as("SELECT superseded_by FROM records WHERE id = ?")
                .bind(old_id)
                .fetch_optional(&mut *tx)
                .await?;
        match current {
            None => return Err(IndexError::NotFound(old_id.to_string())),
            Some((Some(_),)) => return Err(IndexError::AlreadySuperseded(old_id.to_string())),
            Some((None,)) => {}
        }

        sqlx::query("UPDATE records SET superseded_by = ? WHERE id = ? AND superseded_by IS NULL")
            .bind(&record.id)
            .bind(old_id)
            .execute(&mut *tx)
            .await?;

        match store::insert_if_absent(&mut tx, &record).await? {
            Some(ingested_at) => {
                tx.commit().await?;
                record.ingested_at = ingested_at;
                let mut graph = self.write_graph()?;
                graph.mark_superseded(old_id);
                graph.insert(
                    &record.id,
                    record.source,
                    record.metadata.clone(),
                    ingested_at,
                    record.embedding.clone(),
                );
                tracing::info!(old = old_id, new = %record.id, revision = record.revision, "record superseded");
                Ok(IngestOutcome::Inserted(Box::new(record)))
            }
            None => {
                tx.rollback().await?;
                let dup = self.resolve_conflict(&record).await?;
                Ok(IngestOutcome::Duplicate(dup))
            }
        }
    }

    /// Full record by id, including superseded revisions.
    pub async fn get(&self, id: &str) -> Result<Option<DocumentRecord>, IndexError> {
        store::fetch_record(&self.pool, id).await
    }

    /// Top `k` active records passing `filters`.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<RankedResult>, IndexError> {
        if query.len() != self.dims {
            return Err(IndexError::DimensionMismatch {
                expected: self.dims,
                actual: query.len(),
            });
        }
        Ok(self.read_graph()?.search(query, k, filters))
    }

    /// Score an active record against `query`. `None` when the record is
    /// unknown or superseded.
    pub fn ranked(&self, id: &str, query: &[f32]) -> Result<Option<RankedResult>, IndexError> {
        if query.len() != self.dims {
            return Err(IndexError::DimensionMismatch {
                expected: self.dims,
                actual: query.len(),
            });
        }
        Ok(self.read_graph()?.ranked(id, query))
    }

    /// Score an active record against `query`, reading it from SQLite when
    /// it is committed but not yet linked into the graph by a concurrent
    /// insert.
    pub async fn ranked_or_stored(
        &self,
        id: &str,
        query: &[f32],
    ) -> Result<Option<RankedResult>, IndexError> {
        if let Some(hit) = self.ranked(id, query)? {
            return Ok(Some(hit));
        }
        let Some(record) = self.get(id).await? else {
            return Ok(None);
        };
        if record.superseded_by.is_some() {
            return Ok(None);
        }
        tracing::debug!(id, "record not yet in graph, scoring stored vector");
        Ok(Some(RankedResult {
            score: cosine_similarity(query, &record.embedding).clamp(0.0, 1.0),
            id: record.id,
            source: record.source,
            ingested_at: record.ingested_at,
            metadata: record.metadata,
        }))
    }

    pub fn is_indexed(&self, id: &str) -> Result<bool, IndexError> {
        Ok(self.read_graph()?.contains(id))
    }

    /// Whether any active record names this entity or ticker.
    pub fn knows_entity(&self, name: &str) -> Result<bool, IndexError> {
        Ok(self.read_graph()?.knows_entity(name))
    }

    /// Number of active (searchable) records.
    pub fn active_count(&self) -> Result<usize, IndexError> {
        Ok(self.read_graph()?.active_len())
    }

    pub async fn stats(&self) -> Result<IndexStats, IndexError> {
        let (total, active, historical, live, last): (i64, i64, i64, i64, Option<i64>) =
            sqlx::query_as(
                r#"
                SELECT COUNT(*),
                       COALESCE(SUM(superseded_by IS NULL), 0),
                       COALESCE(SUM(superseded_by IS NULL AND source = ?), 0),
                       COALESCE(SUM(superseded_by IS NULL AND source = ?), 0),
                       MAX(ingested_at)
                FROM records
                "#,
            )
            .bind(RecordSource::Historical.as_str())
            .bind(RecordSource::Live.as_str())
            .fetch_one(&self.pool)
            .await?;

        Ok(IndexStats {
            model: self.model.clone(),
            dims: self.dims,
            total_records: total,
            active_records: active,
            superseded_records: total - active,
            historical_records: historical,
            live_records: live,
            graph_nodes: self.read_graph()?.len(),
            last_ingested_at: last.map(store::millis_to_datetime).transpose()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::migrate;
    use crate::models::RecordMetadata;
    use chrono::Utc;
    use tempfile::TempDir;

    async fn open_index(tmp: &TempDir) -> VectorIndex {
        let pool = crate::db::connect_path(&tmp.path().join("idx.sqlite")).await.unwrap();
        migrate(&pool).await.unwrap();
        VectorIndex::open(pool, "unit-4", 4, 1000).await.unwrap()
    }

    fn record(id: &str, embedding: Vec<f32>) -> DocumentRecord {
        DocumentRecord {
            id: id.into(),
            source: RecordSource::Live,
            source_native_id: format!("https://example.test/{}", id),
            revision: 0,
            text: format!("text of {}", id),
            embedding,
            content_hash: format!("hash-{}", id),
            model: "unit-4".into(),
            metadata: RecordMetadata::default(),
            ingested_at: Utc::now(),
            superseded_by: None,
        }
    }

    #[tokio::test]
    async fn test_ingested_at_never_decreases_after_clock_skew() {
        let tmp = TempDir::new().unwrap();
        let index = open_index(&tmp).await;

        index.insert_if_absent(record("a", vec![1.0, 0.0, 0.0, 0.0])).await.unwrap();
        // A stored timestamp an hour ahead of the local clock
        sqlx::query("UPDATE records SET ingested_at = ingested_at + 3600000 WHERE id = 'a'")
            .execute(&index.pool)
            .await
            .unwrap();
        let ahead = index.get("a").await.unwrap().unwrap().ingested_at;

        let b = index.insert_if_absent(record("b", vec![0.0, 1.0, 0.0, 0.0])).await.unwrap();
        let IngestOutcome::Inserted(b) = b else {
            panic!("expected insert");
        };
        assert!(b.ingested_at >= ahead);
        assert_eq!(index.get("b").await.unwrap().unwrap().ingested_at, b.ingested_at);
    }

    #[tokio::test]
    async fn test_committed_record_scored_before_graph_link() {
        let tmp = TempDir::new().unwrap();
        let index = open_index(&tmp).await;

        // Row committed by another writer that has not reached the graph yet
        let pending = record("pending", vec![1.0, 0.0, 0.0, 0.0]);
        let mut conn = index.pool.acquire().await.unwrap();
        store::insert_if_absent(&mut conn, &pending).await.unwrap().unwrap();
        drop(conn);

        let query = [1.0, 0.0, 0.0, 0.0];
        assert!(index.ranked("pending", &query).unwrap().is_none());
        let hit = index.ranked_or_stored("pending", &query).await.unwrap().unwrap();
        assert_eq!(hit.id, "pending");
        assert!((hit.score - 1.0).abs() < 1e-6);
        assert_eq!(hit.source, RecordSource::Live);

        assert!(index.ranked_or_stored("missing", &query).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insert_rejects_incompatible_vectors() {
        let tmp = TempDir::new().unwrap();
        let index = open_index(&tmp).await;

        let err = index
            .insert_if_absent(record("short", vec![1.0, 0.0, 0.0]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INCOMPATIBLE_EMBEDDING");

        let mut foreign = record("foreign", vec![1.0, 0.0, 0.0, 0.0]);
        foreign.model = "other-model".into();
        let err = index.insert_if_absent(foreign).await.unwrap_err();
        assert!(matches!(err, IndexError::ModelMismatch { .. }));
        assert_eq!(index.stats().await.unwrap().total_records, 0);
    }
}
