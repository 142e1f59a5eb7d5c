//! SQLite persistence for records and index metadata.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool};

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::IndexError;
use crate::models::{DocumentRecord, DuplicateKey, DuplicateRef, RecordMetadata, RecordSource};

pub(crate) const RECORD_COLUMNS: &str = "id, source, source_native_id, revision, content_hash, \
     text, embedding, model, dims, metadata_json, ingested_at, superseded_by";

/// Stored `(model, dims)` pair, if the index has been initialized.
pub(crate) async fn read_meta(pool: &SqlitePool) -> Result<Option<(String, usize)>, IndexError> {
    let rows: Vec<(String, String)> =
        sqlx::query_as("SELECT key, value FROM index_meta WHERE key IN ('model', 'dims')")
            .fetch_all(pool)
            .await?;

    let mut model = None;
    let mut dims = None;
    for (key, value) in rows {
        match key.as_str() {
            "model" => model = Some(value),
            "dims" => {
                dims = Some(value.parse::<usize>().map_err(|_| {
                    IndexError::Corrupt(format!("index_meta dims is not a number: '{}'", value))
                })?)
            }
            _ => {}
        }
    }

    match (model, dims) {
        (Some(m), Some(d)) => Ok(Some((m, d))),
        (None, None) => Ok(None),
        _ => Err(IndexError::Corrupt(
            "index_meta holds only one of model/dims".into(),
        )),
    }
}

pub(crate) async fn write_meta(pool: &SqlitePool, model: &str, dims: usize) -> Result<(), IndexError> {
    let mut tx = pool.begin().await?;
    for (key, value) in [("model", model.to_string()), ("dims", dims.to_string())] {
        sqlx::query("INSERT OR IGNORE INTO index_meta (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Insert unless a record with the same id, active native id or active
/// content hash exists. Returns the assigned `ingested_at` on success.
///
/// `ingested_at` is `max(now, latest stored)`, computed inside the insert
/// statement so it never decreases across the table.
pub(crate) async fn insert_if_absent(
    conn: &mut SqliteConnection,
    record: &DocumentRecord,
) -> Result<Option<DateTime<Utc>>, IndexError> {
    let metadata_json = serde_json::to_string(&record.metadata)
        .map_err(|e| IndexError::Corrupt(format!("metadata not serializable: {}", e)))?;

    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        INSERT OR IGNORE INTO records
            (id, source, source_native_id, revision, content_hash, text,
             embedding, model, dims, metadata_json, ingested_at)
        SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?, ?,
               MAX(?, COALESCE((SELECT MAX(ingested_at) FROM records), 0))
        RETURNING ingested_at
        "#,
    )
    .bind(&record.id)
    .bind(record.source.as_str())
    .bind(&record.source_native_id)
    .bind(record.revision as i64)
    .bind(&record.content_hash)
    .bind(&record.text)
    .bind(vec_to_blob(&record.embedding))
    .bind(&record.model)
    .bind(record.embedding.len() as i64)
    .bind(metadata_json)
    .bind(Utc::now().timestamp_millis())
    .fetch_optional(&mut *conn)
    .await?;

    match row {
        Some((ms,)) => Ok(Some(millis_to_datetime(ms)?)),
        None => Ok(None),
    }
}

/// Active record sharing the native id (preferred) or the content hash,
/// falling back to any record with the same id.
pub(crate) async fn find_duplicate<'e, E>(
    executor: E,
    id: Option<&str>,
    native_id: &str,
    content_hash: &str,
) -> Result<Option<DuplicateRef>, IndexError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let row: Option<(String, String, i64, i64)> = sqlx::query_as(
        r#"
        SELECT id, source,
               superseded_by IS NULL AND source_native_id = ?2 AS native_match,
               superseded_by IS NULL AND content_hash = ?3 AS hash_match
        FROM records
        WHERE (superseded_by IS NULL AND (source_native_id = ?2 OR content_hash = ?3))
           OR id = ?1
        ORDER BY native_match DESC, hash_match DESC, seq ASC
        LIMIT 1
        "#,
    )
    .bind(id.unwrap_or(""))
    .bind(native_id)
    .bind(content_hash)
    .fetch_optional(executor)
    .await?;

    let Some((id, source, native_match, hash_match)) = row else {
        return Ok(None);
    };
    let matched_on = if native_match != 0 {
        DuplicateKey::NativeId
    } else if hash_match != 0 {
        DuplicateKey::ContentHash
    } else {
        DuplicateKey::RecordId
    };
    Ok(Some(DuplicateRef {
        id,
        source: parse_source(&source)?,
        matched_on,
    }))
}

pub(crate) async fn fetch_record(pool: &SqlitePool, id: &str) -> Result<Option<DocumentRecord>, IndexError> {
    let sql = format!("SELECT {} FROM records WHERE id = ?", RECORD_COLUMNS);
    let row = sqlx::query(&sql).bind(id).fetch_optional(pool).await?;
    row.map(|r| row_to_record(&r)).transpose()
}

/// Decode a full record row. Any undecodable column is [`IndexError::Corrupt`].
pub(crate) fn row_to_record(row: &SqliteRow) -> Result<DocumentRecord, IndexError> {
    let id: String = row.try_get("id")?;
    let blob: Vec<u8> = row.try_get("embedding")?;
    let dims: i64 = row.try_get("dims")?;
    let embedding = decode_embedding(&id, &blob, dims as usize)?;
    let metadata_json: String = row.try_get("metadata_json")?;
    let source: String = row.try_get("source")?;
    let revision: i64 = row.try_get("revision")?;

    Ok(DocumentRecord {
        source: parse_source(&source)?,
        source_native_id: row.try_get("source_native_id")?,
        revision: revision as u32,
        text: row.try_get("text")?,
        embedding,
        content_hash: row.try_get("content_hash")?,
        model: row.try_get("model")?,
        metadata: decode_metadata(&id, &metadata_json)?,
        ingested_at: millis_to_datetime(row.try_get("ingested_at")?)?,
        superseded_by: row.try_get("superseded_by")?,
        id,
    })
}

pub(crate) fn decode_embedding(id: &str, blob: &[u8], dims: usize) -> Result<Vec<f32>, IndexError> {
    let vector = blob_to_vec(blob).ok_or_else(|| {
        IndexError::Corrupt(format!(
            "record {}: embedding blob of {} bytes is not f32-aligned",
            id,
            blob.len()
        ))
    })?;
    if vector.len() != dims {
        return Err(IndexError::Corrupt(format!(
            "record {}: embedding has {} components, row says {}",
            id,
            vector.len(),
            dims
        )));
    }
    if vector.iter().any(|x| !x.is_finite()) {
        return Err(IndexError::Corrupt(format!(
            "record {}: embedding contains non-finite values",
            id
        )));
    }
    Ok(vector)
}

pub(crate) fn decode_metadata(id: &str, json: &str) -> Result<RecordMetadata, IndexError> {
    serde_json::from_str(json)
        .map_err(|e| IndexError::Corrupt(format!("record {}: metadata unparsable: {}", id, e)))
}

pub(crate) fn parse_source(s: &str) -> Result<RecordSource, IndexError> {
    s.parse().map_err(IndexError::Corrupt)
}

pub(crate) fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>, IndexError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| IndexError::Corrupt(format!("ingested_at out of range: {}", ms)))
}
