//! Error taxonomy for the retrieval core.
//!
//! Each subsystem has its own error enum. Every variant exposes a stable,
//! machine-readable [`code`](QueryError::code) that the CLI and HTTP layers
//! surface to callers:
//!
//! | Code | Meaning |
//! |------|---------|
//! | `EMBEDDING_FAILED` | The query or document could not be embedded |
//! | `LIVE_FETCH_UNAVAILABLE` | The live source failed; results degrade to corpus-only |
//! | `DUPLICATE_DETECTED` | Ingestion resolved to an existing record (an outcome, not an error) |
//! | `INDEX_CORRUPT` | Persisted index state cannot be loaded; rebuild from source |

use thiserror::Error;

pub const EMBEDDING_FAILED: &str = "EMBEDDING_FAILED";
pub const LIVE_FETCH_UNAVAILABLE: &str = "LIVE_FETCH_UNAVAILABLE";
pub const DUPLICATE_DETECTED: &str = "DUPLICATE_DETECTED";
pub const INDEX_CORRUPT: &str = "INDEX_CORRUPT";

/// Failure of an [`EmbeddingProvider`](crate::embedding::EmbeddingProvider).
#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("embedding model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("invalid embedding response: {0}")]
    InvalidResponse(String),
}

/// Failure of a [`LiveFetcher`](crate::live::LiveFetcher).
///
/// "No matching records" is not an error: fetchers return an empty list.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("live source unavailable: {0}")]
    Unavailable(String),
}

/// Failure inside the [`VectorIndex`](crate::index::VectorIndex).
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index corrupt: {0}")]
    Corrupt(String),

    #[error("embedding has {actual} dimensions, index expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("embedding produced by model '{actual}', index is built with '{expected}'")]
    ModelMismatch { expected: String, actual: String },

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("record {0} is already superseded")]
    AlreadySuperseded(String),

    #[error("index lock poisoned")]
    Poisoned,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl IndexError {
    pub fn code(&self) -> &'static str {
        match self {
            IndexError::Corrupt(_) => INDEX_CORRUPT,
            IndexError::DimensionMismatch { .. } | IndexError::ModelMismatch { .. } => {
                "INCOMPATIBLE_EMBEDDING"
            }
            IndexError::NotFound(_) => "NOT_FOUND",
            IndexError::AlreadySuperseded(_) => "ALREADY_SUPERSEDED",
            IndexError::Poisoned | IndexError::Database(_) => "INDEX_UNAVAILABLE",
        }
    }
}

/// Failure to ingest a single document.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("document '{0}' has no text after normalization")]
    EmptyDocument(String),

    #[error("document '{0}' has no source-native identifier")]
    MissingNativeId(String),

    #[error(transparent)]
    Embedding(#[from] EmbedError),

    #[error(transparent)]
    Index(#[from] IndexError),
}

impl IngestError {
    pub fn code(&self) -> &'static str {
        match self {
            IngestError::EmptyDocument(_) | IngestError::MissingNativeId(_) => "INVALID_DOCUMENT",
            IngestError::Embedding(_) => EMBEDDING_FAILED,
            IngestError::Index(e) => e.code(),
        }
    }
}

/// Fatal failure of a hybrid query. Live-source failures never appear here;
/// they are reported as warnings on the response.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("query text must not be empty")]
    EmptyQuery,

    #[error("{EMBEDDING_FAILED}: {0}")]
    EmbeddingFailed(#[source] EmbedError),

    #[error(transparent)]
    Index(#[from] IndexError),
}

impl QueryError {
    pub fn code(&self) -> &'static str {
        match self {
            QueryError::EmptyQuery => "bad_request",
            QueryError::EmbeddingFailed(_) => EMBEDDING_FAILED,
            QueryError::Index(e) => e.code(),
        }
    }
}
