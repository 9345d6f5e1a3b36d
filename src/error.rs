//! Error taxonomy for the search core.
//!
//! Only failures that would hand the caller a wrong answer are represented here.
//! Degradations that merely make the index lag behind the document store
//! (a hit with no record, a failed index write) are logged with `tracing::warn!`
//! and never surface as errors.

use thiserror::Error;

/// Errors raised by the search and indexing core.
#[derive(Debug, Error)]
pub enum MosaicError {
    /// Input could not be embedded: unreadable image, empty text, or a model failure.
    #[error("embedding extraction failed: {0}")]
    EmbeddingExtraction(String),

    /// The vector index did not answer the primary k-NN call in time, or at all.
    #[error("search backend unavailable: {0}")]
    SearchBackendUnavailable(String),

    /// The caller asked for a scope it is not allowed to search.
    #[error("scope not permitted: {0}")]
    ScopeForbidden(String),

    /// The raw scope string did not parse into a known selector.
    #[error("invalid scope: {0}")]
    InvalidScope(String),

    /// Malformed query parameters (page, page size, threshold, vector dimension).
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// The document store failed while the core needed an authoritative answer from it.
    #[error("document store unavailable: {0}")]
    DocumentStoreUnavailable(String),

    /// The referenced media record does not exist.
    #[error("media not found: {0}")]
    MediaNotFound(String),

    /// An existing vector index was created with a different dimension or metric.
    #[error("incompatible index schema: {0}")]
    IncompatibleSchema(String),
}

pub type Result<T, E = MosaicError> = std::result::Result<T, E>;

impl MosaicError {
    /// Short machine-readable label, used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EmbeddingExtraction(_) => "embedding_extraction",
            Self::SearchBackendUnavailable(_) => "search_backend_unavailable",
            Self::ScopeForbidden(_) => "scope_forbidden",
            Self::InvalidScope(_) => "invalid_scope",
            Self::InvalidQuery(_) => "invalid_query",
            Self::DocumentStoreUnavailable(_) => "document_store_unavailable",
            Self::MediaNotFound(_) => "media_not_found",
            Self::IncompatibleSchema(_) => "incompatible_schema",
        }
    }
}
