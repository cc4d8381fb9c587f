use std::io;

use thiserror::Error;

use crate::types::SourceId;

/// Error type for source, curation, build, and publication failures.
#[derive(Debug, Error)]
pub enum CorpusError {
    /// A source could not be reached or listed.
    #[error("data source '{source_id}' is unavailable: {reason}")]
    SourceUnavailable {
        /// Source identifier.
        source_id: SourceId,
        /// Underlying failure.
        reason: String,
    },
    /// A source exists but is neither a table nor a shard repository.
    #[error("data source '{source_id}' resolved to an unsupported shape: {details}")]
    UnsupportedSourceType {
        /// Source identifier.
        source_id: SourceId,
        /// What was found instead.
        details: String,
    },
    /// Required columns are missing or malformed.
    #[error("data source '{source_id}' does not match the expected schema: {details}")]
    SchemaMismatch {
        /// Source identifier.
        source_id: SourceId,
        /// Which columns or cells failed.
        details: String,
    },
    /// A waveform could not be opened or decoded.
    #[error("audio for '{location}' could not be read: {reason}")]
    Audio {
        /// File path or embedded file name.
        location: String,
        /// Decoder failure.
        reason: String,
    },
    /// Invalid settings or an unusable build result.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// The SQLite metadata store is missing or failed a query.
    #[error("metadata store failure: {0}")]
    MetadataStore(String),
    /// A retried operation kept failing.
    #[error("{operation} failed after {attempts} attempts: {reason}")]
    RetriesExhausted {
        /// What was attempted.
        operation: String,
        /// Attempts made.
        attempts: usize,
        /// Last failure.
        reason: String,
    },
    /// Shard writing or upload failed.
    #[error("publication failed: {0}")]
    Publish(String),
    /// Filesystem failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<rusqlite::Error> for CorpusError {
    fn from(err: rusqlite::Error) -> Self {
        CorpusError::MetadataStore(err.to_string())
    }
}
