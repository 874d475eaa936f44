use crate::{
    metadata::MetadataError,
    semantic::{EmbeddingError, IndexError, Position, VectorStorageError},
};

use super::bootstrap::BootstrapError;

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("unknown collection '{0}'")]
    UnknownCollection(String),

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("embedder unavailable: {0}")]
    EmbeddingUnavailable(#[from] EmbeddingError),

    #[error("position {0} already exists in the metadata store")]
    DuplicateKey(Position),

    #[error("consistency violation in '{collection}': {reason}")]
    ConsistencyViolation { collection: String, reason: String },

    #[error("collection '{collection}' is halted until reconciled: {reason}")]
    CollectionHalted { collection: String, reason: String },

    #[error("bootstrap source for '{0}' is empty")]
    EmptySource(String),

    #[error("bootstrap source error: {0}")]
    Source(#[from] BootstrapError),

    #[error("position {0} not found")]
    NotFound(Position),

    #[error("index storage error: {0}")]
    Storage(#[from] VectorStorageError),

    #[error("metadata error: {0}")]
    Metadata(MetadataError),

    #[error("unexpected error: {0:?}")]
    Other(#[from] anyhow::Error),
}

impl From<IndexError> for AppError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::DimensionMismatch { expected, got } => {
                AppError::DimensionMismatch { expected, got }
            }
            IndexError::NonFinite => AppError::InvalidRecord(err.to_string()),
        }
    }
}

impl From<MetadataError> for AppError {
    fn from(err: MetadataError) -> Self {
        match err {
            MetadataError::DuplicateKey(position) => AppError::DuplicateKey(position),
            MetadataError::NotFound(position) => AppError::NotFound(position),
            MetadataError::UnknownField(_) => AppError::InvalidRecord(err.to_string()),
            other => AppError::Metadata(other),
        }
    }
}

impl AppError {
    /// True for errors that mean the dual-store invariant no longer holds.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AppError::ConsistencyViolation { .. } | AppError::DuplicateKey(_)
        )
    }
}
