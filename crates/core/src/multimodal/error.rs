//! Error type shared by the multimodal fusion pipeline.

use thiserror::Error;

/// Errors raised while expanding placeholders, selecting visual tokens or
/// splicing image features into the text embeddings.
///
/// None of these are retryable: they indicate either caller misuse (image and
/// placeholder counts disagree) or a broken invariant between components.
#[derive(Debug, Error)]
pub enum FusionError {
    #[error("malformed image placeholders: {0}")]
    MalformedPlaceholders(String),
    #[error("incompatible feature shape: {0}")]
    IncompatibleFeatureShape(String),
    #[error("invalid feature selector config: {0}")]
    InvalidSelectorConfig(String),
    #[error("invalid multimodal config: {0}")]
    InvalidConfig(String),
    /// Image slots and image features disagree for one request of the batch.
    /// Fails the whole batch.
    #[error("request {request}: expected {expected} image feature rows, found {found}")]
    FeatureCountMismatch {
        request: usize,
        expected: usize,
        found: usize,
    },
    #[error("cannot assemble an empty batch")]
    EmptyBatch,
    #[error("preprocessing worker failed: {0}")]
    WorkerFailed(String),
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, FusionError>;
