//! Error types for paged-scheduler.

use thiserror::Error;

/// Result type alias for paged-scheduler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for paged-scheduler.
#[derive(Error, Debug)]
pub enum Error {
    /// Block allocation failed - no free blocks available.
    #[error("out of KV cache blocks")]
    OutOfBlocks,

    /// The sequence budget cannot exceed the token budget, otherwise a batch
    /// of minimal (single token) sequences would not fit in one step.
    #[error("max_num_seqs ({max_num_seqs}) must not exceed max_num_batched_tokens ({max_num_batched_tokens})")]
    SeqLimitExceedsTokenBudget {
        max_num_seqs: usize,
        max_num_batched_tokens: usize,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
