//! Error types for quarry-index.

/// Errors that can occur during indexing and query operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// Code host error (tree listing, blob fetch).
    #[error("code host error: {0}")]
    Host(#[from] crate::host::HostError),

    /// Embedding or completion service error.
    #[error("LLM error: {0}")]
    Llm(#[from] quarry_llm::LlmError),

    /// Chunk/job persistence error.
    #[error("store error: {0}")]
    Store(#[from] quarry_store::StoreError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A second index request for a repository already being indexed.
    #[error("an index job is already in progress for {0}")]
    AlreadyIndexing(String),

    /// Missing or rejected credentials, surfaced verbatim and never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Integer conversion error.
    #[error("integer conversion failed: {0}")]
    IntConversion(#[from] std::num::TryFromIntError),

    /// Generic catch-all error.
    #[error("{0}")]
    Other(String),
}

/// Result type alias using `IndexError`.
pub type Result<T> = std::result::Result<T, IndexError>;
