//! Typed error taxonomy for the pipeline driver and query engine (spec §7).
//!
//! CLI-level code stays on `anyhow` (see `main.rs`), same split the teacher
//! keeps between library modules and the `cortexast` binary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DocsError {
    /// Manifest schema violation, invalid `chunk_by`, non-positive sizes, non-string metadata.
    #[error("configuration error at {field}: {message}")]
    Config { field: String, message: String },

    #[error("chunking failed for {filepath}: {message}")]
    Chunking { filepath: String, message: String },

    #[error("fingerprint computation failed: {0}")]
    Fingerprint(String),

    /// Retryable embedding failure (HTTP 429/5xx/network) that exhausted `max_retries`.
    #[error("embedding provider transient error (exhausted {attempts} retries): {message}")]
    EmbeddingTransient { attempts: u32, message: String },

    /// Non-retryable embedding failure (4xx other than 429, response shape mismatch).
    #[error("embedding provider fatal error: {0}")]
    EmbeddingFatal(String),

    #[error("embedding cache discarded: {0}")]
    CacheCorrupt(String),

    #[error("index build failed at {stage}: {message}")]
    IndexBuild { stage: String, message: String },

    #[error("query failed: {0}")]
    Query(String),

    #[error("cursor does not match current query or filters")]
    CursorMismatch,

    #[error("cursor is malformed: {0}")]
    CursorMalformed(String),

    #[error("chunk_id '{0}' has an invalid format")]
    InvalidChunkId(String),

    #[error("no chunk found with chunk_id '{0}'")]
    ChunkNotFound(String),
}

pub type Result<T> = std::result::Result<T, DocsError>;
