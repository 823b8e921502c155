use async_openai::error::OpenAIError;
use thiserror::Error;
use tokio::task::JoinError;

/// Core internal errors.
///
/// Recoverable pipeline conditions (a single failed modality, a missing
/// vector index, a timed-out generation call) are absorbed inside the
/// retrieval pipeline and surface only as response metadata. The variants
/// here cross a boundary: either infrastructure faults or the few
/// conditions callers must see.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("OpenAI error: {0}")]
    OpenAI(#[from] OpenAIError),
    /// One modality's embedding model is missing or rejected the input.
    /// Recoverable when the other modality still works.
    #[error("Embedding unavailable: {0}")]
    EmbeddingUnavailable(String),
    /// Every retrieval modality failed; the request cannot proceed.
    #[error("Retrieval failed: {0}")]
    RetrievalFailed(String),
    #[error("Generation failed: {0}")]
    GenerationFailed(String),
    #[error("Generation timed out after {0}ms")]
    GenerationTimeout(u128),
    /// Programmer error in caller-supplied options or document data.
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
    #[error("Internal service error: {0}")]
    InternalError(String),
}
