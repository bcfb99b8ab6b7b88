use async_openai::error::OpenAIError;
use thiserror::Error;
use tokio::task::JoinError;

/// Error kinds propagated as discriminated values, stringified at transport
/// boundaries. Infrastructure failures (`TransportClosed`, `RpcTimeout`,
/// `QueryError`, `ProxyClosed`) are always surfaced to the caller; any error
/// a handler returns, including `Cancelled` from a pipeline stage that
/// noticed its job was aborted mid-flight, is recorded as the job's
/// terminal failure by the queue worker loop.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("OpenAI error: {0}")]
    OpenAI(#[from] OpenAIError),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("LLM parsing error: {0}")]
    LLMParsing(String),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
    #[error("Internal service error: {0}")]
    InternalError(String),

    #[error("transport closed")]
    TransportClosed,
    #[error("rpc timed out")]
    RpcTimeout,
    #[error("query error: {0}")]
    QueryError(String),
    #[error("proxy closed")]
    ProxyClosed,
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("extraction yielded no entities")]
    EmptyExtraction,
    #[error("commit failed: {0}")]
    CommitFailed(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("schema migration failed: {0}")]
    SchemaMigrationFailed(String),

    /// Consumed internally by the fact resolver; never surfaced to a caller.
    #[error("conflicting fact detected")]
    ConflictingFact,
}
