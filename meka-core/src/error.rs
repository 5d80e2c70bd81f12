//! Error types for the MEKA core library.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering LLM, index, configuration, stage execution, state contract and
//! checkpoint domains.

use crate::pipeline::{StageName, StateField};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for the MEKA core library.
#[derive(Debug, thiserror::Error)]
pub enum MekaError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Stage error: {0}")]
    Stage(#[from] StageError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from LLM provider interactions.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("API request failed: {message}")]
    ApiRequest { message: String },

    #[error("API response parse error: {message}")]
    ResponseParse { message: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Provider connection failed: {message}")]
    Connection { message: String },
}

/// Errors from the retrieval backends: embeddings, vector store, lexical
/// index, corpus loading and relevance scoring.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Embedding failed: {message}")]
    Embedding { message: String },

    #[error("Vector store error: {message}")]
    Vector { message: String },

    #[error("Lexical index error: {message}")]
    Lexical { message: String },

    #[error("Corpus error at {path}: {message}")]
    Corpus { path: PathBuf, message: String },

    #[error("Relevance scorer error: {message}")]
    Scorer { message: String },

    #[error("Cold-start rebuild exceeded {timeout_secs}s")]
    ColdStartTimeout { timeout_secs: u64 },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Tantivy error: {0}")]
    Tantivy(#[from] tantivy::TantivyError),
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing credential: environment variable {var} is not set")]
    MissingCredential { var: String },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// A provider call inside a pipeline stage failed, aborting the run.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("Stage '{stage}' failed: {source}")]
    Failed {
        stage: StageName,
        #[source]
        source: Box<MekaError>,
    },

    #[error("Stage '{stage}' timed out after {timeout_secs}s")]
    Timeout { stage: StageName, timeout_secs: u64 },
}

/// Violations of the per-stage read/write contract on `PipelineState`.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("Stage '{stage}' reads '{field}' before it was written")]
    FieldNotReady { stage: StageName, field: StateField },

    #[error("Field '{field}' was already written in this run")]
    AlreadyWritten { field: StateField },

    #[error("Stage '{stage}' does not own field '{field}'")]
    NotOwned { stage: StageName, field: StateField },

    #[error(
        "Stages must be planner -> retriever -> reranker -> synthesizer -> validator, got [{found}]"
    )]
    StageOrder { found: String },

    #[error("Run finished without writing '{missing}'")]
    Incomplete { missing: StateField },
}

/// Errors from the thread checkpoint store.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("Checkpoint persistence error: {message}")]
    Persistence { message: String },

    #[error("Failed to load checkpoint for thread '{thread_id}': {message}")]
    Load { thread_id: String, message: String },
}

impl LlmError {
    /// Failures worth retrying: rate limits, dropped connections, 5xx
    /// responses (mapped to `Connection`) and timeouts.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimited { .. } | LlmError::Connection { .. } | LlmError::Timeout { .. }
        )
    }

    /// Wait requested by the provider, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            LlmError::RateLimited { retry_after_secs } => {
                Some(Duration::from_secs(*retry_after_secs))
            }
            _ => None,
        }
    }
}

impl MekaError {
    /// Whether this error stems from configuration (fatal before any run).
    pub fn is_configuration(&self) -> bool {
        matches!(self, MekaError::Config(_))
    }
}

/// A type alias for results using the top-level `MekaError`.
pub type Result<T> = std::result::Result<T, MekaError>;
