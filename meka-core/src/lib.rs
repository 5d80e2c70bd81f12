//! # MEKA Core
//!
//! Core library for MEKA, the multi-agent expert knowledge assistant.
//! Provides hybrid retrieval (vector, BM25 and web), relevance reranking,
//! grounded answer synthesis with validation, the stage orchestrator,
//! per-thread checkpoints and configuration.

pub mod brain;
pub mod checkpoint;
pub mod config;
pub mod corpus;
pub mod embeddings;
pub mod error;
pub mod lexical;
pub mod pipeline;
pub mod providers;
pub mod reranker;
pub mod retriever;
pub mod runs;
pub mod services;
pub mod types;
pub mod vector_store;
pub mod web;

// Re-export commonly used types at the crate root.
pub use brain::{Brain, LlmProvider, MockLlmProvider};
pub use checkpoint::{CheckpointStore, InMemoryCheckpointStore, JsonFileCheckpointStore};
pub use config::{MekaConfig, load_config};
pub use error::{MekaError, Result};
pub use pipeline::{
    Pipeline, PipelineEvent, PipelineState, Query, StageName, ValidationVerdict, VerdictStatus,
};
pub use retriever::HybridRetriever;
pub use runs::{RunRecord, RunRegistry, RunStatus};
pub use services::Services;
pub use types::{Document, DocumentMetadata, Message, RetrievalSource, Role};
