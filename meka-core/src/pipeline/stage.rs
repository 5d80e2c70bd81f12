//! The `Stage` trait and the tagged outputs stages hand back to the
//! orchestrator.

use crate::error::MekaError;
use crate::pipeline::state::{PipelineState, StateField, ValidationVerdict};
use crate::types::Document;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Identifies a pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Plan,
    Retrieve,
    Rerank,
    Synthesize,
    Validate,
}

impl StageName {
    /// Fixed execution order.
    pub const ORDER: [StageName; 5] = [
        StageName::Plan,
        StageName::Retrieve,
        StageName::Rerank,
        StageName::Synthesize,
        StageName::Validate,
    ];

    /// Agent name used in events and log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Plan => "planner",
            StageName::Retrieve => "retriever",
            StageName::Rerank => "reranker",
            StageName::Synthesize => "synthesizer",
            StageName::Validate => "validator",
        }
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a stage produced. Every variant carries exactly one trace line.
#[derive(Debug, Clone)]
pub enum StageOutput {
    Plan { intent: String, trace: String },
    Retrieve { docs: Vec<Document>, trace: String },
    Rerank { docs: Vec<Document>, trace: String },
    Synthesize { answer: String, trace: String },
    Validate { verdict: ValidationVerdict, trace: String },
}

impl StageOutput {
    /// The state field this output fills (besides the trace).
    pub fn field(&self) -> StateField {
        match self {
            StageOutput::Plan { .. } => StateField::PlanIntent,
            StageOutput::Retrieve { .. } => StateField::RetrievedDocs,
            StageOutput::Rerank { .. } => StateField::RerankedDocs,
            StageOutput::Synthesize { .. } => StateField::Answer,
            StageOutput::Validate { .. } => StateField::Verdict,
        }
    }

    pub fn trace_line(&self) -> &str {
        match self {
            StageOutput::Plan { trace, .. }
            | StageOutput::Retrieve { trace, .. }
            | StageOutput::Rerank { trace, .. }
            | StageOutput::Synthesize { trace, .. }
            | StageOutput::Validate { trace, .. } => trace,
        }
    }
}

/// One step of the pipeline.
///
/// A stage reads from an immutable view of the state and returns its output;
/// the orchestrator checks `reads()` before execution and applies the output
/// against `writes()` afterwards.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> StageName;

    /// Fields that must be present before this stage runs.
    fn reads(&self) -> &'static [StateField];

    /// Fields this stage owns.
    fn writes(&self) -> &'static [StateField];

    async fn execute(&self, state: &PipelineState) -> Result<StageOutput, MekaError>;
}
