//! The five-stage answer pipeline.
//!
//! Each stage implements [`Stage`], declares the `PipelineState` fields it
//! reads and writes, and returns a tagged [`StageOutput`]. The
//! [`Pipeline`] orchestrator runs them in fixed order.

pub mod orchestrator;
pub mod planner;
pub mod rerank;
pub mod retrieve;
pub mod stage;
pub mod state;
pub mod synthesizer;
pub mod validator;

pub use orchestrator::{Pipeline, PipelineEvent};
pub use planner::Planner;
pub use rerank::RerankStage;
pub use retrieve::RetrieveStage;
pub use stage::{Stage, StageName, StageOutput};
pub use state::{
    PipelineState, Query, ReasoningTrace, StateField, ValidationVerdict, VerdictStatus,
    render_history,
};
pub use synthesizer::Synthesizer;
pub use validator::{Validator, parse_verdict};
