//! Planner stage: a short retrieval-intent summary for the trace.

use crate::brain::Brain;
use crate::error::MekaError;
use crate::pipeline::stage::{Stage, StageName, StageOutput};
use crate::pipeline::state::{PipelineState, StateField, render_history};
use async_trait::async_trait;
use std::sync::Arc;

pub struct Planner {
    brain: Arc<Brain>,
}

impl Planner {
    pub fn new(brain: Arc<Brain>) -> Self {
        Self { brain }
    }

    pub fn build_prompt(state: &PipelineState) -> String {
        let web = if state.web_search() {
            "enabled"
        } else {
            "disabled"
        };
        format!(
            "You are a planning agent for a Multi-Agent Expert Knowledge Assistant (MEKA).\n\
             Your goal is to decompose a complex query into a simple search plan.\n\n\
             Conversation so far:\n{}\n\n\
             Web search: {}\n\n\
             Query: {}\n\n\
             Provide a concise plan (1-2 sentences) of what needs to be retrieved to answer this query.\n\
             Plan:",
            render_history(state.prior_turns()),
            web,
            state.query().text
        )
    }
}

#[async_trait]
impl Stage for Planner {
    fn name(&self) -> StageName {
        StageName::Plan
    }

    fn reads(&self) -> &'static [StateField] {
        &[StateField::Query, StateField::History, StateField::WebFlag]
    }

    fn writes(&self) -> &'static [StateField] {
        &[StateField::PlanIntent, StateField::Trace]
    }

    async fn execute(&self, state: &PipelineState) -> Result<StageOutput, MekaError> {
        let prompt = Self::build_prompt(state);
        let intent = self.brain.complete(&prompt).await?.trim().to_string();
        Ok(StageOutput::Plan {
            trace: format!("Planner: {}", intent),
            intent,
        })
    }
}
