//! Reranker stage.

use crate::error::MekaError;
use crate::pipeline::stage::{Stage, StageName, StageOutput};
use crate::pipeline::state::{PipelineState, StateField};
use crate::reranker::RelevanceReranker;
use async_trait::async_trait;
use std::sync::Arc;

pub struct RerankStage {
    reranker: Arc<RelevanceReranker>,
}

impl RerankStage {
    pub fn new(reranker: Arc<RelevanceReranker>) -> Self {
        Self { reranker }
    }
}

#[async_trait]
impl Stage for RerankStage {
    fn name(&self) -> StageName {
        StageName::Rerank
    }

    fn reads(&self) -> &'static [StateField] {
        &[StateField::Query, StateField::RetrievedDocs]
    }

    fn writes(&self) -> &'static [StateField] {
        &[StateField::RerankedDocs, StateField::Trace]
    }

    async fn execute(&self, state: &PipelineState) -> Result<StageOutput, MekaError> {
        let retrieved = state.retrieved_docs().unwrap_or_default();
        if retrieved.is_empty() {
            return Ok(StageOutput::Rerank {
                docs: Vec::new(),
                trace: "Reranker: No docs to rerank".to_string(),
            });
        }
        let docs = self
            .reranker
            .rerank(&state.query().text, retrieved)
            .await?;
        let trace = format!(
            "Reranker: Re-scored {} segments, optimized to top {}",
            retrieved.len(),
            docs.len()
        );
        Ok(StageOutput::Rerank { docs, trace })
    }
}
