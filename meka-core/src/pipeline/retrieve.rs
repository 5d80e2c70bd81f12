//! Retriever stage.

use crate::error::MekaError;
use crate::pipeline::stage::{Stage, StageName, StageOutput};
use crate::pipeline::state::{PipelineState, StateField};
use crate::retriever::HybridRetriever;
use async_trait::async_trait;
use std::sync::Arc;

pub struct RetrieveStage {
    retriever: Arc<HybridRetriever>,
}

impl RetrieveStage {
    pub fn new(retriever: Arc<HybridRetriever>) -> Self {
        Self { retriever }
    }
}

#[async_trait]
impl Stage for RetrieveStage {
    fn name(&self) -> StageName {
        StageName::Retrieve
    }

    fn reads(&self) -> &'static [StateField] {
        &[StateField::Query, StateField::WebFlag]
    }

    fn writes(&self) -> &'static [StateField] {
        &[StateField::RetrievedDocs, StateField::Trace]
    }

    async fn execute(&self, state: &PipelineState) -> Result<StageOutput, MekaError> {
        let retrieval = self
            .retriever
            .retrieve(&state.query().text, state.web_search())
            .await?;
        let trace = format!(
            "Retriever: Found {} documents ({} vector, {} lexical, {} web)",
            retrieval.documents.len(),
            retrieval.vector,
            retrieval.lexical_added,
            retrieval.web
        );
        Ok(StageOutput::Retrieve {
            docs: retrieval.documents,
            trace,
        })
    }
}
