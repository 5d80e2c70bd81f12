//! Synthesizer stage: the final answer from reranked context and history.

use crate::brain::Brain;
use crate::error::MekaError;
use crate::pipeline::stage::{Stage, StageName, StageOutput};
use crate::pipeline::state::{PipelineState, StateField, render_history};
use crate::types::Document;
use async_trait::async_trait;
use std::sync::Arc;

/// Placed between context passages in ranked order.
pub const CONTEXT_SEPARATOR: &str = "\n\n---\n\n";

pub struct Synthesizer {
    brain: Arc<Brain>,
}

impl Synthesizer {
    pub fn new(brain: Arc<Brain>) -> Self {
        Self { brain }
    }

    pub fn render_context(docs: &[Document]) -> String {
        if docs.is_empty() {
            return "No documents were retrieved.".to_string();
        }
        docs.iter()
            .map(|d| d.content.as_str())
            .collect::<Vec<_>>()
            .join(CONTEXT_SEPARATOR)
    }

    pub fn build_prompt(state: &PipelineState) -> String {
        let context = Self::render_context(state.reranked_docs().unwrap_or_default());
        format!(
            "You are a synthesis agent for MEKA. Use the provided context AND conversation history to answer the user's latest query accurately.\n\
             If the context doesn't contain the answer but the history does, use the history. \
             If both are available, prioritize the latest retrieved context.\n\n\
             **Conversation History:**\n{}\n\n\
             **Retrieved Context:**\n{}\n\n\
             **Current User Query:** {}\n\n\
             Answer:",
            render_history(state.prior_turns()),
            context,
            state.query().text
        )
    }
}

#[async_trait]
impl Stage for Synthesizer {
    fn name(&self) -> StageName {
        StageName::Synthesize
    }

    fn reads(&self) -> &'static [StateField] {
        &[
            StateField::RerankedDocs,
            StateField::History,
            StateField::Query,
        ]
    }

    fn writes(&self) -> &'static [StateField] {
        &[StateField::Answer, StateField::Trace]
    }

    async fn execute(&self, state: &PipelineState) -> Result<StageOutput, MekaError> {
        let answer = self.brain.complete(&Self::build_prompt(state)).await?;
        Ok(StageOutput::Synthesize {
            answer,
            trace: "Synthesizer: Synthesized final answer using context and history".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::MockLlmProvider;
    use crate::config::LlmConfig;
    use crate::pipeline::state::Query;
    use crate::types::Message;

    fn reranked_state(docs: Vec<Document>, prior: Vec<Message>) -> PipelineState {
        let mut state = PipelineState::new(Query::new("Who wrote it?"), prior);
        state
            .apply(
                StageName::Rerank,
                &[StateField::RerankedDocs, StateField::Trace],
                StageOutput::Rerank {
                    docs,
                    trace: "Reranker: test".into(),
                },
            )
            .unwrap();
        state
    }

    #[test]
    fn test_context_keeps_ranked_order() {
        let docs = vec![
            Document::new("first", "a", "text"),
            Document::new("second", "b", "text"),
        ];
        assert_eq!(
            Synthesizer::render_context(&docs),
            "first\n\n---\n\nsecond"
        );
    }

    #[test]
    fn test_prompt_sections() {
        let state = reranked_state(
            vec![Document::new("The book was written by Ada.", "s", "text")],
            vec![Message::user("Tell me about the book"), Message::assistant("It is old.")],
        );
        let prompt = Synthesizer::build_prompt(&state);
        assert!(prompt.contains("prioritize the latest retrieved context"));
        assert!(prompt.contains("User: Tell me about the book\nAssistant: It is old."));
        assert!(prompt.contains("**Retrieved Context:**\nThe book was written by Ada."));
        assert!(prompt.contains("**Current User Query:** Who wrote it?"));
    }

    #[tokio::test]
    async fn test_answer_is_literal_completion() {
        let provider = Arc::new(MockLlmProvider::with_response(" Ada. "));
        let stage = Synthesizer::new(Arc::new(Brain::new(provider, &LlmConfig::default())));
        let state = reranked_state(Vec::new(), Vec::new());
        match stage.execute(&state).await.unwrap() {
            StageOutput::Synthesize { answer, .. } => assert_eq!(answer, " Ada. "),
            other => panic!("unexpected output: {:?}", other),
        }
    }
}
