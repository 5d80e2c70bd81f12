//! Groundedness validator stage.
//!
//! Checks the answer against the full retrieved set, not the reranked subset.
//! Only lines that begin with `STATUS` or `REASON` are read; anything else
//! leaves the verdict at `UNKNOWN` rather than raising an error.

use crate::brain::Brain;
use crate::error::MekaError;
use crate::pipeline::stage::{Stage, StageName, StageOutput};
use crate::pipeline::state::{PipelineState, StateField, ValidationVerdict, VerdictStatus};
use async_trait::async_trait;
use std::sync::Arc;

pub struct Validator {
    brain: Arc<Brain>,
}

/// Value between the first and second colon of a line starting with `key`.
fn field_value<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    if !line.starts_with(key) {
        return None;
    }
    line.split(':').nth(1).map(str::trim)
}

/// Parse a `STATUS: ...` / `REASON: ...` reply.
pub fn parse_verdict(text: &str) -> ValidationVerdict {
    let mut verdict = ValidationVerdict::unknown();
    for line in text.lines() {
        if let Some(value) = field_value(line, "STATUS") {
            verdict.status = match value {
                "GROUNDED" => VerdictStatus::Grounded,
                "HALLUCINATED" => VerdictStatus::Hallucinated,
                _ => VerdictStatus::Unknown,
            };
        } else if let Some(value) = field_value(line, "REASON") {
            verdict.reason = value.to_string();
        }
    }
    verdict
}

impl Validator {
    pub fn new(brain: Arc<Brain>) -> Self {
        Self { brain }
    }

    pub fn build_prompt(state: &PipelineState) -> String {
        let context = state
            .retrieved_docs()
            .unwrap_or_default()
            .iter()
            .map(|d| d.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "Check if answer is grounded in context.\n\n\
             Context:\n{}\n\n\
             Answer:\n{}\n\n\
             Respond ONLY:\n\
             STATUS: GROUNDED or HALLUCINATED\n\
             REASON: short reason",
            context,
            state.answer().unwrap_or_default()
        )
    }
}

#[async_trait]
impl Stage for Validator {
    fn name(&self) -> StageName {
        StageName::Validate
    }

    fn reads(&self) -> &'static [StateField] {
        &[StateField::Answer, StateField::RetrievedDocs]
    }

    fn writes(&self) -> &'static [StateField] {
        &[StateField::Verdict, StateField::Trace]
    }

    async fn execute(&self, state: &PipelineState) -> Result<StageOutput, MekaError> {
        let reply = self.brain.complete(&Self::build_prompt(state)).await?;
        let verdict = parse_verdict(&reply);
        if verdict.status == VerdictStatus::Unknown {
            tracing::debug!(reply = %reply, "Validator reply did not carry a recognizable status");
        }
        Ok(StageOutput::Validate {
            trace: format!("Validator: {} - {}", verdict.status, verdict.reason),
            verdict,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::MockLlmProvider;
    use crate::config::LlmConfig;
    use crate::pipeline::state::Query;
    use crate::types::Document;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_grounded() {
        let v = parse_verdict("STATUS: GROUNDED\nREASON: matches source");
        assert_eq!(v.status, VerdictStatus::Grounded);
        assert_eq!(v.reason, "matches source");
    }

    #[test]
    fn test_parse_unrecognizable() {
        assert_eq!(parse_verdict("looks fine to me"), ValidationVerdict::unknown());
        assert_eq!(parse_verdict(""), ValidationVerdict::unknown());
    }

    #[test]
    fn test_parse_skips_preamble_lines() {
        let v = parse_verdict("Sure.\nSTATUS: HALLUCINATED\nREASON: not in context");
        assert_eq!(v.status, VerdictStatus::Hallucinated);
        assert_eq!(v.reason, "not in context");
    }

    #[test]
    fn test_parse_keys_are_case_sensitive_and_unindented() {
        let v = parse_verdict("status: GROUNDED\n  REASON: indented");
        assert_eq!(v, ValidationVerdict::unknown());

        let v = parse_verdict("STATUS: grounded\nREASON: lowercase value");
        assert_eq!(v.status, VerdictStatus::Unknown);
        assert_eq!(v.reason, "lowercase value");
    }

    #[test]
    fn test_parse_takes_value_between_first_and_second_colon() {
        let v = parse_verdict("STATUS: GROUNDED\nREASON: cites source: page 2");
        assert_eq!(v.reason, "cites source");
    }

    #[test]
    fn test_parse_status_without_colon_is_ignored() {
        let v = parse_verdict("STATUS GROUNDED\nREASON: x");
        assert_eq!(v.status, VerdictStatus::Unknown);
        assert_eq!(v.reason, "x");
    }

    #[test]
    fn test_prompt_uses_full_retrieved_set() {
        let mut state = PipelineState::new(Query::new("q"), Vec::new());
        state
            .apply(
                StageName::Retrieve,
                &[StateField::RetrievedDocs, StateField::Trace],
                StageOutput::Retrieve {
                    docs: vec![
                        Document::new("one", "s", "text"),
                        Document::new("two", "s", "text"),
                    ],
                    trace: "Retriever".into(),
                },
            )
            .unwrap();
        state
            .apply(
                StageName::Synthesize,
                &[StateField::Answer, StateField::Trace],
                StageOutput::Synthesize {
                    answer: "Paris".into(),
                    trace: "Synthesizer".into(),
                },
            )
            .unwrap();
        let prompt = Validator::build_prompt(&state);
        assert!(prompt.contains("Context:\none\ntwo\n\nAnswer:\nParis"));
        assert!(prompt.ends_with("REASON: short reason"));
    }

    #[tokio::test]
    async fn test_validator_trace() {
        let provider = Arc::new(MockLlmProvider::with_response(
            "STATUS: GROUNDED\nREASON: supported",
        ));
        let stage = Validator::new(Arc::new(Brain::new(provider, &LlmConfig::default())));
        let state = PipelineState::new(Query::new("q"), Vec::new());
        match stage.execute(&state).await.unwrap() {
            StageOutput::Validate { verdict, trace } => {
                assert_eq!(verdict.status, VerdictStatus::Grounded);
                assert_eq!(trace, "Validator: GROUNDED - supported");
            }
            other => panic!("unexpected output: {:?}", other),
        }
    }
}
