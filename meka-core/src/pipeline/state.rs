//! The typed record threaded through one pipeline run.
//!
//! Stages never mutate the state directly. Each returns a `StageOutput`, and
//! the orchestrator applies it with `PipelineState::apply`, which enforces
//! write-once ownership of every field.

use crate::error::StateError;
use crate::pipeline::stage::{StageName, StageOutput};
use crate::types::{Document, Message, Role};
use serde::{Deserialize, Serialize};

/// An incoming question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub text: String,
    pub web_search: bool,
    pub thread_id: String,
}

impl Query {
    pub const DEFAULT_THREAD: &'static str = "default_user";

    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            web_search: false,
            thread_id: Self::DEFAULT_THREAD.to_string(),
        }
    }

    pub fn with_web_search(mut self, enabled: bool) -> Self {
        self.web_search = enabled;
        self
    }

    pub fn on_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = thread_id.into();
        self
    }
}

/// Named fields of `PipelineState`, used to declare stage reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateField {
    Query,
    History,
    WebFlag,
    PlanIntent,
    RetrievedDocs,
    RerankedDocs,
    Answer,
    Verdict,
    Trace,
}

impl std::fmt::Display for StateField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StateField::Query => "query",
            StateField::History => "history",
            StateField::WebFlag => "web_flag",
            StateField::PlanIntent => "plan_intent",
            StateField::RetrievedDocs => "retrieved_docs",
            StateField::RerankedDocs => "reranked_docs",
            StateField::Answer => "answer",
            StateField::Verdict => "verdict",
            StateField::Trace => "trace",
        };
        f.write_str(name)
    }
}

/// Groundedness outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerdictStatus {
    Grounded,
    Hallucinated,
    Unknown,
}

impl std::fmt::Display for VerdictStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerdictStatus::Grounded => write!(f, "GROUNDED"),
            VerdictStatus::Hallucinated => write!(f, "HALLUCINATED"),
            VerdictStatus::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub status: VerdictStatus,
    pub reason: String,
}

impl ValidationVerdict {
    pub const UNPARSEABLE_REASON: &'static str = "Could not parse";

    pub fn unknown() -> Self {
        Self {
            status: VerdictStatus::Unknown,
            reason: Self::UNPARSEABLE_REASON.to_string(),
        }
    }
}

/// Ordered, append-only stage log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReasoningTrace(Vec<String>);

impl ReasoningTrace {
    pub(crate) fn push(&mut self, line: impl Into<String>) {
        self.0.push(line.into());
    }

    pub fn lines(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Render prior turns as `User:` / `Assistant:` lines.
pub fn render_history(prior: &[Message]) -> String {
    let rendered: Vec<String> = prior
        .iter()
        .filter_map(|m| match m.role {
            Role::User => Some(format!("User: {}", m.content)),
            Role::Assistant => Some(format!("Assistant: {}", m.content)),
            Role::System => None,
        })
        .collect();
    if rendered.is_empty() {
        "No prior conversation.".to_string()
    } else {
        rendered.join("\n")
    }
}

/// State for one invocation.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineState {
    query: Query,
    history: Vec<Message>,
    plan_intent: Option<String>,
    retrieved_docs: Option<Vec<Document>>,
    reranked_docs: Option<Vec<Document>>,
    answer: Option<String>,
    verdict: Option<ValidationVerdict>,
    trace: ReasoningTrace,
}

impl PipelineState {
    /// Start a run. `prior` is the thread's committed history; the incoming
    /// user message is appended to this run's view of it.
    pub fn new(query: Query, prior: Vec<Message>) -> Self {
        let mut history = prior;
        history.push(Message::user(query.text.clone()));
        Self {
            query,
            history,
            plan_intent: None,
            retrieved_docs: None,
            reranked_docs: None,
            answer: None,
            verdict: None,
            trace: ReasoningTrace::default(),
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn web_search(&self) -> bool {
        self.query.web_search
    }

    /// Full history of this run, ending with the current user message.
    pub fn history(&self) -> &[Message] {
        &self.history
    }

    /// History excluding the newest (current) message.
    pub fn prior_turns(&self) -> &[Message] {
        match self.history.split_last() {
            Some((_, prior)) => prior,
            None => &[],
        }
    }

    pub fn plan_intent(&self) -> Option<&str> {
        self.plan_intent.as_deref()
    }

    pub fn retrieved_docs(&self) -> Option<&[Document]> {
        self.retrieved_docs.as_deref()
    }

    pub fn reranked_docs(&self) -> Option<&[Document]> {
        self.reranked_docs.as_deref()
    }

    pub fn answer(&self) -> Option<&str> {
        self.answer.as_deref()
    }

    pub fn verdict(&self) -> Option<&ValidationVerdict> {
        self.verdict.as_ref()
    }

    pub fn trace(&self) -> &ReasoningTrace {
        &self.trace
    }

    /// Whether `field` holds a value a stage may read.
    pub fn has(&self, field: StateField) -> bool {
        match field {
            StateField::Query | StateField::History | StateField::WebFlag | StateField::Trace => {
                true
            }
            StateField::PlanIntent => self.plan_intent.is_some(),
            StateField::RetrievedDocs => self.retrieved_docs.is_some(),
            StateField::RerankedDocs => self.reranked_docs.is_some(),
            StateField::Answer => self.answer.is_some(),
            StateField::Verdict => self.verdict.is_some(),
        }
    }

    /// Apply a stage's output. `writes` is the writer's declared field set.
    pub fn apply(
        &mut self,
        writer: StageName,
        writes: &[StateField],
        output: StageOutput,
    ) -> Result<(), StateError> {
        let field = output.field();
        if !writes.contains(&field) || !writes.contains(&StateField::Trace) {
            let field = if writes.contains(&field) {
                StateField::Trace
            } else {
                field
            };
            return Err(StateError::NotOwned {
                stage: writer,
                field,
            });
        }
        if self.has(field) {
            return Err(StateError::AlreadyWritten { field });
        }

        let trace_line = match output {
            StageOutput::Plan { intent, trace } => {
                self.plan_intent = Some(intent);
                trace
            }
            StageOutput::Retrieve { docs, trace } => {
                self.retrieved_docs = Some(docs);
                trace
            }
            StageOutput::Rerank { docs, trace } => {
                self.reranked_docs = Some(docs);
                trace
            }
            StageOutput::Synthesize { answer, trace } => {
                self.answer = Some(answer);
                trace
            }
            StageOutput::Validate { verdict, trace } => {
                self.verdict = Some(verdict);
                trace
            }
        };
        self.trace.push(trace_line);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_query_defaults() {
        let q = Query::new("hi");
        assert_eq!(q.thread_id, "default_user");
        assert!(!q.web_search);
        let q = q.with_web_search(true).on_thread("t1");
        assert!(q.web_search);
        assert_eq!(q.thread_id, "t1");
    }

    #[test]
    fn test_new_state_appends_user_message() {
        let prior = vec![Message::user("A"), Message::assistant("answer A")];
        let state = PipelineState::new(Query::new("B"), prior);
        assert_eq!(state.history().len(), 3);
        assert_eq!(state.history()[2].content, "B");
        assert_eq!(state.prior_turns().len(), 2);
        assert!(!state.has(StateField::PlanIntent));
        assert!(state.has(StateField::Query));
    }

    #[test]
    fn test_apply_write_once() {
        let mut state = PipelineState::new(Query::new("q"), Vec::new());
        let writes = [StateField::PlanIntent, StateField::Trace];
        state
            .apply(
                StageName::Plan,
                &writes,
                StageOutput::Plan {
                    intent: "look up q".into(),
                    trace: "Planner: look up q".into(),
                },
            )
            .unwrap();
        assert_eq!(state.plan_intent(), Some("look up q"));
        assert_eq!(state.trace().lines(), &["Planner: look up q".to_string()]);

        let err = state
            .apply(
                StageName::Plan,
                &writes,
                StageOutput::Plan {
                    intent: "again".into(),
                    trace: "Planner: again".into(),
                },
            )
            .unwrap_err();
        assert!(matches!(
            err,
            StateError::AlreadyWritten {
                field: StateField::PlanIntent
            }
        ));
        assert_eq!(state.trace().len(), 1);
    }

    #[test]
    fn test_apply_rejects_foreign_field() {
        let mut state = PipelineState::new(Query::new("q"), Vec::new());
        let err = state
            .apply(
                StageName::Plan,
                &[StateField::PlanIntent, StateField::Trace],
                StageOutput::Synthesize {
                    answer: "x".into(),
                    trace: "t".into(),
                },
            )
            .unwrap_err();
        assert!(matches!(
            err,
            StateError::NotOwned {
                stage: StageName::Plan,
                field: StateField::Answer
            }
        ));
        assert!(state.answer().is_none());
    }

    #[test]
    fn test_render_history() {
        assert_eq!(render_history(&[]), "No prior conversation.");
        let prior = vec![
            Message::system("ignored"),
            Message::user("What is the capital of France?"),
            Message::assistant("Paris"),
        ];
        assert_eq!(
            render_history(&prior),
            "User: What is the capital of France?\nAssistant: Paris"
        );
    }

    #[test]
    fn test_verdict_serialization() {
        let v = ValidationVerdict {
            status: VerdictStatus::Grounded,
            reason: "ok".into(),
        };
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["status"], "GROUNDED");
        assert_eq!(ValidationVerdict::unknown().reason, "Could not parse");
    }
}
