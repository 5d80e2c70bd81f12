//! Sequences the five stages over one `PipelineState`.
//!
//! `PLAN -> RETRIEVE -> RERANK -> SYNTHESIZE -> VALIDATE -> DONE`, with no
//! branching. Three entry points share one driver loop: `run` awaits the
//! final state, `stream` emits an event per completed stage, and `submit`
//! records the outcome in a `RunRegistry` in the background.

use crate::checkpoint::CheckpointStore;
use crate::error::{MekaError, StageError, StateError};
use crate::pipeline::planner::Planner;
use crate::pipeline::rerank::RerankStage;
use crate::pipeline::retrieve::RetrieveStage;
use crate::pipeline::stage::{Stage, StageName};
use crate::pipeline::state::{PipelineState, Query, ReasoningTrace, StateField};
use crate::pipeline::synthesizer::Synthesizer;
use crate::pipeline::validator::Validator;
use crate::runs::RunRegistry;
use crate::services::Services;
use crate::types::Message;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

/// Emitted by `Pipeline::stream`.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// A stage finished. `trace` holds only lines not yet emitted in this run.
    Stage {
        stage: StageName,
        state: Box<PipelineState>,
        trace: Vec<String>,
    },
    /// The run aborted. No further events follow.
    Failed {
        stage: Option<StageName>,
        error: String,
    },
}

/// A failed run with whatever trace it accumulated.
#[derive(Debug)]
struct RunFailure {
    stage: Option<StageName>,
    error: MekaError,
    partial_trace: ReasoningTrace,
}

impl RunFailure {
    fn before_start(error: MekaError) -> Self {
        Self {
            stage: None,
            error,
            partial_trace: ReasoningTrace::default(),
        }
    }
}

pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
    checkpoints: Arc<dyn CheckpointStore>,
    stage_timeout: Option<Duration>,
    runs: RunRegistry,
}

impl Pipeline {
    /// Build a pipeline from custom stage implementations.
    ///
    /// The stages must appear exactly once each, in `StageName::ORDER`.
    pub fn new(
        stages: Vec<Arc<dyn Stage>>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Result<Self, StateError> {
        let names: Vec<StageName> = stages.iter().map(|s| s.name()).collect();
        if names != StageName::ORDER {
            let found = names
                .iter()
                .map(StageName::as_str)
                .collect::<Vec<_>>()
                .join(" -> ");
            return Err(StateError::StageOrder { found });
        }
        Ok(Self::assemble(stages, checkpoints))
    }

    fn assemble(stages: Vec<Arc<dyn Stage>>, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        Self {
            stages,
            checkpoints,
            stage_timeout: None,
            runs: RunRegistry::new(),
        }
    }

    /// The standard five-stage pipeline over shared service handles.
    pub fn from_services(services: &Services) -> Self {
        let stages: Vec<Arc<dyn Stage>> = vec![
            Arc::new(Planner::new(Arc::clone(&services.brain))),
            Arc::new(RetrieveStage::new(Arc::clone(&services.retriever))),
            Arc::new(RerankStage::new(Arc::clone(&services.reranker))),
            Arc::new(Synthesizer::new(Arc::clone(&services.brain))),
            Arc::new(Validator::new(Arc::clone(&services.brain))),
        ];
        Self::assemble(stages, Arc::clone(&services.checkpoints))
            .with_stage_timeout(services.stage_timeout)
            .with_run_retention(services.max_finished_runs)
    }

    pub fn with_stage_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.stage_timeout = timeout;
        self
    }

    /// Keep at most `max_finished` completed or failed background runs.
    pub fn with_run_retention(mut self, max_finished: usize) -> Self {
        self.runs = RunRegistry::with_retention(max_finished);
        self
    }

    pub fn stage_names(&self) -> Vec<StageName> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn runs(&self) -> &RunRegistry {
        &self.runs
    }

    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    /// Run to completion. On failure nothing is written to the checkpoint.
    pub async fn run(&self, query: Query) -> Result<PipelineState, MekaError> {
        self.drive(query, |_, _| {}).await.map_err(|f| f.error)
    }

    /// Run in a background task, emitting one event per completed stage.
    ///
    /// Dropping the stream does not cancel the run.
    pub fn stream(self: &Arc<Self>, query: Query) -> UnboundedReceiverStream<PipelineEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            let mut emitted: HashSet<String> = HashSet::new();
            let stage_tx = tx.clone();
            let result = pipeline
                .drive(query, move |stage, state| {
                    let trace: Vec<String> = state
                        .trace()
                        .lines()
                        .iter()
                        .filter(|line| emitted.insert((*line).clone()))
                        .cloned()
                        .collect();
                    // A closed receiver only means the consumer stopped reading.
                    let _ = stage_tx.send(PipelineEvent::Stage {
                        stage,
                        state: Box::new(state.clone()),
                        trace,
                    });
                })
                .await;
            if let Err(failure) = result {
                let _ = tx.send(PipelineEvent::Failed {
                    stage: failure.stage,
                    error: failure.error.to_string(),
                });
            }
        });
        UnboundedReceiverStream::new(rx)
    }

    /// Start a background run and return its id immediately.
    pub async fn submit(self: &Arc<Self>, query: Query) -> Uuid {
        let id = self.runs.create(&query.thread_id).await;
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            pipeline.runs.mark_running(id).await;
            match pipeline.drive(query, |_, _| {}).await {
                Ok(state) => pipeline.runs.complete(id, state).await,
                Err(failure) => {
                    tracing::warn!(run_id = %id, error = %failure.error, "Background run failed");
                    pipeline
                        .runs
                        .fail(id, failure.error.to_string(), failure.partial_trace)
                        .await;
                }
            }
        });
        id
    }

    async fn drive<F>(&self, query: Query, mut on_stage: F) -> Result<PipelineState, RunFailure>
    where
        F: FnMut(StageName, &PipelineState) + Send,
    {
        let run_start = Instant::now();
        let prior = self
            .checkpoints
            .load(&query.thread_id)
            .await
            .map_err(|e| RunFailure::before_start(e.into()))?;
        let thread_id = query.thread_id.clone();
        let mut state = PipelineState::new(query, prior);

        for stage in &self.stages {
            if let Err(error) = self.run_stage(stage.as_ref(), &mut state).await {
                return Err(RunFailure {
                    stage: Some(stage.name()),
                    error,
                    partial_trace: state.trace().clone(),
                });
            }
            on_stage(stage.name(), &state);
        }

        self.commit(&thread_id, &state).await.map_err(|error| RunFailure {
            stage: None,
            error,
            partial_trace: state.trace().clone(),
        })?;

        tracing::info!(
            thread_id = %thread_id,
            elapsed_ms = run_start.elapsed().as_millis() as u64,
            "Pipeline run completed"
        );
        Ok(state)
    }

    async fn run_stage(&self, stage: &dyn Stage, state: &mut PipelineState) -> Result<(), MekaError> {
        let name = stage.name();
        for field in stage.reads() {
            if !state.has(*field) {
                return Err(StateError::FieldNotReady {
                    stage: name,
                    field: *field,
                }
                .into());
            }
        }

        let start = Instant::now();
        tracing::info!(stage = %name, "Stage started");
        let output = match self.stage_timeout {
            Some(limit) => tokio::time::timeout(limit, stage.execute(state))
                .await
                .map_err(|_| StageError::Timeout {
                    stage: name,
                    timeout_secs: limit.as_secs(),
                })?,
            None => stage.execute(state).await,
        }
        .map_err(|e| StageError::Failed {
            stage: name,
            source: Box::new(e),
        })?;

        state.apply(name, stage.writes(), output)?;
        tracing::info!(
            stage = %name,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Stage finished"
        );
        Ok(())
    }

    /// Commit the user message and the answer of a finished run.
    ///
    /// A run that never reached a verdict is not DONE and writes nothing.
    async fn commit(&self, thread_id: &str, state: &PipelineState) -> Result<(), MekaError> {
        let answer = state.answer().ok_or(StateError::Incomplete {
            missing: StateField::Answer,
        })?;
        if state.verdict().is_none() {
            return Err(StateError::Incomplete {
                missing: StateField::Verdict,
            }
            .into());
        }
        let mut messages = Vec::with_capacity(2);
        if let Some(user) = state.history().last() {
            messages.push(user.clone());
        }
        messages.push(Message::assistant(answer));
        self.checkpoints.append_all(thread_id, messages).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::pipeline::stage::StageOutput;
    use crate::pipeline::state::{ValidationVerdict, VerdictStatus};
    use async_trait::async_trait;
    use futures::StreamExt;

    /// Returns a fixed output, optionally sleeping first.
    struct Scripted {
        output: StageOutput,
        delay: Duration,
    }

    #[async_trait]
    impl Stage for Scripted {
        fn name(&self) -> StageName {
            match self.output {
                StageOutput::Plan { .. } => StageName::Plan,
                StageOutput::Retrieve { .. } => StageName::Retrieve,
                StageOutput::Rerank { .. } => StageName::Rerank,
                StageOutput::Synthesize { .. } => StageName::Synthesize,
                StageOutput::Validate { .. } => StageName::Validate,
            }
        }
        fn reads(&self) -> &'static [StateField] {
            &[StateField::Query]
        }
        fn writes(&self) -> &'static [StateField] {
            match self.output {
                StageOutput::Plan { .. } => &[StateField::PlanIntent, StateField::Trace],
                StageOutput::Retrieve { .. } => &[StateField::RetrievedDocs, StateField::Trace],
                StageOutput::Rerank { .. } => &[StateField::RerankedDocs, StateField::Trace],
                StageOutput::Synthesize { .. } => &[StateField::Answer, StateField::Trace],
                StageOutput::Validate { .. } => &[StateField::Verdict, StateField::Trace],
            }
        }
        async fn execute(&self, _state: &PipelineState) -> Result<StageOutput, MekaError> {
            tokio::time::sleep(self.delay).await;
            Ok(self.output.clone())
        }
    }

    fn scripted(output: StageOutput) -> Arc<dyn Stage> {
        Arc::new(Scripted {
            output,
            delay: Duration::ZERO,
        })
    }

    fn plan() -> Arc<dyn Stage> {
        scripted(StageOutput::Plan {
            intent: "plan".into(),
            trace: "Planner: plan".into(),
        })
    }

    fn retrieve(trace: &str) -> Arc<dyn Stage> {
        scripted(StageOutput::Retrieve {
            docs: Vec::new(),
            trace: trace.into(),
        })
    }

    fn rerank() -> Arc<dyn Stage> {
        scripted(StageOutput::Rerank {
            docs: Vec::new(),
            trace: "Reranker: No docs to rerank".into(),
        })
    }

    fn synthesize() -> Arc<dyn Stage> {
        scripted(StageOutput::Synthesize {
            answer: "Paris".into(),
            trace: "Synthesizer: done".into(),
        })
    }

    fn validate() -> Arc<dyn Stage> {
        scripted(StageOutput::Validate {
            verdict: ValidationVerdict {
                status: VerdictStatus::Grounded,
                reason: "ok".into(),
            },
            trace: "Validator: GROUNDED - ok".into(),
        })
    }

    fn full_chain(retrieve_trace: &str) -> Vec<Arc<dyn Stage>> {
        vec![
            plan(),
            retrieve(retrieve_trace),
            rerank(),
            synthesize(),
            validate(),
        ]
    }

    /// Declares a read on a field nobody wrote.
    struct EagerValidator;

    #[async_trait]
    impl Stage for EagerValidator {
        fn name(&self) -> StageName {
            StageName::Validate
        }
        fn reads(&self) -> &'static [StateField] {
            &[StateField::Answer]
        }
        fn writes(&self) -> &'static [StateField] {
            &[StateField::Verdict, StateField::Trace]
        }
        async fn execute(&self, _state: &PipelineState) -> Result<StageOutput, MekaError> {
            unreachable!("reads are checked before execution")
        }
    }

    /// Writes the plan field while claiming to be the synthesizer.
    struct Trespasser;

    #[async_trait]
    impl Stage for Trespasser {
        fn name(&self) -> StageName {
            StageName::Synthesize
        }
        fn reads(&self) -> &'static [StateField] {
            &[]
        }
        fn writes(&self) -> &'static [StateField] {
            &[StateField::Answer, StateField::Trace]
        }
        async fn execute(&self, _state: &PipelineState) -> Result<StageOutput, MekaError> {
            Ok(StageOutput::Plan {
                intent: "stolen".into(),
                trace: "Synthesizer: stolen".into(),
            })
        }
    }

    /// Skips the order check so contract violations can be exercised.
    fn partial(stages: Vec<Arc<dyn Stage>>) -> (Pipeline, Arc<InMemoryCheckpointStore>) {
        let store = Arc::new(InMemoryCheckpointStore::new());
        (Pipeline::assemble(stages, store.clone()), store)
    }

    #[test]
    fn test_new_rejects_truncated_chain() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let err = Pipeline::new(vec![plan()], store).err().unwrap();
        match err {
            StateError::StageOrder { found } => assert_eq!(found, "planner"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_new_rejects_reordered_chain() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let stages = vec![plan(), rerank(), retrieve("r"), synthesize(), validate()];
        assert!(matches!(
            Pipeline::new(stages, store),
            Err(StateError::StageOrder { .. })
        ));
    }

    #[tokio::test]
    async fn test_full_chain_commits_question_and_answer() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let p = Pipeline::new(full_chain("Retriever: none"), store.clone()).unwrap();
        assert_eq!(p.stage_names(), StageName::ORDER.to_vec());

        let state = p.run(Query::new("hello").on_thread("t")).await.unwrap();
        assert_eq!(state.answer(), Some("Paris"));
        let history = store.load("t").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "hello");
        assert_eq!(history[1].content, "Paris");
    }

    #[tokio::test]
    async fn test_run_without_verdict_is_not_committed() {
        let (p, store) = partial(vec![plan(), retrieve("r"), rerank(), synthesize()]);
        let err = p.run(Query::new("hello").on_thread("t")).await.unwrap_err();
        assert!(matches!(
            err,
            MekaError::State(StateError::Incomplete {
                missing: StateField::Verdict
            })
        ));
        assert!(store.load("t").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unwritten_read_is_state_error() {
        let (p, store) = partial(vec![Arc::new(EagerValidator)]);
        let err = p.run(Query::new("q")).await.unwrap_err();
        assert!(matches!(
            err,
            MekaError::State(StateError::FieldNotReady {
                stage: StageName::Validate,
                field: StateField::Answer
            })
        ));
        assert!(store.load("default_user").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_foreign_write_is_state_error() {
        let (p, _) = partial(vec![Arc::new(Trespasser)]);
        let err = p.run(Query::new("q")).await.unwrap_err();
        assert!(matches!(err, MekaError::State(StateError::NotOwned { .. })));
    }

    #[tokio::test]
    async fn test_stage_timeout() {
        let mut stages = full_chain("r");
        stages[0] = Arc::new(Scripted {
            output: StageOutput::Plan {
                intent: "plan".into(),
                trace: "Planner: plan".into(),
            },
            delay: Duration::from_secs(5),
        });
        let store = Arc::new(InMemoryCheckpointStore::new());
        let p = Pipeline::new(stages, store)
            .unwrap()
            .with_stage_timeout(Some(Duration::from_millis(20)));
        let err = p.run(Query::new("q")).await.unwrap_err();
        assert!(matches!(
            err,
            MekaError::Stage(StageError::Timeout {
                stage: StageName::Plan,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_stream_suppresses_repeated_trace_line() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let p = Pipeline::new(full_chain("Planner: plan"), store).unwrap();
        let events: Vec<PipelineEvent> = Arc::new(p).stream(Query::new("q")).collect().await;
        assert_eq!(events.len(), 5);

        let traces: Vec<Vec<String>> = events
            .iter()
            .map(|e| match e {
                PipelineEvent::Stage { trace, .. } => trace.clone(),
                other => panic!("unexpected event: {:?}", other),
            })
            .collect();
        assert_eq!(traces[0], vec!["Planner: plan".to_string()]);
        assert!(traces[1].is_empty());
        assert_eq!(traces[2], vec!["Reranker: No docs to rerank".to_string()]);

        // The state itself still carries both lines.
        if let PipelineEvent::Stage { state, .. } = &events[1] {
            assert_eq!(state.trace().len(), 2);
        }
    }

    #[tokio::test]
    async fn test_stream_reports_failure_after_completed_stages() {
        let (p, _) = partial(vec![plan(), Arc::new(EagerValidator)]);
        let events: Vec<PipelineEvent> = Arc::new(p).stream(Query::new("q")).collect().await;
        assert_eq!(events.len(), 2);
        match &events[0] {
            PipelineEvent::Stage { stage, trace, .. } => {
                assert_eq!(*stage, StageName::Plan);
                assert_eq!(trace, &vec!["Planner: plan".to_string()]);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(
            &events[1],
            PipelineEvent::Failed {
                stage: Some(StageName::Validate),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_submit_records_partial_trace_on_failure() {
        let (p, _) = partial(vec![plan(), Arc::new(EagerValidator)]);
        let p = Arc::new(p);
        let id = p.submit(Query::new("q")).await;
        let record = loop {
            let record = p.runs().get(id).await.unwrap();
            if record.status.is_terminal() {
                break record;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert_eq!(record.status, crate::runs::RunStatus::Failed);
        assert_eq!(record.partial_trace.lines(), &["Planner: plan".to_string()]);
        assert!(record.error.unwrap().contains("validator"));
    }
}
