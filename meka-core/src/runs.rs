//! Background run tracking for `Pipeline::submit`.

use crate::pipeline::state::{PipelineState, ReasoningTrace};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Lifecycle of a background run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Pending => write!(f, "pending"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub id: Uuid,
    pub thread_id: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Set when the run completed.
    pub state: Option<PipelineState>,
    /// Set when the run failed.
    pub error: Option<String>,
    /// Trace accumulated before a failure.
    pub partial_trace: ReasoningTrace,
}

impl RunRecord {
    fn pending(id: Uuid, thread_id: &str) -> Self {
        Self {
            id,
            thread_id: thread_id.to_string(),
            status: RunStatus::Pending,
            created_at: Utc::now(),
            finished_at: None,
            state: None,
            error: None,
            partial_trace: ReasoningTrace::default(),
        }
    }
}

#[derive(Debug, Default)]
struct Runs {
    records: HashMap<Uuid, RunRecord>,
    /// Finished run ids, oldest first.
    finished: VecDeque<Uuid>,
}

impl Runs {
    fn finish(&mut self, id: Uuid, retention: usize) {
        self.finished.push_back(id);
        let mut evicted = 0;
        while self.finished.len() > retention {
            if let Some(old) = self.finished.pop_front() {
                self.records.remove(&old);
                evicted += 1;
            }
        }
        if evicted > 0 {
            tracing::debug!(evicted, "Evicted finished runs from registry");
        }
    }
}

/// Shared registry of background runs, keyed by run id.
///
/// Pending and running records are always kept. Once more than `retention`
/// runs have finished, the ones that finished earliest are evicted.
#[derive(Debug, Clone)]
pub struct RunRegistry {
    runs: Arc<RwLock<Runs>>,
    retention: usize,
}

impl Default for RunRegistry {
    fn default() -> Self {
        Self::with_retention(Self::DEFAULT_RETENTION)
    }
}

impl RunRegistry {
    pub const DEFAULT_RETENTION: usize = 100;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: usize) -> Self {
        Self {
            runs: Arc::new(RwLock::new(Runs::default())),
            retention,
        }
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    pub async fn create(&self, thread_id: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.runs
            .write()
            .await
            .records
            .insert(id, RunRecord::pending(id, thread_id));
        id
    }

    pub async fn mark_running(&self, id: Uuid) {
        if let Some(record) = self.runs.write().await.records.get_mut(&id) {
            record.status = RunStatus::Running;
        }
    }

    pub async fn complete(&self, id: Uuid, state: PipelineState) {
        let mut runs = self.runs.write().await;
        let Some(record) = runs.records.get_mut(&id) else {
            return;
        };
        if record.status.is_terminal() {
            return;
        }
        record.status = RunStatus::Completed;
        record.finished_at = Some(Utc::now());
        record.partial_trace = state.trace().clone();
        record.state = Some(state);
        runs.finish(id, self.retention);
    }

    pub async fn fail(&self, id: Uuid, error: String, partial_trace: ReasoningTrace) {
        let mut runs = self.runs.write().await;
        let Some(record) = runs.records.get_mut(&id) else {
            return;
        };
        if record.status.is_terminal() {
            return;
        }
        record.status = RunStatus::Failed;
        record.finished_at = Some(Utc::now());
        record.error = Some(error);
        record.partial_trace = partial_trace;
        runs.finish(id, self.retention);
    }

    pub async fn get(&self, id: Uuid) -> Option<RunRecord> {
        self.runs.read().await.records.get(&id).cloned()
    }

    /// Remove and return a finished run. Pending or running runs stay put
    /// and yield `None`.
    pub async fn take(&self, id: Uuid) -> Option<RunRecord> {
        let mut runs = self.runs.write().await;
        if !runs.records.get(&id)?.status.is_terminal() {
            return None;
        }
        runs.finished.retain(|f| *f != id);
        runs.records.remove(&id)
    }

    pub async fn len(&self) -> usize {
        self.runs.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.runs.read().await.records.is_empty()
    }
}
