//! Durable run storage.
//!
//! The [`RunStore`] trait is the checkpoint boundary of the orchestrator:
//! every state change, attempt counter and step output goes through it
//! before the run moves on. A process that dies mid-run leaves enough in the
//! store to resume at the first incomplete step.
//!
//! Writes are fenced by [`RunKey::generation`]. When a terminal run is
//! replaced by a fresh one the generation is bumped, and any straggling
//! writer still holding the old key gets an error instead of corrupting the
//! new run.
//!
//! Implementations:
//! - **[`SqliteRunStore`]**: `runs`, `run_steps` and `run_history` tables.
//! - **[`MemoryRunStore`]**: in-process maps, for tests.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use super::state::{RunState, RunStatus};
use crate::models::IndexResult;

pub use memory::MemoryRunStore;
pub use sqlite::SqliteRunStore;

/// Identity of one generation of a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunKey {
    pub namespace: String,
    pub run_id: String,
    pub generation: i64,
}

/// Parameters for admitting a run.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub namespace: String,
    pub run_id: String,
    pub entity_id: String,
    pub task_queue: String,
    pub code: String,
}

/// Checkpoint of one step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepSnapshot {
    pub step: RunState,
    pub attempts: u32,
    pub completed: bool,
    /// Step output when completed, or partial progress otherwise.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Run {
    pub run_id: String,
    pub entity_id: String,
    pub namespace: String,
    pub task_queue: String,
    pub generation: i64,
    pub state: RunState,
    pub status: RunStatus,
    #[serde(skip)]
    pub code: String,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub steps: Vec<StepSnapshot>,
}

impl Run {
    pub fn key(&self) -> RunKey {
        RunKey {
            namespace: self.namespace.clone(),
            run_id: self.run_id.clone(),
            generation: self.generation,
        }
    }

    pub fn step(&self, step: RunState) -> Option<&StepSnapshot> {
        self.steps.iter().find(|s| s.step == step)
    }

    /// Attempts made so far for a step (0 if never started).
    pub fn attempts(&self, step: RunState) -> u32 {
        self.step(step).map(|s| s.attempts).unwrap_or(0)
    }

    /// Result of the index write, once the Indexing step has completed.
    pub fn index_result(&self) -> Option<IndexResult> {
        self.step(RunState::Indexing)
            .filter(|s| s.completed)
            .and_then(|s| s.output.clone())
            .and_then(|v| serde_json::from_value(v).ok())
    }
}

/// Result of [`RunStore::create_or_attach`].
#[derive(Debug, Clone)]
pub enum Admission {
    /// A new generation was created and must be driven by the caller.
    Created(Run),
    /// A non-terminal run already exists for this id.
    Active(Run),
}

/// Filter for [`RunStore::list`].
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub status: Option<RunStatus>,
    pub task_queue: Option<String>,
    pub limit: Option<usize>,
}

#[async_trait]
pub trait RunStore: Send + Sync {
    /// Atomically admit a run: attach to a non-terminal one, replace a
    /// terminal one with the next generation, or create the first.
    async fn create_or_attach(&self, new: NewRun) -> Result<Admission>;

    /// Load a run with its step snapshots.
    async fn get(&self, namespace: &str, run_id: &str) -> Result<Option<Run>>;

    /// Move a run to `state`. Fails if the generation is stale or the
    /// transition is not allowed from the stored state.
    async fn transition(&self, key: &RunKey, state: RunState, error: Option<&str>) -> Result<()>;

    /// Persist the attempt counter of `step`, with the error of the previous
    /// attempt and any partial output.
    async fn record_attempt(
        &self,
        key: &RunKey,
        step: RunState,
        attempts: u32,
        error: Option<&str>,
        partial: Option<&Value>,
    ) -> Result<()>;

    /// Save the output of `step` and advance the run to `next` in one write.
    async fn complete_step(
        &self,
        key: &RunKey,
        step: RunState,
        output: &Value,
        next: RunState,
    ) -> Result<()>;

    /// Runs in a namespace, most recently updated first. Step snapshots
    /// are not loaded.
    async fn list(&self, namespace: &str, filter: &RunFilter) -> Result<Vec<Run>>;

    /// Delete terminal runs last updated before `before`, with their steps
    /// and archived history. Returns the number of runs removed.
    async fn prune(&self, namespace: &str, before: DateTime<Utc>) -> Result<u64>;
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
