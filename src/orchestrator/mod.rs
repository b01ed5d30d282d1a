//! Durable run orchestration.
//!
//! The [`Orchestrator`] drives one run per entity through a fixed sequence
//! of steps, checkpointing every attempt and output in a [`RunStore`]:
//!
//! ```text
//! Pending ─▶ Summarizing ─▶ EmbeddingOverall ─▶ Chunking ─▶ SummarizingChunks
//!                                                                 │
//!            Completed ◀── Indexing ◀── EmbeddingChunks ◀─────────┘
//!
//!            Failed  (from any non-terminal state)
//! ```
//!
//! # Execution model
//!
//! - Runs execute independently on the tokio runtime; steps within a run are
//!   strictly sequential.
//! - A semaphore of `max_concurrent_steps` permits bounds step attempts in
//!   flight across all runs. A permit is held for one attempt, never during
//!   backoff.
//! - Each attempt runs under `step_timeout_secs`. A timeout is a transient
//!   failure.
//! - Transient failures are retried with exponential backoff up to
//!   `max_attempts`; permanent ones fail the run immediately.
//! - The attempt counter is persisted before each attempt, so attempts made
//!   before a crash still count after [`Orchestrator::resume_incomplete`].
//!
//! If a checkpoint write fails the run is abandoned in place (not failed).
//! The next event for the same entity reattaches a driver in
//! [`Orchestrator::start_or_attach`]; `resume_incomplete` picks up the rest.

pub mod retry;
pub mod state;
pub mod store;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, StepError};
use crate::models::IndexResult;
use crate::steps::{compose_document, DocumentParts, Pipeline};

pub use retry::RetryPolicy;
pub use state::{RunState, RunStatus, STEPS};
pub use store::{Admission, NewRun, Run, RunFilter, RunKey, RunStore, StepSnapshot};

/// Deterministic run id for an entity. Also the concurrency key: at most one
/// non-terminal run exists per id.
pub fn run_id_for(entity_id: &str) -> String {
    format!("snippet-ingestion-{}", entity_id)
}

/// Outcome of [`Orchestrator::start_or_attach`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// A new run (or a fresh generation of a finished one) was started.
    Started { run_id: String, generation: i64 },
    /// A run for this id is already in progress; nothing was started.
    Attached { run_id: String, generation: i64 },
}

impl Submission {
    pub fn run_id(&self) -> &str {
        match self {
            Self::Started { run_id, .. } | Self::Attached { run_id, .. } => run_id,
        }
    }

    pub fn generation(&self) -> i64 {
        match self {
            Self::Started { generation, .. } | Self::Attached { generation, .. } => *generation,
        }
    }
}

struct ActiveRun {
    generation: i64,
    cancel: CancellationToken,
    state: watch::Receiver<RunState>,
}

struct Inner {
    store: Arc<dyn RunStore>,
    pipeline: Arc<Pipeline>,
    policy: RetryPolicy,
    namespace: String,
    task_queue: String,
    permits: Semaphore,
    active: Mutex<HashMap<String, ActiveRun>>,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn RunStore>, pipeline: Arc<Pipeline>, config: &OrchestratorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                pipeline,
                policy: RetryPolicy::from_config(config),
                namespace: config.namespace.clone(),
                task_queue: config.task_queue.clone(),
                permits: Semaphore::new(config.max_concurrent_steps),
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Start a run for `entity_id`, or attach to the one already in progress.
    ///
    /// Returns as soon as the run is durably recorded; execution continues
    /// in the background. A terminal run under the same id is archived and
    /// replaced by a fresh generation.
    pub async fn start_or_attach(
        &self,
        run_id: &str,
        entity_id: &str,
        code: &str,
    ) -> Result<Submission, OrchestratorError> {
        let mut active = self.inner.active.lock().await;

        let admission = self
            .inner
            .store
            .create_or_attach(NewRun {
                namespace: self.inner.namespace.clone(),
                run_id: run_id.to_string(),
                entity_id: entity_id.to_string(),
                task_queue: self.inner.task_queue.clone(),
                code: code.to_string(),
            })
            .await
            .map_err(OrchestratorError::unavailable)?;

        match admission {
            Admission::Active(run) => {
                if !active.contains_key(run_id) && run.task_queue == self.inner.task_queue {
                    // No driver here: the last one gave up on a failed checkpoint.
                    let run = self
                        .inner
                        .store
                        .get(&self.inner.namespace, run_id)
                        .await
                        .map_err(OrchestratorError::unavailable)?
                        .ok_or_else(|| OrchestratorError::RunNotFound(run_id.to_string()))?;
                    if !run.state.is_terminal() {
                        tracing::info!(run_id, generation = run.generation, state = %run.state, "reattaching driver to orphaned run");
                        let generation = run.generation;
                        self.spawn(&mut active, run);
                        return Ok(Submission::Attached {
                            run_id: run_id.to_string(),
                            generation,
                        });
                    }
                }
                tracing::debug!(run_id, generation = run.generation, state = %run.state, "run already active");
                Ok(Submission::Attached {
                    run_id: run.run_id,
                    generation: run.generation,
                })
            }
            Admission::Created(run) => {
                tracing::info!(run_id, entity_id, generation = run.generation, "run started");
                let generation = run.generation;
                self.spawn(&mut active, run);
                Ok(Submission::Started {
                    run_id: run_id.to_string(),
                    generation,
                })
            }
        }
    }

    /// Resume every non-terminal run of this task queue that is not already
    /// executing in this process. Returns how many were resumed.
    pub async fn resume_incomplete(&self) -> Result<usize, OrchestratorError> {
        let filter = RunFilter {
            task_queue: Some(self.inner.task_queue.clone()),
            ..RunFilter::default()
        };
        let candidates = self
            .inner
            .store
            .list(&self.inner.namespace, &filter)
            .await
            .map_err(OrchestratorError::unavailable)?;

        let mut active = self.inner.active.lock().await;
        let mut resumed = 0;
        for summary in candidates.into_iter().filter(|r| !r.state.is_terminal()) {
            if active.contains_key(&summary.run_id) {
                continue;
            }
            let Some(run) = self
                .inner
                .store
                .get(&self.inner.namespace, &summary.run_id)
                .await
                .map_err(OrchestratorError::unavailable)?
            else {
                continue;
            };
            if run.state.is_terminal() {
                continue;
            }
            tracing::info!(run_id = %run.run_id, state = %run.state, "resuming run");
            self.spawn(&mut active, run);
            resumed += 1;
        }
        Ok(resumed)
    }

    /// Request cancellation. Takes effect at the next step boundary and ends
    /// the run `Failed` with `last_error = "cancelled"`.
    ///
    /// Returns `false` if the run had already finished.
    pub async fn cancel(&self, run_id: &str) -> Result<bool, OrchestratorError> {
        if let Some(active) = self.inner.active.lock().await.get(run_id) {
            tracing::info!(run_id, "cancellation requested");
            active.cancel.cancel();
            return Ok(true);
        }

        let run = self.status(run_id).await?;
        if run.state.is_terminal() {
            return Ok(false);
        }
        // Not executing here: no step is in flight to wait for.
        self.inner
            .store
            .transition(&run.key(), RunState::Failed, Some("cancelled"))
            .await
            .map_err(OrchestratorError::unavailable)?;
        tracing::info!(run_id, "run cancelled");
        Ok(true)
    }

    pub async fn status(&self, run_id: &str) -> Result<Run, OrchestratorError> {
        self.inner
            .store
            .get(&self.inner.namespace, run_id)
            .await
            .map_err(OrchestratorError::unavailable)?
            .ok_or_else(|| OrchestratorError::RunNotFound(run_id.to_string()))
    }

    /// Wait until the run is terminal, or until this process stops driving
    /// it, and return its latest record.
    pub async fn wait(&self, run_id: &str) -> Result<Run, OrchestratorError> {
        let receiver = self
            .inner
            .active
            .lock()
            .await
            .get(run_id)
            .map(|a| a.state.clone());

        if let Some(mut rx) = receiver {
            // Err means the driver went away without reaching a terminal state.
            let _ = rx.wait_for(|s| s.is_terminal()).await;
        }
        self.status(run_id).await
    }

    pub async fn list(&self, filter: &RunFilter) -> Result<Vec<Run>, OrchestratorError> {
        self.inner
            .store
            .list(&self.inner.namespace, filter)
            .await
            .map_err(OrchestratorError::unavailable)
    }

    /// Delete terminal runs not updated within `retention`.
    pub async fn prune(&self, retention: Duration) -> Result<u64, OrchestratorError> {
        let retention = chrono::Duration::from_std(retention)
            .map_err(|e| OrchestratorError::unavailable(anyhow!(e)))?;
        let removed = self
            .inner
            .store
            .prune(&self.inner.namespace, Utc::now() - retention)
            .await
            .map_err(OrchestratorError::unavailable)?;
        tracing::info!(removed, "pruned finished runs");
        Ok(removed)
    }

    /// Number of runs executing in this process.
    pub async fn active_runs(&self) -> usize {
        self.inner.active.lock().await.len()
    }

    fn spawn(&self, active: &mut HashMap<String, ActiveRun>, run: Run) {
        let cancel = CancellationToken::new();
        let (tx, rx) = watch::channel(run.state);
        active.insert(
            run.run_id.clone(),
            ActiveRun {
                generation: run.generation,
                cancel: cancel.clone(),
                state: rx,
            },
        );

        let inner = self.inner.clone();
        let span = tracing::info_span!(
            "run",
            run_id = %run.run_id,
            entity_id = %run.entity_id,
            generation = run.generation
        );
        tokio::spawn(
            async move {
                let run_id = run.run_id.clone();
                let generation = run.generation;
                match inner.execute(run, &cancel, &tx).await {
                    Ok(state) => tracing::info!(state = %state, "run finished"),
                    Err(e) => tracing::error!(error = %format!("{:#}", e), "run abandoned, will resume on next event or restart"),
                }
                let mut active = inner.active.lock().await;
                if active.get(&run_id).is_some_and(|a| a.generation == generation) {
                    active.remove(&run_id);
                }
            }
            .instrument(span),
        );
    }
}

/// Step outputs recovered from checkpoints and filled in as the run goes.
#[derive(Default)]
struct RunContext {
    summary: Option<String>,
    overall_embedding: Option<Vec<f32>>,
    chunks: Option<Vec<String>>,
    chunk_summaries: Vec<Option<String>>,
    chunk_summaries_done: bool,
    chunk_embeddings: Option<Vec<Vec<f32>>>,
}

fn decode<T: DeserializeOwned>(snap: &StepSnapshot) -> anyhow::Result<Option<T>> {
    snap.output
        .clone()
        .map(serde_json::from_value)
        .transpose()
        .with_context(|| format!("corrupt checkpoint for step {}", snap.step))
}

fn encode<T: Serialize>(value: &T) -> Result<Value, StepError> {
    serde_json::to_value(value).map_err(|e| StepError::permanent(format!("unserializable output: {}", e)))
}

fn missing(what: &str) -> StepError {
    StepError::permanent(format!("missing checkpoint: {}", what))
}

impl RunContext {
    fn from_run(run: &Run) -> anyhow::Result<Self> {
        let mut ctx = Self::default();
        for snap in &run.steps {
            match snap.step {
                RunState::SummarizingChunks => {
                    ctx.chunk_summaries = decode(snap)?.unwrap_or_default();
                    ctx.chunk_summaries_done = snap.completed;
                }
                _ if !snap.completed => {}
                RunState::Summarizing => ctx.summary = decode(snap)?,
                RunState::EmbeddingOverall => ctx.overall_embedding = decode(snap)?,
                RunState::Chunking => ctx.chunks = decode(snap)?,
                RunState::EmbeddingChunks => ctx.chunk_embeddings = decode(snap)?,
                _ => {}
            }
        }
        Ok(ctx)
    }

    fn partial(&self, step: RunState) -> Option<Value> {
        match step {
            RunState::SummarizingChunks if !self.chunk_summaries.is_empty() => {
                serde_json::to_value(&self.chunk_summaries).ok()
            }
            _ => None,
        }
    }

    fn finished_summaries(&self) -> Result<Vec<String>, StepError> {
        if !self.chunk_summaries_done {
            return Err(missing("chunk summaries"));
        }
        self.chunk_summaries
            .iter()
            .cloned()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| missing("chunk summaries"))
    }
}

impl Inner {
    async fn execute(
        &self,
        run: Run,
        cancel: &CancellationToken,
        tx: &watch::Sender<RunState>,
    ) -> anyhow::Result<RunState> {
        let key = run.key();
        let mut ctx = RunContext::from_run(&run)?;
        let mut state = run.state;

        if state == RunState::Pending {
            self.store.transition(&key, RunState::Summarizing, None).await?;
            state = RunState::Summarizing;
            tx.send_replace(state);
        }

        while state.is_step() {
            if cancel.is_cancelled() {
                self.store
                    .transition(&key, RunState::Failed, Some("cancelled"))
                    .await?;
                tracing::info!(step = %state, "run cancelled");
                state = RunState::Failed;
                tx.send_replace(state);
                break;
            }

            let snapshot = run.step(state);
            let prior_attempts = snapshot.map(|s| s.attempts).unwrap_or(0);
            let prior_error = snapshot.and_then(|s| s.last_error.clone());

            match self
                .run_step(&key, state, prior_attempts, prior_error, &run, &mut ctx)
                .await?
            {
                Ok(output) => {
                    let next = state
                        .next()
                        .ok_or_else(|| anyhow!("no state follows {}", state))?;
                    self.store.complete_step(&key, state, &output, next).await?;
                    tracing::debug!(step = %state, "step completed");
                    state = next;
                }
                Err(e) => {
                    let message = e.to_string();
                    self.store
                        .transition(&key, RunState::Failed, Some(&message))
                        .await?;
                    tracing::warn!(step = %state, error = %message, "run failed");
                    state = RunState::Failed;
                }
            }
            tx.send_replace(state);
        }

        Ok(state)
    }

    /// Run one step to success, permanent failure or exhaustion.
    ///
    /// The outer `Result` is a checkpoint failure; the inner one is the step
    /// outcome.
    async fn run_step(
        &self,
        key: &RunKey,
        step: RunState,
        prior_attempts: u32,
        prior_error: Option<String>,
        run: &Run,
        ctx: &mut RunContext,
    ) -> anyhow::Result<Result<Value, StepError>> {
        // Attempts interrupted by a restart still count.
        if !self.policy.can_retry(prior_attempts) {
            return Ok(Err(StepError::transient(format!(
                "{} attempts exhausted before restart, last error: {}",
                step,
                prior_error.as_deref().unwrap_or("none recorded")
            ))));
        }

        let mut attempts = prior_attempts;
        loop {
            attempts += 1;
            self.store.record_attempt(key, step, attempts, None, None).await?;

            let result = {
                let _permit = self.permits.acquire().await?;
                let timeout = self.policy.attempt_timeout;
                match tokio::time::timeout(timeout, self.attempt(step, run, ctx)).await {
                    Ok(result) => result,
                    Err(_) => Err(StepError::transient(format!(
                        "{} timed out after {}s",
                        step,
                        timeout.as_secs_f64()
                    ))),
                }
            };

            let err = match result {
                Ok(output) => return Ok(Ok(output)),
                Err(e) => e,
            };

            let message = err.to_string();
            self.store
                .record_attempt(key, step, attempts, Some(&message), ctx.partial(step).as_ref())
                .await?;

            if !err.is_retriable() || !self.policy.can_retry(attempts) {
                return Ok(Err(err));
            }

            let delay = self.policy.backoff(attempts);
            tracing::warn!(
                step = %step,
                attempt = attempts,
                error = %message,
                delay_ms = delay.as_millis() as u64,
                "step attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// A single attempt of `step`, recording its output in `ctx` on success.
    async fn attempt(&self, step: RunState, run: &Run, ctx: &mut RunContext) -> Result<Value, StepError> {
        let pipeline = &self.pipeline;
        match step {
            RunState::Summarizing => {
                let summary = pipeline.summarize_whole(&run.code).await?;
                let output = encode(&summary)?;
                ctx.summary = Some(summary);
                Ok(output)
            }
            RunState::EmbeddingOverall => {
                let summary = ctx.summary.as_deref().ok_or_else(|| missing("overall summary"))?;
                let embedding = pipeline.embed_one(summary).await?;
                let output = encode(&embedding)?;
                ctx.overall_embedding = Some(embedding);
                Ok(output)
            }
            RunState::Chunking => {
                let chunks = pipeline.chunk(&run.code)?;
                tracing::debug!(chunks = chunks.len(), "chunked snippet");
                let output = encode(&chunks)?;
                ctx.chunks = Some(chunks);
                Ok(output)
            }
            RunState::SummarizingChunks => {
                let chunks = ctx.chunks.as_ref().ok_or_else(|| missing("chunks"))?;
                pipeline
                    .summarize_chunks(chunks, &mut ctx.chunk_summaries)
                    .await?;
                ctx.chunk_summaries_done = true;
                encode(&ctx.chunk_summaries)
            }
            RunState::EmbeddingChunks => {
                let summaries = ctx.finished_summaries()?;
                let embeddings = pipeline.embed_many(&summaries).await?;
                let output = encode(&embeddings)?;
                ctx.chunk_embeddings = Some(embeddings);
                Ok(output)
            }
            RunState::Indexing => {
                let doc = compose_document(DocumentParts {
                    entity_id: run.entity_id.clone(),
                    code: run.code.clone(),
                    overall_summary: ctx.summary.clone().ok_or_else(|| missing("overall summary"))?,
                    overall_embedding: ctx
                        .overall_embedding
                        .clone()
                        .ok_or_else(|| missing("overall embedding"))?,
                    chunks: ctx.chunks.clone().ok_or_else(|| missing("chunks"))?,
                    chunk_summaries: ctx.finished_summaries()?,
                    chunk_embeddings: ctx
                        .chunk_embeddings
                        .clone()
                        .ok_or_else(|| missing("chunk embeddings"))?,
                    created_at: run.created_at,
                })?;
                let result: IndexResult = pipeline.write_index(&doc).await?;
                tracing::info!(document_id = %result.document_id, chunks = doc.chunks.len(), "document indexed");
                encode(&result)
            }
            other => Err(StepError::permanent(format!("{} is not a step", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_is_deterministic() {
        assert_eq!(run_id_for("abc-123"), "snippet-ingestion-abc-123");
        assert_eq!(run_id_for("abc-123"), run_id_for("abc-123"));
    }

    #[test]
    fn test_context_from_partial_checkpoint() {
        let now = Utc::now();
        let run = Run {
            run_id: "r".to_string(),
            entity_id: "e".to_string(),
            namespace: "default".to_string(),
            task_queue: "q".to_string(),
            generation: 1,
            state: RunState::SummarizingChunks,
            status: RunStatus::Running,
            code: "ab".to_string(),
            last_error: None,
            created_at: now,
            updated_at: now,
            steps: vec![
                StepSnapshot {
                    step: RunState::Summarizing,
                    attempts: 1,
                    completed: true,
                    output: Some(serde_json::json!("sum")),
                    last_error: None,
                },
                StepSnapshot {
                    step: RunState::Chunking,
                    attempts: 1,
                    completed: true,
                    output: Some(serde_json::json!(["a", "b"])),
                    last_error: None,
                },
                StepSnapshot {
                    step: RunState::SummarizingChunks,
                    attempts: 1,
                    completed: false,
                    output: Some(serde_json::json!(["part 1", null])),
                    last_error: Some("transient: 503".to_string()),
                },
            ],
        };

        let ctx = RunContext::from_run(&run).unwrap();
        assert_eq!(ctx.summary.as_deref(), Some("sum"));
        assert_eq!(ctx.chunks.as_ref().map(Vec::len), Some(2));
        assert_eq!(ctx.chunk_summaries, vec![Some("part 1".to_string()), None]);
        assert!(!ctx.chunk_summaries_done);
        assert!(ctx.finished_summaries().is_err());
        assert!(ctx.partial(RunState::SummarizingChunks).is_some());
        assert!(ctx.partial(RunState::Chunking).is_none());
    }
}
