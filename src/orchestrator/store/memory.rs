//! In-memory [`RunStore`] for tests.
//!
//! Behaves like [`SqliteRunStore`](super::SqliteRunStore) but nothing
//! survives the process. [`MemoryRunStore::set_available`] simulates an
//! unreachable store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::{Admission, NewRun, Run, RunFilter, RunKey, RunStore, StepSnapshot};
use crate::orchestrator::state::RunState;

type Key = (String, String);

pub struct MemoryRunStore {
    runs: Mutex<HashMap<Key, Run>>,
    history: Mutex<Vec<Run>>,
    available: AtomicBool,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self {
            runs: Mutex::new(HashMap::new()),
            history: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
        }
    }

    /// While unavailable every call fails, as if the store were unreachable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Generations archived so far.
    pub fn archived(&self) -> usize {
        self.history.lock().map(|h| h.len()).unwrap_or(0)
    }

    fn check_available(&self) -> Result<()> {
        if !self.available.load(Ordering::SeqCst) {
            bail!("run store unavailable");
        }
        Ok(())
    }

    fn with_run<T>(&self, key: &RunKey, f: impl FnOnce(&mut Run) -> Result<T>) -> Result<T> {
        self.check_available()?;
        let mut runs = self.runs.lock().map_err(|_| anyhow!("run store lock poisoned"))?;
        let run = runs
            .get_mut(&(key.namespace.clone(), key.run_id.clone()))
            .filter(|r| r.generation == key.generation)
            .ok_or_else(|| anyhow!("run {} generation {} not found", key.run_id, key.generation))?;
        f(run)
    }
}

impl Default for MemoryRunStore {
    fn default() -> Self {
        Self::new()
    }
}

fn set_state(run: &mut Run, state: RunState) {
    run.state = state;
    run.status = state.status();
    run.updated_at = Utc::now();
}

fn snapshot_mut(run: &mut Run, step: RunState) -> &mut StepSnapshot {
    if let Some(pos) = run.steps.iter().position(|s| s.step == step) {
        return &mut run.steps[pos];
    }
    run.steps.push(StepSnapshot {
        step,
        attempts: 0,
        completed: false,
        output: None,
        last_error: None,
    });
    let last = run.steps.len() - 1;
    &mut run.steps[last]
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn create_or_attach(&self, new: NewRun) -> Result<Admission> {
        self.check_available()?;
        let mut runs = self.runs.lock().map_err(|_| anyhow!("run store lock poisoned"))?;
        let key = (new.namespace.clone(), new.run_id.clone());
        let now = Utc::now();

        let generation = match runs.get(&key) {
            Some(existing) if !existing.state.is_terminal() => {
                return Ok(Admission::Active(existing.clone()));
            }
            Some(existing) => {
                let archived = existing.clone();
                let generation = archived.generation + 1;
                self.history
                    .lock()
                    .map_err(|_| anyhow!("run store lock poisoned"))?
                    .push(archived);
                generation
            }
            None => 1,
        };

        let run = Run {
            run_id: new.run_id,
            entity_id: new.entity_id,
            namespace: new.namespace,
            task_queue: new.task_queue,
            generation,
            state: RunState::Pending,
            status: RunState::Pending.status(),
            code: new.code,
            last_error: None,
            created_at: now,
            updated_at: now,
            steps: Vec::new(),
        };
        runs.insert(key, run.clone());
        Ok(Admission::Created(run))
    }

    async fn get(&self, namespace: &str, run_id: &str) -> Result<Option<Run>> {
        self.check_available()?;
        let runs = self.runs.lock().map_err(|_| anyhow!("run store lock poisoned"))?;
        Ok(runs
            .get(&(namespace.to_string(), run_id.to_string()))
            .cloned())
    }

    async fn transition(&self, key: &RunKey, state: RunState, error: Option<&str>) -> Result<()> {
        self.with_run(key, |run| {
            if !run.state.can_transition_to(state) {
                bail!("illegal transition {} -> {} for {}", run.state, state, run.run_id);
            }
            set_state(run, state);
            if let Some(e) = error {
                run.last_error = Some(e.to_string());
            }
            Ok(())
        })
    }

    async fn record_attempt(
        &self,
        key: &RunKey,
        step: RunState,
        attempts: u32,
        error: Option<&str>,
        partial: Option<&Value>,
    ) -> Result<()> {
        self.with_run(key, |run| {
            if run.state != step {
                bail!("run {} is in {}, not {}", run.run_id, run.state, step);
            }
            let snap = snapshot_mut(run, step);
            snap.attempts = attempts;
            if let Some(e) = error {
                snap.last_error = Some(e.to_string());
            }
            if let Some(p) = partial {
                snap.output = Some(p.clone());
            }
            run.updated_at = Utc::now();
            Ok(())
        })
    }

    async fn complete_step(
        &self,
        key: &RunKey,
        step: RunState,
        output: &Value,
        next: RunState,
    ) -> Result<()> {
        self.with_run(key, |run| {
            if run.state != step || !step.can_transition_to(next) {
                bail!("cannot complete {} while run {} is in {}", step, run.run_id, run.state);
            }
            let snap = snapshot_mut(run, step);
            snap.completed = true;
            snap.output = Some(output.clone());
            set_state(run, next);
            Ok(())
        })
    }

    async fn list(&self, namespace: &str, filter: &RunFilter) -> Result<Vec<Run>> {
        self.check_available()?;
        let runs = self.runs.lock().map_err(|_| anyhow!("run store lock poisoned"))?;
        let mut out: Vec<Run> = runs
            .values()
            .filter(|r| r.namespace == namespace)
            .filter(|r| filter.status.map_or(true, |s| r.status == s))
            .filter(|r| filter.task_queue.as_ref().map_or(true, |q| &r.task_queue == q))
            .map(|r| Run {
                steps: Vec::new(),
                ..r.clone()
            })
            .collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn prune(&self, namespace: &str, before: DateTime<Utc>) -> Result<u64> {
        self.check_available()?;
        let mut runs = self.runs.lock().map_err(|_| anyhow!("run store lock poisoned"))?;
        let doomed: Vec<Key> = runs
            .iter()
            .filter(|(_, r)| r.namespace == namespace && r.state.is_terminal() && r.updated_at < before)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            runs.remove(key);
        }
        let mut history = self.history.lock().map_err(|_| anyhow!("run store lock poisoned"))?;
        history.retain(|r| !doomed.contains(&(r.namespace.clone(), r.run_id.clone())));
        Ok(doomed.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::super::contract;
    use super::*;

    #[tokio::test]
    async fn test_admission() {
        let store = MemoryRunStore::new();
        contract::admission(&store).await;
        assert_eq!(store.archived(), 1);
    }

    #[tokio::test]
    async fn test_checkpoints() {
        contract::checkpoints(&MemoryRunStore::new()).await;
    }

    #[tokio::test]
    async fn test_prune() {
        contract::prune(&MemoryRunStore::new()).await;
    }

    #[tokio::test]
    async fn test_unavailable() {
        let store = MemoryRunStore::new();
        store.set_available(false);
        assert!(store
            .create_or_attach(contract::new_run("r"))
            .await
            .is_err());
        store.set_available(true);
        assert!(store.create_or_attach(contract::new_run("r")).await.is_ok());
    }
}
