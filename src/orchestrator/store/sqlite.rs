//! SQLite-backed [`RunStore`].
//!
//! | Table | Contents |
//! |-------|----------|
//! | `runs` | current generation of every run, keyed by `(namespace, run_id)` |
//! | `run_steps` | attempt counters and outputs per step of a generation |
//! | `run_history` | terminal generations archived when a fresh run replaced them |
//!
//! State changes are conditional `UPDATE`s on `(generation, state)`, so a
//! write from a stale or out-of-order caller affects zero rows and is
//! reported as an error.

use std::path::Path;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::{from_millis, Admission, NewRun, Run, RunFilter, RunKey, RunStore, StepSnapshot};
use crate::orchestrator::state::{RunState, STEPS};
use crate::{db, migrate};

const TERMINAL: &str = "('completed', 'failed')";

pub struct SqliteRunStore {
    pool: SqlitePool,
}

impl SqliteRunStore {
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path).await?;
        migrate::migrate_runs(&pool).await?;
        Ok(Self { pool })
    }

    async fn load_steps(&self, namespace: &str, run_id: &str, generation: i64) -> Result<Vec<StepSnapshot>> {
        let rows = sqlx::query(
            "SELECT step, attempts, completed, output_json, last_error FROM run_steps
             WHERE namespace = ? AND run_id = ? AND generation = ?",
        )
        .bind(namespace)
        .bind(run_id)
        .bind(generation)
        .fetch_all(&self.pool)
        .await?;

        let mut steps = Vec::with_capacity(rows.len());
        for row in rows {
            let step: String = row.get("step");
            let output: Option<String> = row.get("output_json");
            steps.push(StepSnapshot {
                step: step.parse()?,
                attempts: row.get::<i64, _>("attempts") as u32,
                completed: row.get::<i64, _>("completed") != 0,
                output: output
                    .map(|s| serde_json::from_str(&s))
                    .transpose()
                    .context("corrupt step output")?,
                last_error: row.get("last_error"),
            });
        }
        steps.sort_by_key(|s| STEPS.iter().position(|x| *x == s.step));
        Ok(steps)
    }
}

fn row_to_run(row: &SqliteRow) -> Result<Run> {
    let state: RunState = row.get::<String, _>("state").parse()?;
    Ok(Run {
        run_id: row.get("run_id"),
        entity_id: row.get("entity_id"),
        namespace: row.get("namespace"),
        task_queue: row.get("task_queue"),
        generation: row.get("generation"),
        state,
        status: state.status(),
        code: row.get("code"),
        last_error: row.get("last_error"),
        created_at: from_millis(row.get("created_at")),
        updated_at: from_millis(row.get("updated_at")),
        steps: Vec::new(),
    })
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// States from which `target` may be entered.
fn predecessors(target: RunState) -> Vec<&'static str> {
    [RunState::Pending]
        .into_iter()
        .chain(STEPS)
        .filter(|s| s.can_transition_to(target))
        .map(|s| s.as_str())
        .collect()
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[async_trait]
impl RunStore for SqliteRunStore {
    async fn create_or_attach(&self, new: NewRun) -> Result<Admission> {
        let now = now_millis();
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query("SELECT generation, state FROM runs WHERE namespace = ? AND run_id = ?")
            .bind(&new.namespace)
            .bind(&new.run_id)
            .fetch_optional(&mut *tx)
            .await?;

        let generation = match existing {
            None => {
                let inserted = sqlx::query(
                    "INSERT INTO runs (namespace, run_id, entity_id, generation, task_queue, state, code, last_error, created_at, updated_at)
                     VALUES (?, ?, ?, 1, ?, 'pending', ?, NULL, ?, ?)
                     ON CONFLICT(namespace, run_id) DO NOTHING",
                )
                .bind(&new.namespace)
                .bind(&new.run_id)
                .bind(&new.entity_id)
                .bind(&new.task_queue)
                .bind(&new.code)
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                if inserted.rows_affected() == 0 {
                    // Lost a race with another admitter.
                    let run = self
                        .get(&new.namespace, &new.run_id)
                        .await?
                        .context("run vanished during admission")?;
                    return Ok(Admission::Active(run));
                }
                1
            }
            Some(row) => {
                let generation: i64 = row.get("generation");
                let state: RunState = row.get::<String, _>("state").parse()?;
                if !state.is_terminal() {
                    tx.commit().await?;
                    let run = self
                        .get(&new.namespace, &new.run_id)
                        .await?
                        .context("run vanished during admission")?;
                    return Ok(Admission::Active(run));
                }

                sqlx::query(
                    "INSERT OR REPLACE INTO run_history (namespace, run_id, generation, entity_id, state, last_error, created_at, updated_at, archived_at)
                     SELECT namespace, run_id, generation, entity_id, state, last_error, created_at, updated_at, ?
                     FROM runs WHERE namespace = ? AND run_id = ?",
                )
                .bind(now)
                .bind(&new.namespace)
                .bind(&new.run_id)
                .execute(&mut *tx)
                .await?;

                sqlx::query("DELETE FROM run_steps WHERE namespace = ? AND run_id = ?")
                    .bind(&new.namespace)
                    .bind(&new.run_id)
                    .execute(&mut *tx)
                    .await?;

                let updated = sqlx::query(&format!(
                    "UPDATE runs SET generation = generation + 1, entity_id = ?, task_queue = ?, state = 'pending',
                        code = ?, last_error = NULL, created_at = ?, updated_at = ?
                     WHERE namespace = ? AND run_id = ? AND generation = ? AND state IN {}",
                    TERMINAL
                ))
                .bind(&new.entity_id)
                .bind(&new.task_queue)
                .bind(&new.code)
                .bind(now)
                .bind(now)
                .bind(&new.namespace)
                .bind(&new.run_id)
                .bind(generation)
                .execute(&mut *tx)
                .await?;
                if updated.rows_affected() != 1 {
                    bail!("run {} changed during admission", new.run_id);
                }
                tx.commit().await?;
                generation + 1
            }
        };

        Ok(Admission::Created(Run {
            run_id: new.run_id,
            entity_id: new.entity_id,
            namespace: new.namespace,
            task_queue: new.task_queue,
            generation,
            state: RunState::Pending,
            status: RunState::Pending.status(),
            code: new.code,
            last_error: None,
            created_at: from_millis(now),
            updated_at: from_millis(now),
            steps: Vec::new(),
        }))
    }

    async fn get(&self, namespace: &str, run_id: &str) -> Result<Option<Run>> {
        let row = sqlx::query("SELECT * FROM runs WHERE namespace = ? AND run_id = ?")
            .bind(namespace)
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut run = row_to_run(&row)?;
        run.steps = self.load_steps(namespace, run_id, run.generation).await?;
        Ok(Some(run))
    }

    async fn transition(&self, key: &RunKey, state: RunState, error: Option<&str>) -> Result<()> {
        let from = predecessors(state);
        if from.is_empty() {
            bail!("no transition leads to {}", state);
        }
        let sql = format!(
            "UPDATE runs SET state = ?, last_error = COALESCE(?, last_error), updated_at = ?
             WHERE namespace = ? AND run_id = ? AND generation = ? AND state IN ({})",
            placeholders(from.len())
        );
        let mut query = sqlx::query(&sql)
            .bind(state.as_str())
            .bind(error)
            .bind(now_millis())
            .bind(&key.namespace)
            .bind(&key.run_id)
            .bind(key.generation);
        for s in &from {
            query = query.bind(*s);
        }
        let result = query.execute(&self.pool).await?;
        if result.rows_affected() != 1 {
            bail!(
                "cannot move run {} (generation {}) to {}",
                key.run_id,
                key.generation,
                state
            );
        }
        Ok(())
    }

    async fn record_attempt(
        &self,
        key: &RunKey,
        step: RunState,
        attempts: u32,
        error: Option<&str>,
        partial: Option<&Value>,
    ) -> Result<()> {
        let now = now_millis();
        let partial = partial.map(serde_json::to_string).transpose()?;
        let mut tx = self.pool.begin().await?;

        let touched = sqlx::query(
            "UPDATE runs SET updated_at = ? WHERE namespace = ? AND run_id = ? AND generation = ? AND state = ?",
        )
        .bind(now)
        .bind(&key.namespace)
        .bind(&key.run_id)
        .bind(key.generation)
        .bind(step.as_str())
        .execute(&mut *tx)
        .await?;
        if touched.rows_affected() != 1 {
            bail!("run {} (generation {}) is not in {}", key.run_id, key.generation, step);
        }

        sqlx::query(
            "INSERT INTO run_steps (namespace, run_id, generation, step, attempts, completed, output_json, last_error, updated_at)
             VALUES (?, ?, ?, ?, ?, 0, ?, ?, ?)
             ON CONFLICT(namespace, run_id, generation, step) DO UPDATE SET
                attempts = excluded.attempts,
                output_json = COALESCE(excluded.output_json, run_steps.output_json),
                last_error = COALESCE(excluded.last_error, run_steps.last_error),
                updated_at = excluded.updated_at",
        )
        .bind(&key.namespace)
        .bind(&key.run_id)
        .bind(key.generation)
        .bind(step.as_str())
        .bind(attempts as i64)
        .bind(partial)
        .bind(error)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn complete_step(
        &self,
        key: &RunKey,
        step: RunState,
        output: &Value,
        next: RunState,
    ) -> Result<()> {
        if !step.can_transition_to(next) {
            bail!("illegal transition {} -> {}", step, next);
        }
        let now = now_millis();
        let output = serde_json::to_string(output)?;
        let mut tx = self.pool.begin().await?;

        let moved = sqlx::query(
            "UPDATE runs SET state = ?, updated_at = ?
             WHERE namespace = ? AND run_id = ? AND generation = ? AND state = ?",
        )
        .bind(next.as_str())
        .bind(now)
        .bind(&key.namespace)
        .bind(&key.run_id)
        .bind(key.generation)
        .bind(step.as_str())
        .execute(&mut *tx)
        .await?;
        if moved.rows_affected() != 1 {
            bail!("run {} (generation {}) is not in {}", key.run_id, key.generation, step);
        }

        sqlx::query(
            "INSERT INTO run_steps (namespace, run_id, generation, step, attempts, completed, output_json, last_error, updated_at)
             VALUES (?, ?, ?, ?, 1, 1, ?, NULL, ?)
             ON CONFLICT(namespace, run_id, generation, step) DO UPDATE SET
                completed = 1,
                output_json = excluded.output_json,
                updated_at = excluded.updated_at",
        )
        .bind(&key.namespace)
        .bind(&key.run_id)
        .bind(key.generation)
        .bind(step.as_str())
        .bind(output)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn list(&self, namespace: &str, filter: &RunFilter) -> Result<Vec<Run>> {
        let states: Vec<&'static str> = filter
            .status
            .map(|s| RunState::with_status(s).iter().map(|st| st.as_str()).collect())
            .unwrap_or_default();

        let mut sql = String::from("SELECT * FROM runs WHERE namespace = ?");
        if filter.status.is_some() {
            sql.push_str(&format!(" AND state IN ({})", placeholders(states.len())));
        }
        if filter.task_queue.is_some() {
            sql.push_str(" AND task_queue = ?");
        }
        sql.push_str(" ORDER BY updated_at DESC LIMIT ?");

        let mut query = sqlx::query(&sql).bind(namespace);
        for s in &states {
            query = query.bind(*s);
        }
        if let Some(q) = &filter.task_queue {
            query = query.bind(q);
        }
        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
        let rows = query.bind(limit).fetch_all(&self.pool).await?;

        rows.iter().map(row_to_run).collect()
    }

    async fn prune(&self, namespace: &str, before: DateTime<Utc>) -> Result<u64> {
        let cutoff = before.timestamp_millis();
        let doomed = format!(
            "SELECT run_id FROM runs WHERE namespace = ? AND state IN {} AND updated_at < ?",
            TERMINAL
        );
        let mut tx = self.pool.begin().await?;

        for table in ["run_steps", "run_history"] {
            sqlx::query(&format!(
                "DELETE FROM {} WHERE namespace = ? AND run_id IN ({})",
                table, doomed
            ))
            .bind(namespace)
            .bind(namespace)
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;
        }

        let removed = sqlx::query(&format!(
            "DELETE FROM runs WHERE namespace = ? AND state IN {} AND updated_at < ?",
            TERMINAL
        ))
        .bind(namespace)
        .bind(cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(removed)
    }
}
