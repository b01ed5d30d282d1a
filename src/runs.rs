//! `snip runs`: operator views over the run store.

use anyhow::Result;
use std::time::Duration;

use crate::error::OrchestratorError;
use crate::orchestrator::{run_id_for, Run, RunFilter, RunStatus};
use crate::runtime::App;

/// Look a run up by run id, falling back to treating `id` as an entity id.
pub async fn find_run(app: &App, id: &str) -> Result<Run, OrchestratorError> {
    match app.orchestrator.status(id).await {
        Err(OrchestratorError::RunNotFound(_)) => app.orchestrator.status(&run_id_for(id)).await,
        other => other,
    }
}

pub async fn run_list(app: &App, status: Option<String>, limit: usize) -> Result<()> {
    let status = status.as_deref().map(str::parse::<RunStatus>).transpose()?;
    let runs = app
        .orchestrator
        .list(&RunFilter {
            status,
            task_queue: None,
            limit: Some(limit),
        })
        .await?;

    if runs.is_empty() {
        println!("No runs.");
        return Ok(());
    }

    println!(
        "{:<48} {:>4} {:<20} {:<20}",
        "RUN", "GEN", "STATE", "UPDATED"
    );
    for run in &runs {
        println!(
            "{:<48} {:>4} {:<20} {:<20}",
            run.run_id,
            run.generation,
            run.state.as_str(),
            run.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

pub async fn run_show(app: &App, id: &str) -> Result<()> {
    let run = find_run(app, id).await?;

    println!("run:        {}", run.run_id);
    println!("entity:     {}", run.entity_id);
    println!("generation: {}", run.generation);
    println!("state:      {} ({})", run.state, run.status);
    println!("queue:      {}", run.task_queue);
    println!("created:    {}", run.created_at.to_rfc3339());
    println!("updated:    {}", run.updated_at.to_rfc3339());
    if let Some(err) = &run.last_error {
        println!("error:      {}", err);
    }
    if let Some(result) = run.index_result() {
        println!("document:   {} (success: {})", result.document_id, result.success);
    }

    if !run.steps.is_empty() {
        println!();
        println!("  {:<20} {:>8}  {:<9} LAST ERROR", "STEP", "ATTEMPTS", "DONE");
        for step in &run.steps {
            println!(
                "  {:<20} {:>8}  {:<9} {}",
                step.step.as_str(),
                step.attempts,
                if step.completed { "yes" } else { "no" },
                step.last_error.as_deref().unwrap_or("-")
            );
        }
    }
    Ok(())
}

pub async fn run_cancel(app: &App, id: &str) -> Result<()> {
    let run = find_run(app, id).await?;
    if app.orchestrator.cancel(&run.run_id).await? {
        println!("{} cancelled", run.run_id);
    } else {
        println!("{} already {}", run.run_id, run.state);
    }
    Ok(())
}

pub async fn run_prune(app: &App, older_than_hours: Option<u64>) -> Result<()> {
    let hours = older_than_hours.unwrap_or(app.config.orchestrator.retention_hours);
    let removed = app
        .orchestrator
        .prune(Duration::from_secs(hours * 3600))
        .await?;
    println!("pruned {} finished run(s) older than {}h", removed, hours);
    Ok(())
}
