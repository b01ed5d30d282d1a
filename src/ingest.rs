//! `snip ingest`: publish snippet events from a JSON Lines file.
//!
//! Every non-empty line is published verbatim, keyed by its `id` field when
//! there is one. Validation happens in the consumer, so a bad line becomes a
//! discarded poison message exactly as it would from any other producer.
//!
//! With `--process` the command also drains the broker in-process and waits
//! for the resulting runs, which is handy with the offline provider.

use anyhow::{bail, Context, Result};
use std::path::Path;

use crate::broker::key_of;
use crate::config::TopicsConfig;
use crate::orchestrator::RunState;
use crate::runtime::App;

/// Resolve `created`/`updated`/`deleted` to the configured topic name.
/// Any other value must already be one of the configured names.
pub fn resolve_topic(topics: &TopicsConfig, topic: &str) -> Result<String> {
    let resolved = match topic {
        "created" => topics.created.clone(),
        "updated" => topics.updated.clone(),
        "deleted" => topics.deleted.clone(),
        other => other.to_string(),
    };
    if !topics.all().contains(&resolved) {
        bail!(
            "Unknown topic '{}'. Use created, updated, deleted or one of: {}",
            topic,
            topics.all().join(", ")
        );
    }
    Ok(resolved)
}

/// Publish each non-empty line of `file`. Returns the number published.
pub async fn publish_file(app: &App, file: &Path, topic: &str) -> Result<usize> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let mut published = 0;
    for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let key = key_of(line.as_bytes());
        let (partition, offset) = app
            .broker
            .publish(topic, key.as_deref(), line.as_bytes())
            .await?;
        tracing::debug!(topic, partition, offset, "published event");
        published += 1;
    }
    Ok(published)
}

pub async fn run_ingest(app: &App, file: &Path, topic: &str, process: bool) -> Result<()> {
    let topic = resolve_topic(&app.config.broker.topics, topic)?;
    let published = publish_file(app, file, &topic).await?;

    println!("ingest {} -> {}", file.display(), topic);
    println!("  published: {}", published);

    if !process {
        println!("ok");
        return Ok(());
    }

    let stats = app.consumer.drain().await?;
    println!("  runs started: {}", stats.started);
    println!("  runs attached: {}", stats.attached);
    println!("  deletes skipped: {}", stats.skipped);
    println!("  discarded: {}", stats.discarded);
    if stats.withheld > 0 {
        println!("  withheld: {}", stats.withheld);
    }

    let mut failed = 0;
    for run_id in &stats.run_ids {
        let run = app.orchestrator.wait(run_id).await?;
        println!(
            "  {}  {}{}",
            run.run_id,
            run.state,
            run.last_error
                .as_deref()
                .map(|e| format!("  ({})", e))
                .unwrap_or_default()
        );
        // A non-terminal run here lost its driver and did not finish.
        if run.state != RunState::Completed {
            failed += 1;
        }
    }

    if failed > 0 {
        bail!("{} run(s) did not complete", failed);
    }
    println!("ok");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_topic() {
        let topics = TopicsConfig::default();
        assert_eq!(resolve_topic(&topics, "created").unwrap(), "snippet.created");
        assert_eq!(resolve_topic(&topics, "snippet.deleted").unwrap(), "snippet.deleted");
        assert!(resolve_topic(&topics, "snippet.moved").is_err());
    }
}
