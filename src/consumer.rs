//! Event consumer.
//!
//! Pulls snippet change notifications from the [`Broker`], validates them
//! into [`SnippetEvent`]s and hands them to the [`Orchestrator`]. The
//! consumer owns offset-commit timing:
//!
//! | Outcome | Commit? |
//! |---------|---------|
//! | run started or attached | yes |
//! | delete event (no-op) | yes |
//! | invalid message (poison) | yes, after logging |
//! | orchestrator unavailable | **no**; partition rewound and retried with backoff |
//!
//! Each partition is consumed by its own task, strictly in offset order.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::Value;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::broker::{Broker, Message, TopicPartition};
use crate::config::{BrokerConfig, TopicsConfig};
use crate::error::{OrchestratorError, ValidationError};
use crate::models::{EventKind, SnippetEvent};
use crate::orchestrator::{run_id_for, Orchestrator, Submission};

const MAX_ID_BYTES: usize = 256;
const MAX_WITHHOLD_BACKOFF: Duration = Duration::from_secs(30);

/// Map a topic name to the kind of event it carries.
pub fn classify_topic(topics: &TopicsConfig, topic: &str) -> Option<EventKind> {
    if topic == topics.created {
        Some(EventKind::Created)
    } else if topic == topics.updated {
        Some(EventKind::Updated)
    } else if topic == topics.deleted {
        Some(EventKind::Deleted)
    } else {
        None
    }
}

/// Entity ids are opaque, but must be usable as a document id and a run id.
pub fn validate_entity_id(id: &str) -> Result<(), ValidationError> {
    if id.is_empty() {
        return Err(ValidationError::InvalidId("empty".to_string()));
    }
    if id.len() > MAX_ID_BYTES {
        return Err(ValidationError::InvalidId(format!(
            "{} bytes exceeds {}",
            id.len(),
            MAX_ID_BYTES
        )));
    }
    if id.chars().any(char::is_control) {
        return Err(ValidationError::InvalidId(format!("{:?} contains control characters", id)));
    }
    // URL path normalization drops dot segments, leaving no document id.
    if id == "." || id == ".." {
        return Err(ValidationError::InvalidId(format!("{:?} is a dot segment", id)));
    }
    Ok(())
}

/// Parse and validate a raw message body.
pub fn parse_event(topics: &TopicsConfig, topic: &str, payload: &[u8]) -> Result<SnippetEvent, ValidationError> {
    let kind = classify_topic(topics, topic).ok_or_else(|| ValidationError::UnknownTopic(topic.to_string()))?;

    let body: Value = serde_json::from_slice(payload).map_err(|e| ValidationError::Malformed(e.to_string()))?;
    let Value::Object(fields) = body else {
        return Err(ValidationError::Malformed("expected an object".to_string()));
    };

    let entity_id = fields
        .get("id")
        .and_then(Value::as_str)
        .ok_or(ValidationError::MissingField("id"))?
        .to_string();
    validate_entity_id(&entity_id)?;

    let code = || {
        fields
            .get("code")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(ValidationError::MissingField("code"))
    };

    Ok(match kind {
        EventKind::Created => SnippetEvent::Created { entity_id, code: code()? },
        EventKind::Updated => SnippetEvent::Updated { entity_id, code: code()? },
        EventKind::Deleted => SnippetEvent::Deleted { entity_id },
    })
}

/// What the consumer did with one message.
#[derive(Debug)]
pub enum Disposition {
    Submitted(Submission),
    /// Delete event: accepted, no run started.
    Skipped { entity_id: String },
    /// Poison message: logged and dropped.
    Discarded(ValidationError),
    /// Orchestrator unavailable: left uncommitted for redelivery.
    Withheld(OrchestratorError),
}

impl Disposition {
    pub fn should_commit(&self) -> bool {
        !matches!(self, Self::Withheld(_))
    }
}

/// Per-outcome counts from [`Consumer::drain`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainStats {
    pub started: usize,
    pub attached: usize,
    pub skipped: usize,
    pub discarded: usize,
    pub withheld: usize,
    pub run_ids: Vec<String>,
}

impl DrainStats {
    fn record(&mut self, disposition: &Disposition) {
        match disposition {
            Disposition::Submitted(s) => {
                match s {
                    Submission::Started { .. } => self.started += 1,
                    Submission::Attached { .. } => self.attached += 1,
                }
                if !self.run_ids.iter().any(|r| r == s.run_id()) {
                    self.run_ids.push(s.run_id().to_string());
                }
            }
            Disposition::Skipped { .. } => self.skipped += 1,
            Disposition::Discarded(_) => self.discarded += 1,
            Disposition::Withheld(_) => self.withheld += 1,
        }
    }
}

#[derive(Clone)]
pub struct Consumer {
    broker: Arc<dyn Broker>,
    orchestrator: Orchestrator,
    topics: TopicsConfig,
    group_id: String,
    poll_interval: Duration,
}

impl Consumer {
    pub fn new(broker: Arc<dyn Broker>, orchestrator: Orchestrator, config: &BrokerConfig) -> Self {
        Self {
            broker,
            orchestrator,
            topics: config.topics.clone(),
            group_id: config.group_id.clone(),
            poll_interval: config.poll_interval(),
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Process one message and commit its offset unless the orchestrator
    /// was unavailable. Errors only when the commit itself fails.
    pub async fn on_message(&self, msg: &Message) -> Result<Disposition> {
        let disposition = self.dispatch(msg).await;
        if disposition.should_commit() {
            self.broker
                .commit(&self.group_id, &msg.topic_partition(), msg.offset)
                .await?;
        }
        Ok(disposition)
    }

    async fn dispatch(&self, msg: &Message) -> Disposition {
        let event = match parse_event(&self.topics, &msg.topic, &msg.payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(
                    topic = %msg.topic,
                    partition = msg.partition,
                    offset = msg.offset,
                    error = %e,
                    "discarding invalid message"
                );
                return Disposition::Discarded(e);
            }
        };

        let entity_id = event.entity_id().to_string();
        let Some(code) = event.code() else {
            tracing::info!(entity_id = %entity_id, "delete event accepted, nothing to run");
            return Disposition::Skipped { entity_id };
        };

        let run_id = run_id_for(&entity_id);
        match self.orchestrator.start_or_attach(&run_id, &entity_id, code).await {
            Ok(submission) => {
                tracing::debug!(
                    run_id = %run_id,
                    kind = ?event.kind(),
                    offset = msg.offset,
                    "event submitted"
                );
                Disposition::Submitted(submission)
            }
            Err(e) => {
                tracing::warn!(
                    run_id = %run_id,
                    topic = %msg.topic,
                    partition = msg.partition,
                    offset = msg.offset,
                    error = %e,
                    "submission failed, offset not committed"
                );
                Disposition::Withheld(e)
            }
        }
    }

    /// Consume every assigned partition until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let assignments = self.broker.assignments(&self.topics.all());
        tracing::info!(
            group = %self.group_id,
            partitions = assignments.len(),
            "consumer started"
        );

        let mut tasks = JoinSet::new();
        for tp in assignments {
            let consumer = self.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move { consumer.run_partition(tp, cancel).await });
        }
        while let Some(joined) = tasks.join_next().await {
            joined??;
        }
        tracing::info!("consumer stopped");
        Ok(())
    }

    async fn run_partition(&self, tp: TopicPartition, cancel: CancellationToken) -> Result<()> {
        let mut position = None;
        let mut backoff = self.poll_interval;

        while !cancel.is_cancelled() {
            let offset = match position {
                Some(offset) => offset,
                None => match self.broker.committed(&self.group_id, &tp).await {
                    Ok(offset) => *position.insert(offset),
                    Err(e) => {
                        tracing::warn!(partition = %tp, error = %format!("{:#}", e), "cannot read committed offset");
                        pause(&cancel, self.poll_interval).await;
                        continue;
                    }
                },
            };

            let msg = match self.broker.fetch(&tp, offset).await {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    pause(&cancel, self.poll_interval).await;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(partition = %tp, error = %format!("{:#}", e), "fetch failed");
                    pause(&cancel, self.poll_interval).await;
                    continue;
                }
            };

            match self.on_message(&msg).await {
                Ok(d) if d.should_commit() => {
                    position = Some(msg.offset + 1);
                    backoff = self.poll_interval;
                }
                Ok(_) => {
                    // Rewind to the committed offset and try again later.
                    position = None;
                    pause(&cancel, backoff).await;
                    backoff = (backoff * 2).min(MAX_WITHHOLD_BACKOFF);
                }
                Err(e) => {
                    tracing::warn!(partition = %tp, offset = msg.offset, error = %format!("{:#}", e), "commit failed");
                    position = None;
                    pause(&cancel, self.poll_interval).await;
                }
            }
        }
        Ok(())
    }

    /// Process everything uncommitted at the time of the call, then return.
    ///
    /// Messages published while draining are left for the next call. A
    /// partition stops at its first withheld message, which stays
    /// uncommitted.
    pub async fn drain(&self) -> Result<DrainStats> {
        let mut stats = DrainStats::default();
        for tp in self.broker.assignments(&self.topics.all()) {
            let end = self.broker.end_offset(&tp).await?;
            let mut offset = self.broker.committed(&self.group_id, &tp).await?;
            while offset < end {
                let Some(msg) = self.broker.fetch(&tp, offset).await? else {
                    break;
                };
                let disposition = self.on_message(&msg).await?;
                stats.record(&disposition);
                if !disposition.should_commit() {
                    break;
                }
                offset = msg.offset + 1;
            }
        }
        Ok(stats)
    }
}

async fn pause(cancel: &CancellationToken, duration: Duration) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(duration) => {}
    }
}
