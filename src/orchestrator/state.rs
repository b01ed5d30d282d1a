//! Run state machine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Fine-grained position of a run in the pipeline.
///
/// Step states are visited in the order of [`STEPS`]; `Failed` is reachable
/// from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Summarizing,
    EmbeddingOverall,
    Chunking,
    SummarizingChunks,
    EmbeddingChunks,
    Indexing,
    Completed,
    Failed,
}

/// Step states in execution order.
pub const STEPS: [RunState; 6] = [
    RunState::Summarizing,
    RunState::EmbeddingOverall,
    RunState::Chunking,
    RunState::SummarizingChunks,
    RunState::EmbeddingChunks,
    RunState::Indexing,
];

/// Coarse status shown to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Summarizing => "summarizing",
            Self::EmbeddingOverall => "embedding_overall",
            Self::Chunking => "chunking",
            Self::SummarizingChunks => "summarizing_chunks",
            Self::EmbeddingChunks => "embedding_chunks",
            Self::Indexing => "indexing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn is_step(&self) -> bool {
        STEPS.contains(self)
    }

    /// State entered when the current one succeeds.
    pub fn next(&self) -> Option<RunState> {
        match self {
            Self::Pending => Some(Self::Summarizing),
            Self::Summarizing => Some(Self::EmbeddingOverall),
            Self::EmbeddingOverall => Some(Self::Chunking),
            Self::Chunking => Some(Self::SummarizingChunks),
            Self::SummarizingChunks => Some(Self::EmbeddingChunks),
            Self::EmbeddingChunks => Some(Self::Indexing),
            Self::Indexing => Some(Self::Completed),
            Self::Completed | Self::Failed => None,
        }
    }

    pub fn can_transition_to(&self, target: RunState) -> bool {
        if self.is_terminal() {
            return false;
        }
        target == RunState::Failed || self.next() == Some(target)
    }

    pub fn status(&self) -> RunStatus {
        match self {
            Self::Pending => RunStatus::Pending,
            Self::Completed => RunStatus::Completed,
            Self::Failed => RunStatus::Failed,
            _ => RunStatus::Running,
        }
    }

    /// Persisted states that count toward a status filter.
    pub fn with_status(status: RunStatus) -> Vec<RunState> {
        match status {
            RunStatus::Pending => vec![Self::Pending],
            RunStatus::Running => STEPS.to_vec(),
            RunStatus::Completed => vec![Self::Completed],
            RunStatus::Failed => vec![Self::Failed],
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => Self::Pending,
            "summarizing" => Self::Summarizing,
            "embedding_overall" => Self::EmbeddingOverall,
            "chunking" => Self::Chunking,
            "summarizing_chunks" => Self::SummarizingChunks,
            "embedding_chunks" => Self::EmbeddingChunks,
            "indexing" => Self::Indexing,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            other => anyhow::bail!("unknown run state: {}", other),
        })
    }
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            other => anyhow::bail!(
                "unknown run status '{}' (expected pending, running, completed or failed)",
                other
            ),
        })
    }
}
