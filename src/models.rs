//! Core data models used throughout the ingestion pipeline.
//!
//! These types represent the events, chunks, and documents that flow from the
//! broker through the orchestrator into the search index.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of change a [`SnippetEvent`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
}

/// A validated snippet change notification.
///
/// Only produced by [`crate::consumer::parse_event`]; nothing past the
/// consumer ever sees the raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnippetEvent {
    Created { entity_id: String, code: String },
    Updated { entity_id: String, code: String },
    Deleted { entity_id: String },
}

impl SnippetEvent {
    pub fn entity_id(&self) -> &str {
        match self {
            Self::Created { entity_id, .. }
            | Self::Updated { entity_id, .. }
            | Self::Deleted { entity_id } => entity_id,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::Created { .. } => EventKind::Created,
            Self::Updated { .. } => EventKind::Updated,
            Self::Deleted { .. } => EventKind::Deleted,
        }
    }

    /// Source code carried by the event, absent for deletions.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Created { code, .. } | Self::Updated { code, .. } => Some(code),
            Self::Deleted { .. } => None,
        }
    }
}

/// One ordered slice of a snippet with its summary and embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    #[serde(rename = "chunk_index")]
    pub index: usize,
    pub code: String,
    pub summary: String,
    pub embedding: Vec<f32>,
}

/// The document written to the search index, one per entity.
///
/// Serializes to the index wire shape (`snippet_id`, `overall_summary`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnippetDocument {
    #[serde(rename = "snippet_id")]
    pub entity_id: String,
    pub code: String,
    pub overall_summary: String,
    pub overall_embedding: Vec<f32>,
    pub chunks: Vec<Chunk>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SnippetDocument {
    /// Concatenation of chunk code in index order.
    pub fn reassembled_code(&self) -> String {
        let mut ordered: Vec<&Chunk> = self.chunks.iter().collect();
        ordered.sort_by_key(|c| c.index);
        ordered.iter().map(|c| c.code.as_str()).collect()
    }
}

/// Outcome of writing a document to the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexResult {
    pub success: bool,
    pub document_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IndexResult {
    pub fn ok(document_id: impl Into<String>) -> Self {
        Self {
            success: true,
            document_id: document_id.into(),
            error: None,
        }
    }
}
