//! Search index abstraction.
//!
//! The [`SearchIndex`] trait is the only write path into the shared search
//! engine. Implementations:
//! - **[`OpenSearchIndex`]**: OpenSearch/Elasticsearch over its REST API.
//! - **[`MemoryIndex`]**: in-process map, for tests and offline runs.
//!
//! # Contract
//!
//! | Method | Guarantee |
//! |--------|-----------|
//! | [`ensure_schema`](SearchIndex::ensure_schema) | create-if-absent, safe under concurrent callers |
//! | [`upsert`](SearchIndex::upsert) | wholesale replace keyed by entity id, visible before returning |
//! | [`get`](SearchIndex::get) | read back the current document |

pub mod memory;
pub mod opensearch;

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::IndexConfig;
use crate::error::StepError;
use crate::models::{IndexResult, SnippetDocument};

pub use memory::MemoryIndex;
pub use opensearch::OpenSearchIndex;

#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Create the index with its mapping if it does not exist yet.
    async fn ensure_schema(&self) -> Result<(), StepError>;

    /// Insert or wholly replace the document for `doc.entity_id`.
    async fn upsert(&self, doc: &SnippetDocument) -> Result<IndexResult, StepError>;

    /// Fetch the document stored for an entity.
    async fn get(&self, entity_id: &str) -> Result<Option<SnippetDocument>, StepError>;
}

/// Index body: settings plus mappings with cosine k-NN vectors.
///
/// Chunks are a `nested` field so every chunk vector is searchable on its own.
pub fn index_definition(dims: usize) -> Value {
    let vector = json!({
        "type": "knn_vector",
        "dimension": dims,
        "method": {
            "name": "hnsw",
            "space_type": "cosinesimil",
            "engine": "nmslib",
        },
    });

    json!({
        "settings": {
            "index": {
                "number_of_shards": 1,
                "number_of_replicas": 0,
                "knn": true,
            }
        },
        "mappings": {
            "properties": {
                "snippet_id": { "type": "keyword" },
                "code": { "type": "text" },
                "overall_summary": { "type": "text" },
                "overall_embedding": vector,
                "chunks": {
                    "type": "nested",
                    "properties": {
                        "chunk_index": { "type": "integer" },
                        "code": { "type": "text" },
                        "summary": { "type": "text" },
                        "embedding": vector,
                    }
                },
                "created_at": { "type": "date" },
                "updated_at": { "type": "date" },
            }
        }
    })
}

/// Create the configured index backend.
pub fn create_index(config: &IndexConfig, dims: usize) -> Result<Arc<dyn SearchIndex>> {
    match config.kind.as_str() {
        "opensearch" => Ok(Arc::new(OpenSearchIndex::new(config, dims)?)),
        "memory" => Ok(Arc::new(MemoryIndex::new())),
        other => bail!("Unknown index kind: {}", other),
    }
}
