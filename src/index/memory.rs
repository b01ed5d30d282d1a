//! In-memory [`SearchIndex`] implementation for testing and offline runs.
//!
//! Uses a `HashMap` behind `std::sync::RwLock`. Writes are visible to reads
//! as soon as `upsert` returns.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::StepError;
use crate::models::{IndexResult, SnippetDocument};

use super::SearchIndex;

pub struct MemoryIndex {
    docs: RwLock<HashMap<String, SnippetDocument>>,
    schema_created: AtomicUsize,
    upserts: AtomicUsize,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
            schema_created: AtomicUsize::new(0),
            upserts: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.docs.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of times the schema was actually created (0 or 1).
    pub fn schema_creations(&self) -> usize {
        self.schema_created.load(Ordering::SeqCst)
    }

    pub fn upsert_count(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }
}

impl Default for MemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> StepError {
    StepError::permanent("memory index lock poisoned")
}

#[async_trait]
impl SearchIndex for MemoryIndex {
    async fn ensure_schema(&self) -> Result<(), StepError> {
        // First caller wins; later callers observe the existing schema.
        let _ = self
            .schema_created
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst);
        Ok(())
    }

    async fn upsert(&self, doc: &SnippetDocument) -> Result<IndexResult, StepError> {
        if self.schema_creations() == 0 {
            return Err(StepError::permanent("index does not exist"));
        }
        let mut docs = self.docs.write().map_err(|_| poisoned())?;
        docs.insert(doc.entity_id.clone(), doc.clone());
        self.upserts.fetch_add(1, Ordering::SeqCst);
        Ok(IndexResult::ok(doc.entity_id.clone()))
    }

    async fn get(&self, entity_id: &str) -> Result<Option<SnippetDocument>, StepError> {
        let docs = self.docs.read().map_err(|_| poisoned())?;
        Ok(docs.get(entity_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn doc(id: &str, code: &str) -> SnippetDocument {
        SnippetDocument {
            entity_id: id.to_string(),
            code: code.to_string(),
            overall_summary: "s".to_string(),
            overall_embedding: vec![1.0],
            chunks: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_upsert_replaces_wholesale() {
        let index = MemoryIndex::new();
        index.ensure_schema().await.unwrap();
        index.ensure_schema().await.unwrap();
        assert_eq!(index.schema_creations(), 1);

        index.upsert(&doc("a", "v1")).await.unwrap();
        let result = index.upsert(&doc("a", "v2")).await.unwrap();
        assert!(result.success);
        assert_eq!(result.document_id, "a");
        assert_eq!(index.len(), 1);
        assert_eq!(index.get("a").await.unwrap().unwrap().code, "v2");
    }

    #[tokio::test]
    async fn test_upsert_without_schema_fails() {
        let index = MemoryIndex::new();
        assert!(index.upsert(&doc("a", "v1")).await.is_err());
    }
}
