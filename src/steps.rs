//! Transformation steps of the ingestion pipeline.
//!
//! A [`Pipeline`] bundles the providers, chunking strategy and search index a
//! deployment runs with. Each method is one attempt of one step: it either
//! succeeds or returns a [`StepError`] classified as transient or permanent.
//! Retrying, timeouts and checkpointing are the orchestrator's job.
//!
//! | Step | Method | Output |
//! |------|--------|--------|
//! | Summarize-Whole | [`summarize_whole`](Pipeline::summarize_whole) | overall summary |
//! | Embed | [`embed_one`](Pipeline::embed_one) | embedding of the overall summary |
//! | Chunk | [`chunk`](Pipeline::chunk) | ordered chunk texts |
//! | Summarize-Chunks | [`summarize_chunks`](Pipeline::summarize_chunks) | one summary per chunk |
//! | Embed-Many | [`embed_many`](Pipeline::embed_many) | one embedding per chunk summary |
//! | Index-Write | [`write_index`](Pipeline::write_index) | [`IndexResult`] |

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::OnceCell;

use crate::chunk::{chunk_code, ChunkStrategy};
use crate::error::StepError;
use crate::index::SearchIndex;
use crate::models::{Chunk, IndexResult, SnippetDocument};
use crate::provider::{check_vectors, Embedder, Providers, Summarizer};

pub struct Pipeline {
    summarizer: Arc<dyn Summarizer>,
    embedder: Arc<dyn Embedder>,
    strategy: ChunkStrategy,
    index: Arc<dyn SearchIndex>,
    schema_ready: OnceCell<()>,
}

impl Pipeline {
    pub fn new(providers: Providers, strategy: ChunkStrategy, index: Arc<dyn SearchIndex>) -> Self {
        Self {
            summarizer: providers.summarizer,
            embedder: providers.embedder,
            strategy,
            index,
            schema_ready: OnceCell::new(),
        }
    }

    pub fn dims(&self) -> usize {
        self.embedder.dims()
    }

    pub async fn summarize_whole(&self, code: &str) -> Result<String, StepError> {
        if code.trim().is_empty() {
            return Err(StepError::permanent("snippet code is empty"));
        }
        let summary = self.summarizer.summarize_code(code).await?;
        if summary.trim().is_empty() {
            return Err(StepError::transient("summarizer returned an empty summary"));
        }
        Ok(summary)
    }

    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>, StepError> {
        let vector = self.embedder.embed(text).await?;
        check_vectors(std::slice::from_ref(&vector), 1, self.dims())?;
        Ok(vector)
    }

    /// Embed a batch; `result[i]` belongs to `texts[i]`.
    pub async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, StepError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let vectors = self.embedder.embed_many(texts).await?;
        check_vectors(&vectors, texts.len(), self.dims())?;
        Ok(vectors)
    }

    /// Split code into ordered chunks whose concatenation is the input.
    pub fn chunk(&self, code: &str) -> Result<Vec<String>, StepError> {
        let chunks = chunk_code(code, self.strategy);
        if chunks.concat() != code {
            return Err(StepError::permanent(format!(
                "{} chunker did not cover the input exactly",
                self.strategy.name()
            )));
        }
        Ok(chunks)
    }

    /// Summarize every chunk that does not have a summary in `done` yet.
    ///
    /// `done` carries progress across attempts: successful summaries are
    /// kept even when the attempt as a whole fails, so a retry only calls
    /// the provider for the missing indices. A permanent error stops at
    /// once; transient ones are collected and the first is returned after
    /// the remaining chunks have been tried.
    pub async fn summarize_chunks(
        &self,
        chunks: &[String],
        done: &mut Vec<Option<String>>,
    ) -> Result<(), StepError> {
        done.resize(chunks.len(), None);
        let mut first_error = None;

        for (i, chunk) in chunks.iter().enumerate() {
            if done[i].is_some() {
                continue;
            }
            match self.summarizer.summarize_chunk(chunk, i).await {
                Ok(summary) if !summary.trim().is_empty() => done[i] = Some(summary),
                Ok(_) => {
                    first_error.get_or_insert_with(|| {
                        StepError::transient(format!("empty summary for chunk {}", i))
                    });
                }
                Err(e) if e.is_retriable() => {
                    tracing::debug!(chunk = i, error = %e, "chunk summary failed");
                    first_error.get_or_insert(e);
                }
                Err(e) => return Err(e),
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Make sure the index exists (once per process), then upsert.
    pub async fn write_index(&self, doc: &SnippetDocument) -> Result<IndexResult, StepError> {
        self.schema_ready
            .get_or_try_init(|| self.index.ensure_schema())
            .await?;
        let result = self.index.upsert(doc).await?;
        if !result.success {
            return Err(StepError::transient(
                result
                    .error
                    .unwrap_or_else(|| "index rejected the document".to_string()),
            ));
        }
        Ok(result)
    }
}

/// Everything the Indexing step needs, gathered from earlier step outputs.
pub struct DocumentParts {
    pub entity_id: String,
    pub code: String,
    pub overall_summary: String,
    pub overall_embedding: Vec<f32>,
    pub chunks: Vec<String>,
    pub chunk_summaries: Vec<String>,
    pub chunk_embeddings: Vec<Vec<f32>>,
    pub created_at: DateTime<Utc>,
}

/// Assemble the index document. Misaligned parts are a permanent error.
pub fn compose_document(parts: DocumentParts) -> Result<SnippetDocument, StepError> {
    let n = parts.chunks.len();
    if parts.chunk_summaries.len() != n || parts.chunk_embeddings.len() != n {
        return Err(StepError::permanent(format!(
            "chunk outputs misaligned: {} chunks, {} summaries, {} embeddings",
            n,
            parts.chunk_summaries.len(),
            parts.chunk_embeddings.len()
        )));
    }

    let chunks = parts
        .chunks
        .into_iter()
        .zip(parts.chunk_summaries)
        .zip(parts.chunk_embeddings)
        .enumerate()
        .map(|(index, ((code, summary), embedding))| Chunk {
            index,
            code,
            summary,
            embedding,
        })
        .collect();

    Ok(SnippetDocument {
        entity_id: parts.entity_id,
        code: parts.code,
        overall_summary: parts.overall_summary,
        overall_embedding: parts.overall_embedding,
        chunks,
        created_at: parts.created_at,
        updated_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::MemoryIndex;
    use crate::provider::OfflineProvider;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Fails chunk `fail_index` transiently the first `failures` times.
    struct FlakySummarizer {
        fail_index: usize,
        failures: Mutex<usize>,
        calls: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl Summarizer for FlakySummarizer {
        async fn summarize_code(&self, _code: &str) -> Result<String, StepError> {
            Ok("whole".to_string())
        }

        async fn summarize_chunk(&self, _chunk: &str, index: usize) -> Result<String, StepError> {
            self.calls.lock().unwrap().push(index);
            let mut failures = self.failures.lock().unwrap();
            if index == self.fail_index && *failures > 0 {
                *failures -= 1;
                return Err(StepError::transient("503"));
            }
            Ok(format!("part {}", index + 1))
        }
    }

    fn pipeline(summarizer: Arc<dyn Summarizer>, index: Arc<MemoryIndex>) -> Pipeline {
        let providers = Providers {
            summarizer,
            embedder: Arc::new(OfflineProvider::new(16)),
        };
        Pipeline::new(providers, ChunkStrategy::Lines { max_tokens: 4 }, index)
    }

    #[tokio::test]
    async fn test_blank_code_is_permanent() {
        let p = pipeline(Arc::new(OfflineProvider::new(16)), Arc::new(MemoryIndex::new()));
        let err = p.summarize_whole("  \n\t").await.unwrap_err();
        assert!(!err.is_retriable());
    }

    #[tokio::test]
    async fn test_partial_chunk_summaries_retry_only_missing() {
        let flaky = Arc::new(FlakySummarizer {
            fail_index: 1,
            failures: Mutex::new(1),
            calls: Mutex::new(Vec::new()),
        });
        let p = pipeline(flaky.clone(), Arc::new(MemoryIndex::new()));
        let chunks = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let mut done = Vec::new();

        let err = p.summarize_chunks(&chunks, &mut done).await.unwrap_err();
        assert!(err.is_retriable());
        assert_eq!(done.iter().filter(|s| s.is_some()).count(), 2);

        p.summarize_chunks(&chunks, &mut done).await.unwrap();
        assert_eq!(*flaky.calls.lock().unwrap(), vec![0, 1, 2, 1]);
        assert_eq!(done[1].as_deref(), Some("part 2"));
    }

    #[tokio::test]
    async fn test_embed_many_aligned() {
        let p = pipeline(Arc::new(OfflineProvider::new(16)), Arc::new(MemoryIndex::new()));
        let texts = vec!["alpha".to_string(), "beta".to_string(), "alpha".to_string()];
        let vectors = p.embed_many(&texts).await.unwrap();
        assert_eq!(vectors.len(), 3);
        assert!(vectors.iter().all(|v| v.len() == 16));
        assert_eq!(vectors[0], vectors[2]);
        assert_eq!(vectors[0], p.embed_one("alpha").await.unwrap());
    }

    #[tokio::test]
    async fn test_write_index_creates_schema_once() {
        let index = Arc::new(MemoryIndex::new());
        let p = pipeline(Arc::new(OfflineProvider::new(16)), index.clone());
        let doc = compose_document(DocumentParts {
            entity_id: "e1".to_string(),
            code: "x".to_string(),
            overall_summary: "s".to_string(),
            overall_embedding: vec![0.0; 16],
            chunks: vec!["x".to_string()],
            chunk_summaries: vec!["s".to_string()],
            chunk_embeddings: vec![vec![0.0; 16]],
            created_at: Utc::now(),
        })
        .unwrap();

        assert!(p.write_index(&doc).await.unwrap().success);
        assert!(p.write_index(&doc).await.unwrap().success);
        assert_eq!(index.schema_creations(), 1);
        assert_eq!(index.len(), 1);
        assert_eq!(index.upsert_count(), 2);
    }

    #[test]
    fn test_compose_rejects_misaligned_parts() {
        let err = compose_document(DocumentParts {
            entity_id: "e1".to_string(),
            code: "ab".to_string(),
            overall_summary: "s".to_string(),
            overall_embedding: vec![],
            chunks: vec!["a".to_string(), "b".to_string()],
            chunk_summaries: vec!["s".to_string()],
            chunk_embeddings: vec![vec![], vec![]],
            created_at: Utc::now(),
        })
        .unwrap_err();
        assert!(!err.is_retriable());
    }
}
