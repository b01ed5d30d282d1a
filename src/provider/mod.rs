//! AI provider abstraction for summarization and embedding.
//!
//! Defines the [`Summarizer`] and [`Embedder`] traits used by the pipeline
//! steps, and concrete implementations:
//! - **[`OpenAiProvider`]**: chat completions and embeddings over HTTP.
//! - **[`OfflineProvider`]**: deterministic local stand-in for development
//!   and tests, no credentials or network needed.
//!
//! # Error Classification
//!
//! Providers never retry on their own. Each call is a single attempt that
//! reports a [`StepError`]:
//! - HTTP 429 (rate limited) and 5xx (server error) → transient
//! - HTTP 4xx (client error, not 429) → permanent
//! - Network errors → transient
//!
//! Retrying, backoff and timeouts belong to the orchestrator.

pub mod offline;
pub mod openai;

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::config::ProviderConfig;
use crate::error::StepError;

pub use offline::OfflineProvider;
pub use openai::OpenAiProvider;

/// Produces natural-language summaries of code.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Summarize a whole snippet.
    async fn summarize_code(&self, code: &str) -> Result<String, StepError>;

    /// Summarize one chunk; `index` is zero-based.
    async fn summarize_chunk(&self, chunk: &str, index: usize) -> Result<String, StepError>;
}

/// Turns text into fixed-length vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-large"`).
    fn model_name(&self) -> &str;

    /// Returns the vector dimensionality every call must produce.
    fn dims(&self) -> usize;

    /// Embed a batch of texts. `result[i]` corresponds to `texts[i]`.
    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, StepError>;

    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, StepError> {
        let mut vectors = self.embed_many(&[text.to_string()]).await?;
        check_vectors(&vectors, 1, self.dims())?;
        Ok(vectors.remove(0))
    }
}

/// Verify a batch response is aligned with its inputs and has the right width.
///
/// Both a count mismatch and a dimension mismatch are permanent: retrying the
/// same request against the same model cannot fix them.
pub fn check_vectors(vectors: &[Vec<f32>], expected: usize, dims: usize) -> Result<(), StepError> {
    if vectors.len() != expected {
        return Err(StepError::permanent(format!(
            "embedding count mismatch: expected {}, got {}",
            expected,
            vectors.len()
        )));
    }
    if let Some((i, v)) = vectors.iter().enumerate().find(|(_, v)| v.len() != dims) {
        return Err(StepError::permanent(format!(
            "embedding {} has dimension {}, expected {}",
            i,
            v.len(),
            dims
        )));
    }
    Ok(())
}

/// The pair of providers a deployment runs with.
#[derive(Clone)]
pub struct Providers {
    pub summarizer: Arc<dyn Summarizer>,
    pub embedder: Arc<dyn Embedder>,
}

/// Create providers based on configuration.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"openai"` | [`OpenAiProvider`] for both roles |
/// | `"offline"` | [`OfflineProvider`] for both roles |
pub fn create_providers(config: &ProviderConfig) -> Result<Providers> {
    match config.kind.as_str() {
        "openai" => {
            let provider = Arc::new(OpenAiProvider::new(config)?);
            Ok(Providers {
                summarizer: provider.clone(),
                embedder: provider,
            })
        }
        "offline" => {
            let provider = Arc::new(OfflineProvider::new(config.embedding_dims));
            Ok(Providers {
                summarizer: provider.clone(),
                embedder: provider,
            })
        }
        other => bail!("Unknown provider kind: {}", other),
    }
}
