//! Deterministic local provider.
//!
//! Summaries are built from simple source statistics and embeddings are
//! hashed bag-of-tokens vectors, L2-normalized. Same input, same output,
//! which makes it usable for local runs and end-to-end tests.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::StepError;

use super::{Embedder, Summarizer};

pub struct OfflineProvider {
    dims: usize,
}

impl OfflineProvider {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }

    fn vectorize(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for token in tokens(text) {
            let digest = Sha256::digest(token.as_bytes());
            let bucket = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize
                % self.dims;
            let sign = if digest[4] & 1 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }

        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for x in v.iter_mut() {
                *x /= norm;
            }
        }
        v
    }
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

fn describe(code: &str) -> String {
    let lines = code.lines().count();
    let first = code
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default();
    let first: String = first.chars().take(80).collect();
    format!(
        "{} line{} of code ({} bytes) starting with `{}`.",
        lines,
        if lines == 1 { "" } else { "s" },
        code.len(),
        first
    )
}

#[async_trait]
impl Summarizer for OfflineProvider {
    async fn summarize_code(&self, code: &str) -> Result<String, StepError> {
        Ok(format!("Snippet: {}", describe(code)))
    }

    async fn summarize_chunk(&self, chunk: &str, index: usize) -> Result<String, StepError> {
        Ok(format!("Part {}: {}", index + 1, describe(chunk)))
    }
}

#[async_trait]
impl Embedder for OfflineProvider {
    fn model_name(&self) -> &str {
        "offline-hash"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, StepError> {
        Ok(texts.iter().map(|t| self.vectorize(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_embed_many_aligned_and_sized() {
        let p = OfflineProvider::new(64);
        let texts = vec![
            "adds two numbers".to_string(),
            "parses a config file".to_string(),
            "adds two numbers".to_string(),
        ];
        let vectors = p.embed_many(&texts).await.unwrap();
        assert_eq!(vectors.len(), 3);
        assert!(vectors.iter().all(|v| v.len() == 64));
        assert_eq!(vectors[0], vectors[2]);
        assert_ne!(vectors[0], vectors[1]);
    }

    #[tokio::test]
    async fn test_summary_non_empty() {
        let p = OfflineProvider::new(8);
        let s = p
            .summarize_code("function add(a,b){return a+b}")
            .await
            .unwrap();
        assert!(s.contains("1 line of code"));
        let s = p.summarize_chunk("x = 1\ny = 2\n", 1).await.unwrap();
        assert!(s.starts_with("Part 2"));
    }
}
