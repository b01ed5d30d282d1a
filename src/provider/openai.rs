//! OpenAI-compatible provider.
//!
//! Calls `POST {base_url}/chat/completions` for summaries and
//! `POST {base_url}/embeddings` (with `dimensions`) for vectors.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::config::ProviderConfig;
use crate::error::StepError;

use super::{check_vectors, Embedder, Summarizer};

const SERVICE: &str = "openai";

const CODE_SYSTEM_PROMPT: &str = "You are a code summarization assistant. Analyze the provided \
code and create a concise, informative summary that describes what the code does, its main \
purpose, key components, and functionality. Focus on the high-level behavior and intent rather \
than implementation details. Keep the summary clear and professional.";

const CHUNK_SYSTEM_PROMPT: &str = "You are a code summarization assistant. Analyze the provided \
code snippet and create a brief, informative summary. Focus on what this specific portion of \
code does and its purpose. Keep it concise but meaningful.";

pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    embedding_model: String,
    dims: usize,
}

impl OpenAiProvider {
    /// Create a new provider from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if no API key is configured or the HTTP client
    /// cannot be built.
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("OPENAI_API_KEY required for openai provider"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            embedding_model: config.embedding_model.clone(),
            dims: config.embedding_dims,
        })
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<serde_json::Value, StepError> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| StepError::from_transport(SERVICE, e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(StepError::from_status(SERVICE, status, &text));
        }

        response
            .json()
            .await
            .map_err(|e| StepError::transient(format!("invalid {} response body: {}", SERVICE, e)))
    }

    async fn complete(&self, system: &str, user: String) -> Result<String, StepError> {
        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
        });
        let response = self.post("/chat/completions", body).await?;
        parse_completion(&response)
    }
}

#[async_trait]
impl Summarizer for OpenAiProvider {
    async fn summarize_code(&self, code: &str) -> Result<String, StepError> {
        self.complete(
            CODE_SYSTEM_PROMPT,
            format!("Please summarize this code:\n\n{}", code),
        )
        .await
    }

    async fn summarize_chunk(&self, chunk: &str, index: usize) -> Result<String, StepError> {
        self.complete(
            CHUNK_SYSTEM_PROMPT,
            format!(
                "Please summarize this code chunk (part {}):\n\n{}",
                index + 1,
                chunk
            ),
        )
        .await
    }
}

#[async_trait]
impl Embedder for OpenAiProvider {
    fn model_name(&self) -> &str {
        &self.embedding_model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, StepError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = json!({
            "model": self.embedding_model,
            "input": texts,
            "dimensions": self.dims,
        });
        let response = self.post("/embeddings", body).await?;
        let vectors = parse_embeddings(&response)?;
        check_vectors(&vectors, texts.len(), self.dims)?;
        Ok(vectors)
    }
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Extract the first choice's text. An empty answer is treated as transient:
/// the same prompt may well produce text on the next attempt.
fn parse_completion(json: &serde_json::Value) -> Result<String, StepError> {
    let parsed: CompletionResponse = serde_json::from_value(json.clone())
        .map_err(|e| StepError::transient(format!("Invalid completion response: {}", e)))?;

    let text = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .map(|s| s.trim().to_string())
        .unwrap_or_default();

    if text.is_empty() {
        return Err(StepError::transient("completion returned no text"));
    }
    Ok(text)
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Deserialize)]
struct EmbeddingRow {
    index: usize,
    embedding: Vec<f32>,
}

/// Parse the embeddings response, ordering rows by their `index` field so the
/// output lines up with the request inputs.
fn parse_embeddings(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, StepError> {
    let mut parsed: EmbeddingResponse = serde_json::from_value(json.clone())
        .map_err(|e| StepError::transient(format!("Invalid embedding response: {}", e)))?;

    parsed.data.sort_by_key(|row| row.index);
    Ok(parsed.data.into_iter().map(|row| row.embedding).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_completion() {
        let json = json!({
            "choices": [{ "message": { "role": "assistant", "content": "  Adds two numbers.\n" } }]
        });
        assert_eq!(parse_completion(&json).unwrap(), "Adds two numbers.");
    }

    #[test]
    fn test_parse_completion_empty_is_transient() {
        let json = json!({ "choices": [{ "message": { "content": "" } }] });
        assert!(parse_completion(&json).unwrap_err().is_retriable());
        let json = json!({ "choices": [] });
        assert!(parse_completion(&json).unwrap_err().is_retriable());
    }

    #[test]
    fn test_parse_embeddings_sorted_by_index() {
        let json = json!({
            "data": [
                { "index": 1, "embedding": [0.0, 1.0] },
                { "index": 0, "embedding": [1.0, 0.0] },
            ]
        });
        let vectors = parse_embeddings(&json).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_new_requires_key() {
        let config = ProviderConfig::default();
        assert!(OpenAiProvider::new(&config).is_err());
    }
}
