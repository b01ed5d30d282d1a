//! Configuration loading and validation.
//!
//! Settings come from an optional TOML file and are then overlaid with
//! environment variables, so a deployment can run from the environment alone.
//! The resulting [`Config`] is validated once at startup and passed by
//! reference (or `Arc`) into every component constructor.
//!
//! ```toml
//! [provider]
//! kind = "openai"
//! model = "gpt-4o-mini"
//! embedding_model = "text-embedding-3-large"
//! embedding_dims = 1024
//!
//! [broker]
//! path = "./data/broker.sqlite"
//! group_id = "snippet-ingestion-worker"
//!
//! [orchestrator]
//! path = "./data/runs.sqlite"
//! max_concurrent_steps = 8
//!
//! [index]
//! kind = "opensearch"
//! host = "localhost"
//! port = 9200
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    /// `openai` or `offline`.
    #[serde(default = "default_provider_kind")]
    pub kind: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_embedding_dims")]
    pub embedding_dims: usize,
    #[serde(default = "default_provider_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: default_provider_kind(),
            api_key: None,
            base_url: default_base_url(),
            model: default_model(),
            embedding_model: default_embedding_model(),
            embedding_dims: default_embedding_dims(),
            timeout_secs: default_provider_timeout_secs(),
        }
    }
}

fn default_provider_kind() -> String {
    "openai".to_string()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-3-large".to_string()
}
fn default_embedding_dims() -> usize {
    1024
}
fn default_provider_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_path")]
    pub path: PathBuf,
    #[serde(default = "default_group_id")]
    pub group_id: String,
    #[serde(default = "default_partitions")]
    pub partitions: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub topics: TopicsConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            path: default_broker_path(),
            group_id: default_group_id(),
            partitions: default_partitions(),
            poll_interval_ms: default_poll_interval_ms(),
            topics: TopicsConfig::default(),
        }
    }
}

impl BrokerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_broker_path() -> PathBuf {
    PathBuf::from("./data/broker.sqlite")
}
fn default_group_id() -> String {
    "snippet-ingestion-worker".to_string()
}
fn default_partitions() -> u32 {
    4
}
fn default_poll_interval_ms() -> u64 {
    200
}

/// Logical topic names for snippet change notifications.
#[derive(Debug, Deserialize, Clone)]
pub struct TopicsConfig {
    #[serde(default = "default_topic_created")]
    pub created: String,
    #[serde(default = "default_topic_updated")]
    pub updated: String,
    #[serde(default = "default_topic_deleted")]
    pub deleted: String,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            created: default_topic_created(),
            updated: default_topic_updated(),
            deleted: default_topic_deleted(),
        }
    }
}

impl TopicsConfig {
    pub fn all(&self) -> Vec<String> {
        vec![
            self.created.clone(),
            self.updated.clone(),
            self.deleted.clone(),
        ]
    }
}

fn default_topic_created() -> String {
    "snippet.created".to_string()
}
fn default_topic_updated() -> String {
    "snippet.updated".to_string()
}
fn default_topic_deleted() -> String {
    "snippet.deleted".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct OrchestratorConfig {
    /// SQLite file holding runs and step checkpoints.
    #[serde(default = "default_runs_path")]
    pub path: PathBuf,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_task_queue")]
    pub task_queue: String,
    #[serde(default = "default_max_concurrent_steps")]
    pub max_concurrent_steps: usize,
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            path: default_runs_path(),
            namespace: default_namespace(),
            task_queue: default_task_queue(),
            max_concurrent_steps: default_max_concurrent_steps(),
            step_timeout_secs: default_step_timeout_secs(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            retention_hours: default_retention_hours(),
        }
    }
}

fn default_runs_path() -> PathBuf {
    PathBuf::from("./data/runs.sqlite")
}
fn default_namespace() -> String {
    "default".to_string()
}
fn default_task_queue() -> String {
    "snippet-ingestion-queue".to_string()
}
fn default_max_concurrent_steps() -> usize {
    8
}
fn default_step_timeout_secs() -> u64 {
    300
}
fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    1_000
}
fn default_max_backoff_ms() -> u64 {
    10_000
}
fn default_retention_hours() -> u64 {
    168
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// `opensearch` or `memory`.
    #[serde(default = "default_index_kind")]
    pub kind: String,
    #[serde(default = "default_index_host")]
    pub host: String,
    #[serde(default = "default_index_port")]
    pub port: u16,
    #[serde(default = "default_index_name")]
    pub name: String,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            kind: default_index_kind(),
            host: default_index_host(),
            port: default_index_port(),
            name: default_index_name(),
        }
    }
}

fn default_index_kind() -> String {
    "opensearch".to_string()
}
fn default_index_host() -> String {
    "localhost".to_string()
}
fn default_index_port() -> u16 {
    9200
}
fn default_index_name() -> String {
    "code_snippets".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// `lines` or `whole`.
    #[serde(default = "default_chunk_strategy")]
    pub strategy: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            strategy: default_chunk_strategy(),
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_chunk_strategy() -> String {
    "lines".to_string()
}
fn default_max_tokens() -> usize {
    512
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7431".to_string()
}

impl Config {
    /// Overlay values from environment-style lookups.
    ///
    /// Takes a lookup function rather than reading `std::env` directly so
    /// callers (and tests) control the source.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("OPENAI_API_KEY") {
            self.provider.api_key = Some(v);
        }
        if let Some(v) = get("OPENAI_BASE_URL") {
            self.provider.base_url = v;
        }
        if let Some(v) = get("OPENAI_MODEL") {
            self.provider.model = v;
        }
        if let Some(v) = get("OPENAI_EMBEDDING_MODEL") {
            self.provider.embedding_model = v;
        }
        if let Some(v) = get("OPENAI_EMBEDDING_DIMENSIONS") {
            self.provider.embedding_dims = v
                .parse()
                .with_context(|| format!("OPENAI_EMBEDDING_DIMENSIONS is not a number: {v}"))?;
        }

        if let Some(v) = get("BROKER_PATH") {
            self.broker.path = PathBuf::from(v);
        }
        if let Some(v) = get("BROKER_GROUP_ID") {
            self.broker.group_id = v;
        }
        if let Some(v) = get("BROKER_TOPIC_SNIPPET_CREATED") {
            self.broker.topics.created = v;
        }
        if let Some(v) = get("BROKER_TOPIC_SNIPPET_UPDATED") {
            self.broker.topics.updated = v;
        }
        if let Some(v) = get("BROKER_TOPIC_SNIPPET_DELETED") {
            self.broker.topics.deleted = v;
        }

        if let Some(v) = get("RUNS_PATH") {
            self.orchestrator.path = PathBuf::from(v);
        }
        if let Some(v) = get("RUNS_NAMESPACE") {
            self.orchestrator.namespace = v;
        }
        if let Some(v) = get("RUNS_TASK_QUEUE") {
            self.orchestrator.task_queue = v;
        }

        if let Some(v) = get("OPENSEARCH_HOST") {
            self.index.host = v;
        }
        if let Some(v) = get("OPENSEARCH_PORT") {
            self.index.port = v
                .parse()
                .with_context(|| format!("OPENSEARCH_PORT is not a port number: {v}"))?;
        }
        if let Some(v) = get("OPENSEARCH_INDEX") {
            self.index.name = v;
        }

        if let Some(v) = get("SNIP_BIND") {
            self.server.bind = v;
        }

        Ok(())
    }

    /// Check every invariant the rest of the crate relies on.
    pub fn validate(&self) -> Result<()> {
        match self.provider.kind.as_str() {
            "openai" => {
                if self.provider.api_key.is_none() {
                    bail!("OPENAI_API_KEY must be set when provider.kind is 'openai'");
                }
            }
            "offline" => {}
            other => bail!(
                "Unknown provider kind: '{}'. Must be openai or offline.",
                other
            ),
        }
        if self.provider.embedding_dims == 0 {
            bail!("provider.embedding_dims must be > 0");
        }

        if self.broker.partitions == 0 {
            bail!("broker.partitions must be > 0");
        }
        if self.broker.group_id.trim().is_empty() {
            bail!("broker.group_id must not be empty");
        }
        let topics = &self.broker.topics;
        if topics.created == topics.updated
            || topics.created == topics.deleted
            || topics.updated == topics.deleted
        {
            bail!("broker.topics must name three distinct topics");
        }

        let orch = &self.orchestrator;
        if orch.max_attempts == 0 {
            bail!("orchestrator.max_attempts must be >= 1");
        }
        if orch.max_concurrent_steps == 0 {
            bail!("orchestrator.max_concurrent_steps must be >= 1");
        }
        if orch.step_timeout_secs == 0 {
            bail!("orchestrator.step_timeout_secs must be > 0");
        }
        if orch.initial_backoff_ms > orch.max_backoff_ms {
            bail!("orchestrator.initial_backoff_ms must not exceed max_backoff_ms");
        }

        match self.index.kind.as_str() {
            "opensearch" | "memory" => {}
            other => bail!(
                "Unknown index kind: '{}'. Must be opensearch or memory.",
                other
            ),
        }
        if self.index.name.trim().is_empty() {
            bail!("index.name must not be empty");
        }

        match self.chunking.strategy.as_str() {
            "lines" | "whole" => {}
            other => bail!(
                "Unknown chunking strategy: '{}'. Must be lines or whole.",
                other
            ),
        }
        if self.chunking.max_tokens == 0 {
            bail!("chunking.max_tokens must be > 0");
        }

        Ok(())
    }
}

/// Load configuration from an optional TOML file plus the process environment.
///
/// A missing file is only an error when the path was given explicitly.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            toml::from_str(&content).with_context(|| "Failed to parse config file")?
        }
        None => Config::default(),
    };

    config.apply_env(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.provider.embedding_dims, 1024);
        assert_eq!(cfg.broker.topics.created, "snippet.created");
        assert_eq!(cfg.broker.group_id, "snippet-ingestion-worker");
        assert_eq!(cfg.orchestrator.task_queue, "snippet-ingestion-queue");
        assert_eq!(cfg.orchestrator.max_attempts, 3);
        assert_eq!(cfg.orchestrator.step_timeout_secs, 300);
        assert_eq!(cfg.index.port, 9200);
        assert_eq!(cfg.index.name, "code_snippets");
    }

    #[test]
    fn test_missing_api_key_fails_fast() {
        let cfg = Config::default();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("OPENAI_API_KEY"));
    }

    #[test]
    fn test_env_overlay() {
        let mut cfg = Config::default();
        cfg.apply_env(env(&[
            ("OPENAI_API_KEY", "sk-test"),
            ("OPENAI_EMBEDDING_DIMENSIONS", "256"),
            ("OPENSEARCH_PORT", "9201"),
            ("BROKER_TOPIC_SNIPPET_UPDATED", "snippets.updated.v2"),
            ("RUNS_NAMESPACE", "staging"),
        ]))
        .unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.provider.api_key.as_deref(), Some("sk-test"));
        assert_eq!(cfg.provider.embedding_dims, 256);
        assert_eq!(cfg.index.port, 9201);
        assert_eq!(cfg.broker.topics.updated, "snippets.updated.v2");
        assert_eq!(cfg.orchestrator.namespace, "staging");
    }

    #[test]
    fn test_env_rejects_bad_numbers() {
        let mut cfg = Config::default();
        assert!(cfg
            .apply_env(env(&[("OPENAI_EMBEDDING_DIMENSIONS", "lots")]))
            .is_err());
    }

    #[test]
    fn test_toml_sections() {
        let cfg: Config = toml::from_str(
            r#"
            [provider]
            kind = "offline"
            embedding_dims = 64

            [chunking]
            strategy = "whole"

            [index]
            kind = "memory"
            "#,
        )
        .unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.provider.embedding_dims, 64);
        assert_eq!(cfg.chunking.strategy, "whole");
        assert_eq!(cfg.chunking.max_tokens, 512);
    }

    #[test]
    fn test_rejects_duplicate_topics() {
        let mut cfg = Config::default();
        cfg.provider.kind = "offline".to_string();
        cfg.broker.topics.updated = cfg.broker.topics.created.clone();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let mut cfg = Config::default();
        cfg.provider.kind = "offline".to_string();
        cfg.orchestrator.max_attempts = 0;
        assert!(cfg.validate().is_err());
    }
}
