//! Component wiring.
//!
//! Builds every long-lived component from a validated [`Config`] once, so
//! the CLI commands, the HTTP server and the tests share one construction
//! path. Config is passed explicitly; nothing reads it from a global.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::broker::{Broker, SqliteBroker};
use crate::chunk::ChunkStrategy;
use crate::config::Config;
use crate::consumer::Consumer;
use crate::index::{create_index, SearchIndex};
use crate::orchestrator::store::{RunStore, SqliteRunStore};
use crate::orchestrator::Orchestrator;
use crate::provider::{create_providers, Providers};
use crate::steps::Pipeline;

#[derive(Clone)]
pub struct App {
    pub config: Arc<Config>,
    pub broker: Arc<dyn Broker>,
    pub store: Arc<dyn RunStore>,
    pub index: Arc<dyn SearchIndex>,
    pub orchestrator: Orchestrator,
    pub consumer: Consumer,
}

impl App {
    /// Open the SQLite broker and run store and build the configured
    /// providers and index.
    pub async fn open(config: Config) -> Result<Self> {
        let broker = SqliteBroker::open(&config.broker.path, config.broker.partitions)
            .await
            .with_context(|| format!("Failed to open broker at {}", config.broker.path.display()))?;
        let store = SqliteRunStore::open(&config.orchestrator.path)
            .await
            .with_context(|| {
                format!(
                    "Failed to open run store at {}",
                    config.orchestrator.path.display()
                )
            })?;
        let providers = create_providers(&config.provider)?;
        let index = create_index(&config.index, config.provider.embedding_dims)?;
        Self::assemble(config, Arc::new(broker), Arc::new(store), providers, index)
    }

    /// Wire already-built backends together.
    pub fn assemble(
        config: Config,
        broker: Arc<dyn Broker>,
        store: Arc<dyn RunStore>,
        providers: Providers,
        index: Arc<dyn SearchIndex>,
    ) -> Result<Self> {
        let strategy = ChunkStrategy::from_config(&config.chunking)?;
        let embedding_model = providers.embedder.model_name().to_string();
        let pipeline = Arc::new(Pipeline::new(providers, strategy, index.clone()));
        let orchestrator = Orchestrator::new(store.clone(), pipeline, &config.orchestrator);
        let consumer = Consumer::new(broker.clone(), orchestrator.clone(), &config.broker);

        tracing::debug!(
            provider = %config.provider.kind,
            embedding_model = %embedding_model,
            index = %config.index.kind,
            chunking = strategy.name(),
            "components assembled"
        );

        Ok(Self {
            config: Arc::new(config),
            broker,
            store,
            index,
            orchestrator,
            consumer,
        })
    }
}
