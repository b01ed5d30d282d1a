#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use snippet_ingest::broker::{Broker, MemoryBroker};
use snippet_ingest::config::Config;
use snippet_ingest::error::StepError;
use snippet_ingest::index::{MemoryIndex, SearchIndex};
use snippet_ingest::orchestrator::store::{MemoryRunStore, RunStore};
use snippet_ingest::provider::{Embedder, OfflineProvider, Providers, Summarizer};
use snippet_ingest::runtime::App;

pub const DIMS: usize = 32;

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.provider.kind = "offline".to_string();
    config.provider.embedding_dims = DIMS;
    config.index.kind = "memory".to_string();
    config.broker.partitions = 2;
    config.broker.poll_interval_ms = 10;
    config.orchestrator.initial_backoff_ms = 1;
    config.orchestrator.max_backoff_ms = 4;
    config
}

pub struct Harness {
    pub app: App,
    pub store: Arc<MemoryRunStore>,
    pub index: Arc<MemoryIndex>,
    pub broker: Arc<MemoryBroker>,
}

pub fn harness(config: Config, providers: Providers) -> Harness {
    let store = Arc::new(MemoryRunStore::new());
    let index = Arc::new(MemoryIndex::new());
    let broker = Arc::new(MemoryBroker::new(config.broker.partitions));
    let app = App::assemble(
        config,
        broker.clone() as Arc<dyn Broker>,
        store.clone() as Arc<dyn RunStore>,
        providers,
        index.clone() as Arc<dyn SearchIndex>,
    )
    .unwrap();
    Harness {
        app,
        store,
        index,
        broker,
    }
}

pub fn offline() -> Providers {
    let provider = Arc::new(OfflineProvider::new(DIMS));
    Providers {
        summarizer: provider.clone(),
        embedder: provider,
    }
}

pub fn with_summarizer(summarizer: Arc<dyn Summarizer>) -> Providers {
    Providers {
        summarizer,
        embedder: Arc::new(OfflineProvider::new(DIMS)),
    }
}

pub fn with_embedder(embedder: Arc<dyn Embedder>) -> Providers {
    Providers {
        summarizer: Arc::new(OfflineProvider::new(DIMS)),
        embedder,
    }
}

/// Scripted summarizer.
///
/// - `gate`: whole-snippet summaries block until a permit is released.
/// - `fail_whole`: the first N whole-snippet calls fail transiently.
/// - `fail_chunk`: `(index, n)` fails that chunk transiently the first n times.
/// - `hang`: whole-snippet calls never finish.
#[derive(Default)]
pub struct ScriptedSummarizer {
    pub gate: Option<Semaphore>,
    pub fail_whole: Mutex<usize>,
    pub always_fail: bool,
    pub fail_chunk: Mutex<Option<(usize, usize)>>,
    pub hang: bool,
    pub whole_calls: AtomicUsize,
    pub chunk_calls: Mutex<Vec<usize>>,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl ScriptedSummarizer {
    pub fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::default()
        }
    }

    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1000);
        }
    }

    pub fn whole_calls(&self) -> usize {
        self.whole_calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn chunk_calls_for(&self, index: usize) -> usize {
        self.chunk_calls
            .lock()
            .unwrap()
            .iter()
            .filter(|i| **i == index)
            .count()
    }
}

#[async_trait]
impl Summarizer for ScriptedSummarizer {
    async fn summarize_code(&self, code: &str) -> Result<String, StepError> {
        self.whole_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if self.always_fail {
            return Err(StepError::transient("provider returned 503"));
        }
        {
            let mut remaining = self.fail_whole.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StepError::transient("provider returned 503"));
            }
        }
        Ok(format!("Summary of {} bytes of code.", code.len()))
    }

    async fn summarize_chunk(&self, chunk: &str, index: usize) -> Result<String, StepError> {
        self.chunk_calls.lock().unwrap().push(index);
        let mut fail = self.fail_chunk.lock().unwrap();
        if let Some((i, n)) = fail.as_mut() {
            if *i == index && *n > 0 {
                *n -= 1;
                return Err(StepError::transient("provider returned 429"));
            }
        }
        Ok(format!("Part {}: {} bytes.", index + 1, chunk.len()))
    }
}

/// Embedder that returns vectors of the wrong width.
pub struct WrongDimsEmbedder {
    pub calls: AtomicUsize,
}

#[async_trait]
impl Embedder for WrongDimsEmbedder {
    fn model_name(&self) -> &str {
        "wrong-dims"
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, StepError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|_| vec![0.1; DIMS - 1]).collect())
    }
}
