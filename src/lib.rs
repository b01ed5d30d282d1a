//! # snippet-ingest
//!
//! An event-driven, durably executed pipeline that turns raw code snippets
//! into searchable, embedding-enriched documents.
//!
//! Snippet change notifications arrive on a partitioned broker. The consumer
//! validates each one and starts (or attaches to) a run keyed by the
//! snippet id. The orchestrator drives every run through summarization,
//! embedding, chunking and indexing, checkpointing each step so a restart
//! resumes where it left off.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌──────────────┐   ┌─────────────┐
//! │  Broker  │──▶│ Consumer │──▶│ Orchestrator │──▶│ SearchIndex │
//! │ (SQLite) │   │ validate │   │  steps +     │   │ (OpenSearch)│
//! └──────────┘   └──────────┘   │  RunStore    │   └─────────────┘
//!      ▲                        └──────┬───────┘
//!      │ POST /topics/{t}              │ Summarizer / Embedder
//! ┌────┴─────┐                  ┌──────▼───────┐
//! │   HTTP   │                  │   Provider   │
//! └──────────┘                  │ OpenAI/local │
//!                               └──────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML + environment configuration |
//! | [`models`] | Events, chunks and index documents |
//! | [`error`] | Step, validation and orchestrator errors |
//! | [`broker`] | Partitioned topics with committed offsets |
//! | [`consumer`] | Event validation and offset-commit policy |
//! | [`orchestrator`] | Run state machine, retries and checkpoint store |
//! | [`steps`] | The transformation steps of one run |
//! | [`chunk`] | Code chunking |
//! | [`provider`] | Summarization and embedding providers |
//! | [`index`] | Search index writer |
//! | [`runtime`] | Component wiring |
//! | [`server`] | HTTP API |
//! | [`db`] | SQLite connection |
//! | [`migrate`] | Schema migrations |

pub mod broker;
pub mod chunk;
pub mod config;
pub mod consumer;
pub mod db;
pub mod error;
pub mod index;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod orchestrator;
pub mod provider;
pub mod runs;
pub mod runtime;
pub mod server;
pub mod steps;
