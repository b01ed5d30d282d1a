//! # snippet-ingest CLI (`snip`)
//!
//! ## Usage
//!
//! ```bash
//! snip --config ./config/snip.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `snip init` | Create the broker and run databases (and optionally the search index) |
//! | `snip serve` | Run the consumer, resume unfinished runs and serve the HTTP API |
//! | `snip ingest <file.jsonl>` | Publish snippet events from a JSON Lines file |
//! | `snip runs list` | List runs, optionally filtered by status |
//! | `snip runs show <id>` | Show one run with per-step attempts |
//! | `snip runs cancel <id>` | Cancel a run at its next step boundary |
//! | `snip runs prune` | Delete finished runs past the retention window |
//!
//! ## Examples
//!
//! ```bash
//! # Local run without credentials or a search cluster
//! snip --config ./config/offline.toml ingest snippets.jsonl --process
//!
//! # Production worker
//! OPENAI_API_KEY=sk-... snip serve
//!
//! RUST_LOG=snippet_ingest=debug snip runs show abc-123
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use snippet_ingest::config::load_config;
use snippet_ingest::runtime::App;
use snippet_ingest::{ingest, runs, server};

/// Durable ingestion pipeline that turns code snippets into
/// embedding-enriched search documents.
#[derive(Parser)]
#[command(name = "snip", version, about)]
struct Cli {
    /// Path to a TOML configuration file.
    ///
    /// Optional: every setting has a default and most can be overridden by
    /// environment variables (`OPENAI_API_KEY`, `OPENSEARCH_HOST`, ...).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the broker and run databases. Idempotent.
    Init {
        /// Also create the search index if it does not exist.
        #[arg(long)]
        index: bool,
    },

    /// Consume snippet events and serve the HTTP API until ctrl-c.
    Serve,

    /// Publish snippet events from a JSON Lines file.
    ///
    /// Each line is a message body such as
    /// `{"id": "abc-123", "code": "function add(a,b){return a+b}"}`.
    Ingest {
        /// JSON Lines file, one event per line.
        file: PathBuf,

        /// `created`, `updated`, `deleted`, or a configured topic name.
        #[arg(long, default_value = "created")]
        topic: String,

        /// Process the events in this process and wait for the runs.
        #[arg(long)]
        process: bool,
    },

    /// Inspect and manage runs.
    Runs {
        #[command(subcommand)]
        action: RunsAction,
    },
}

#[derive(Subcommand)]
enum RunsAction {
    /// List runs, most recently updated first.
    List {
        /// Filter by status: pending, running, completed, failed.
        #[arg(long)]
        status: Option<String>,

        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Show a run by run id or entity id.
    Show { id: String },
    /// Cancel a run by run id or entity id.
    Cancel { id: String },
    /// Delete finished runs older than the retention window.
    Prune {
        /// Override `orchestrator.retention_hours`.
        #[arg(long)]
        older_than_hours: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = load_config(cli.config.as_deref())?;
    let app = App::open(cfg).await?;

    match cli.command {
        Commands::Init { index } => {
            if index {
                app.index
                    .ensure_schema()
                    .await
                    .map_err(|e| anyhow::anyhow!("Failed to create search index: {}", e))?;
                println!("Search index '{}' ready.", app.config.index.name);
            }
            println!("Broker:    {}", app.config.broker.path.display());
            println!("Run store: {}", app.config.orchestrator.path.display());
            println!("Initialized successfully.");
        }
        Commands::Serve => {
            server::serve(Arc::new(app)).await?;
        }
        Commands::Ingest {
            file,
            topic,
            process,
        } => {
            ingest::run_ingest(&app, &file, &topic, process).await?;
        }
        Commands::Runs { action } => match action {
            RunsAction::List { status, limit } => runs::run_list(&app, status, limit).await?,
            RunsAction::Show { id } => runs::run_show(&app, &id).await?,
            RunsAction::Cancel { id } => runs::run_cancel(&app, &id).await?,
            RunsAction::Prune { older_than_hours } => {
                runs::run_prune(&app, older_than_hours).await?
            }
        },
    }

    Ok(())
}
