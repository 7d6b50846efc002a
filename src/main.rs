//! # ragbase CLI (`rag`)
//!
//! The `rag` binary is the primary interface for ragbase. It provides
//! commands for database initialization, knowledge-group syncing,
//! question answering, and starting the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! rag --config ./config/ragbase.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rag init` | Create the SQLite database and run schema migrations |
//! | `rag groups` | List knowledge groups and their run status |
//! | `rag sync <group>` | Run one ingestion sync for a group |
//! | `rag stop <group>` | Cooperatively stop a running sync |
//! | `rag items <group>` | List a group's ingested items |
//! | `rag search "<query>"` | Inspect what retrieval would return |
//! | `rag ask "<query>"` | Answer a question against a group |
//! | `rag clear <group>` | Delete a group's items and index records |
//! | `rag serve` | Start the HTTP API server |

mod answer;
mod broker;
mod chunk;
mod citation;
mod config;
mod crawl;
mod db;
mod dedup;
mod embedding;
mod flow;
mod indexer;
mod ingest;
mod kb;
mod llm;
mod migrate;
mod models;
mod server;
mod sources;
mod store;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use crate::answer::{AnswerEvent, AnswerListener, AnswerOptions, Answerer};
use crate::citation::{extract_citations, CitationOptions};
use crate::crawl::HttpFetcher;
use crate::flow::FlowOptions;
use crate::indexer::{make_indexer, Indexer};
use crate::ingest::{clear_group, run_sync, stop_group, SyncDeps};
use crate::llm::{get_model, OpenAiChatModel};
use crate::store::sqlite::SqliteStore;
use crate::store::MetaStore;

/// ragbase — a knowledge-base ingestion and retrieval-augmented
/// answering engine.
#[derive(Parser)]
#[command(
    name = "rag",
    about = "ragbase — ingest content sources into a searchable knowledge base and answer questions with cited responses",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ragbase.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. This
    /// command is idempotent.
    Init,

    /// List knowledge groups and their run status.
    Groups,

    /// Run one ingestion sync for a group.
    Sync {
        /// Group name as configured under `[groups.<name>]`.
        group: String,

        /// Override the group's page limit for this run.
        #[arg(long)]
        limit: Option<usize>,

        /// File to ingest, for `upload` groups.
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Cooperatively stop a running sync.
    ///
    /// The crawler observes the status change before its next fetch;
    /// requests already in flight finish naturally.
    Stop {
        group: String,
    },

    /// List a group's ingested items with status and errors.
    Items {
        group: String,
    },

    /// Search a group's knowledge base without answering.
    ///
    /// Prints the reranked passages with scores and source URLs; useful
    /// for inspecting what the answer loop would retrieve.
    Search {
        /// The search query.
        query: String,

        /// Group to search.
        #[arg(long)]
        group: String,
    },

    /// Answer a question against a group's knowledge base.
    Ask {
        /// The question.
        query: String,

        /// Group to answer from.
        #[arg(long)]
        group: String,

        /// Print source links after the answer.
        #[arg(long)]
        show_sources: bool,
    },

    /// Delete a group's items and index records.
    Clear {
        group: String,
    },

    /// Start the HTTP API server.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("ragbase=info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }

        Commands::Groups => {
            let store = open_store(&cfg).await?;
            sources::list_groups(&cfg, store.as_ref()).await?;
        }

        Commands::Sync { group, limit, file } => {
            let store = open_store(&cfg).await?;
            let upload = match file {
                Some(path) => {
                    let text = std::fs::read_to_string(&path)?;
                    let title = path
                        .file_stem()
                        .map(|s| s.to_string_lossy().to_string())
                        .unwrap_or_else(|| "upload".to_string());
                    Some((title, text))
                }
                None => None,
            };

            let deps = SyncDeps {
                store,
                fetcher: Arc::new(HttpFetcher::new()?),
                upload,
                external_adapter: None,
            };

            let report = run_sync(&cfg, deps, &group, limit).await?;
            println!("sync {}", report.group_id);
            println!("  visited: {} keys", report.visited);
            println!("  completed items: {}", report.completed);
            println!("  failed items: {}", report.failed);
            if report.stale_removed > 0 {
                println!("  stale removed: {}", report.stale_removed);
            }
            match report.error {
                Some(error) => println!("error: {}", error),
                None => println!("ok"),
            }
        }

        Commands::Stop { group } => {
            let store = open_store(&cfg).await?;
            stop_group(store.as_ref(), &group).await?;
            println!("Stop requested for '{}'.", group);
        }

        Commands::Items { group } => {
            let store = open_store(&cfg).await?;
            sources::list_items(store.as_ref(), &group).await?;
        }

        Commands::Search { query, group } => {
            let group_config = cfg
                .groups
                .get(&group)
                .ok_or_else(|| anyhow::anyhow!("Unknown knowledge group: '{}'", group))?;
            let indexer = make_indexer(&cfg, group_config.indexer.as_deref())?;

            let options = indexer::SearchOptions {
                top_k: cfg.retrieval.top_k,
                exclude_ids: Vec::new(),
            };
            let raw = indexer.search(&group, &query, &options).await?;
            let passages = indexer.process(&query, raw).await?;

            if passages.is_empty() {
                println!("No results.");
            }
            for (i, passage) in passages.iter().enumerate() {
                println!("{}. [{:.2}] {}", i + 1, passage.score, passage.url.as_deref().unwrap_or("-"));
                println!(
                    "    excerpt: \"{}\"",
                    passage.content.replace('\n', " ").chars().take(160).collect::<String>()
                );
            }
        }

        Commands::Ask {
            query,
            group,
            show_sources,
        } => {
            let store = open_store(&cfg).await?;
            ask(&cfg, store, &group, &query, show_sources).await?;
        }

        Commands::Clear { group } => {
            let store = open_store(&cfg).await?;
            let group_config = cfg
                .groups
                .get(&group)
                .ok_or_else(|| anyhow::anyhow!("Unknown knowledge group: '{}'", group))?;
            let indexer = make_indexer(&cfg, group_config.indexer.as_deref())?;
            clear_group(store.as_ref(), indexer.as_ref(), &group).await?;
            println!("Cleared '{}'.", group);
        }

        Commands::Serve => {
            let store = open_store(&cfg).await?;
            let fetcher = Arc::new(HttpFetcher::new()?);
            server::run_server(&cfg, store, fetcher).await?;
        }
    }

    Ok(())
}

async fn open_store(cfg: &config::Config) -> anyhow::Result<Arc<dyn MetaStore>> {
    let pool = db::connect(cfg).await?;
    migrate::apply_schema(&pool).await?;
    Ok(Arc::new(SqliteStore::new(pool)))
}

async fn ask(
    cfg: &config::Config,
    store: Arc<dyn MetaStore>,
    group_name: &str,
    query: &str,
    show_sources: bool,
) -> anyhow::Result<()> {
    let group = cfg
        .groups
        .get(group_name)
        .ok_or_else(|| anyhow::anyhow!("Unknown knowledge group: '{}'", group_name))?;

    let indexer = make_indexer(cfg, group.indexer.as_deref())?;

    let mut model_config = get_model(&cfg.llm.model);
    if let Some(base_url) = &cfg.llm.base_url {
        model_config.base_url = base_url.clone();
    }
    model_config.api_key_env = cfg.llm.api_key_env.clone();
    let credits = model_config.credits_per_message;

    let answerer = Answerer::new(
        store,
        indexer,
        Arc::new(OpenAiChatModel::new(model_config)?),
        AnswerOptions {
            group_id: group_name.to_string(),
            collection_id: group_name.to_string(),
            chat_prompt: group.chat_prompt.clone(),
            top_k: cfg.retrieval.top_k,
            min_score: group.min_score,
            credits_per_message: credits,
            flow: FlowOptions {
                max_tool_calls: cfg.llm.max_tool_calls,
                max_steps: cfg.llm.max_steps,
            },
        },
    );

    // Stream deltas straight to stdout as they arrive.
    let listener: Arc<AnswerListener> = Arc::new(|event: AnswerEvent| match event {
        AnswerEvent::ToolCall { query } => {
            eprintln!("[searching: {}]", query);
        }
        AnswerEvent::StreamDelta { delta, .. } => {
            print!("{}", delta);
            use std::io::Write;
            let _ = std::io::stdout().flush();
        }
        _ => {}
    });

    let result = answerer.answer(query, Vec::new(), Some(listener)).await?;
    println!();

    match result {
        Some(AnswerEvent::AnswerComplete {
            content, sources, ..
        }) => {
            if show_sources {
                let extracted =
                    extract_citations(&content, &sources, CitationOptions { clean_citations: true });
                if !extracted.cited_links.is_empty() {
                    println!("\nSources:");
                    for (index, link) in &extracted.cited_links {
                        println!(
                            "  [{}] {} {}",
                            index,
                            link.title.as_deref().unwrap_or("(untitled)"),
                            link.url.as_deref().unwrap_or("")
                        );
                    }
                }
            }
        }
        _ => {
            println!("I don't know.");
        }
    }

    Ok(())
}
