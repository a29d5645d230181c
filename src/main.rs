//! # Persona Harness CLI (`persona`)
//!
//! ## Usage
//!
//! ```bash
//! persona --config ./config/persona.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `persona init` | Create the database and seed a default template per personality |
//! | `persona ingest <file.jsonl>` | Chunk, embed, and store corpus passages |
//! | `persona template publish\|show\|history\|rollback` | Manage prompt template versions |
//! | `persona ask "<query>" --personality <id>` | Answer one question |
//! | `persona stats` | Corpus, template, and cache counts |
//! | `persona cache purge` | Drop expired durable cache entries |
//! | `persona serve` | Start the HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! persona init
//! persona ingest ./corpus/gita.jsonl
//! persona ask "What is dharma?" --personality krishna
//! persona template publish --personality krishna --file ./templates/krishna.txt
//! persona serve
//! ```
//!
//! Logs go to stderr; set `RUST_LOG` to adjust (default `info`).

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use persona_harness::cache::durable;
use persona_harness::orchestrator::{self, AskArgs};
use persona_harness::{config, ingest, migrate, server, stats, templates};
use persona_harness_core::ratelimit::Tier;
use persona_harness_core::template::VersionSelector;

/// Persona Harness: grounded, persona-specific answers from partitioned
/// corpora with versioned prompt templates.
#[derive(Parser)]
#[command(
    name = "persona",
    about = "Persona Harness: grounded answers from historical and spiritual personalities",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/persona.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent. Personalities with no template yet get the stock
    /// template as version 1.
    Init,

    /// Ingest corpus passages from a JSONL file.
    ///
    /// One passage per line:
    /// `{"personality_id", "source", "chapter"?, "verse"?, "text", "domain_tags"?}`.
    /// Chunks already stored (same personality, same content) are skipped.
    Ingest {
        path: PathBuf,

        /// Parse and chunk, but write nothing.
        #[arg(long)]
        dry_run: bool,
    },

    /// Manage prompt templates.
    Template {
        #[command(subcommand)]
        action: TemplateAction,
    },

    /// Ask a personality a question.
    Ask {
        query: String,

        #[arg(long)]
        personality: String,

        #[arg(long, default_value = "en")]
        language: String,

        /// Passages to retrieve (defaults to `retrieval.k`).
        #[arg(long)]
        k: Option<usize>,

        /// Minimum cosine similarity (defaults to `retrieval.similarity_threshold`).
        #[arg(long)]
        threshold: Option<f32>,

        #[arg(long, default_value = "anonymous")]
        tier: Tier,

        #[arg(long, default_value = "cli")]
        user: String,

        /// Print the full response as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show database statistics.
    Stats,

    /// Maintain the response cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Start the HTTP server on `server.bind`.
    Serve,
}

#[derive(Subcommand)]
enum TemplateAction {
    /// Publish a new version from a file.
    Publish {
        #[arg(long)]
        personality: String,

        #[arg(long, default_value = "default")]
        id: String,

        #[arg(long)]
        file: PathBuf,

        #[arg(long, default_value = "cli")]
        author: String,
    },

    /// Print a version (latest unless `--version` is given).
    Show {
        #[arg(long)]
        personality: String,

        #[arg(long, default_value = "default")]
        id: String,

        #[arg(long)]
        version: Option<u64>,
    },

    /// List every version, oldest first.
    History {
        #[arg(long)]
        personality: String,

        #[arg(long, default_value = "default")]
        id: String,
    },

    /// Republish an earlier version's body as a new version.
    Rollback {
        #[arg(long)]
        personality: String,

        #[arg(long, default_value = "default")]
        id: String,

        #[arg(long)]
        to: u64,

        #[arg(long, default_value = "cli")]
        author: String,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Delete expired entries from the durable tier.
    Purge,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            let seeded = templates::seed_defaults(&cfg).await?;
            println!("Database initialized successfully.");
            if seeded > 0 {
                println!("Seeded default template for {} personalities.", seeded);
            }
        }
        Commands::Ingest { path, dry_run } => {
            ingest::run_ingest(&cfg, &path, dry_run).await?;
        }
        Commands::Template { action } => match action {
            TemplateAction::Publish {
                personality,
                id,
                file,
                author,
            } => {
                templates::run_publish(&cfg, &id, &personality, &file, &author).await?;
            }
            TemplateAction::Show {
                personality,
                id,
                version,
            } => {
                let selector = version
                    .map(VersionSelector::Exact)
                    .unwrap_or(VersionSelector::Latest);
                templates::run_show(&cfg, &id, &personality, selector).await?;
            }
            TemplateAction::History { personality, id } => {
                templates::run_history(&cfg, &id, &personality).await?;
            }
            TemplateAction::Rollback {
                personality,
                id,
                to,
                author,
            } => {
                templates::run_rollback(&cfg, &id, &personality, to, &author).await?;
            }
        },
        Commands::Ask {
            query,
            personality,
            language,
            k,
            threshold,
            tier,
            user,
            json,
        } => {
            orchestrator::run_ask(
                &cfg,
                AskArgs {
                    query,
                    personality_id: personality,
                    language,
                    k,
                    similarity_threshold: threshold,
                    tier,
                    user_id: user,
                    json,
                },
            )
            .await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Cache { action } => match action {
            CacheAction::Purge => {
                durable::run_purge(&cfg).await?;
            }
        },
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
