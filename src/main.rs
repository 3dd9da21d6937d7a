//! # Microblog CLI (`microblog`)
//!
//! ## Usage
//!
//! ```bash
//! microblog --config ./config/microblog.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `microblog init` | Create the primary, queue and search schemas |
//! | `microblog serve` | Start the HTTP API |
//! | `microblog worker` | Run background jobs (`--burst` exits when idle) |
//! | `microblog reindex` | Rebuild the post search index |
//! | `microblog search "<query>"` | Search posts |
//! | `microblog purge-jobs` | Evict expired finished jobs from the queue |

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use microblog::{config, logging, migrate, search_cmd, server, worker};

/// Microblog: posts, followers, private messages, full-text search and
/// background export jobs behind a JSON API.
#[derive(Parser)]
#[command(name = "microblog", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/microblog.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize every database schema.
    ///
    /// Idempotent: running it again leaves existing data untouched.
    Init,

    /// Start the HTTP API on `[server].bind`.
    Serve,

    /// Process background jobs from the queue.
    Worker {
        /// Exit once the queue is empty instead of polling forever.
        #[arg(long)]
        burst: bool,
    },

    /// Re-upsert every post into the search index.
    Reindex,

    /// Full-text search over posts.
    Search {
        /// Free-text query.
        query: String,

        /// Result page (1-based).
        #[arg(long, default_value_t = 1)]
        page: i64,

        /// Results per page. Defaults to `[app].posts_per_page`.
        #[arg(long)]
        per_page: Option<i64>,
    },

    /// Evict finished jobs older than `[queue].result_ttl_secs`.
    PurgeJobs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init_logging(&cfg.log.level);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Worker { burst } => {
            worker::run_worker(&cfg, burst).await?;
        }
        Commands::Reindex => {
            search_cmd::run_reindex(&cfg).await?;
        }
        Commands::Search {
            query,
            page,
            per_page,
        } => {
            search_cmd::run_search(&cfg, &query, page, per_page).await?;
        }
        Commands::PurgeJobs => {
            worker::run_purge_jobs(&cfg).await?;
        }
    }

    Ok(())
}
