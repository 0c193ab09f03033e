//! # Viking Store CLI (`vk`)
//!
//! The `vk` binary drives a Viking Store workspace: writing and reading
//! context under `viking://` URIs, reorganizing the hierarchy,
//! maintaining relations, running the indexing pipeline, and searching.
//!
//! ## Usage
//!
//! ```bash
//! vk --config ./config/vk.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `vk init` | Create the workspace, vector database, and scope roots |
//! | `vk write <uri> --text/--file` | Write a file |
//! | `vk read <uri>` | Print a file |
//! | `vk ls <uri>` / `vk tree <uri>` | List a directory |
//! | `vk mkdir` / `vk rm` / `vk mv` / `vk stat` | Structural operations |
//! | `vk grep` / `vk glob` | Search by content or path pattern |
//! | `vk abstract` / `vk overview` | Print a directory's L0 / L1 |
//! | `vk link` / `vk unlink` / `vk relations` | Relation tables |
//! | `vk reindex <uri> [--wait]` | Queue (and optionally run) a semantic pass |
//! | `vk find` / `vk search` | Hierarchical semantic retrieval |
//! | `vk status` | Queue, vector, and transaction counts |
//!
//! ## Examples
//!
//! ```bash
//! vk init
//! vk write viking://resources/docs/wal.md --file ./wal.md
//! vk reindex viking://resources/docs --wait
//! vk find "how are writes made durable" --uri viking://resources
//! ```
//!
//! Logging goes to stderr and is controlled by `VK_LOG` (falling back
//! to `RUST_LOG`, default `warn`).

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use viking_store::commands;
use viking_store::config::{self, Config};
use viking_store::services::Services;

/// Viking Store CLI: a context store for AI agents.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. A missing file at the default location means built-in defaults.
/// See `config/vk.example.toml` for every key.
#[derive(Parser)]
#[command(
    name = "vk",
    about = "Viking Store: a URI-addressed context store with hierarchical retrieval",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/vk.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the workspace.
    ///
    /// Creates the object-store root, the vector database and collection,
    /// and the `resources`, `user`, and `agent` scope directories.
    /// Running it again is safe.
    Init,

    /// Write a file from a local path or inline text.
    Write {
        uri: String,
        /// Read content from this local file.
        #[arg(long, conflicts_with = "text")]
        file: Option<PathBuf>,
        /// Use this text as the content.
        #[arg(long)]
        text: Option<String>,
    },

    /// Print a file.
    Read { uri: String },

    /// List a directory.
    Ls {
        #[arg(default_value = "viking://")]
        uri: String,
        /// Include dot-files.
        #[arg(short = 'a', long = "all")]
        all: bool,
        /// Show each child directory's abstract.
        #[arg(long = "abstract")]
        with_abstract: bool,
    },

    /// List a directory recursively.
    Tree {
        #[arg(default_value = "viking://")]
        uri: String,
        #[arg(short = 'a', long = "all")]
        all: bool,
        /// Maximum number of entries.
        #[arg(long, default_value_t = 1000)]
        limit: usize,
    },

    /// Create a directory and any missing ancestors.
    Mkdir { uri: String },

    /// Remove a file or directory and its index entries.
    Rm {
        uri: String,
        /// Remove a non-empty directory.
        #[arg(short = 'r', long)]
        recursive: bool,
    },

    /// Move a file or directory, carrying its index entries along.
    Mv { from: String, to: String },

    /// Show metadata for a node.
    Stat { uri: String },

    /// Search file contents with a regular expression.
    Grep {
        pattern: String,
        #[arg(long, default_value = "viking://")]
        uri: String,
        #[arg(short = 'i', long)]
        ignore_case: bool,
    },

    /// Find nodes by relative path pattern (e.g. `**/*.md`).
    Glob {
        pattern: String,
        #[arg(long, default_value = "viking://")]
        uri: String,
        #[arg(long, default_value_t = 1000)]
        limit: usize,
    },

    /// Print a directory's one-sentence abstract (L0).
    Abstract { uri: String },

    /// Print a directory's overview (L1).
    Overview { uri: String },

    /// Relate one node to others.
    Link {
        from: String,
        #[arg(required = true)]
        to: Vec<String>,
        #[arg(long, default_value = "")]
        reason: String,
    },

    /// Remove a related URI from a node's relation table.
    Unlink { from: String, uri: String },

    /// List a node's related URIs.
    Relations { uri: String },

    /// Queue a semantic pass over a subtree.
    ///
    /// With `--wait`, the pipeline runs in this process until the
    /// semantic and embedding queues are drained.
    Reindex {
        uri: String,
        #[arg(long)]
        wait: bool,
        /// Give up waiting after this many seconds.
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Semantic search in one partition.
    Find {
        query: String,
        /// Restrict to a directory; its URI also selects the partition.
        #[arg(long)]
        uri: Option<String>,
        #[arg(long, default_value_t = 10)]
        limit: usize,
        /// Drop matches scoring below this.
        #[arg(long)]
        threshold: Option<f64>,
    },

    /// Search with optional session context.
    Search {
        query: String,
        #[arg(long)]
        uri: Option<String>,
        /// Summary of the conversation so far.
        #[arg(long)]
        session_summary: Option<String>,
        /// A recent message; repeatable.
        #[arg(long = "message")]
        messages: Vec<String>,
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[arg(long)]
        threshold: Option<f64>,
    },

    /// Show queue, vector, and transaction counts.
    Status,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("VK_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load(path: &Path) -> anyhow::Result<Config> {
    if path.exists() {
        config::load_config(path)
    } else {
        debug!("config {} not found, using defaults", path.display());
        Ok(Config::default())
    }
}

async fn dispatch(services: &Services, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Init => commands::run_init(services).await,
        Commands::Write { uri, file, text } => {
            commands::run_write(services, &uri, file.as_deref(), text.as_deref()).await
        }
        Commands::Read { uri } => commands::run_read(services, &uri).await,
        Commands::Ls {
            uri,
            all,
            with_abstract,
        } => commands::run_ls(services, &uri, all, with_abstract).await,
        Commands::Tree { uri, all, limit } => commands::run_tree(services, &uri, all, limit).await,
        Commands::Mkdir { uri } => commands::run_mkdir(services, &uri).await,
        Commands::Rm { uri, recursive } => commands::run_rm(services, &uri, recursive).await,
        Commands::Mv { from, to } => commands::run_mv(services, &from, &to).await,
        Commands::Stat { uri } => commands::run_stat(services, &uri).await,
        Commands::Grep {
            pattern,
            uri,
            ignore_case,
        } => commands::run_grep(services, &uri, &pattern, ignore_case).await,
        Commands::Glob {
            pattern,
            uri,
            limit,
        } => commands::run_glob(services, &pattern, &uri, limit).await,
        Commands::Abstract { uri } => commands::run_abstract(services, &uri).await,
        Commands::Overview { uri } => commands::run_overview(services, &uri).await,
        Commands::Link { from, to, reason } => {
            commands::run_link(services, &from, to, &reason).await
        }
        Commands::Unlink { from, uri } => commands::run_unlink(services, &from, &uri).await,
        Commands::Relations { uri } => commands::run_relations(services, &uri).await,
        Commands::Reindex { uri, wait, timeout } => {
            commands::run_reindex(services, &uri, wait, timeout.map(Duration::from_secs)).await
        }
        Commands::Find {
            query,
            uri,
            limit,
            threshold,
        } => commands::run_find(services, &query, uri.as_deref(), limit, threshold).await,
        Commands::Search {
            query,
            uri,
            session_summary,
            messages,
            limit,
            threshold,
        } => {
            commands::run_search(
                services,
                &query,
                uri.as_deref(),
                session_summary,
                messages,
                limit,
                threshold,
            )
            .await
        }
        Commands::Status => commands::run_status(services).await,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = load(&cli.config)?;

    let services = Services::open(cfg).await?;
    let result = dispatch(&services, cli.command).await;
    services.stop().await;
    result
}
