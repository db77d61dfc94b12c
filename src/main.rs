//! # Sitekeeper CLI (`sitekeeper`)
//!
//! Runs the admin HTTP API and offers the same bin, deployment, media and
//! taxonomy operations from the command line.
//!
//! ## Usage
//!
//! ```bash
//! sitekeeper --config ./config/sitekeeper.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `sitekeeper serve` | Start the admin HTTP API |
//! | `sitekeeper bin list` | List binned posts and pages |
//! | `sitekeeper bin move <kind> <file>` | Move a post or page to the bin |
//! | `sitekeeper bin restore <file>` | Restore a binned item |
//! | `sitekeeper bin purge <file> --sha <sha>` | Delete a binned item for good |
//! | `sitekeeper deploy history` | Recent deployments, local and CI |
//! | `sitekeeper deploy status <sha>` | CI status for one commit |
//! | `sitekeeper deploy watch` | Follow in-flight deployments until they finish |
//! | `sitekeeper images list` | List Cloudinary images |
//! | `sitekeeper images audit` | Find missing and unused images |
//! | `sitekeeper taxonomy show` | Print categories and tags |
//! | `sitekeeper completions <shell>` | Print shell completions |
//!
//! Credentials are read from the environment variables named in the config
//! (`GITHUB_TOKEN`, `CLOUDINARY_API_KEY`, `CLOUDINARY_API_SECRET` and
//! `SITEKEEPER_ADMIN_TOKEN` by default). Logs go to stderr; `RUST_LOG`
//! overrides `-v`.

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use sitekeeper::commands;
use sitekeeper::config;
use sitekeeper::models::ContentKind;
use sitekeeper::server::{self, AppContext};

/// Content admin for GitHub-backed static sites.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/sitekeeper.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "sitekeeper",
    about = "Content admin for GitHub-backed static sites",
    version,
    long_about = "Sitekeeper edits posts, pages, taxonomy and site settings as commits through \
    the GitHub Contents API, keeps deleted items in a bin, manages Cloudinary images, and tracks \
    the CI deployment each commit triggers."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/sitekeeper.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the admin HTTP API.
    ///
    /// Binds to `[server].bind` and runs until interrupted.
    Serve,

    /// Inspect and manage the bin.
    Bin {
        #[command(subcommand)]
        action: BinAction,
    },

    /// Deployment history and status.
    Deploy {
        #[command(subcommand)]
        action: DeployAction,
    },

    /// Cloudinary images.
    Images {
        #[command(subcommand)]
        action: ImagesAction,
    },

    /// Categories and tags.
    Taxonomy {
        #[command(subcommand)]
        action: TaxonomyAction,
    },

    /// Print a shell completion script to stdout.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum BinAction {
    /// List binned items, most recently binned first.
    List,
    /// Move a post or page to the bin.
    Move {
        /// `post` or `page`.
        kind: ContentKind,
        file: String,
        /// Revision the item was read at.
        #[arg(long)]
        sha: Option<String>,
    },
    /// Restore a binned item to its live directory.
    Restore {
        file: String,
        #[arg(long)]
        sha: Option<String>,
        /// Destination kind. Inferred from the filename when omitted.
        #[arg(long)]
        kind: Option<ContentKind>,
    },
    /// Permanently delete a binned item.
    Purge {
        file: String,
        /// Exact revision to delete.
        #[arg(long)]
        sha: String,
    },
}

#[derive(Subcommand)]
enum DeployAction {
    /// Local deployment log merged with CI history.
    History,
    /// CI status for one commit.
    Status { sha: String },
    /// Follow in-flight deployments until they finish.
    Watch,
}

#[derive(Subcommand)]
enum ImagesAction {
    /// List uploaded images.
    List,
    /// Compare image references in posts with uploaded images.
    Audit,
    /// Add loading="lazy" to <img> tags in posts, one commit per post.
    LazyLoad {
        /// Report what would change without committing.
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
enum TaxonomyAction {
    /// Print the taxonomy document.
    Show {
        /// Print plain category and tag lists instead of YAML.
        #[arg(long)]
        flat: bool,
    },
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "sitekeeper=info",
        1 => "sitekeeper=debug",
        _ => "sitekeeper=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Commands that don't require config
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "sitekeeper", &mut std::io::stdout());
        return Ok(());
    }

    init_logging(cli.verbose);
    let cfg = config::load_config(&cli.config)?;

    if let Commands::Serve = cli.command {
        return server::run_server(&cfg).await;
    }

    let ctx = AppContext::from_config(&cfg)?;
    match cli.command {
        Commands::Bin { action } => match action {
            BinAction::List => commands::run_bin_list(&ctx).await?,
            BinAction::Move { kind, file, sha } => {
                commands::run_bin_move(&ctx, kind, &file, sha.as_deref()).await?
            }
            BinAction::Restore { file, sha, kind } => {
                commands::run_bin_restore(&ctx, &file, sha.as_deref(), kind).await?
            }
            BinAction::Purge { file, sha } => commands::run_bin_purge(&ctx, &file, &sha).await?,
        },
        Commands::Deploy { action } => match action {
            DeployAction::History => commands::run_deploy_history(&ctx).await?,
            DeployAction::Status { sha } => commands::run_deploy_status(&ctx, &sha).await?,
            DeployAction::Watch => commands::run_deploy_watch(&ctx).await?,
        },
        Commands::Images { action } => match action {
            ImagesAction::List => commands::run_images_list(&ctx).await?,
            ImagesAction::Audit => commands::run_images_audit(&ctx).await?,
            ImagesAction::LazyLoad { dry_run } => {
                commands::run_images_lazy_load(&ctx, dry_run).await?
            }
        },
        Commands::Taxonomy { action } => match action {
            TaxonomyAction::Show { flat } => commands::run_taxonomy_show(&ctx, flat).await?,
        },
        Commands::Serve | Commands::Completions { .. } => {}
    }

    Ok(())
}
