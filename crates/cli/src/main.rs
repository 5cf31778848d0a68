//! Esquire CLI: administration of the conversation store and ranking.
//!
//! Commands:
//! - `history`: Show the most recent turns of a conversation
//! - `append`: Store one turn
//! - `trim`: Keep only the newest turns of a conversation
//! - `stats`: Row count and compaction state
//! - `compact`: Run storage compaction if due (or now, with `--force`)
//! - `rank`: Rank a JSON file of raw search hits
//! - `config`: Show, locate or validate configuration

use clap::{Parser, Subcommand};
use esquire_config::AppConfig;
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(
    name = "esquire",
    about = "Esquire, legal assistant memory and retrieval tooling",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to ~/.esquire/config.toml)
    #[arg(short, long, global = true, env = "ESQUIRE_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the most recent turns of a conversation, oldest first
    History {
        conversation_id: String,

        /// Number of turns (defaults to memory.context_limit)
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Store one turn
    Append {
        conversation_id: String,

        /// `user` or `assistant`
        role: String,

        content: String,
    },

    /// Delete all but the newest turns of a conversation
    Trim {
        conversation_id: String,

        #[arg(short, long)]
        keep: usize,
    },

    /// Show row count and compaction state
    Stats { conversation_id: String },

    /// Compact the store if the interval has elapsed
    Compact {
        /// Compact now regardless of the interval
        #[arg(long)]
        force: bool,
    },

    /// Rank a JSON array of raw search hits and print the result
    Rank {
        file: PathBuf,

        /// JSON object mapping regulation ids to instrument keys
        #[arg(long)]
        links: Option<PathBuf>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Print the config file path
    Path,
    /// Load and validate the configuration
    Validate,
}

fn load_config(path: Option<&PathBuf>) -> Result<AppConfig, Box<dyn std::error::Error>> {
    let path = path.cloned().unwrap_or_else(AppConfig::config_path);
    AppConfig::load_with_env(&path).map_err(|e| format!("Failed to load config: {e}").into())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries command output.
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Commands::Config { action } = &cli.command {
        let path = cli.config.clone().unwrap_or_else(AppConfig::config_path);
        return match action {
            ConfigAction::Show => commands::config_cmd::show(&path).await,
            ConfigAction::Path => commands::config_cmd::path(&path).await,
            ConfigAction::Validate => commands::config_cmd::validate(&path).await,
        };
    }

    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::History { conversation_id, limit } => {
            commands::memory::history(&config, &conversation_id, limit).await?
        }
        Commands::Append { conversation_id, role, content } => {
            commands::memory::append(&config, &conversation_id, &role, &content).await?
        }
        Commands::Trim { conversation_id, keep } => {
            commands::memory::trim(&config, &conversation_id, keep).await?
        }
        Commands::Stats { conversation_id } => {
            commands::memory::stats(&config, &conversation_id).await?
        }
        Commands::Compact { force } => commands::memory::compact(&config, force).await?,
        Commands::Rank { file, links } => {
            commands::rank::run(&config, &file, links.as_deref()).await?
        }
        Commands::Config { .. } => {}
    }

    Ok(())
}
