mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use mosaic::config::MosaicConfig;
use mosaic::store::Visibility;

#[derive(Parser)]
#[command(name = "mosaic", version, about = "Multimodal media search with CLIP embeddings")]
struct Cli {
    /// Config file (defaults to ~/.mosaic/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage the embedding model
    Model {
        #[command(subcommand)]
        action: ModelAction,
    },
    /// Store media files and index them
    Ingest {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Owning user id (omit for system media, which must be public)
        #[arg(long)]
        owner: Option<String>,
        #[arg(long, default_value = "public")]
        visibility: Visibility,
        /// Tag to attach (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// Search by image or text
    Search {
        /// Query image file
        #[arg(long, conflicts_with = "text")]
        image: Option<PathBuf>,
        /// Query text
        #[arg(long)]
        text: Option<String>,
        #[command(flatten)]
        opts: cli::search::QueryOptions,
    },
    /// Find media similar to a stored image
    Similar {
        media_id: String,
        #[command(flatten)]
        opts: cli::search::QueryOptions,
    },
    /// Delete a media item, its bytes and its vector
    Delete { media_id: String },
    /// Rebuild all vectors with the configured model
    Reindex,
    /// Run diagnostics
    Doctor,
}

#[derive(Subcommand)]
enum ModelAction {
    /// Download the CLIP model to ~/.mosaic/models/
    Download,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => MosaicConfig::load_from(path)?,
        None => MosaicConfig::load()?,
    };

    // Log to stderr so stdout stays clean for --json output.
    let filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Model { action } => match action {
            ModelAction::Download => {
                cli::model_download(&config.embedding).await?;
            }
        },
        Command::Ingest {
            files,
            owner,
            visibility,
            tags,
        } => {
            let opts = cli::ingest::IngestOptions {
                owner,
                visibility,
                tags,
            };
            cli::ingest::ingest(&config, &files, opts).await?;
        }
        Command::Search { image, text, opts } => {
            cli::search::search(&config, image, text, &opts).await?;
        }
        Command::Similar { media_id, opts } => {
            cli::search::similar(&config, &media_id, &opts).await?;
        }
        Command::Delete { media_id } => {
            cli::ingest::delete(&config, &media_id).await?;
        }
        Command::Reindex => {
            cli::reindex::reindex(&config).await?;
        }
        Command::Doctor => {
            cli::doctor::doctor(&config).await?;
        }
    }

    Ok(())
}
