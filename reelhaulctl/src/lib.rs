pub mod commands;

use std::io;
use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinError;
use tracing::debug;

use reelhaul_core::{
    load_ingest_config, CatalogError, ConfigError, DiscoveryError, IndexError, IngestConfig,
    IngestError, IngestRuntime, IngestService, SourceType,
};

use commands::{DiscoverArgs, DownloadArgs, EncodeArgs, ErrorsArgs, SearchArgs, WatchArgs};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("background task failed: {0}")]
    Task(#[from] JoinError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Video ingest pipeline control interface", long_about = None)]
pub struct Cli {
    /// Path to ingest.toml
    #[arg(long, default_value = "configs/ingest.toml")]
    pub config: PathBuf,
    /// Output format
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Crawl a source and persist the videos it lists
    Discover(DiscoverArgs),
    /// Download, encode and store catalog videos
    Download(DownloadArgs),
    /// Copy the catalog into the search index
    Sync,
    /// Query the search index
    Search(SearchArgs),
    /// Write a stored video to a local file
    Watch(WatchArgs),
    /// Fetch and encode a stream URL straight to a file
    Encode(EncodeArgs),
    /// Show recorded pipeline failures
    Errors(ErrorsArgs),
    /// Print shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

pub fn run(cli: Cli) -> Result<()> {
    if let Commands::Completions { shell } = &cli.command {
        let mut command = Cli::command();
        let name = command.get_name().to_string();
        clap_complete::generate(*shell, &mut command, name, &mut io::stdout());
        return Ok(());
    }

    let config = load_ingest_config(&cli.config)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run_with_config(cli, config))
}

async fn run_with_config(cli: Cli, config: IngestConfig) -> Result<()> {
    let ingest = IngestRuntime::start(config)?;
    debug!(config = %cli.config.display(), "runtime ready");
    let outcome = execute(&cli, ingest.service()).await;
    // Downloads, uploads and error records queued by the command finish
    // before the lanes are torn down.
    ingest.wait_idle().await;
    ingest.shutdown().await;
    outcome
}

async fn execute(cli: &Cli, service: &IngestService) -> Result<()> {
    match &cli.command {
        Commands::Discover(args) => {
            render(&commands::discover::run(service, args).await?, cli.format)
        }
        Commands::Download(args) => {
            render(&commands::download::run(service, args).await?, cli.format)
        }
        Commands::Sync => render(&commands::index::sync(service).await?, cli.format),
        Commands::Search(args) => {
            render(&commands::index::search(service, args).await?, cli.format)
        }
        Commands::Watch(args) => render(&commands::media::watch(service, args).await?, cli.format),
        Commands::Encode(args) => {
            render(&commands::media::encode(service, args).await?, cli.format)
        }
        Commands::Errors(args) => render(&commands::errors::run(service, args).await?, cli.format),
        Commands::Completions { .. } => Ok(()),
    }
}

pub(crate) fn parse_source(raw: &str) -> std::result::Result<SourceType, String> {
    raw.parse()
        .map_err(|err: CatalogError| err.to_string())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    println!("{}", render_to_string(value, format)?);
    Ok(())
}

fn render_to_string<T>(value: &T, format: OutputFormat) -> Result<String>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => Ok(value.display()),
        OutputFormat::Json => Ok(serde_json::to_string_pretty(value)?),
    }
}

pub trait DisplayFallback {
    fn display(&self) -> String;
}
