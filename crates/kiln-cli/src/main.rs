//! Kiln CLI entrypoint.

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod handlers;

use commands::{Commands, ConfigCommands, CorpusCommands};
use config::{KilnConfig, LogFormat, LoggingConfig};

#[derive(Parser)]
#[command(name = "kiln")]
#[command(author, version, about = "GPU build orchestration and failure triage", long_about = None)]
struct Cli {
    /// Configuration file (defaults to ./kiln.yaml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = KilnConfig::load(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Run { builds } => handlers::run(&config, &builds).await?,
        Commands::Triage { log, json } => handlers::triage(&config, &log, json).await?,
        Commands::Parse { log } => handlers::parse(&config, &log).await?,
        Commands::Corpus { command } => match command {
            CorpusCommands::List { category } => {
                handlers::corpus_list(&config, category.as_deref()).await?
            }
            CorpusCommands::RecordFix {
                signature,
                fix,
                failed,
            } => handlers::corpus_record_fix(&config, &signature, &fix, !failed).await?,
        },
        Commands::Config { command } => match command {
            ConfigCommands::Show => handlers::show_config(&config)?,
            ConfigCommands::Init { force } => handlers::init_config(force)?,
        },
    }

    Ok(())
}
