//! CLI command definitions.

use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Schedule builds on the configured pool and triage their failures
    Run {
        /// YAML file listing the builds to run
        #[arg(short, long)]
        builds: PathBuf,
    },

    /// Diagnose a build log against the failure corpus
    Triage {
        /// Path to the log file
        log: PathBuf,

        /// Print the analysis as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the error events extracted from a log
    Parse {
        /// Path to the log file
        log: PathBuf,
    },

    /// Inspect and update the failure corpus
    Corpus {
        #[command(subcommand)]
        command: CorpusCommands,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum CorpusCommands {
    /// List known failure signatures
    List {
        /// Only show one category
        #[arg(short, long)]
        category: Option<String>,
    },

    /// Record the result of applying a fix
    RecordFix {
        /// Signature ID
        signature: String,

        /// Fix description
        fix: String,

        /// The fix did not resolve the failure
        #[arg(long)]
        failed: bool,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,

    /// Write a starter kiln.yaml
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}
