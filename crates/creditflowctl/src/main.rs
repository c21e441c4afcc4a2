//! creditflowctl: Command-line inspector for creditflow budget tables.
//!
//! Attaches to the `budgets{owner}` files a file-backed run maps and prints
//! the live budgets or a summary of a table.

mod commands;

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use creditflow::engine::layout_path;

/// Command-line inspector for creditflow budget tables.
#[derive(Parser)]
#[command(name = "creditflowctl")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Output format (text, json)
    #[arg(short, long, default_value = "text")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown output format: {s}")),
        }
    }
}

/// Which budget table to open.
#[derive(Args)]
struct TableArgs {
    /// Path to a budget table file
    #[arg(short, long, conflicts_with = "directory")]
    file: Option<PathBuf>,

    /// Directory holding `budgets{owner}` files
    #[arg(short, long, env = "CREDITFLOW_DIRECTORY")]
    directory: Option<PathBuf>,

    /// Owner partition within --directory
    #[arg(long, default_value_t = 0)]
    owner: usize,
}

impl TableArgs {
    fn path(&self) -> Result<PathBuf> {
        match (&self.file, &self.directory) {
            (Some(file), _) => Ok(file.clone()),
            (None, Some(directory)) => Ok(layout_path(directory, self.owner)),
            (None, None) => bail!("either --file or --directory is required"),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List live budgets of a table
    Budgets {
        #[command(flatten)]
        table: TableArgs,
    },
    /// Summarize a table
    Summary {
        #[command(flatten)]
        table: TableArgs,
    },
}

fn main() -> Result<()> {
    // Initialize tracing for debug output
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Budgets { table } => commands::budgets::run(&table.path()?, cli.output)?,
        Commands::Summary { table } => commands::summary::run(&table.path()?, cli.output)?,
    }

    Ok(())
}
