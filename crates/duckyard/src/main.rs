//! duckyard command-line interface
//!
//! Attach external databases to a per-project DuckDB warehouse, cache their
//! tables, register folders of data files, import files, and define and run
//! analyses over all of it, or run ad-hoc queries.

use anyhow::Result;
use clap::{Parser, Subcommand};
use duckyard_logging::{init_logging, LogConfig};
use std::path::PathBuf;
use std::process::ExitCode;

mod cli;

use cli::analysis::AnalysisAction;
use cli::cache::CacheAction;
use cli::config::DuckyardConfig;
use cli::context::CliContext;
use cli::file::FileAction;
use cli::folder::FolderAction;
use cli::query::QueryAction;
use cli::source::SourceAction;

#[derive(Parser, Debug)]
#[command(name = "duckyard", version, about = "DuckDB source federation and analyses")]
struct Cli {
    /// Enable verbose logging (info/debug to stderr)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Print machine-readable JSON instead of tables
    #[arg(long, global = true)]
    json: bool,

    /// Data directory holding project warehouses (overrides config.toml)
    #[arg(long, global = true, env = "DUCKYARD_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Project to operate on (overrides config.toml)
    #[arg(short = 'p', long, global = true, env = "DUCKYARD_PROJECT")]
    project: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Attach, inspect and detach external databases
    Source {
        #[command(subcommand)]
        action: SourceAction,
    },
    /// Local copies of source tables
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Local directories of CSV and Parquet files
    Folder {
        #[command(subcommand)]
        action: FolderAction,
    },
    /// Named SQL analyses with dependency-aware runs
    Analysis {
        #[command(subcommand)]
        action: AnalysisAction,
    },
    /// CSV and Parquet files imported as warehouse tables
    File {
        #[command(subcommand)]
        action: FileAction,
    },
    /// Ad-hoc SQL whose results are kept as tables
    Query {
        #[command(subcommand)]
        action: QueryAction,
    },
    /// Show resolved configuration and paths
    Config,
}

fn run_command(cli: Cli) -> Result<()> {
    let config = DuckyardConfig::load()?;
    let ctx = CliContext::new(config, cli.data_dir, cli.project, cli.json)?;
    match cli.command {
        Commands::Source { action } => cli::source::run(&ctx, action),
        Commands::Cache { action } => cli::cache::run(&ctx, action),
        Commands::Folder { action } => cli::folder::run(&ctx, action),
        Commands::Analysis { action } => cli::analysis::run(&ctx, action),
        Commands::File { action } => cli::file::run(&ctx, action),
        Commands::Query { action } => cli::query::run(&ctx, action),
        Commands::Config => cli::config::run(&ctx),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let json_mode = cli.json;

    if let Err(err) = init_logging(LogConfig {
        app_name: "duckyard",
        verbose: cli.verbose,
        log_dir: None,
    }) {
        eprintln!("Warning: logging disabled: {:#}", err);
    }

    match run_command(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if json_mode {
                cli::error::print_json_error(&err);
            } else {
                cli::error::print_error(&err);
            }
            ExitCode::from(1)
        }
    }
}
