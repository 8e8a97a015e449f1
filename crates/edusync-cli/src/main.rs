//! EduSync CLI
//!
//! Command-line interface for EduSync - offline-first school records.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use edusync_core::Config;

mod commands;
mod output;

use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "edusync")]
#[command(about = "EduSync - Offline-first school records")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Use this configuration file instead of the default
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage records in a collection
    Record {
        #[command(subcommand)]
        command: RecordCommands,
    },
    /// Show engine status (connectivity, pending changes, last sync)
    Status,
    /// Sync with the remote store now
    Sync,
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Run a remote document store for development
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:3030")]
        bind: String,
    },
}

#[derive(Subcommand)]
enum RecordCommands {
    /// Create a record from a JSON object
    #[command(alias = "create")]
    Add {
        /// Collection name (students, classes, ...)
        collection: String,
        /// Record body, e.g. '{"name": "Ada"}'
        body: String,
    },
    /// Show one record
    #[command(alias = "show")]
    Get {
        collection: String,
        /// Record ID (full or prefix)
        id: String,
    },
    /// List every record in a collection
    #[command(alias = "ls")]
    List { collection: String },
    /// Find records by an indexed field
    Query {
        collection: String,
        /// Indexed field, e.g. classId
        field: String,
        /// Value to match (parsed as JSON, falling back to a string)
        value: String,
    },
    /// Merge a JSON object into a record
    #[command(alias = "edit")]
    Update {
        collection: String,
        /// Record ID (full or prefix)
        id: String,
        /// Fields to replace, e.g. '{"classId": "c2"}'
        patch: String,
    },
    /// Delete a record
    #[command(alias = "rm")]
    Delete {
        collection: String,
        /// Record ID (full or prefix)
        id: String,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (data_dir, remote_url, auto_sync, ...)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));
    let config_path = cli.config.as_ref();

    // Commands that don't need the local store
    match &cli.command {
        Commands::Config { command } => {
            return handle_config_command(command.clone(), config_path, &output);
        }
        Commands::Serve { bind } => return commands::serve::run(bind, &output).await,
        _ => {}
    }

    let config = load_config(config_path)?;
    let engine = commands::open_engine(&config).await?;
    // Let the connect-time pass pull remote changes before anything is read
    engine.settle().await;

    let result = match cli.command {
        Commands::Record { command } => handle_record_command(command, &engine, &output),
        Commands::Status => commands::status::show(&engine, &config, &output),
        Commands::Sync => commands::sync::sync(&engine, &config, &output).await,
        Commands::Config { .. } | Commands::Serve { .. } => unreachable!(), // Handled above
    };

    // Push what the command wrote before the process exits
    engine.settle().await;
    engine.shutdown();

    result
}

fn handle_record_command(
    command: RecordCommands,
    engine: &edusync_core::SyncEngine,
    output: &Output,
) -> Result<()> {
    use commands::record;

    match command {
        RecordCommands::Add { collection, body } => record::add(engine, &collection, &body, output),
        RecordCommands::Get { collection, id } => record::get(engine, &collection, &id, output),
        RecordCommands::List { collection } => record::list(engine, &collection, output),
        RecordCommands::Query {
            collection,
            field,
            value,
        } => record::query(engine, &collection, &field, &value, output),
        RecordCommands::Update {
            collection,
            id,
            patch,
        } => record::update(engine, &collection, &id, &patch, output),
        RecordCommands::Delete { collection, id } => {
            record::delete(engine, &collection, &id, output)
        }
    }
}

fn handle_config_command(
    command: Option<ConfigCommands>,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    match command {
        Some(ConfigCommands::Show) | None => commands::config::show(config_path, output),
        Some(ConfigCommands::Set { key, value }) => {
            commands::config::set(key, value, config_path, output)
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")
}

/// Log to stderr; RUST_LOG overrides the verbosity flags
fn init_logging(verbose: u8) {
    let log_level = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "edusync_core={},edusync_cli={}",
            log_level, log_level
        ))
    });

    // Ignore error if already initialized
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
