//! sugar: inspect and edit a sugar persistence store from the command line

mod commands;
mod output;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "sugar")]
#[command(about = "Manage a sugar persistence store")]
#[command(version)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Minimal output (IDs only)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Log stack activity to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Open the store at this path instead of the configured one
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show where the store lives and how it was opened
    Status,
    /// Open the store, creating or migrating it as needed
    Init,
    /// Insert an object and save it
    #[command(alias = "add")]
    Insert {
        /// Entity name
        entity: String,
        /// Property as key=value; values are parsed as JSON when possible
        #[arg(short, long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,
    },
    /// Count the objects of an entity
    Count { entity: String },
    /// List the objects of an entity
    #[command(alias = "ls")]
    List { entity: String },
    /// Delete an object by id
    #[command(alias = "rm")]
    Delete { entity: String, id: String },
    /// Delete the store file
    Remove {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        force: bool,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Set a configuration value
    Set { key: String, value: String },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "sugar_core=debug" } else { "warn" };
    let env_filter =
        EnvFilter::try_from_env("SUGAR_LOG").unwrap_or_else(|_| EnvFilter::new(default));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));

    // Commands that don't open the store
    if let Commands::Config { command } = &cli.command {
        return match command.clone() {
            Some(ConfigCommands::Show) | None => commands::config::show(&output),
            Some(ConfigCommands::Set { key, value }) => {
                commands::config::set(key, value, &output)
            }
        };
    }

    let config = commands::load_config(cli.database)?;

    match cli.command {
        Commands::Status => commands::status::show(config, &output).await,
        Commands::Init => commands::init::run(config, &output).await,
        Commands::Insert { entity, set } => {
            commands::object::insert(config, entity, set, &output).await
        }
        Commands::Count { entity } => commands::object::count(config, entity, &output).await,
        Commands::List { entity } => commands::object::list(config, entity, &output).await,
        Commands::Delete { entity, id } => {
            commands::object::delete(config, entity, id, &output).await
        }
        Commands::Remove { force } => commands::remove::run(config, force, &output),
        Commands::Config { .. } => unreachable!(), // Handled above
    }
}
