//! snapsort CLI - runs the clustering and stacking engine over fixture files.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{ClusterCommand, StacksCommand};

/// snapsort CLI - group faces into people and photos into similar-shot stacks.
///
/// Input fixtures are YAML or JSON files holding embeddings and metadata.
/// Engine settings come from an optional YAML config (`--config`); every
/// field has a default.
#[derive(Parser)]
#[command(name = "snapsort")]
#[command(about = "Face clustering and similar-shot stacking")]
#[command(version)]
pub struct Cli {
    /// Engine config file (YAML)
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Output file (default: stdout)
    #[arg(short = 'o', long, global = true)]
    pub output: Option<String>,

    /// Input fixture file (YAML or JSON)
    #[arg(short = 'f', long = "file", global = true)]
    pub input: Option<String>,

    /// Output as JSON (for piping)
    #[arg(long, global = true)]
    pub json: bool,

    /// Verbose output
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Cluster face embeddings into people
    Cluster(ClusterCommand),
    /// Group photo embeddings into similar-shot stacks
    Stacks(StacksCommand),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins; -v raises the default to debug.
    let level = if cli.verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match &cli.command {
        Commands::Cluster(cmd) => cmd.run(&cli).await,
        Commands::Stacks(cmd) => cmd.run(&cli).await,
    }
}
