//! Kiln
//!
//! Command-line entry point for the Kiln build worker.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kiln_runner::commands::{Commands, handle_command};
use kiln_runner::config::Config;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "Kiln commit-triggered build worker", long_about = None)]
struct Cli {
    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kiln_runner=info,kiln_store=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let database_url = cli.database_url;
    let config = Config::from_lookup(|key| match key {
        "DATABASE_URL" => database_url.clone(),
        _ => std::env::var(key).ok(),
    })?;
    config.validate()?;

    handle_command(cli.command, &config).await
}
