//! HGX command line
//!
//! Inspects engine configuration and runs an end-to-end demo of dynamic
//! objects between in-memory peers.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

use commands::{config::ConfigAction, demo::DemoArgs};

#[derive(Parser)]
#[command(name = "hgx")]
#[command(about = "HGX - encrypted dynamic objects", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file path
    #[arg(short, long, global = true, default_value = "hgx.toml")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect and validate configuration
    #[command(subcommand)]
    Config(ConfigAction),

    /// Share and update an object between two in-memory peers
    Demo(DemoArgs),
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Config(action) => commands::config::run(action, &cli.config)?,
        Commands::Demo(args) => commands::demo::run(args, &cli.config).await?,
    }
    Ok(())
}
