// src/main.rs
// Hivemind - communal memory layer for a fleet of conversational agents

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use hivemind::activity_log::ActivityLog;
use hivemind::brain::Brain;
use hivemind::config::HivemindConfig;

#[derive(Parser)]
#[command(name = "hivemind", about = "Communal memory layer for a fleet of conversational agents")]
struct Cli {
    /// Path to config.toml (default: ~/.hivemind/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the brain with its background workers until interrupted
    Serve,
    /// Print store statistics as JSON
    Stats,
    /// Print all registered devices as JSON
    Devices,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env from ~/.hivemind only, never from CWD
    if let Some(home) = dirs::home_dir()
        && let Err(e) = dotenvy::from_path(home.join(".hivemind/.env"))
    {
        tracing::debug!("Failed to load global .env file: {}", e);
    }

    let cli = Cli::parse();

    let log_level = match cli.command {
        Some(Commands::Serve) | None => Level::INFO,
        _ => Level::WARN,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let config = match &cli.config {
        Some(path) => HivemindConfig::load_from(path),
        None => HivemindConfig::load(),
    };

    match cli.command {
        None | Some(Commands::Serve) => run_serve(config).await,
        Some(Commands::Stats) => run_stats(config).await,
        Some(Commands::Devices) => run_devices(config).await,
    }
}

async fn run_serve(config: HivemindConfig) -> Result<()> {
    std::fs::create_dir_all(config.data_dir())?;
    let log = ActivityLog::new(config.data_dir().join("hivemind.log"), 1000, 7);
    let brain = Brain::new(config)?;
    brain.initialize().await?;
    log.emit("INFO", &format!("serving as device {}", brain.device_id()));

    tracing::info!(device_id = %brain.device_id(), "hivemind serving; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    brain.close().await?;
    log.emit("INFO", "shut down");
    Ok(())
}

async fn run_stats(config: HivemindConfig) -> Result<()> {
    let brain = Brain::new(config)?;
    brain.initialize().await?;

    let stats = brain.get_memory_stats().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);

    brain.close().await?;
    Ok(())
}

async fn run_devices(config: HivemindConfig) -> Result<()> {
    let brain = Brain::new(config)?;
    brain.initialize().await?;

    let devices = brain.list_devices().await?;
    println!("{}", serde_json::to_string_pretty(&devices)?);

    brain.close().await?;
    Ok(())
}
