//! Stratorun - Execution-Dispatch Middleware
//!
//! Gateway binary: loads the configuration, wires the storage
//! backend and daemon matcher, and serves the submission API.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use anyhow::Result;

use stratorun::api::template::MemoryTemplateCache;
use stratorun::api::GatewayServer;
use stratorun::config::StratorunConfig;
use stratorun::daemon::DaemonMatcher;
use stratorun::storage::HttpStorage;

/// Stratorun - Execution-Dispatch Middleware
#[derive(Parser)]
#[command(name = "stratorun")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "stratorun.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the execution gateway
    Start,

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "stratorun.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level);

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Validate => run_validate(cli.config),
        Commands::Init { output } => run_init(output),
    }
}

fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run_start(config_path: PathBuf) -> Result<()> {
    let config = Arc::new(StratorunConfig::from_file(&config_path)?);
    tracing::info!(
        "Starting stratorun gateway with {} worker hosts",
        config.cluster.hosts.len()
    );

    let storage = Arc::new(HttpStorage::new(
        &config.server.storage_url,
        &config.cluster,
    )?);
    let daemons = Arc::new(
        DaemonMatcher::load(
            &config.daemons,
            &config.execution.sysimage_devices,
            &config.execution.default_content_type,
            config.limits,
        )
        .await,
    );
    let cache = Arc::new(MemoryTemplateCache::default());

    let server = GatewayServer::new(Arc::clone(&config), storage, daemons, cache);
    server.start().await?;
    Ok(())
}

fn run_validate(config_path: PathBuf) -> Result<()> {
    let config = StratorunConfig::from_file(&config_path)?;
    println!("Configuration OK: {}", config_path.display());
    println!("  gateway bind: {}", config.server.bind_address);
    println!("  storage url:  {}", config.server.storage_url);
    println!("  worker hosts: {}", config.cluster.hosts.len());
    println!(
        "  sysimages:    {}",
        config
            .execution
            .sysimage_devices
            .keys()
            .cloned()
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(())
}

fn run_init(output: PathBuf) -> Result<()> {
    let config = StratorunConfig::example();
    let rendered = toml::to_string_pretty(&config)?;
    std::fs::write(&output, rendered)?;
    println!("Wrote example configuration to {}", output.display());
    Ok(())
}
