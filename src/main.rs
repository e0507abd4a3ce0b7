//! Drydock CLI: run the sandbox lifecycle daemon or validate its
//! configuration.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use drydock::auth::provider_from_config;
use drydock::config::CONFIG_FILE;
use drydock::sandbox::DockerBackend;
use drydock::{Config, ImageBuilder, SandboxManager};

#[derive(Parser)]
#[command(
    name = "drydock",
    version,
    about = "Sandbox lifecycle manager for hosted agent execution environments"
)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = CONFIG_FILE)]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon: image builds, warm pools, session reaper
    Serve,
    /// Validate the configuration and print a summary
    Check,
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "drydock=debug"
    } else {
        "drydock=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = Config::load(&cli.config)?;
    match cli.command {
        Command::Serve => serve(config).await,
        Command::Check => check(&config),
    }
}

async fn serve(config: Config) -> Result<()> {
    if config.repositories.is_empty() {
        anyhow::bail!(
            "No repositories configured; add a `repositories` list to {}",
            CONFIG_FILE
        );
    }

    let backend = Arc::new(
        DockerBackend::connect()
            .await
            .context("Docker backend unavailable")?,
    );
    let tokens = provider_from_config(&config.auth)?;
    let images = Arc::new(ImageBuilder::new(
        backend.clone(),
        tokens,
        config.build.clone(),
        config.sandbox.clone(),
    ));
    let manager = Arc::new(SandboxManager::new(config, backend, images));

    info!("Drydock starting");
    let build_loop = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.run_build_loop().await })
    };
    let reaper = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.run_reaper().await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    manager.shutdown().await;
    let _ = build_loop.await;
    let _ = reaper.await;
    info!("Drydock stopped");
    Ok(())
}

fn check(config: &Config) -> Result<()> {
    println!("Configuration OK");
    println!("  repositories:     {}", config.repositories.len());
    for repo in &config.repositories {
        println!("    - {repo}");
    }
    println!("  pool target:      {}", config.pool.target_size);
    println!("  pool max age:     {}m", config.pool.max_age_minutes);
    println!("  build interval:   {}m", config.build.interval_minutes);
    println!("  base branch:      {}", config.build.base_branch);
    println!("  bootstrap image:  {}", config.build.bootstrap_image);
    println!(
        "  sandbox limits:   {}MB / {} cores / {}GB / {}h",
        config.sandbox.memory_mb,
        config.sandbox.cpu_cores,
        config.sandbox.disk_gb,
        config.sandbox.timeout_hours
    );
    println!("  auth provider:    {}", config.auth.provider);
    Ok(())
}
