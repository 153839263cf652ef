mod db;
mod fs;
mod service;
mod task;

use std::path::PathBuf;

use anyhow::Result;
use clap::{arg, command, Parser};
use tracing::info;
use tracing_subscriber::EnvFilter;

use common::config::read_config;
use service::{EntanglementService, ESMRegistry};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// config file
    #[arg(short, long, default_value = "/etc/entanglement/config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = read_config(PathBuf::from(cli.config)).await?;

    let registry = ESMRegistry::new();

    // db has to be up first: both fs and task look it up via the registry
    // as soon as they start handling messages.
    let db_service = db::svc::DbService::create(config.clone(), &registry);
    db_service.start(&registry).await?;

    let fs_service = fs::svc::FsService::create(config.clone(), &registry);
    fs_service.start(&registry).await?;

    let task_service = task::svc::TaskService::create(config.clone(), &registry);
    task_service.start(&registry).await?;

    info!("scanner backend started");

    // the services run as detached tasks behind their esm channels; block
    // here until the process is asked to stop.
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    Ok(())
}
