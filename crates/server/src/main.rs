use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokenflow_core::definition::load_sources_from_dir;
use tokenflow_core::{Engine, EngineService, TaskRegistry};

mod api;
mod config;

use config::{AppState, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "tokenflow")]
#[command(about = "BPMN-style process execution service", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "tokenflow.toml")]
    config: PathBuf,

    /// Data directory for storage
    #[arg(short, long, default_value = "./data", env = "TOKENFLOW_DATA_DIR")]
    data_dir: PathBuf,

    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tokenflow=info,tokenflow_core=info,tower_http=debug".into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let args = Args::parse();

    tracing::info!("Starting tokenflow");
    tracing::info!("Data directory: {}", args.data_dir.display());

    let config = ServerConfig::load(&args.config, args.data_dir)?;

    let service = Arc::new(EngineService::new(config.engine.clone(), TaskRegistry::with_builtins()));
    let report = service.activate(config.resolve_dependencies()?).await?;
    if report.failed > 0 {
        tracing::warn!("{} instances could not be recovered", report.failed);
    }

    let engine = service.engine().await?;
    if let Some(dir) = &config.deploy_dir {
        deploy_directory(&engine, dir)?;
    }
    for schedule in config.schedules.clone() {
        service.schedule_start(schedule).await?;
    }
    drop(engine);

    let addr = format!("{}:{}", args.host, args.port);
    tracing::info!("Starting API server on {}", addr);

    let state = AppState {
        service: service.clone(),
    };
    api::serve(&addr, state, shutdown_signal()).await?;

    service.deactivate().await?;
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Deploy every definition source under `dir` whose content differs from the
/// latest deployed version of its key
fn deploy_directory(engine: &Engine, dir: &Path) -> Result<()> {
    let sources = load_sources_from_dir(dir)
        .with_context(|| format!("Failed to read definitions from {}", dir.display()))?;

    let mut deployed = 0;
    for source in sources {
        if let Ok(existing) = engine.definitions().latest(&source.key) {
            if existing.to_source() == source {
                continue;
            }
        }
        match engine.definitions().deploy(source) {
            Ok(_) => deployed += 1,
            Err(err) => tracing::error!("Skipping definition from {}: {}", dir.display(), err),
        }
    }

    tracing::info!("Deployed {} definitions from {}", deployed, dir.display());
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received, draining in-flight work");
}
