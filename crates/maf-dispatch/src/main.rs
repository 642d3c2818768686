//! `maf-dispatchd`: the long-running daemon that hosts a `Runtime` and its
//! background sweepers. Grounded on `jit-server`'s `#[tokio::main]` plus
//! `tracing_subscriber::fmt()` startup shape; the `jit` CLI's `--data-dir`/
//! `JIT_DATA_DIR` env-var convention grounds `--config`/`MAF_CONFIG` here.

use anyhow::Result;
use clap::Parser;
use maf_core::RuntimeConfig;
use maf_dispatch::Runtime;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Runs the MAF coordination runtime daemon.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a TOML config file. Omit to run on defaults plus env
    /// overrides only.
    #[arg(short, long, env = "MAF_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(EnvFilter::try_from_env("MAF_LOG").unwrap_or_else(|_| EnvFilter::new("info")))
        .compact()
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => RuntimeConfig::from_file(path)?,
        None => RuntimeConfig::default(),
    }
    .apply_env_overrides();

    info!(backends = ?config.backend_fallback, store_path = ?config.store_path, "starting maf-dispatchd");

    let runtime = Arc::new(Runtime::bootstrap(config)?);
    runtime.spawn_sweepers();

    info!(backend = runtime.store().backend_kind(), "runtime ready");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, exiting");
    Ok(())
}
