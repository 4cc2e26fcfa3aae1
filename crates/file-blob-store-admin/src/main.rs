//! Blob store admin tool
//!
//! Inspects, shrinks and verifies blob cache directories outside of any
//! running storage. Results are printed to stdout as JSON.

mod commands;
mod error;

use crate::error::{AdminError, Result};
use clap::{Parser, Subcommand};
use file_blob_store::BlobStoreOptions;
use serde::Serialize;
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "file-blob-store-admin")]
#[command(about = "Inspect and maintain blob cache directories")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Count blob files and their total size
    Stats {
        /// Blob directory (defaults to BLOB_CACHE_DIR)
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Run one eviction pass
    Shrink {
        #[arg(long)]
        dir: Option<PathBuf>,
        /// Size limit in bytes, with optional KB/MB/GB suffix (defaults to BLOB_CACHE_SIZE)
        #[arg(long)]
        max_bytes: Option<String>,
        /// Percentage of the limit to free below it (defaults to BLOB_CACHE_SIZE_CHECK)
        #[arg(long)]
        check_percent: Option<u8>,
    },
    /// Check the layout marker, creating it in a new directory
    Verify {
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = init_logging() {
        // No subscriber to report through.
        eprintln!("Failed to initialise logging: {}", e);
        std::process::exit(1);
    }
    if let Err(e) = run(cli).await {
        error!(error = %e, "Command failed");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let env = BlobStoreOptions::from_env()?;

    match cli.command {
        Command::Stats { dir } => {
            let dir = commands::resolve_dir(dir, &env)?;
            print_json(&commands::stats(&dir).await?)
        }
        Command::Shrink {
            dir,
            max_bytes,
            check_percent,
        } => {
            let dir = commands::resolve_dir(dir, &env)?;
            let max_bytes = commands::resolve_max_bytes(max_bytes.as_deref(), &env)?;
            let check_percent = check_percent.unwrap_or(env.check_percent);
            print_json(&commands::shrink(&dir, max_bytes, check_percent).await?)
        }
        Command::Verify { dir } => {
            let dir = commands::resolve_dir(dir, &env)?;
            print_json(&commands::verify(&dir).await?)
        }
    }
}

fn init_logging() -> Result<()> {
    let env_filter =
        EnvFilter::from_default_env().add_directive("file_blob_store=info".parse()?);

    // Use JSON format for GCP Cloud Logging when LOG_FORMAT=json
    if std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false)
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer())
            .try_init()
            .map_err(|e| AdminError::Config(e.to_string()))
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|e| AdminError::Config(e.to_string()))
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
