//! One-shot preflight runner
//!
//! Runs the readiness battery against the configured RPC endpoints and
//! prints the report. Exit code is non-zero unless every check passes.
//!
//! Usage:
//!   preflight_check --json
//!   preflight_check --sequential --rpc-urls https://eth.llamarpc.com

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use phasegate_backend::{
    config::EngineConfig,
    optimizer::{MemoryOptimizerStore, OptimizerStore, SqliteOptimizerStore},
    preflight::{CheckStatus, PreflightContext, PreflightValidator},
    provider::RpcProvider,
};

#[derive(Parser, Debug)]
#[command(name = "preflight_check")]
#[command(about = "Run PhaseGate preflight checks once and report")]
struct Args {
    /// Comma-separated RPC endpoints (overrides RPC_URLS)
    #[arg(long)]
    rpc_urls: Option<String>,

    /// Run checks one after another instead of concurrently
    #[arg(long, default_value_t = false)]
    sequential: bool,

    /// Skip the optimizer database and probe an in-memory store
    #[arg(long, default_value_t = false)]
    no_db: bool,

    /// Print the report as JSON
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::WARN.into()))
        .init();

    let args = Args::parse();
    let mut config = EngineConfig::from_env();
    if let Some(urls) = args.rpc_urls {
        config.rpc_urls = urls
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if args.sequential {
        config.preflight_concurrent = false;
    }

    let provider = Arc::new(
        RpcProvider::new(
            config.rpc_urls.clone(),
            config.oracle_address.clone(),
            config.call_timeout(),
        )
        .context("Failed to build RPC provider")?,
    );
    let store: Arc<dyn OptimizerStore> = if args.no_db {
        Arc::new(MemoryOptimizerStore::new())
    } else {
        Arc::new(SqliteOptimizerStore::new(&config.optimizer_db_path)?)
    };

    let validator = PreflightValidator::new(&config, provider, store);
    let report = validator.run(&PreflightContext::from_config(&config)).await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for check in &report.checks {
            let mark = match check.status {
                CheckStatus::Pass => "PASS",
                CheckStatus::Pending => "PEND",
                CheckStatus::Fail => "FAIL",
            };
            println!(
                "[{}] {:<22} {:>6}ms  {}",
                mark, check.name, check.elapsed_ms, check.message
            );
        }
        println!(
            "\npreflight {}",
            if report.passed { "PASSED" } else { "NOT PASSED" }
        );
    }

    if !report.passed {
        std::process::exit(1);
    }
    Ok(())
}
