//! PhaseGate - confidence-gated session orchestrator
//!
//! Boots a session against live chain data, runs the simulation feed until
//! the learned confidence clears the gate, and serves the whole lifecycle
//! over HTTP + WebSocket.
//!
//! Usage:
//!   phasegate --bind 0.0.0.0:3100
//!   phasegate --offline --auto-start
//!
//! Environment: see `EngineConfig::from_env` (RPC_URLS, ACCOUNT_ADDRESS,
//! LIVE_MODE_ENABLED, REQUIRE_CONFIDENCE_GATE, OPTIMIZER_PERSISTENCE, ...)

use std::{path::Path, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use phasegate_backend::{
    api::{create_router, AppState},
    config::{EngineConfig, OptimizerPersistence},
    feed::EfficiencyRamp,
    optimizer::{MemoryOptimizerStore, OptimizerStore, SqliteOptimizerStore},
    orchestrator::{PaperSettlement, PhaseOrchestrator},
    preflight::CheckStatus,
    provider::{ChainDataProvider, RpcProvider, ScriptedProvider},
};

#[derive(Parser, Debug)]
#[command(name = "phasegate")]
#[command(about = "Confidence-gated simulation-to-live orchestrator")]
struct Args {
    /// HTTP bind address (overrides BIND_ADDR)
    #[arg(long)]
    bind: Option<String>,

    /// Optimizer SQLite path (overrides OPTIMIZER_DB_PATH)
    #[arg(long)]
    db_path: Option<String>,

    /// tracing filter, e.g. "phasegate_backend=debug,tower_http=info"
    #[arg(long, env = "RUST_LOG")]
    log_filter: Option<String>,

    /// Serve scripted chain data instead of calling RPC endpoints
    #[arg(long, env = "PHASEGATE_OFFLINE", default_value_t = false)]
    offline: bool,

    /// Begin booting the session immediately
    #[arg(long, env = "PHASEGATE_AUTO_START", default_value_t = false)]
    auto_start: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    let args = Args::parse();
    init_tracing(args.log_filter.as_deref());

    let mut config = EngineConfig::from_env();
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(db_path) = args.db_path {
        config.optimizer_db_path = db_path;
    }
    config.optimizer_db_path = resolve_data_path(&config.optimizer_db_path);

    info!("🎯 PhaseGate starting");
    info!(
        live_mode = config.live_mode_enabled,
        gate = config.require_confidence_gate,
        threshold = config.confidence_threshold,
        tick_ms = config.sim_tick_ms,
        "Gate configuration"
    );
    if !config.security_flags_ok() {
        warn!("⚠️  Live mode is enabled with the confidence gate OFF");
    }

    let (provider, rpc): (Arc<dyn ChainDataProvider>, Option<Arc<RpcProvider>>) = if args.offline {
        warn!("🧪 Offline mode: serving scripted chain data");
        let scripted: Arc<dyn ChainDataProvider> = Arc::new(ScriptedProvider::default());
        (scripted, None)
    } else {
        let rpc = Arc::new(
            RpcProvider::new(
                config.rpc_urls.clone(),
                config.oracle_address.clone(),
                config.call_timeout(),
            )
            .context("Failed to build RPC provider")?,
        );
        info!(endpoints = rpc.endpoints().len(), "🔗 RPC provider ready");
        let provider: Arc<dyn ChainDataProvider> = rpc.clone();
        (provider, Some(rpc))
    };

    let store: Arc<dyn OptimizerStore> = match config.optimizer_persistence {
        OptimizerPersistence::Durable => Arc::new(
            SqliteOptimizerStore::new(&config.optimizer_db_path)
                .context("Failed to open optimizer store")?,
        ),
        OptimizerPersistence::Ephemeral => {
            info!("💭 Optimizer persistence: ephemeral");
            Arc::new(MemoryOptimizerStore::new())
        }
    };

    let orchestrator = PhaseOrchestrator::new(
        config.clone(),
        provider,
        store,
        Arc::new(PaperSettlement::new()),
        Arc::new(EfficiencyRamp::from_config(&config)),
    );

    let report = orchestrator.run_preflight().await;
    for check in &report.checks {
        match check.status {
            CheckStatus::Pass => info!(check = %check.name, "  ✓ {}", check.message),
            _ => warn!(check = %check.name, status = ?check.status, "  ✗ {}", check.message),
        }
    }

    if args.auto_start {
        orchestrator.start()?;
    }

    let app = create_router(AppState {
        orchestrator: orchestrator.clone(),
        rpc,
    })
    .layer(TraceLayer::new_for_http())
    .layer(CorsLayer::permissive());

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    info!("🎯 API server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    orchestrator.shutdown();
    info!("👋 PhaseGate stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

fn init_tracing(filter: Option<&str>) {
    let filter = filter
        .and_then(|f| tracing_subscriber::EnvFilter::try_new(f).ok())
        .unwrap_or_else(|| "phasegate_backend=debug,phasegate=debug,tower_http=info".into());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Relative paths are resolved against the crate root, not the caller's cwd.
fn resolve_data_path(raw: &str) -> String {
    let p = PathBuf::from(raw);
    if p.is_absolute() {
        return p.to_string_lossy().to_string();
    }
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join(p)
        .to_string_lossy()
        .to_string()
}

fn load_env() {
    // Standard dotenv search (cwd + parents)
    let _ = dotenv();

    // Also the crate root, for runs with --manifest-path from elsewhere
    let candidate = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if candidate.exists() {
        let _ = dotenv::from_path(&candidate);
    }
}
