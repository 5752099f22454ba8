//! Preflight Validator
//!
//! Fixed battery of readiness checks. Reports only: a failing report never
//! blocks a state transition, it is surfaced to the operator.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use futures_util::future::{join_all, BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{is_valid_address, EngineConfig};
use crate::optimizer::OptimizerStore;
use crate::provider::ChainDataProvider;

pub const CHECK_RPC_CONNECTIVITY: &str = "rpc_connectivity";
pub const CHECK_ACCOUNT_ADDRESS: &str = "account_address";
pub const CHECK_RESOURCES: &str = "resource_availability";
pub const CHECK_SECURITY_FLAGS: &str = "security_flags";
pub const CHECK_PROVIDER_LATENCY: &str = "provider_latency";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Pending,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreflightCheck {
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreflightReport {
    pub checks: Vec<PreflightCheck>,
    pub passed: bool,
    pub ran_at: DateTime<Utc>,
}

impl PreflightReport {
    pub fn from_checks(checks: Vec<PreflightCheck>) -> Self {
        let passed = !checks.is_empty() && checks.iter().all(|c| c.status == CheckStatus::Pass);
        Self {
            checks,
            passed,
            ran_at: Utc::now(),
        }
    }

    pub fn check(&self, name: &str) -> Option<&PreflightCheck> {
        self.checks.iter().find(|c| c.name == name)
    }
}

/// Session-dependent inputs for a run
#[derive(Debug, Clone, Default)]
pub struct PreflightContext {
    pub account_address: Option<String>,
    pub live_mode_enabled: bool,
    pub require_confidence_gate: bool,
}

impl PreflightContext {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            account_address: config.account_address.clone(),
            live_mode_enabled: config.live_mode_enabled,
            require_confidence_gate: config.require_confidence_gate,
        }
    }
}

pub struct PreflightValidator {
    provider: Arc<dyn ChainDataProvider>,
    store: Arc<dyn OptimizerStore>,
    concurrent: bool,
    max_latency: Duration,
    min_free_memory_mb: u64,
}

impl PreflightValidator {
    pub fn new(
        config: &EngineConfig,
        provider: Arc<dyn ChainDataProvider>,
        store: Arc<dyn OptimizerStore>,
    ) -> Self {
        Self {
            provider,
            store,
            concurrent: config.preflight_concurrent,
            max_latency: Duration::from_millis(config.preflight_max_latency_ms),
            min_free_memory_mb: config.preflight_min_free_memory_mb,
        }
    }

    /// Run the whole battery. Result order is fixed regardless of mode.
    pub async fn run(&self, ctx: &PreflightContext) -> PreflightReport {
        let checks: Vec<BoxFuture<'_, PreflightCheck>> = vec![
            self.rpc_connectivity().boxed(),
            Self::account_address(ctx).boxed(),
            self.resource_availability().boxed(),
            Self::security_flags(ctx).boxed(),
            self.provider_latency().boxed(),
        ];

        let results = if self.concurrent {
            join_all(checks).await
        } else {
            let mut out = Vec::with_capacity(checks.len());
            for check in checks {
                out.push(check.await);
            }
            out
        };

        let report = PreflightReport::from_checks(results);
        if report.passed {
            info!("✅ Preflight passed ({} checks)", report.checks.len());
        } else {
            let failing: Vec<&str> = report
                .checks
                .iter()
                .filter(|c| c.status != CheckStatus::Pass)
                .map(|c| c.name.as_str())
                .collect();
            warn!(failing = ?failing, "⚠️ Preflight not passed");
        }
        report
    }

    async fn rpc_connectivity(&self) -> PreflightCheck {
        let started = Instant::now();
        let (status, message) = match self.provider.block_height().await {
            Ok(height) => (CheckStatus::Pass, format!("block height {}", height)),
            Err(e) => (CheckStatus::Fail, e.to_string()),
        };
        finish(CHECK_RPC_CONNECTIVITY, status, message, started)
    }

    async fn account_address(ctx: &PreflightContext) -> PreflightCheck {
        let started = Instant::now();
        let (status, message) = match ctx.account_address.as_deref() {
            None => (CheckStatus::Pending, "no account address configured".to_string()),
            Some(addr) if is_valid_address(addr) => (CheckStatus::Pass, format!("account {}", addr)),
            Some(addr) => (CheckStatus::Fail, format!("malformed account address: {}", addr)),
        };
        finish(CHECK_ACCOUNT_ADDRESS, status, message, started)
    }

    async fn resource_availability(&self) -> PreflightCheck {
        let started = Instant::now();

        if let Err(e) = self.store.health_check() {
            return finish(
                CHECK_RESOURCES,
                CheckStatus::Fail,
                format!("optimizer store unavailable: {:#}", e),
                started,
            );
        }

        let available_mb = available_memory_mb();
        let (status, message) = if available_mb >= self.min_free_memory_mb {
            (
                CheckStatus::Pass,
                format!("store ok, {} MB available", available_mb),
            )
        } else {
            (
                CheckStatus::Fail,
                format!(
                    "{} MB available, {} MB required",
                    available_mb, self.min_free_memory_mb
                ),
            )
        };
        finish(CHECK_RESOURCES, status, message, started)
    }

    async fn security_flags(ctx: &PreflightContext) -> PreflightCheck {
        let started = Instant::now();
        let (status, message) = match (ctx.live_mode_enabled, ctx.require_confidence_gate) {
            (false, _) => (CheckStatus::Pass, "live mode disabled".to_string()),
            (true, true) => (CheckStatus::Pass, "live mode enabled behind confidence gate".to_string()),
            (true, false) => (
                CheckStatus::Fail,
                "live mode enabled with confidence gate off".to_string(),
            ),
        };
        finish(CHECK_SECURITY_FLAGS, status, message, started)
    }

    async fn provider_latency(&self) -> PreflightCheck {
        let started = Instant::now();
        let outcome = self.provider.gas_price_gwei().await;
        let elapsed = started.elapsed();
        let (status, message) = match outcome {
            Ok(_) if elapsed < self.max_latency => (
                CheckStatus::Pass,
                format!("gas price round-trip {}ms", elapsed.as_millis()),
            ),
            Ok(_) => (
                CheckStatus::Fail,
                format!(
                    "gas price round-trip {}ms exceeds {}ms",
                    elapsed.as_millis(),
                    self.max_latency.as_millis()
                ),
            ),
            Err(e) => (CheckStatus::Fail, e.to_string()),
        };
        finish(CHECK_PROVIDER_LATENCY, status, message, started)
    }
}

fn finish(name: &str, status: CheckStatus, message: String, started: Instant) -> PreflightCheck {
    PreflightCheck {
        name: name.to_string(),
        status,
        message,
        elapsed_ms: started.elapsed().as_millis() as u64,
    }
}

fn available_memory_mb() -> u64 {
    let mut sys = sysinfo::System::new();
    sys.refresh_memory();
    sys.available_memory() / (1024 * 1024)
}
