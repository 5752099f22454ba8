//! Shared session, metrics and event types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::optimizer::OptimizerState;
use crate::preflight::PreflightReport;

/// Session lifecycle. `Live` is terminal until an explicit reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Booting,
    Ready,
    Simulating,
    Transitioning,
    Live,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Booting => write!(f, "BOOTING"),
            Self::Ready => write!(f, "READY"),
            Self::Simulating => write!(f, "SIMULATING"),
            Self::Transitioning => write!(f, "TRANSITIONING"),
            Self::Live => write!(f, "LIVE"),
        }
    }
}

/// Ordered boot checklist. Only meaningful while `Booting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootStage {
    Init,
    ExternalDependency,
    Wallet,
    Liquidity,
    Workers,
    Optimization,
    Complete,
}

impl BootStage {
    pub const ALL: [BootStage; 7] = [
        BootStage::Init,
        BootStage::ExternalDependency,
        BootStage::Wallet,
        BootStage::Liquidity,
        BootStage::Workers,
        BootStage::Optimization,
        BootStage::Complete,
    ];

    /// Next stage in the checklist; `Complete` stays `Complete`.
    pub fn next(self) -> BootStage {
        match self {
            BootStage::Init => BootStage::ExternalDependency,
            BootStage::ExternalDependency => BootStage::Wallet,
            BootStage::Wallet => BootStage::Liquidity,
            BootStage::Liquidity => BootStage::Workers,
            BootStage::Workers => BootStage::Optimization,
            BootStage::Optimization => BootStage::Complete,
            BootStage::Complete => BootStage::Complete,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            BootStage::Init => "initializing core",
            BootStage::ExternalDependency => "connecting blockchain provider",
            BootStage::Wallet => "verifying account address",
            BootStage::Liquidity => "sampling reference liquidity",
            BootStage::Workers => "preparing simulation workers",
            BootStage::Optimization => "loading optimizer state",
            BootStage::Complete => "boot complete",
        }
    }
}

impl std::fmt::Display for BootStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Init => "init",
            Self::ExternalDependency => "external_dependency",
            Self::Wallet => "wallet",
            Self::Liquidity => "liquidity",
            Self::Workers => "workers",
            Self::Optimization => "optimization",
            Self::Complete => "complete",
        };
        write!(f, "{}", s)
    }
}

/// External input whose absence pauses the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingRequirement {
    BlockchainConnection,
    Wallet,
}

impl std::fmt::Display for MissingRequirement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BlockchainConnection => write!(f, "blockchain_connection"),
            Self::Wallet => write!(f, "wallet"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceSource {
    /// Chainlink aggregator `latestRoundData()`
    Oracle,
    /// Gas-correlated estimate used when every oracle call failed
    Derived,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReferencePrice {
    pub price_usd: f64,
    pub source: PriceSource,
}

/// One immutable feed observation. Replaced wholesale every tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub reference_price_usd: f64,
    pub price_source: PriceSource,
    pub gas_price_gwei: f64,
    pub block_height: u64,
    /// 0-100
    pub volatility_index: f64,
    pub theoretical_max: f64,
    pub captured: f64,
    /// 0..=0.95
    pub efficiency: f64,
    /// efficiency * 100
    pub confidence: f64,
    pub captured_per_hour: f64,
    pub captured_per_event: f64,
    pub provider_latency_ms: u64,
}

/// Result of a `confirm_live` request
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum GateOutcome {
    /// Transition to live performed
    Promoted { confidence: f64 },
    /// Gate not satisfied; state untouched
    Rejected { confidence: f64, threshold: f64 },
    /// Live mode disabled by configuration; state untouched
    LiveDisabled,
    /// Already live; nothing to do
    AlreadyLive,
}

/// Aggregate view served to dashboards
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionView {
    pub session_id: String,
    pub state: SessionState,
    pub boot_stage: Option<BootStage>,
    pub paused: bool,
    pub missing_requirement: Option<MissingRequirement>,
    pub account_address: Option<String>,
    pub confidence: f64,
    pub confidence_threshold: f64,
    pub gate_enabled: bool,
    pub live_mode_enabled: bool,
    pub cumulative_captured: f64,
    pub balance_eth: f64,
    pub feed_degraded: bool,
    pub failed_ticks: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_secs: i64,
    pub last_error: Option<String>,
}

/// Events broadcast to the presentation layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EngineEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    BootStage {
        stage: BootStage,
    },
    Paused {
        requirement: MissingRequirement,
        reason: String,
    },
    Resumed {
        requirement: MissingRequirement,
    },
    Metrics(MetricsSnapshot),
    FeedDegraded {
        consecutive_failures: u64,
        reason: String,
    },
    OptimizerInsight {
        cycle: u64,
        insight: String,
    },
    OptimizerSnapshot(OptimizerState),
    Preflight(PreflightReport),
    Gate(GateOutcome),
    Withdrawal {
        requested: f64,
        applied: f64,
        balance_eth: f64,
    },
    Session(SessionView),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boot_stage_order() {
        let mut stage = BootStage::Init;
        let mut seen = vec![stage];
        while stage != BootStage::Complete {
            stage = stage.next();
            seen.push(stage);
        }
        assert_eq!(seen, BootStage::ALL.to_vec());
        assert!(BootStage::Wallet < BootStage::Liquidity);
        assert_eq!(BootStage::Complete.next(), BootStage::Complete);
    }

    #[test]
    fn test_event_serialization_shape() {
        let ev = EngineEvent::StateChanged {
            from: SessionState::Ready,
            to: SessionState::Simulating,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "state_changed");
        assert_eq!(json["data"]["to"], "simulating");

        let gate = serde_json::to_value(GateOutcome::Rejected {
            confidence: 70.0,
            threshold: 85.0,
        })
        .unwrap();
        assert_eq!(gate["outcome"], "rejected");
    }
}
