//! Engine configuration
//!
//! Defaults are production-safe: live mode off, confidence gate on, durable
//! optimizer state. Every field can be overridden from the environment (or a
//! `.env` file); values that fail to parse or fall outside their valid range
//! are ignored and the default is kept.

use std::{env, time::Duration};

/// Public mainnet endpoints, tried in order
pub const DEFAULT_RPC_URLS: &[&str] = &[
    "https://eth.llamarpc.com",
    "https://rpc.ankr.com/eth",
    "https://cloudflare-eth.com",
];

/// Chainlink ETH/USD aggregator (Ethereum mainnet, 8 decimals)
pub const CHAINLINK_ETH_USD: &str = "0x5f4eC3Df9cbd43714FE2740f5E3616155c5b8419";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerPersistence {
    /// Weights survive session resets and process restarts
    Durable,
    /// Weights are reset with the session and never written to disk
    Ephemeral,
}

impl OptimizerPersistence {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "durable" | "persistent" | "sqlite" => Some(Self::Durable),
            "ephemeral" | "memory" => Some(Self::Ephemeral),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    // Provider
    pub rpc_urls: Vec<String>,
    pub oracle_address: String,
    pub call_timeout_ms: u64,

    // Session inputs
    pub account_address: Option<String>,
    pub live_mode_enabled: bool,

    // Confidence gate
    pub require_confidence_gate: bool,
    pub confidence_threshold: f64,

    // Simulation feed
    pub sim_tick_ms: u64,
    pub efficiency_ceiling: f64,
    pub efficiency_increment: f64,
    pub opportunity_scale: f64,

    // Optimizer
    pub optimizer_fast_ms: u64,
    pub optimizer_slow_ms: u64,
    pub optimizer_learning_rate: f64,
    pub optimizer_persistence: OptimizerPersistence,
    pub optimizer_db_path: String,
    pub latency_threshold_ms: u64,

    // Preflight
    pub preflight_concurrent: bool,
    pub preflight_max_latency_ms: u64,
    pub preflight_min_free_memory_mb: u64,

    // Boot pacing
    pub boot_stage_delay_ms: u64,

    // Presentation
    pub bind_addr: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rpc_urls: DEFAULT_RPC_URLS.iter().map(|s| s.to_string()).collect(),
            oracle_address: CHAINLINK_ETH_USD.to_string(),
            call_timeout_ms: 4_000,

            account_address: None,
            live_mode_enabled: false,

            require_confidence_gate: true,
            confidence_threshold: 85.0,

            sim_tick_ms: 3_000,
            efficiency_ceiling: 0.95,
            efficiency_increment: 0.05,
            opportunity_scale: 1.5,

            optimizer_fast_ms: 5_000,
            optimizer_slow_ms: 15 * 60 * 1_000,
            optimizer_learning_rate: 0.05,
            optimizer_persistence: OptimizerPersistence::Durable,
            optimizer_db_path: "phasegate_optimizer.db".to_string(),
            latency_threshold_ms: 1_500,

            preflight_concurrent: true,
            preflight_max_latency_ms: 1_500,
            preflight_min_free_memory_mb: 256,

            boot_stage_delay_ms: 400,

            bind_addr: "0.0.0.0:3100".to_string(),
        }
    }
}

/// Unrecognised spellings yield `None` so the default stays in force
fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

fn env_flag(key: &str) -> Option<bool> {
    env::var(key).ok().and_then(|v| parse_flag(&v))
}

fn env_u64(key: &str, min: u64) -> Option<u64> {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v >= min)
}

fn env_f64(key: &str, valid: impl Fn(f64) -> bool) -> Option<f64> {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite() && valid(*v))
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(raw) = env::var("RPC_URLS") {
            let urls: Vec<String> = raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !urls.is_empty() {
                cfg.rpc_urls = urls;
            }
        }
        cfg.oracle_address = env::var("ORACLE_ADDRESS")
            .ok()
            .filter(|v| is_valid_address(v))
            .unwrap_or(cfg.oracle_address);
        cfg.call_timeout_ms = env_u64("PROVIDER_CALL_TIMEOUT_MS", 100).unwrap_or(cfg.call_timeout_ms);

        // An address that is present but malformed is kept so preflight can flag it.
        cfg.account_address = env::var("ACCOUNT_ADDRESS")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        cfg.live_mode_enabled = env_flag("LIVE_MODE_ENABLED").unwrap_or(cfg.live_mode_enabled);

        cfg.require_confidence_gate =
            env_flag("REQUIRE_CONFIDENCE_GATE").unwrap_or(cfg.require_confidence_gate);
        cfg.confidence_threshold = env_f64("CONFIDENCE_THRESHOLD", |v| v > 0.0 && v <= 100.0)
            .unwrap_or(cfg.confidence_threshold);

        cfg.sim_tick_ms = env_u64("SIM_TICK_MS", 100).unwrap_or(cfg.sim_tick_ms);
        cfg.efficiency_increment = env_f64("SIM_EFFICIENCY_INCREMENT", |v| v > 0.0 && v <= 1.0)
            .unwrap_or(cfg.efficiency_increment);
        cfg.opportunity_scale =
            env_f64("SIM_OPPORTUNITY_SCALE", |v| v > 0.0).unwrap_or(cfg.opportunity_scale);

        cfg.optimizer_fast_ms = env_u64("OPTIMIZER_FAST_MS", 250).unwrap_or(cfg.optimizer_fast_ms);
        cfg.optimizer_slow_ms = env_u64("OPTIMIZER_SLOW_MS", 1_000).unwrap_or(cfg.optimizer_slow_ms);
        cfg.optimizer_learning_rate = env_f64("OPTIMIZER_LEARNING_RATE", |v| v > 0.0 && v <= 0.5)
            .unwrap_or(cfg.optimizer_learning_rate);
        cfg.optimizer_persistence = env::var("OPTIMIZER_PERSISTENCE")
            .ok()
            .and_then(|v| OptimizerPersistence::parse(&v))
            .unwrap_or(cfg.optimizer_persistence);
        cfg.optimizer_db_path = env::var("OPTIMIZER_DB_PATH")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(cfg.optimizer_db_path);
        cfg.latency_threshold_ms =
            env_u64("OPTIMIZER_LATENCY_THRESHOLD_MS", 1).unwrap_or(cfg.latency_threshold_ms);

        cfg.preflight_concurrent =
            env_flag("PREFLIGHT_CONCURRENT").unwrap_or(cfg.preflight_concurrent);
        cfg.preflight_max_latency_ms =
            env_u64("PREFLIGHT_MAX_LATENCY_MS", 1).unwrap_or(cfg.preflight_max_latency_ms);
        cfg.preflight_min_free_memory_mb =
            env_u64("PREFLIGHT_MIN_FREE_MEMORY_MB", 0).unwrap_or(cfg.preflight_min_free_memory_mb);

        cfg.boot_stage_delay_ms =
            env_u64("BOOT_STAGE_DELAY_MS", 0).unwrap_or(cfg.boot_stage_delay_ms);

        cfg.bind_addr = env::var("BIND_ADDR")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(cfg.bind_addr);

        cfg
    }

    pub fn sim_tick(&self) -> Duration {
        Duration::from_millis(self.sim_tick_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn boot_stage_delay(&self) -> Duration {
        Duration::from_millis(self.boot_stage_delay_ms)
    }

    /// Live mode enabled without the confidence gate is an unsafe combination
    pub fn security_flags_ok(&self) -> bool {
        !self.live_mode_enabled || self.require_confidence_gate
    }
}

/// `0x` followed by exactly 40 hex digits
pub fn is_valid_address(addr: &str) -> bool {
    let addr = addr.trim();
    let Some(hex_part) = addr
        .strip_prefix("0x")
        .or_else(|| addr.strip_prefix("0X"))
    else {
        return false;
    };
    hex_part.len() == 40 && hex_part.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_safe() {
        let cfg = EngineConfig::default();
        assert!(!cfg.live_mode_enabled);
        assert!(cfg.require_confidence_gate);
        assert_eq!(cfg.confidence_threshold, 85.0);
        assert_eq!(cfg.efficiency_ceiling, 0.95);
        assert_eq!(cfg.optimizer_fast_ms, 5_000);
        assert_eq!(cfg.optimizer_slow_ms, 900_000);
        assert_eq!(cfg.rpc_urls.len(), 3);
        assert!(cfg.security_flags_ok());
    }

    #[test]
    fn test_address_validation() {
        assert!(is_valid_address("0x5f4eC3Df9cbd43714FE2740f5E3616155c5b8419"));
        assert!(is_valid_address("  0x0000000000000000000000000000000000000001 "));
        assert!(!is_valid_address("5f4eC3Df9cbd43714FE2740f5E3616155c5b8419"));
        assert!(!is_valid_address("0x5f4eC3Df9cbd43714FE2740f5E3616155c5b841"));
        assert!(!is_valid_address("0xZZ4eC3Df9cbd43714FE2740f5E3616155c5b8419"));
        assert!(!is_valid_address(""));
    }

    #[test]
    fn test_security_flags() {
        let mut cfg = EngineConfig::default();
        cfg.live_mode_enabled = true;
        assert!(cfg.security_flags_ok());
        cfg.require_confidence_gate = false;
        assert!(!cfg.security_flags_ok());
    }

    #[test]
    fn test_flag_parse() {
        assert_eq!(parse_flag(" Yes "), Some(true));
        assert_eq!(parse_flag("ON"), Some(true));
        assert_eq!(parse_flag("0"), Some(false));
        assert_eq!(parse_flag("False"), Some(false));
        assert_eq!(parse_flag("enabled"), None);
        assert_eq!(parse_flag(""), None);
    }

    #[test]
    fn test_unparseable_gate_flag_keeps_gate_on() {
        // Only test touching this variable
        env::set_var("REQUIRE_CONFIDENCE_GATE", "enabled");
        let cfg = EngineConfig::from_env();
        assert!(cfg.require_confidence_gate);

        env::set_var("REQUIRE_CONFIDENCE_GATE", "off");
        let cfg = EngineConfig::from_env();
        assert!(!cfg.require_confidence_gate);

        env::remove_var("REQUIRE_CONFIDENCE_GATE");
        assert!(EngineConfig::from_env().require_confidence_gate);
    }

    #[test]
    fn test_persistence_parse() {
        assert_eq!(
            OptimizerPersistence::parse("Ephemeral"),
            Some(OptimizerPersistence::Ephemeral)
        );
        assert_eq!(
            OptimizerPersistence::parse("durable"),
            Some(OptimizerPersistence::Durable)
        );
        assert_eq!(OptimizerPersistence::parse("maybe"), None);
    }
}
