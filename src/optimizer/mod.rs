//! Strategy Optimizer
//!
//! Holds three complementary weight pairs describing strategic leanings:
//! - risk appetite: aggressive vs conservative
//! - venue preference: primary vs alternate DEX routing
//! - gas sensitivity: gas-sensitive vs gas-tolerant
//!
//! Each cycle derives a bounded reward from recent metrics, nudges the
//! dominant member of every pair toward 1 on positive reward, pivots toward
//! the other member on negative reward (only while the dominant weight is
//! above 0.5), then renormalizes. Pair sums of exactly 1 are checked after
//! every cycle.
//!
//! The optimizer never touches the network. Cadence is the caller's choice.

pub mod store;

pub use store::*;

use std::{collections::VecDeque, sync::Arc};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::EngineError;
use crate::models::MetricsSnapshot;

/// History ring capacity
pub const MAX_HISTORY: usize = 50;
const PAIR_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StrategyWeights {
    pub aggressive: f64,
    pub conservative: f64,
    pub primary_venue: f64,
    pub alternate_venue: f64,
    pub gas_sensitive: f64,
    pub gas_tolerant: f64,
}

impl Default for StrategyWeights {
    fn default() -> Self {
        Self {
            aggressive: 0.5,
            conservative: 0.5,
            primary_venue: 0.6,
            alternate_venue: 0.4,
            gas_sensitive: 0.7,
            gas_tolerant: 0.3,
        }
    }
}

impl StrategyWeights {
    /// (label of first member, label of second member, first, second)
    fn pairs_mut(&mut self) -> [(&'static str, &'static str, &mut f64, &mut f64); 3] {
        [
            ("aggressive", "conservative", &mut self.aggressive, &mut self.conservative),
            ("primary_venue", "alternate_venue", &mut self.primary_venue, &mut self.alternate_venue),
            ("gas_sensitive", "gas_tolerant", &mut self.gas_sensitive, &mut self.gas_tolerant),
        ]
    }

    pub fn pair_sums(&self) -> [f64; 3] {
        [
            self.aggressive + self.conservative,
            self.primary_venue + self.alternate_venue,
            self.gas_sensitive + self.gas_tolerant,
        ]
    }

    pub fn is_normalized(&self) -> bool {
        self.pair_sums()
            .iter()
            .all(|s| (s - 1.0).abs() <= PAIR_EPSILON)
    }

    fn leaning(first: &'static str, second: &'static str, a: f64, b: f64) -> String {
        if a >= b {
            format!("{} {:.2}", first, a)
        } else {
            format!("{} {:.2}", second, b)
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "{}, {}, {}",
            Self::leaning("aggressive", "conservative", self.aggressive, self.conservative),
            Self::leaning("primary_venue", "alternate_venue", self.primary_venue, self.alternate_venue),
            Self::leaning("gas_sensitive", "gas_tolerant", self.gas_sensitive, self.gas_tolerant),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub ts: i64,
    pub description: String,
    /// Signed reward of the cycle
    pub outcome: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub weights: StrategyWeights,
    pub learning_rate: f64,
    pub cycle: u64,
    pub history: VecDeque<HistoryEntry>,
}

impl OptimizerState {
    pub fn new(learning_rate: f64) -> Self {
        Self {
            weights: StrategyWeights::default(),
            learning_rate,
            cycle: 0,
            history: VecDeque::with_capacity(MAX_HISTORY),
        }
    }

    /// Structural sanity of a loaded state
    pub fn validate(&self) -> Result<(), EngineError> {
        if !self.weights.is_normalized() {
            return Err(EngineError::PersistenceCorrupt(format!(
                "weight pairs do not sum to 1: {:?}",
                self.weights.pair_sums()
            )));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0 && self.learning_rate <= 1.0) {
            return Err(EngineError::PersistenceCorrupt(format!(
                "learning rate out of range: {}",
                self.learning_rate
            )));
        }
        Ok(())
    }

    fn push_history(&mut self, entry: HistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(entry);
    }
}

/// Inputs for one reward computation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RewardSignals {
    /// Change in cumulative captured size since the previous cycle
    pub balance_trend: f64,
    pub provider_latency_ms: u64,
    pub confidence: f64,
    pub volatility_index: f64,
    pub gas_price_gwei: f64,
    /// Ticks that failed since the previous cycle
    pub failed_ticks: u64,
}

impl RewardSignals {
    pub fn from_metrics(snapshot: &MetricsSnapshot, balance_trend: f64, failed_ticks: u64) -> Self {
        Self {
            balance_trend,
            provider_latency_ms: snapshot.provider_latency_ms,
            confidence: snapshot.confidence,
            volatility_index: snapshot.volatility_index,
            gas_price_gwei: snapshot.gas_price_gwei,
            failed_ticks,
        }
    }
}

/// Threshold reward in [-1, 1]
pub fn compute_reward(signals: &RewardSignals, latency_threshold_ms: u64) -> f64 {
    let mut reward = 0.0;

    if signals.balance_trend > 0.0 {
        reward += 0.1;
    } else if signals.balance_trend < 0.0 {
        reward -= 0.1;
    }
    if signals.provider_latency_ms > latency_threshold_ms {
        reward -= 0.2;
    }
    if signals.confidence >= 50.0 {
        reward += 0.1;
    }
    if signals.volatility_index >= 60.0 {
        reward += 0.05;
    }
    if signals.gas_price_gwei >= 80.0 {
        reward -= 0.1;
    }
    reward -= (0.1 * signals.failed_ticks as f64).min(0.3);

    reward.clamp(-1.0, 1.0)
}

/// Adjust one complementary pair in place. Returns true when the pair pivoted
/// away from its dominant member.
fn adjust_pair(a: &mut f64, b: &mut f64, reward: f64, learning_rate: f64) -> bool {
    let a_dominant = *a >= *b;
    let (dominant, other) = if a_dominant { (a, b) } else { (b, a) };
    let step = learning_rate * reward.abs();
    let mut pivoted = false;

    if reward > 0.0 {
        *dominant = (*dominant + step).min(1.0);
        *other = (*other - step).max(0.0);
    } else if reward < 0.0 && *dominant > 0.5 {
        *dominant = (*dominant - step).max(0.0);
        *other = (*other + step).min(1.0);
        pivoted = true;
    }

    normalize_pair(dominant, other);
    pivoted
}

fn normalize_pair(a: &mut f64, b: &mut f64) {
    let sum = *a + *b;
    if !(sum.is_finite() && sum > 0.0) || *a < 0.0 || *b < 0.0 {
        *a = 0.5;
        *b = 0.5;
        return;
    }
    *a /= sum;
    *b = 1.0 - *a;
}

/// State captured for persistence, written once the optimizer lock is released
pub struct PendingSave {
    store: Arc<dyn OptimizerStore>,
    state: OptimizerState,
}

impl PendingSave {
    pub fn cycle(&self) -> u64 {
        self.state.cycle
    }

    /// Blocking write; call from `spawn_blocking` on the runtime.
    pub fn commit(self) -> anyhow::Result<()> {
        self.store.save(&self.state)
    }
}

pub struct Optimizer {
    state: OptimizerState,
    store: Arc<dyn OptimizerStore>,
    default_learning_rate: f64,
    latency_threshold_ms: u64,
}

impl Optimizer {
    /// Load from the store; missing or corrupt state yields the default.
    pub fn load(store: Arc<dyn OptimizerStore>, learning_rate: f64, latency_threshold_ms: u64) -> Self {
        let state = match store.load() {
            Ok(Some(state)) => match state.validate() {
                Ok(()) => {
                    info!(cycle = state.cycle, weights = %state.weights.summary(), "🧠 Optimizer state restored");
                    state
                }
                Err(e) => {
                    warn!(error = %e, "Persisted optimizer state invalid, starting fresh");
                    OptimizerState::new(learning_rate)
                }
            },
            Ok(None) => {
                debug!("No persisted optimizer state, starting fresh");
                OptimizerState::new(learning_rate)
            }
            Err(e) => {
                warn!(error = %e, "Failed to load optimizer state, starting fresh");
                OptimizerState::new(learning_rate)
            }
        };

        Self {
            state,
            store,
            default_learning_rate: learning_rate,
            latency_threshold_ms,
        }
    }

    pub fn state(&self) -> &OptimizerState {
        &self.state
    }

    /// Snapshot of the current state for `PendingSave::commit`
    pub fn pending_save(&self) -> PendingSave {
        PendingSave {
            store: self.store.clone(),
            state: self.state.clone(),
        }
    }

    /// Run one learning cycle in memory. Returns a human-readable insight;
    /// persist with `pending_save`.
    pub fn optimize_cycle(&mut self, signals: &RewardSignals) -> String {
        let reward = compute_reward(signals, self.latency_threshold_ms);
        let lr = self.state.learning_rate;

        let mut pivots = Vec::new();
        for (first, second, a, b) in self.state.weights.pairs_mut() {
            let toward = if *a >= *b { second } else { first };
            if adjust_pair(a, b, reward, lr) {
                pivots.push(toward);
            }
        }

        if !self.state.weights.is_normalized() {
            // Only reachable through NaN inputs; reset the offending pairs.
            warn!(sums = ?self.state.weights.pair_sums(), "Weight pair invariant violated, rebalancing");
            for (_, _, a, b) in self.state.weights.pairs_mut() {
                if (*a + *b - 1.0).abs() > PAIR_EPSILON {
                    *a = 0.5;
                    *b = 0.5;
                }
            }
        }

        self.state.cycle += 1;

        let insight = if pivots.is_empty() {
            format!(
                "cycle {}: reward {:+.2}, leaning {}",
                self.state.cycle,
                reward,
                self.state.weights.summary()
            )
        } else {
            format!(
                "cycle {}: reward {:+.2}, pivoting toward {}; leaning {}",
                self.state.cycle,
                reward,
                pivots.join(", "),
                self.state.weights.summary()
            )
        };

        self.state.push_history(HistoryEntry {
            ts: Utc::now().timestamp(),
            description: insight.clone(),
            outcome: reward,
        });

        debug!(cycle = self.state.cycle, reward, "Optimizer cycle complete");
        insight
    }

    /// Discard learned state (ephemeral mode session reset)
    pub fn reset(&mut self) {
        self.state = OptimizerState::new(self.default_learning_rate);
        if let Err(e) = self.store.save(&self.state) {
            warn!(error = %e, "Failed to persist optimizer reset");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn optimizer() -> (Optimizer, Arc<MemoryOptimizerStore>) {
        let store = Arc::new(MemoryOptimizerStore::new());
        (Optimizer::load(store.clone(), 0.05, 1_500), store)
    }

    fn positive() -> RewardSignals {
        RewardSignals {
            balance_trend: 1.0,
            provider_latency_ms: 100,
            confidence: 60.0,
            volatility_index: 70.0,
            gas_price_gwei: 30.0,
            failed_ticks: 0,
        }
    }

    fn negative() -> RewardSignals {
        RewardSignals {
            balance_trend: -1.0,
            provider_latency_ms: 5_000,
            confidence: 10.0,
            volatility_index: 10.0,
            gas_price_gwei: 120.0,
            failed_ticks: 5,
        }
    }

    #[test]
    fn test_reward_thresholds() {
        assert!((compute_reward(&positive(), 1_500) - 0.25).abs() < 1e-12);
        // -0.1 trend, -0.2 latency, -0.1 gas, -0.3 failures
        assert!((compute_reward(&negative(), 1_500) + 0.7).abs() < 1e-12);
        assert_eq!(compute_reward(&RewardSignals::default(), 1_500), 0.0);
    }

    #[test]
    fn test_positive_reward_strengthens_dominant() {
        let (mut opt, _) = optimizer();
        let before = opt.state().weights;
        opt.optimize_cycle(&positive());
        let after = opt.state().weights;

        assert!(after.primary_venue > before.primary_venue);
        assert!(after.gas_sensitive > before.gas_sensitive);
        // 0.5/0.5 tie resolves to the first member
        assert!(after.aggressive > after.conservative);
        assert!(after.is_normalized());
    }

    #[test]
    fn test_negative_reward_pivots_only_above_half() {
        let (mut opt, _) = optimizer();
        let insight = opt.optimize_cycle(&negative());
        let w = opt.state().weights;

        // Risk pair started balanced: no pivot
        assert_eq!(w.aggressive, 0.5);
        assert_eq!(w.conservative, 0.5);
        assert!(w.primary_venue < 0.6);
        assert!(w.gas_sensitive < 0.7);
        assert!(insight.contains("pivoting toward"));
    }

    #[test]
    fn test_pairs_sum_to_one_every_cycle() {
        let (mut opt, _) = optimizer();
        for i in 0..500 {
            let signals = if i % 3 == 0 { negative() } else { positive() };
            opt.optimize_cycle(&signals);
            for sum in opt.state().weights.pair_sums() {
                assert!((sum - 1.0).abs() <= 1e-9, "cycle {} sum {}", i, sum);
            }
            let w = opt.state().weights;
            for v in [w.aggressive, w.conservative, w.primary_venue, w.alternate_venue, w.gas_sensitive, w.gas_tolerant] {
                assert!((0.0..=1.0).contains(&v));
            }
        }
        assert_eq!(opt.state().cycle, 500);
    }

    #[test]
    fn test_history_is_bounded_and_persisted() {
        let (mut opt, store) = optimizer();
        for _ in 0..(MAX_HISTORY + 10) {
            opt.optimize_cycle(&positive());
        }
        assert_eq!(opt.state().history.len(), MAX_HISTORY);
        assert!(opt.state().history.back().unwrap().description.starts_with("cycle 60"));

        // Nothing is written until the pending save is committed
        assert!(store.load().unwrap().is_none());
        let pending = opt.pending_save();
        assert_eq!(pending.cycle(), 60);
        pending.commit().unwrap();

        let saved = store.load().unwrap().unwrap();
        assert_eq!(saved.cycle, 60);
        assert_eq!(&saved, opt.state());
    }

    #[test]
    fn test_reload_restores_learning() {
        let store = Arc::new(MemoryOptimizerStore::new());
        {
            let mut opt = Optimizer::load(store.clone(), 0.05, 1_500);
            opt.optimize_cycle(&positive());
            opt.optimize_cycle(&positive());
            opt.pending_save().commit().unwrap();
        }
        let opt = Optimizer::load(store, 0.05, 1_500);
        assert_eq!(opt.state().cycle, 2);
    }

    #[test]
    fn test_invalid_persisted_state_falls_back() {
        let store = Arc::new(MemoryOptimizerStore::new());
        let mut bad = OptimizerState::new(0.05);
        bad.weights.aggressive = 0.9;
        store.save(&bad).unwrap();

        let opt = Optimizer::load(store, 0.05, 1_500);
        assert_eq!(opt.state().weights, StrategyWeights::default());
        assert_eq!(opt.state().cycle, 0);
    }

    #[test]
    fn test_reset_discards_learning() {
        let (mut opt, store) = optimizer();
        opt.optimize_cycle(&positive());
        opt.reset();
        assert_eq!(opt.state().cycle, 0);
        assert_eq!(store.load().unwrap().unwrap().cycle, 0);
    }
}
