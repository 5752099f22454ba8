//! Simulation Feed
//!
//! Timer-driven tick that turns live chain reads into an immutable
//! `MetricsSnapshot`:
//!
//! ```text
//! volatility      = clamp(gas_gwei * 2, 0, 100)
//! theoretical_max = volatility / 10 * opportunity_scale
//! efficiency      = model(history), clamped to [0, ceiling]
//! captured        = theoretical_max * efficiency
//! confidence      = efficiency * 100
//! ```
//!
//! A tick either emits a complete snapshot or nothing. Provider failures
//! bump the failure counters and raise the degraded flag without touching
//! efficiency.
//!
//! Cancellation: every start bumps a generation counter. Emission re-checks
//! the generation while holding the emit lock, and `stop()` bumps it under
//! the same lock, so once `stop()` returns no further snapshot is emitted.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use arc_swap::ArcSwapOption;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::errors::EngineResult;
use crate::models::{MetricsSnapshot, ReferencePrice};
use crate::provider::ChainDataProvider;

/// Snapshots kept for the confidence model
const HISTORY_LEN: usize = 32;

// ============================================================================
// Confidence model
// ============================================================================

/// Produces the efficiency for the next tick from recent snapshots
/// (oldest first). The feed clamps whatever this returns.
pub trait ConfidenceModel: Send + Sync {
    fn next_efficiency(&self, history: &[MetricsSnapshot]) -> f64;

    fn name(&self) -> &'static str;
}

/// Linear ramp toward a ceiling, one increment per successful tick
#[derive(Debug, Clone, Copy)]
pub struct EfficiencyRamp {
    pub increment: f64,
    pub ceiling: f64,
}

impl EfficiencyRamp {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            increment: config.efficiency_increment,
            ceiling: config.efficiency_ceiling,
        }
    }
}

impl Default for EfficiencyRamp {
    fn default() -> Self {
        Self {
            increment: 0.05,
            ceiling: 0.95,
        }
    }
}

impl ConfidenceModel for EfficiencyRamp {
    fn next_efficiency(&self, history: &[MetricsSnapshot]) -> f64 {
        let previous = history.last().map(|s| s.efficiency).unwrap_or(0.0);
        (previous + self.increment).min(self.ceiling)
    }

    fn name(&self) -> &'static str {
        "efficiency_ramp"
    }
}

// ============================================================================
// Tick computation
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct FeedSettings {
    pub tick: Duration,
    pub opportunity_scale: f64,
    pub efficiency_ceiling: f64,
}

impl FeedSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            tick: config.sim_tick(),
            opportunity_scale: config.opportunity_scale,
            efficiency_ceiling: config.efficiency_ceiling,
        }
    }

    fn ticks_per_hour(&self) -> f64 {
        let ms = self.tick.as_millis().max(1) as f64;
        3_600_000.0 / ms
    }
}

/// Raw provider reads for one tick
#[derive(Debug, Clone, Copy)]
pub struct TickInputs {
    pub gas_price_gwei: f64,
    pub reference: ReferencePrice,
    pub block_height: u64,
    pub latency_ms: u64,
}

pub fn volatility_index(gas_price_gwei: f64) -> f64 {
    if !gas_price_gwei.is_finite() {
        return 0.0;
    }
    (gas_price_gwei * 2.0).clamp(0.0, 100.0)
}

/// Keep efficiency on a 1e-6 grid so repeated increments land on exact
/// thresholds.
fn quantize(efficiency: f64) -> f64 {
    (efficiency * 1e6).round() / 1e6
}

/// Mutable feed bookkeeping, guarded by the emit lock
#[derive(Debug, Default)]
pub struct FeedState {
    seq: u64,
    history: Vec<MetricsSnapshot>,
    total_captured: f64,
}

impl FeedState {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn efficiency(&self) -> f64 {
        self.history.last().map(|s| s.efficiency).unwrap_or(0.0)
    }

    pub fn apply(
        &mut self,
        inputs: &TickInputs,
        model: &dyn ConfidenceModel,
        settings: &FeedSettings,
    ) -> MetricsSnapshot {
        let volatility = volatility_index(inputs.gas_price_gwei);
        let theoretical_max = volatility / 10.0 * settings.opportunity_scale;

        let mut efficiency = model.next_efficiency(&self.history);
        if !efficiency.is_finite() {
            efficiency = self.efficiency();
        }
        let efficiency = quantize(efficiency.clamp(0.0, settings.efficiency_ceiling));

        let captured = theoretical_max * efficiency;
        self.seq += 1;
        self.total_captured += captured;

        let snapshot = MetricsSnapshot {
            seq: self.seq,
            ts: Utc::now(),
            reference_price_usd: inputs.reference.price_usd,
            price_source: inputs.reference.source,
            gas_price_gwei: inputs.gas_price_gwei,
            block_height: inputs.block_height,
            volatility_index: volatility,
            theoretical_max,
            captured,
            efficiency,
            confidence: efficiency * 100.0,
            captured_per_hour: captured * settings.ticks_per_hour(),
            captured_per_event: self.total_captured / self.seq as f64,
            provider_latency_ms: inputs.latency_ms,
        };

        if self.history.len() >= HISTORY_LEN {
            self.history.remove(0);
        }
        self.history.push(snapshot.clone());
        snapshot
    }
}

// ============================================================================
// Feed runtime
// ============================================================================

#[derive(Debug, Clone)]
pub enum FeedEvent {
    Snapshot(Arc<MetricsSnapshot>),
    Degraded {
        consecutive_failures: u64,
        reason: String,
    },
}

pub type FeedSink = Arc<dyn Fn(FeedEvent) + Send + Sync>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedStatus {
    pub running: bool,
    pub generation: u64,
    pub emitted: u64,
    pub failed_ticks: u64,
    pub consecutive_failures: u64,
    pub degraded: bool,
    pub last_error: Option<String>,
}

struct FeedInner {
    generation: AtomicU64,
    running: AtomicBool,
    state: Mutex<FeedState>,
    latest: ArcSwapOption<MetricsSnapshot>,
    failed_ticks: AtomicU64,
    consecutive_failures: AtomicU64,
    degraded: AtomicBool,
    last_error: Mutex<Option<String>>,
}

pub struct SimulationFeed {
    provider: Arc<dyn ChainDataProvider>,
    model: Arc<dyn ConfidenceModel>,
    settings: FeedSettings,
    inner: Arc<FeedInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SimulationFeed {
    pub fn new(
        provider: Arc<dyn ChainDataProvider>,
        model: Arc<dyn ConfidenceModel>,
        settings: FeedSettings,
    ) -> Self {
        Self {
            provider,
            model,
            settings,
            inner: Arc::new(FeedInner {
                generation: AtomicU64::new(0),
                running: AtomicBool::new(false),
                state: Mutex::new(FeedState::default()),
                latest: ArcSwapOption::empty(),
                failed_ticks: AtomicU64::new(0),
                consecutive_failures: AtomicU64::new(0),
                degraded: AtomicBool::new(false),
                last_error: Mutex::new(None),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn latest(&self) -> Option<Arc<MetricsSnapshot>> {
        self.inner.latest.load_full()
    }

    pub fn status(&self) -> FeedStatus {
        FeedStatus {
            running: self.is_running(),
            generation: self.inner.generation.load(Ordering::SeqCst),
            emitted: self.inner.state.lock().seq(),
            failed_ticks: self.inner.failed_ticks.load(Ordering::Relaxed),
            consecutive_failures: self.inner.consecutive_failures.load(Ordering::Relaxed),
            degraded: self.inner.degraded.load(Ordering::Relaxed),
            last_error: self.inner.last_error.lock().clone(),
        }
    }

    /// Start ticking with fresh bookkeeping. Returns false if already running.
    pub fn start(&self, sink: FeedSink) -> bool {
        let generation = {
            let mut state = self.inner.state.lock();
            if self.inner.running.swap(true, Ordering::SeqCst) {
                return false;
            }
            *state = FeedState::default();
            self.inner.latest.store(None);
            self.inner.failed_ticks.store(0, Ordering::Relaxed);
            self.inner.consecutive_failures.store(0, Ordering::Relaxed);
            self.inner.degraded.store(false, Ordering::Relaxed);
            *self.inner.last_error.lock() = None;
            self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1
        };

        let provider = self.provider.clone();
        let model = self.model.clone();
        let settings = self.settings;
        let inner = self.inner.clone();

        info!(
            generation,
            tick_ms = settings.tick.as_millis() as u64,
            model = model.name(),
            "📈 Simulation feed started"
        );

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(settings.tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if inner.generation.load(Ordering::SeqCst) != generation {
                    break;
                }
                run_tick(provider.as_ref(), model.as_ref(), &settings, &inner, generation, &sink).await;
            }
            debug!(generation, "Simulation feed task exited");
        });

        if let Some(old) = self.task.lock().replace(handle) {
            old.abort();
        }
        true
    }

    /// Idempotent. No snapshot is emitted after this returns.
    pub fn stop(&self) -> bool {
        let was_running = {
            let _emit = self.inner.state.lock();
            self.inner.generation.fetch_add(1, Ordering::SeqCst);
            self.inner.running.swap(false, Ordering::SeqCst)
        };
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
        if was_running {
            info!("🛑 Simulation feed stopped");
        }
        was_running
    }
}

impl Drop for SimulationFeed {
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}

async fn fetch_inputs(provider: &dyn ChainDataProvider) -> EngineResult<TickInputs> {
    let started = Instant::now();
    let (gas_price_gwei, reference, block_height) = tokio::try_join!(
        provider.gas_price_gwei(),
        provider.reference_price(),
        provider.block_height()
    )?;
    Ok(TickInputs {
        gas_price_gwei,
        reference,
        block_height,
        latency_ms: started.elapsed().as_millis() as u64,
    })
}

async fn run_tick(
    provider: &dyn ChainDataProvider,
    model: &dyn ConfidenceModel,
    settings: &FeedSettings,
    inner: &FeedInner,
    generation: u64,
    sink: &FeedSink,
) {
    let fetched = fetch_inputs(provider).await;

    let mut state = inner.state.lock();
    if inner.generation.load(Ordering::SeqCst) != generation {
        debug!(generation, "Discarding tick from stale generation");
        return;
    }

    match fetched {
        Ok(inputs) => {
            let snapshot = Arc::new(state.apply(&inputs, model, settings));
            inner.latest.store(Some(snapshot.clone()));
            inner.consecutive_failures.store(0, Ordering::Relaxed);
            inner.degraded.store(false, Ordering::Relaxed);
            debug!(
                seq = snapshot.seq,
                confidence = snapshot.confidence,
                volatility = snapshot.volatility_index,
                source = ?snapshot.price_source,
                "Tick"
            );
            sink(FeedEvent::Snapshot(snapshot));
        }
        Err(e) => {
            inner.failed_ticks.fetch_add(1, Ordering::Relaxed);
            let consecutive = inner.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
            inner.degraded.store(true, Ordering::Relaxed);
            let reason = e.to_string();
            *inner.last_error.lock() = Some(reason.clone());
            warn!(consecutive_failures = consecutive, error = %reason, "⚠️ Feed tick failed, snapshot skipped");
            sink(FeedEvent::Degraded {
                consecutive_failures: consecutive,
                reason,
            });
        }
    }
}
