//! Phase Orchestrator
//!
//! Owns the session state machine:
//!
//! ```text
//! Idle -> Booting -> Ready -> Simulating -> Transitioning -> Live
//! ```
//!
//! Booting walks the `BootStage` checklist and pauses whenever an external
//! input is missing (blockchain connection, account address). Pauses are
//! resolved explicitly through `resolve_wallet` / `retry_connection`; nothing
//! is retried automatically.
//!
//! The confidence gate is checked and the `Transitioning` state is written in
//! the same critical section of the session mutex. Feed snapshots are applied
//! under that mutex too and are dropped unless the session is `Simulating`,
//! so no tick can land between a passing check and the transition.
//!
//! Lock order: feed emit lock, then session mutex. The orchestrator never
//! calls into the feed while holding the session mutex.

mod session;
pub mod settlement;

pub use settlement::*;

use std::{sync::Arc, time::Duration};

use arc_swap::ArcSwapOption;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{sync::broadcast, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{is_valid_address, EngineConfig, OptimizerPersistence};
use crate::errors::{EngineError, EngineResult};
use crate::feed::{ConfidenceModel, FeedEvent, FeedSettings, FeedSink, FeedStatus, SimulationFeed};
use crate::models::{
    BootStage, EngineEvent, GateOutcome, MetricsSnapshot, MissingRequirement, SessionState,
    SessionView,
};
use crate::optimizer::{Optimizer, OptimizerState, OptimizerStore, PendingSave, RewardSignals};
use crate::preflight::{PreflightContext, PreflightReport, PreflightValidator};
use crate::provider::ChainDataProvider;

use session::{Pause, Session};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawalOutcome {
    pub requested: f64,
    pub applied: f64,
    pub balance_eth: f64,
    pub settlement_reference: String,
}

/// Per-loop bookkeeping for reward deltas
#[derive(Debug, Default)]
struct CycleTracker {
    last_marker: Option<f64>,
    last_failed_ticks: u64,
}

enum RetryTarget {
    Boot { epoch: u64, stage: BootStage },
    Simulation,
}

pub struct PhaseOrchestrator {
    config: EngineConfig,
    provider: Arc<dyn ChainDataProvider>,
    settlement: Arc<dyn SettlementService>,
    feed: SimulationFeed,
    optimizer: Mutex<Optimizer>,
    preflight: PreflightValidator,
    session: Mutex<Session>,
    events: broadcast::Sender<EngineEvent>,
    optimizer_task: Mutex<Option<JoinHandle<()>>>,
    last_preflight: ArcSwapOption<PreflightReport>,
}

impl PhaseOrchestrator {
    pub fn new(
        config: EngineConfig,
        provider: Arc<dyn ChainDataProvider>,
        store: Arc<dyn OptimizerStore>,
        settlement: Arc<dyn SettlementService>,
        model: Arc<dyn ConfidenceModel>,
    ) -> Arc<Self> {
        let feed = SimulationFeed::new(provider.clone(), model, FeedSettings::from_config(&config));
        let optimizer = Optimizer::load(
            store.clone(),
            config.optimizer_learning_rate,
            config.latency_threshold_ms,
        );
        let preflight = PreflightValidator::new(&config, provider.clone(), store);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let session = Session::new(0, config.account_address.clone());

        Arc::new(Self {
            config,
            provider,
            settlement,
            feed,
            optimizer: Mutex::new(optimizer),
            preflight,
            session: Mutex::new(session),
            events,
            optimizer_task: Mutex::new(None),
            last_preflight: ArcSwapOption::empty(),
        })
    }

    // ========================================================================
    // Read side
    // ========================================================================

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn view(&self) -> SessionView {
        let feed = self.feed.status();
        self.session.lock().view(&self.config, &feed)
    }

    pub fn latest_metrics(&self) -> Option<Arc<MetricsSnapshot>> {
        self.feed.latest()
    }

    pub fn feed_status(&self) -> FeedStatus {
        self.feed.status()
    }

    pub fn optimizer_state(&self) -> OptimizerState {
        self.optimizer.lock().state().clone()
    }

    pub fn last_preflight(&self) -> Option<Arc<PreflightReport>> {
        self.last_preflight.load_full()
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn publish_view(&self) {
        self.emit(EngineEvent::Session(self.view()));
    }

    fn set_state(&self, session: &mut Session, to: SessionState) {
        let from = session.state;
        session.state = to;
        info!(from = %from, to = %to, session_id = %session.id, "session_transition");
        self.emit(EngineEvent::StateChanged { from, to });
    }

    /// Records `pause` only if the session is still in `expected` within `epoch`
    fn pause(&self, epoch: u64, expected: SessionState, pause: Pause) {
        {
            let mut s = self.session.lock();
            if s.epoch != epoch || s.state != expected {
                debug!(requirement = %pause.requirement, state = %s.state, "Stale pause dropped");
                return;
            }
            warn!(
                requirement = %pause.requirement,
                reason = %pause.reason,
                state = %s.state,
                "⏸️  Session paused"
            );
            self.emit(EngineEvent::Paused {
                requirement: pause.requirement,
                reason: pause.reason.clone(),
            });
            s.pause = Some(pause);
        }
        self.publish_view();
    }

    // ========================================================================
    // Boot
    // ========================================================================

    /// `Idle -> Booting`, then walks the boot checklist in the background.
    pub fn start(self: &Arc<Self>) -> EngineResult<()> {
        let epoch = {
            let mut s = self.session.lock();
            if s.state != SessionState::Idle {
                return Err(EngineError::InvalidState {
                    command: "start",
                    state: s.state,
                });
            }
            s.started_at = Some(Utc::now());
            s.boot_stage = Some(BootStage::Init);
            s.last_error = None;
            self.set_state(&mut s, SessionState::Booting);
            s.epoch
        };
        info!("🚀 Session boot started");
        self.spawn_boot(epoch, BootStage::Init);
        Ok(())
    }

    fn spawn_boot(self: &Arc<Self>, epoch: u64, from: BootStage) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.drive_boot(epoch, from).await;
        });
    }

    async fn drive_boot(self: Arc<Self>, epoch: u64, from: BootStage) {
        let mut stage = from;
        loop {
            if !self.enter_stage(epoch, stage) {
                return;
            }
            if stage == BootStage::Complete {
                self.finish_boot(epoch);
                return;
            }
            if let Err(pause) = self.run_stage(stage).await {
                self.pause(epoch, SessionState::Booting, pause);
                return;
            }
            let delay = self.config.boot_stage_delay();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            stage = stage.next();
        }
    }

    fn enter_stage(&self, epoch: u64, stage: BootStage) -> bool {
        let mut s = self.session.lock();
        if s.epoch != epoch || s.state != SessionState::Booting || s.pause.is_some() {
            return false;
        }
        s.boot_stage = Some(stage);
        info!(stage = %stage, "🔧 Boot: {}", stage.label());
        self.emit(EngineEvent::BootStage { stage });
        true
    }

    async fn run_stage(&self, stage: BootStage) -> Result<(), Pause> {
        match stage {
            BootStage::ExternalDependency => match self.provider.block_height().await {
                Ok(height) => {
                    debug!(block_height = height, "Provider reachable");
                    Ok(())
                }
                Err(e) => Err(Pause {
                    requirement: MissingRequirement::BlockchainConnection,
                    reason: e.to_string(),
                }),
            },
            BootStage::Wallet => {
                let address = self.session.lock().account_address.clone();
                match address {
                    None => Err(Pause {
                        requirement: MissingRequirement::Wallet,
                        reason: "no account address configured".to_string(),
                    }),
                    Some(addr) if !is_valid_address(&addr) => Err(Pause {
                        requirement: MissingRequirement::Wallet,
                        reason: format!("malformed account address: {}", addr),
                    }),
                    Some(_) => Ok(()),
                }
            }
            BootStage::Liquidity => match self.provider.reference_price().await {
                Ok(price) => {
                    debug!(price_usd = price.price_usd, source = ?price.source, "Reference price sampled");
                    Ok(())
                }
                Err(e) => Err(Pause {
                    requirement: MissingRequirement::BlockchainConnection,
                    reason: e.to_string(),
                }),
            },
            BootStage::Optimization => {
                let state = self.optimizer_state();
                debug!(cycle = state.cycle, "Optimizer state ready");
                self.emit(EngineEvent::OptimizerSnapshot(state));
                Ok(())
            }
            BootStage::Init | BootStage::Workers | BootStage::Complete => Ok(()),
        }
    }

    fn finish_boot(&self, epoch: u64) {
        {
            let mut s = self.session.lock();
            if s.epoch != epoch || s.state != SessionState::Booting {
                return;
            }
            s.boot_stage = None;
            self.set_state(&mut s, SessionState::Ready);
        }
        info!("✅ Boot complete, session ready");
        self.publish_view();
    }

    /// Supply the account address. Resumes a boot paused on `Wallet` at
    /// `Liquidity`; otherwise just records it.
    pub fn resolve_wallet(self: &Arc<Self>, address: &str) -> EngineResult<()> {
        let address = address.trim();

        if !is_valid_address(address) {
            let reason = format!("malformed account address: {}", address);
            let mut s = self.session.lock();
            if let Some(pause) = s.pause.as_mut().filter(|p| p.requirement == MissingRequirement::Wallet) {
                pause.reason = reason.clone();
            }
            s.last_error = Some(reason.clone());
            return Err(EngineError::invalid_input(reason));
        }

        let resume = {
            let mut s = self.session.lock();
            if matches!(s.state, SessionState::Transitioning | SessionState::Live) {
                return Err(EngineError::InvalidState {
                    command: "resolve_wallet",
                    state: s.state,
                });
            }
            s.account_address = Some(address.to_string());
            s.last_error = None;

            if s.state == SessionState::Booting && s.paused_on(MissingRequirement::Wallet) {
                s.pause = None;
                s.boot_stage = Some(BootStage::Liquidity);
                self.emit(EngineEvent::Resumed {
                    requirement: MissingRequirement::Wallet,
                });
                Some(s.epoch)
            } else {
                None
            }
        };

        if let Some(epoch) = resume {
            info!(address = %address, "▶️  Wallet resolved, resuming boot");
            self.spawn_boot(epoch, BootStage::Liquidity);
        }
        self.publish_view();
        Ok(())
    }

    /// Resolve a `BlockchainConnection` pause, either in boot or at
    /// simulation start.
    pub async fn retry_connection(self: &Arc<Self>) -> EngineResult<()> {
        let target = {
            let mut s = self.session.lock();
            if !s.paused_on(MissingRequirement::BlockchainConnection) {
                return Err(EngineError::InvalidState {
                    command: "retry_connection",
                    state: s.state,
                });
            }
            let target = match s.state {
                SessionState::Booting => RetryTarget::Boot {
                    epoch: s.epoch,
                    stage: s.boot_stage.unwrap_or(BootStage::ExternalDependency),
                },
                SessionState::Ready => RetryTarget::Simulation,
                other => {
                    return Err(EngineError::InvalidState {
                        command: "retry_connection",
                        state: other,
                    })
                }
            };
            s.pause = None;
            self.emit(EngineEvent::Resumed {
                requirement: MissingRequirement::BlockchainConnection,
            });
            target
        };

        info!("🔁 Retrying blockchain connection");
        match target {
            RetryTarget::Boot { epoch, stage } => {
                self.spawn_boot(epoch, stage);
                self.publish_view();
                Ok(())
            }
            RetryTarget::Simulation => self.start_simulation().await,
        }
    }

    // ========================================================================
    // Simulation
    // ========================================================================

    /// `Ready -> Simulating` after a connectivity round-trip. A failed
    /// round-trip pauses on `BlockchainConnection` and stays `Ready`.
    pub async fn start_simulation(self: &Arc<Self>) -> EngineResult<()> {
        let epoch = {
            let s = self.session.lock();
            if s.state != SessionState::Ready {
                return Err(EngineError::InvalidState {
                    command: "start_simulation",
                    state: s.state,
                });
            }
            s.epoch
        };

        if let Err(e) = self.provider.block_height().await {
            self.pause(
                epoch,
                SessionState::Ready,
                Pause {
                    requirement: MissingRequirement::BlockchainConnection,
                    reason: e.to_string(),
                },
            );
            return Err(e);
        }

        {
            let mut s = self.session.lock();
            if s.epoch != epoch || s.state != SessionState::Ready {
                return Err(EngineError::InvalidState {
                    command: "start_simulation",
                    state: s.state,
                });
            }
            s.pause = None;
            s.last_error = None;
            s.confidence = 0.0;
            s.cumulative_captured = 0.0;
            self.set_state(&mut s, SessionState::Simulating);
        }

        self.feed.start(self.feed_sink());
        self.start_optimizer_loop(epoch, Duration::from_millis(self.config.optimizer_fast_ms));

        // A reset may have slipped in while the feed was starting
        if self.session.lock().epoch != epoch {
            self.feed.stop();
            self.stop_optimizer_loop();
        }

        info!("🧪 Simulation started");
        self.publish_view();
        Ok(())
    }

    fn feed_sink(self: &Arc<Self>) -> FeedSink {
        let weak = Arc::downgrade(self);
        Arc::new(move |event: FeedEvent| {
            if let Some(this) = weak.upgrade() {
                this.on_feed_event(event);
            }
        })
    }

    fn on_feed_event(&self, event: FeedEvent) {
        match event {
            FeedEvent::Snapshot(snapshot) => {
                {
                    let mut s = self.session.lock();
                    if s.state != SessionState::Simulating {
                        debug!(seq = snapshot.seq, state = %s.state, "Dropping snapshot outside simulation");
                        return;
                    }
                    s.confidence = snapshot.confidence;
                    s.cumulative_captured += snapshot.captured;
                }
                self.emit(EngineEvent::Metrics((*snapshot).clone()));
            }
            FeedEvent::Degraded {
                consecutive_failures,
                reason,
            } => {
                self.emit(EngineEvent::FeedDegraded {
                    consecutive_failures,
                    reason,
                });
            }
        }
    }

    // ========================================================================
    // Optimizer loop
    // ========================================================================

    fn start_optimizer_loop(self: &Arc<Self>, epoch: u64, cadence: Duration) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + cadence, cadence);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut tracker = CycleTracker::default();
            loop {
                interval.tick().await;
                let Some(this) = weak.upgrade() else {
                    break;
                };
                if !this.optimizer_pass(epoch, &mut tracker).await {
                    break;
                }
            }
        });

        debug!(cadence_ms = cadence.as_millis() as u64, "Optimizer loop scheduled");
        if let Some(old) = self.optimizer_task.lock().replace(handle) {
            old.abort();
        }
    }

    fn stop_optimizer_loop(&self) {
        if let Some(handle) = self.optimizer_task.lock().take() {
            handle.abort();
        }
    }

    /// One optimizer cycle. Returns false when the loop should end.
    async fn optimizer_pass(&self, epoch: u64, tracker: &mut CycleTracker) -> bool {
        let feed = self.feed.status();
        let (state, marker) = {
            let s = self.session.lock();
            if s.epoch != epoch {
                return false;
            }
            let marker = if s.state == SessionState::Live {
                s.balance_eth
            } else {
                s.cumulative_captured
            };
            (s.state, marker)
        };
        if !matches!(state, SessionState::Simulating | SessionState::Live) {
            return true;
        }
        let Some(snapshot) = self.feed.latest() else {
            return true;
        };

        let trend = tracker.last_marker.map(|m| marker - m).unwrap_or(0.0);
        tracker.last_marker = Some(marker);
        let failed = feed.failed_ticks.saturating_sub(tracker.last_failed_ticks);
        tracker.last_failed_ticks = feed.failed_ticks;

        let signals = RewardSignals::from_metrics(&snapshot, trend, failed);
        let (insight, state, pending) = {
            let mut optimizer = self.optimizer.lock();
            let insight = optimizer.optimize_cycle(&signals);
            (insight, optimizer.state().clone(), optimizer.pending_save())
        };
        persist_optimizer(pending).await;

        info!(cycle = state.cycle, "🧠 {}", insight);
        self.emit(EngineEvent::OptimizerInsight {
            cycle: state.cycle,
            insight,
        });
        self.emit(EngineEvent::OptimizerSnapshot(state));
        true
    }

    // ========================================================================
    // Live gate
    // ========================================================================

    fn check_gate(&self, confidence: f64) -> EngineResult<()> {
        if self.config.require_confidence_gate && confidence < self.config.confidence_threshold {
            return Err(EngineError::GateViolation {
                confidence,
                threshold: self.config.confidence_threshold,
            });
        }
        Ok(())
    }

    /// Promote `Simulating -> Transitioning -> Live` if the gate allows it.
    /// A refused gate leaves the session untouched.
    pub async fn confirm_live(self: &Arc<Self>) -> EngineResult<GateOutcome> {
        let (epoch, confidence, address) = {
            let mut s = self.session.lock();
            match s.state {
                SessionState::Live | SessionState::Transitioning => {
                    return Ok(GateOutcome::AlreadyLive);
                }
                SessionState::Simulating => {}
                other => {
                    return Err(EngineError::InvalidState {
                        command: "confirm_live",
                        state: other,
                    })
                }
            }

            if !self.config.live_mode_enabled {
                info!("🔒 Live confirmation refused: live mode disabled");
                let outcome = GateOutcome::LiveDisabled;
                self.emit(EngineEvent::Gate(outcome));
                return Ok(outcome);
            }

            if let Err(violation) = self.check_gate(s.confidence) {
                debug!(reason = %violation, "Confidence gate held");
                let outcome = GateOutcome::Rejected {
                    confidence: s.confidence,
                    threshold: self.config.confidence_threshold,
                };
                self.emit(EngineEvent::Gate(outcome));
                return Ok(outcome);
            }

            self.set_state(&mut s, SessionState::Transitioning);
            (s.epoch, s.confidence, s.account_address.clone())
        };

        self.feed.stop();
        self.stop_optimizer_loop();

        let balance = match address.as_deref() {
            Some(addr) => match self.provider.balance_eth(addr).await {
                Ok(balance) => Some(balance),
                Err(e) => {
                    warn!(error = %e, "⚠️ Balance read failed on promotion");
                    None
                }
            },
            None => None,
        };

        {
            let mut s = self.session.lock();
            if s.epoch != epoch || s.state != SessionState::Transitioning {
                return Err(EngineError::InvalidState {
                    command: "confirm_live",
                    state: s.state,
                });
            }
            match balance {
                Some(b) => s.balance_eth = b,
                None => s.last_error = Some("account balance unavailable".to_string()),
            }
            self.set_state(&mut s, SessionState::Live);
        }

        info!(confidence, "🟢 Session promoted to LIVE");
        self.start_optimizer_loop(epoch, Duration::from_millis(self.config.optimizer_slow_ms));

        let outcome = GateOutcome::Promoted { confidence };
        self.emit(EngineEvent::Gate(outcome));
        self.publish_view();
        Ok(outcome)
    }

    /// Decrease the live balance by `amount` (floored at zero) and hand the
    /// applied amount to settlement. A failed settlement restores the balance.
    pub async fn withdraw(&self, amount: f64) -> EngineResult<WithdrawalOutcome> {
        if !(amount.is_finite() && amount > 0.0) {
            return Err(EngineError::invalid_input(format!(
                "withdrawal amount must be positive, got {}",
                amount
            )));
        }

        let (epoch, applied, balance_eth, request) = {
            let mut s = self.session.lock();
            if s.state != SessionState::Live {
                return Err(EngineError::InvalidState {
                    command: "withdraw",
                    state: s.state,
                });
            }
            let applied = amount.min(s.balance_eth);
            s.balance_eth = (s.balance_eth - amount).max(0.0);
            let request = WithdrawalRequest {
                session_id: s.id.clone(),
                account_address: s.account_address.clone(),
                amount_eth: applied,
            };
            (s.epoch, applied, s.balance_eth, request)
        };

        match self.settlement.settle_withdrawal(&request).await {
            Ok(receipt) => {
                info!(requested = amount, applied, balance_eth, "💸 Withdrawal applied");
                self.emit(EngineEvent::Withdrawal {
                    requested: amount,
                    applied,
                    balance_eth,
                });
                self.publish_view();
                Ok(WithdrawalOutcome {
                    requested: amount,
                    applied,
                    balance_eth,
                    settlement_reference: receipt.reference,
                })
            }
            Err(e) => {
                warn!(error = %e, amount, "⚠️ Settlement failed, restoring balance");
                let mut s = self.session.lock();
                if s.epoch == epoch && s.state == SessionState::Live {
                    s.balance_eth += applied;
                    s.last_error = Some(format!("settlement failed: {:#}", e));
                }
                Err(EngineError::unavailable(format!("settlement failed: {:#}", e)))
            }
        }
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    pub async fn run_preflight(&self) -> PreflightReport {
        let ctx = {
            let s = self.session.lock();
            PreflightContext {
                account_address: s.account_address.clone(),
                live_mode_enabled: self.config.live_mode_enabled,
                require_confidence_gate: self.config.require_confidence_gate,
            }
        };
        let report = self.preflight.run(&ctx).await;
        self.last_preflight.store(Some(Arc::new(report.clone())));
        self.emit(EngineEvent::Preflight(report.clone()));
        report
    }

    /// Stop all loops and return to a fresh `Idle` session
    pub fn reset(&self) {
        let from = {
            let mut s = self.session.lock();
            let from = s.state;
            let epoch = s.epoch + 1;
            *s = Session::new(epoch, self.config.account_address.clone());
            if from != SessionState::Idle {
                info!(from = %from, to = %SessionState::Idle, "session_transition");
                self.emit(EngineEvent::StateChanged {
                    from,
                    to: SessionState::Idle,
                });
            }
            from
        };

        self.feed.stop();
        self.stop_optimizer_loop();

        if self.config.optimizer_persistence == OptimizerPersistence::Ephemeral {
            let state = {
                let mut optimizer = self.optimizer.lock();
                optimizer.reset();
                optimizer.state().clone()
            };
            self.emit(EngineEvent::OptimizerSnapshot(state));
        }

        info!(from = %from, "🔄 Session reset");
        self.publish_view();
    }

    /// Stop background work ahead of process exit
    pub fn shutdown(&self) {
        self.feed.stop();
        self.stop_optimizer_loop();
    }
}

/// SQLite writes stay off the async workers and outside the optimizer lock
async fn persist_optimizer(pending: PendingSave) {
    let cycle = pending.cycle();
    match tokio::task::spawn_blocking(move || pending.commit()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, cycle, "Failed to persist optimizer state"),
        Err(e) => warn!(error = %e, cycle, "Optimizer persist task failed"),
    }
}
