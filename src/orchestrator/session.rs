use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::feed::FeedStatus;
use crate::models::{BootStage, MissingRequirement, SessionState, SessionView};

#[derive(Debug, Clone)]
pub(crate) struct Pause {
    pub requirement: MissingRequirement,
    pub reason: String,
}

/// Mutable session record. Only ever touched under the orchestrator's
/// session mutex.
#[derive(Debug)]
pub(crate) struct Session {
    pub id: String,
    /// Bumped on reset; background tasks carrying an older epoch stand down
    pub epoch: u64,
    pub state: SessionState,
    pub boot_stage: Option<BootStage>,
    pub pause: Option<Pause>,
    pub account_address: Option<String>,
    pub confidence: f64,
    pub cumulative_captured: f64,
    pub balance_eth: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Session {
    pub fn new(epoch: u64, account_address: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            epoch,
            state: SessionState::Idle,
            boot_stage: None,
            pause: None,
            account_address,
            confidence: 0.0,
            cumulative_captured: 0.0,
            balance_eth: 0.0,
            started_at: None,
            last_error: None,
        }
    }

    pub fn paused_on(&self, requirement: MissingRequirement) -> bool {
        self.pause
            .as_ref()
            .map(|p| p.requirement == requirement)
            .unwrap_or(false)
    }

    pub fn view(&self, config: &EngineConfig, feed: &FeedStatus) -> SessionView {
        let uptime_secs = self
            .started_at
            .map(|t| (Utc::now() - t).num_seconds().max(0))
            .unwrap_or(0);
        let feed_active = self.state == SessionState::Simulating;

        SessionView {
            session_id: self.id.clone(),
            state: self.state,
            boot_stage: self.boot_stage,
            paused: self.pause.is_some(),
            missing_requirement: self.pause.as_ref().map(|p| p.requirement),
            account_address: self.account_address.clone(),
            confidence: self.confidence,
            confidence_threshold: config.confidence_threshold,
            gate_enabled: config.require_confidence_gate,
            live_mode_enabled: config.live_mode_enabled,
            cumulative_captured: self.cumulative_captured,
            balance_eth: self.balance_eth,
            feed_degraded: feed_active && feed.degraded,
            failed_ticks: if feed_active { feed.failed_ticks } else { 0 },
            started_at: self.started_at,
            uptime_secs,
            last_error: self
                .pause
                .as_ref()
                .map(|p| p.reason.clone())
                .or_else(|| self.last_error.clone()),
        }
    }
}
